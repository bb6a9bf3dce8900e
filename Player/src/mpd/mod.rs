//! DASH manifest data structures for OMAF viewport-dependent streaming.
//! These represent the parsed MPD tree: adaptation sets, representations,
//! segment addressing, and the OMAF properties attached to them.

pub mod parser;

use chrono::{DateTime, Utc};

/// `MPD@type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationType {
    #[default]
    Static,
    Dynamic,
}

/// MPD profiles the player recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashProfile {
    IsoffLive,
    IsoffOnDemand,
    IsoffMain,
    Full,
    OmafIndexedIsobmff,
    Other,
}

impl DashProfile {
    pub fn from_urn(urn: &str) -> DashProfile {
        if urn.contains("isoff-live:2011") {
            DashProfile::IsoffLive
        } else if urn.contains("isoff-on-demand:2011") {
            DashProfile::IsoffOnDemand
        } else if urn.contains("isoff-main:2011") {
            DashProfile::IsoffMain
        } else if urn.contains("full:2011") {
            DashProfile::Full
        } else if urn.contains("omaf:dash:profile:indexed-isobmff") {
            DashProfile::OmafIndexedIsobmff
        } else {
            DashProfile::Other
        }
    }
}

/// Segment addressing resolved for a representation: either a template with
/// fixed duration, a timeline, or a single file addressed by `sidx`.
#[derive(Debug, Clone, Default)]
pub struct SegmentTemplate {
    pub media: String,
    pub initialization: String,
    /// Raw `@duration` in `@timescale` units.
    pub duration: Option<u64>,
    pub timescale: u64,
    pub start_number: u32,
    pub timeline: Vec<TimelineEntry>,
}

/// One `<S>` row of a `SegmentTimeline` before repeat expansion.
#[derive(Debug, Clone, Copy)]
pub struct TimelineEntry {
    pub start_time: Option<u64>,
    pub duration: u64,
    pub repeat: i64,
}

impl SegmentTemplate {
    pub fn segment_duration_ms(&self) -> Option<u64> {
        self.duration
            .map(|d| d * 1000 / self.timescale.max(1))
    }

    pub fn has_timeline(&self) -> bool {
        !self.timeline.is_empty()
    }

    /// Expands `<S t d r>` rows into absolute (start, duration) pairs in
    /// timescale units, merging overlapping entries by keeping the later
    /// start.
    pub fn expanded_timeline(&self) -> Vec<(u64, u64)> {
        let mut result: Vec<(u64, u64)> = Vec::new();
        let mut cursor = 0u64;
        for entry in &self.timeline {
            let mut start = entry.start_time.unwrap_or(cursor);
            if let Some((last_start, last_duration)) = result.last().copied() {
                if start < last_start + last_duration {
                    start = last_start + last_duration;
                }
            }
            let repeats = entry.repeat.max(0) as u64 + 1;
            for i in 0..repeats {
                result.push((start + i * entry.duration, entry.duration));
            }
            cursor = start + repeats * entry.duration;
        }
        result
    }
}

/// Stereo channel claimed by a representation or adaptation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoChannel {
    Left,
    Right,
}

/// CICP VideoFramePackingType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePacking {
    SideBySide,
    TopBottom,
    /// Temporal interleaving; recognized but not playable.
    Temporal,
}

impl FramePacking {
    pub fn from_cicp(value: u32) -> Option<FramePacking> {
        match value {
            3 => Some(FramePacking::SideBySide),
            4 => Some(FramePacking::TopBottom),
            5 => Some(FramePacking::Temporal),
            _ => None,
        }
    }
}

/// Spherical coverage advertised through `omaf:cc`, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CoverageInfo {
    pub azimuth_center: f64,
    pub elevation_center: f64,
    pub azimuth_range: f64,
    pub elevation_range: f64,
}

/// One quality entry from `srqr`/`2dqr` MPD properties.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QualityInfo {
    pub quality_ranking: u8,
    /// Sphere region for srqr entries; None marks the remaining-area entry.
    pub coverage: Option<CoverageInfo>,
}

/// OMAF properties gathered from Essential/Supplemental property
/// descriptors on an adaptation set or representation.
#[derive(Debug, Clone, Default)]
pub struct OmafAttributes {
    /// 0 = equirectangular, 1 = cubemap, from `omaf:pf`.
    pub projection_type: Option<u8>,
    pub coverage: Option<CoverageInfo>,
    pub quality: Vec<QualityInfo>,
    /// Multiple quality levels inside one track (multi-resolution case).
    pub multi_resolution: bool,
    pub has_region_wise_packing: bool,
    /// `(tag, member adaptation-set ids)` of a Preselection descriptor.
    pub preselection: Option<(String, Vec<u32>)>,
}

/// A single encoded variant inside an adaptation set.
#[derive(Debug, Clone, Default)]
pub struct RepresentationDesc {
    pub id: String,
    pub bandwidth: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codecs: String,
    pub quality_ranking: Option<u8>,
    pub dependency_ids: Vec<String>,
    pub association_id: Option<String>,
    pub association_type: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub base_url: Option<String>,
    pub omaf: OmafAttributes,
    pub stereo: Option<StereoChannel>,
}

impl RepresentationDesc {
    /// Codec string marks an extractor track (`hvc2`, `resv.podv+ercm`
    /// variants resolve through their restricted scheme).
    pub fn is_extractor(&self) -> bool {
        self.codecs.contains("hvc2")
    }
}

/// An adaptation set: interchangeable representations of one media
/// component.
#[derive(Debug, Clone, Default)]
pub struct AdaptationSetDesc {
    pub id: u32,
    pub content_type: String,
    pub mime_type: String,
    pub codecs: String,
    pub segment_template: Option<SegmentTemplate>,
    pub representations: Vec<RepresentationDesc>,
    pub omaf: OmafAttributes,
    pub frame_packing: Option<FramePacking>,
    pub stereo: Option<StereoChannel>,
    /// Role descriptor value `metadata` marks timed-metadata sets.
    pub is_metadata: bool,
}

impl AdaptationSetDesc {
    pub fn is_video(&self) -> bool {
        self.content_type == "video" || self.mime_type.contains("video")
    }

    pub fn is_audio(&self) -> bool {
        self.content_type == "audio" || self.mime_type.contains("audio")
    }

    pub fn is_extractor(&self) -> bool {
        self.codecs.contains("hvc2")
            || self.representations.iter().any(|r| r.is_extractor())
    }

    /// Effective segment template for a representation, preferring the
    /// representation-level one.
    pub fn template_for<'a>(
        &'a self,
        representation: &'a RepresentationDesc,
    ) -> Option<&'a SegmentTemplate> {
        representation
            .segment_template
            .as_ref()
            .or(self.segment_template.as_ref())
    }
}

/// Top-level parsed MPD.
#[derive(Debug, Clone, Default)]
pub struct Mpd {
    pub presentation_type: PresentationType,
    pub profiles: Vec<DashProfile>,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub media_presentation_duration_ms: Option<u64>,
    pub minimum_update_period_ms: Option<u64>,
    pub min_buffer_time_ms: Option<u64>,
    pub adaptation_sets: Vec<AdaptationSetDesc>,
}

impl Mpd {
    pub fn is_dynamic(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
    }

    /// On-demand profile: one file per representation, `sidx` addressing.
    pub fn is_on_demand(&self) -> bool {
        self.profiles.iter().any(|p| {
            matches!(
                p,
                DashProfile::IsoffOnDemand | DashProfile::OmafIndexedIsobmff
            )
        })
    }

    pub fn adaptation_set_by_id(&self, id: u32) -> Option<&AdaptationSetDesc> {
        self.adaptation_sets.iter().find(|a| a.id == id)
    }
}

/// Resolves `$RepresentationID$`, `$Number$` (with `%0Nd` widths), `$Time$`
/// and `$Bandwidth$` in a segment template string.
pub fn fill_template(
    template: &str,
    representation_id: &str,
    bandwidth: u32,
    number: u32,
    time: u64,
) -> String {
    use regex::Regex;
    let filled = template
        .replace("$RepresentationID$", representation_id)
        .replace("$Bandwidth$", &bandwidth.to_string())
        .replace("$Time$", &time.to_string());
    let re = Regex::new(r"\$Number(?::%0(\d+)d|%0(\d+)d)?\$").unwrap();
    re.replace_all(&filled, |caps: &regex::Captures| {
        if let Some(width) = caps.get(1).or_else(|| caps.get(2)) {
            format!(
                "{:0width$}",
                number,
                width = width.as_str().parse::<usize>().unwrap_or(1)
            )
        } else {
            number.to_string()
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_number_width() {
        assert_eq!(
            fill_template("seg_$RepresentationID$_$Number:%05d$.m4s", "v1", 0, 42, 0),
            "seg_v1_00042.m4s"
        );
        assert_eq!(fill_template("seg_$Number$.m4s", "v1", 0, 7, 0), "seg_7.m4s");
    }

    #[test]
    fn timeline_expansion_merges_overlap() {
        let template = SegmentTemplate {
            timeline: vec![
                TimelineEntry {
                    start_time: Some(0),
                    duration: 100,
                    repeat: 1,
                },
                TimelineEntry {
                    start_time: Some(150),
                    duration: 100,
                    repeat: 0,
                },
            ],
            timescale: 100,
            ..Default::default()
        };
        let expanded = template.expanded_timeline();
        // second entry overlaps the first pair's extent and is pushed to
        // its end
        assert_eq!(expanded, vec![(0, 100), (100, 100), (200, 100)]);
    }
}
