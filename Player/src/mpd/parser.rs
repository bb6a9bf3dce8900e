//! MPD parsing: a quick-xml event loop over the manifest tree.
//!
//! Only the first Period is consumed; the recognized attribute surface is
//! the one the player acts on (segment addressing, OMAF descriptors,
//! associations, preselections). Unknown elements pass through silently.

use super::*;
use crate::error::{Result, StreamingError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const SCHEME_PROJECTION: &str = "urn:mpeg:mpegI:omaf:2017:pf";
const SCHEME_COVERAGE: &str = "urn:mpeg:mpegI:omaf:2017:cc";
const SCHEME_SPHERE_QUALITY: &str = "urn:mpeg:mpegI:omaf:2017:srqr";
const SCHEME_2D_QUALITY: &str = "urn:mpeg:mpegI:omaf:2017:2dqr";
const SCHEME_PACKING: &str = "urn:mpeg:mpegI:omaf:2017:rwpk";
const SCHEME_PRESELECTION: &str = "urn:mpeg:dash:preselection:2016";
const SCHEME_FRAME_PACKING: &str = "urn:mpeg:mpegB:cicp:VideoFramePackingType";
const SCHEME_ROLE: &str = "urn:mpeg:dash:role:2011";
const SCHEME_STEREO_ID: &str = "urn:mpeg:dash:stereoid:2011";

fn invalid(msg: impl Into<String>) -> StreamingError {
    StreamingError::InvalidData(msg.into())
}

fn attr_map(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| invalid(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| invalid(format!("bad attribute value: {e}")))?
            .to_string();
        out.push((key, value));
    }
    Ok(out)
}

fn get<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name || k.ends_with(&format!(":{name}")))
        .map(|(_, v)| v.as_str())
}

fn parse_iso_duration_ms(value: &str) -> Option<u64> {
    iso8601_duration::Duration::parse(value)
        .ok()
        .and_then(|d| d.to_std())
        .map(|d| d.as_millis() as u64)
}

fn parse_frame_rate(value: &str) -> f64 {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().unwrap_or(0.0);
        let den: f64 = den.parse().unwrap_or(1.0);
        if den != 0.0 {
            return num / den;
        }
    }
    value.parse().unwrap_or(0.0)
}

/// Degrees encoded in units of 2^-16 degrees, the OMAF descriptor
/// convention shared with the boxes.
fn parse_q16_degrees(value: &str) -> f64 {
    value.parse::<i64>().map(|v| v as f64 / 65536.0).unwrap_or(0.0)
}

fn parse_segment_template(attrs: &[(String, String)]) -> SegmentTemplate {
    SegmentTemplate {
        media: get(attrs, "media").unwrap_or_default().to_string(),
        initialization: get(attrs, "initialization").unwrap_or_default().to_string(),
        duration: get(attrs, "duration").and_then(|d| d.parse().ok()),
        timescale: get(attrs, "timescale")
            .and_then(|t| t.parse().ok())
            .unwrap_or(1),
        start_number: get(attrs, "startNumber")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1),
        timeline: Vec::new(),
    }
}

/// Which OMAF descriptor we are currently inside, for nested children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyContext {
    None,
    Projection,
    Coverage,
    SphereQuality,
    TwoDQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateTarget {
    Adaptation,
    Representation,
}

pub fn parse_mpd(xml: &str) -> Result<Mpd> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut mpd = Mpd::default();
    let mut current_adaptation: Option<AdaptationSetDesc> = None;
    let mut current_rep: Option<RepresentationDesc> = None;
    let mut inside_rep = false;
    let mut period_index = 0usize;
    let mut template_target = TemplateTarget::Adaptation;
    let mut property_context = PropertyContext::None;
    let mut inside_base_url = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| invalid(format!("xml error: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref())
                    .map_err(|_| invalid("non-utf8 tag"))?
                    .to_string();
                // strip namespace prefixes for matching
                let local = tag.rsplit(':').next().unwrap_or(&tag).to_string();
                if period_index > 1 {
                    buf.clear();
                    continue;
                }
                let attrs = attr_map(e)?;
                match local.as_str() {
                    "MPD" => parse_mpd_attributes(&mut mpd, &attrs)?,
                    "Period" => period_index += 1,
                    "AdaptationSet" => {
                        template_target = TemplateTarget::Adaptation;
                        current_adaptation = Some(parse_adaptation_attributes(&attrs));
                    }
                    "Representation" => {
                        inside_rep = true;
                        template_target = TemplateTarget::Representation;
                        current_rep = Some(parse_representation_attributes(&attrs));
                    }
                    "SegmentTemplate" => {
                        let template = parse_segment_template(&attrs);
                        if inside_rep {
                            template_target = TemplateTarget::Representation;
                            if let Some(rep) = current_rep.as_mut() {
                                rep.segment_template = Some(template);
                            }
                        } else {
                            template_target = TemplateTarget::Adaptation;
                            if let Some(adaptation) = current_adaptation.as_mut() {
                                adaptation.segment_template = Some(template);
                            }
                        }
                    }
                    "S" => {
                        let entry = TimelineEntry {
                            start_time: get(&attrs, "t").and_then(|v| v.parse().ok()),
                            duration: get(&attrs, "d")
                                .and_then(|v| v.parse().ok())
                                .ok_or_else(|| invalid("timeline S without @d"))?,
                            repeat: get(&attrs, "r").and_then(|v| v.parse().ok()).unwrap_or(0),
                        };
                        let template = match template_target {
                            TemplateTarget::Representation => current_rep
                                .as_mut()
                                .and_then(|r| r.segment_template.as_mut()),
                            TemplateTarget::Adaptation => current_adaptation
                                .as_mut()
                                .and_then(|a| a.segment_template.as_mut()),
                        };
                        if let Some(template) = template {
                            template.timeline.push(entry);
                        }
                    }
                    "BaseURL" => inside_base_url = !is_empty,
                    "Role" => {
                        if get(&attrs, "schemeIdUri") == Some(SCHEME_ROLE)
                            && get(&attrs, "value") == Some("metadata")
                        {
                            if let Some(adaptation) = current_adaptation.as_mut() {
                                adaptation.is_metadata = true;
                            }
                        }
                    }
                    "EssentialProperty" | "SupplementalProperty" => {
                        property_context = parse_property(
                            &attrs,
                            is_empty,
                            current_adaptation.as_mut(),
                            current_rep.as_mut(),
                            inside_rep,
                        )?;
                    }
                    "projection_type" if property_context == PropertyContext::Projection => {
                        if let Some(value) = get(&attrs, "value") {
                            set_projection(
                                value,
                                current_adaptation.as_mut(),
                                current_rep.as_mut(),
                                inside_rep,
                            );
                        }
                    }
                    "coverageInfo" if property_context == PropertyContext::Coverage => {
                        let coverage = parse_coverage_attributes(&attrs);
                        apply_omaf(
                            current_adaptation.as_mut(),
                            current_rep.as_mut(),
                            inside_rep,
                            |omaf| omaf.coverage = Some(coverage),
                        );
                    }
                    "qualityInfo"
                        if matches!(
                            property_context,
                            PropertyContext::SphereQuality | PropertyContext::TwoDQuality
                        ) =>
                    {
                        let info = QualityInfo {
                            quality_ranking: get(&attrs, "quality_ranking")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0),
                            coverage: if property_context == PropertyContext::SphereQuality
                                && get(&attrs, "centre_azimuth").is_some()
                            {
                                Some(parse_coverage_attributes(&attrs))
                            } else {
                                None
                            },
                        };
                        apply_omaf(
                            current_adaptation.as_mut(),
                            current_rep.as_mut(),
                            inside_rep,
                            |omaf| omaf.quality.push(info),
                        );
                    }
                    "sphRegionQuality" | "twoDRegionQuality" => {
                        // multiple quality levels flagged on the container
                        let multi = get(&attrs, "quality_type").map_or(false, |v| v != "0");
                        apply_omaf(
                            current_adaptation.as_mut(),
                            current_rep.as_mut(),
                            inside_rep,
                            |omaf| omaf.multi_resolution = omaf.multi_resolution || multi,
                        );
                    }
                    _ => {}
                }
            }
            Event::Text(ref text) => {
                if inside_base_url && inside_rep {
                    if let (Some(rep), Ok(value)) = (current_rep.as_mut(), text.unescape()) {
                        let value = value.trim();
                        if !value.is_empty() {
                            rep.base_url = Some(value.to_string());
                        }
                    }
                }
            }
            Event::End(ref e) => {
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref()).unwrap_or("");
                let local = tag.rsplit(':').next().unwrap_or(tag);
                match local {
                    "BaseURL" => inside_base_url = false,
                    "Representation" => {
                        inside_rep = false;
                        template_target = TemplateTarget::Adaptation;
                        if let (Some(rep), Some(adaptation)) =
                            (current_rep.take(), current_adaptation.as_mut())
                        {
                            adaptation.representations.push(rep);
                        }
                    }
                    "AdaptationSet" => {
                        if let Some(mut adaptation) = current_adaptation.take() {
                            if period_index <= 1 {
                                // representations sorted ascending by
                                // bandwidth; an invariant downstream relies
                                // on
                                adaptation
                                    .representations
                                    .sort_by_key(|r| r.bandwidth);
                                mpd.adaptation_sets.push(adaptation);
                            }
                        }
                    }
                    "EssentialProperty" | "SupplementalProperty" => {
                        property_context = PropertyContext::None;
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if mpd.adaptation_sets.is_empty() {
        return Err(invalid("MPD contains no adaptation sets"));
    }
    Ok(mpd)
}

fn parse_mpd_attributes(mpd: &mut Mpd, attrs: &[(String, String)]) -> Result<()> {
    if let Some(value) = get(attrs, "type") {
        mpd.presentation_type = match value {
            "dynamic" => PresentationType::Dynamic,
            _ => PresentationType::Static,
        };
    }
    if let Some(value) = get(attrs, "profiles") {
        mpd.profiles = value.split(',').map(DashProfile::from_urn).collect();
    }
    if let Some(value) = get(attrs, "availabilityStartTime") {
        mpd.availability_start_time = value.parse::<chrono::DateTime<chrono::Utc>>().ok();
    }
    if let Some(value) = get(attrs, "mediaPresentationDuration") {
        mpd.media_presentation_duration_ms = parse_iso_duration_ms(value);
    }
    if let Some(value) = get(attrs, "minimumUpdatePeriod") {
        mpd.minimum_update_period_ms = parse_iso_duration_ms(value);
    }
    if let Some(value) = get(attrs, "minBufferTime") {
        mpd.min_buffer_time_ms = parse_iso_duration_ms(value);
    }
    Ok(())
}

fn parse_adaptation_attributes(attrs: &[(String, String)]) -> AdaptationSetDesc {
    AdaptationSetDesc {
        id: get(attrs, "id").and_then(|v| v.parse().ok()).unwrap_or(0),
        content_type: get(attrs, "contentType").unwrap_or_default().to_string(),
        mime_type: get(attrs, "mimeType").unwrap_or_default().to_string(),
        codecs: get(attrs, "codecs").unwrap_or_default().to_string(),
        ..Default::default()
    }
}

fn parse_representation_attributes(attrs: &[(String, String)]) -> RepresentationDesc {
    RepresentationDesc {
        id: get(attrs, "id").unwrap_or_default().to_string(),
        bandwidth: get(attrs, "bandwidth")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        width: get(attrs, "width").and_then(|v| v.parse().ok()).unwrap_or(0),
        height: get(attrs, "height")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        frame_rate: get(attrs, "frameRate").map(parse_frame_rate).unwrap_or(0.0),
        codecs: get(attrs, "codecs").unwrap_or_default().to_string(),
        quality_ranking: get(attrs, "qualityRanking").and_then(|v| v.parse().ok()),
        dependency_ids: get(attrs, "dependencyId")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        association_id: get(attrs, "associationId").map(str::to_string),
        association_type: get(attrs, "associationType").map(str::to_string),
        ..Default::default()
    }
}

fn parse_coverage_attributes(attrs: &[(String, String)]) -> CoverageInfo {
    CoverageInfo {
        azimuth_center: get(attrs, "centre_azimuth")
            .map(parse_q16_degrees)
            .unwrap_or(0.0),
        elevation_center: get(attrs, "centre_elevation")
            .map(parse_q16_degrees)
            .unwrap_or(0.0),
        azimuth_range: get(attrs, "azimuth_range")
            .map(parse_q16_degrees)
            .unwrap_or(360.0),
        elevation_range: get(attrs, "elevation_range")
            .map(parse_q16_degrees)
            .unwrap_or(180.0),
    }
}

fn apply_omaf(
    adaptation: Option<&mut AdaptationSetDesc>,
    representation: Option<&mut RepresentationDesc>,
    inside_rep: bool,
    f: impl FnOnce(&mut OmafAttributes),
) {
    if inside_rep {
        if let Some(rep) = representation {
            f(&mut rep.omaf);
            return;
        }
    }
    if let Some(adaptation) = adaptation {
        f(&mut adaptation.omaf);
    }
}

fn set_projection(
    value: &str,
    adaptation: Option<&mut AdaptationSetDesc>,
    representation: Option<&mut RepresentationDesc>,
    inside_rep: bool,
) {
    if let Ok(projection) = value.parse::<u8>() {
        apply_omaf(adaptation, representation, inside_rep, |omaf| {
            omaf.projection_type = Some(projection)
        });
    }
}

fn parse_property(
    attrs: &[(String, String)],
    is_empty: bool,
    mut adaptation: Option<&mut AdaptationSetDesc>,
    mut representation: Option<&mut RepresentationDesc>,
    inside_rep: bool,
) -> Result<PropertyContext> {
    let scheme = get(attrs, "schemeIdUri").unwrap_or_default().to_string();
    let value = get(attrs, "value").map(str::to_string);
    let mut context = PropertyContext::None;
    match scheme.as_str() {
        SCHEME_PROJECTION => {
            // projection may come as an attribute of the descriptor or a
            // child element
            if let Some(v) = get(attrs, "projection_type") {
                set_projection(v, adaptation.as_deref_mut(), representation.as_deref_mut(), inside_rep);
            } else if !is_empty {
                context = PropertyContext::Projection;
            }
        }
        SCHEME_COVERAGE => {
            if get(attrs, "centre_azimuth").is_some() {
                let coverage = parse_coverage_attributes(attrs);
                apply_omaf(
                    adaptation.as_deref_mut(),
                    representation.as_deref_mut(),
                    inside_rep,
                    |omaf| omaf.coverage = Some(coverage),
                );
            } else if !is_empty {
                context = PropertyContext::Coverage;
            }
        }
        SCHEME_SPHERE_QUALITY => {
            if !is_empty {
                context = PropertyContext::SphereQuality;
            }
        }
        SCHEME_2D_QUALITY => {
            if !is_empty {
                context = PropertyContext::TwoDQuality;
            }
        }
        SCHEME_PACKING => {
            apply_omaf(
                adaptation.as_deref_mut(),
                representation.as_deref_mut(),
                inside_rep,
                |omaf| omaf.has_region_wise_packing = true,
            );
        }
        SCHEME_PRESELECTION => {
            if let Some(value) = value.as_deref() {
                let (tag, members) = value.split_once(',').unwrap_or((value, ""));
                let ids = members
                    .split_whitespace()
                    .filter_map(|v| v.parse().ok())
                    .collect::<Vec<u32>>();
                apply_omaf(
                    adaptation.as_deref_mut(),
                    representation.as_deref_mut(),
                    inside_rep,
                    |omaf| omaf.preselection = Some((tag.trim().to_string(), ids)),
                );
            }
        }
        SCHEME_FRAME_PACKING => {
            if let Some(packing) = value
                .as_deref()
                .and_then(|v| v.parse().ok())
                .and_then(FramePacking::from_cicp)
            {
                if let Some(adaptation) = adaptation.as_deref_mut() {
                    adaptation.frame_packing = Some(packing);
                }
            }
        }
        SCHEME_STEREO_ID => {
            let channel = value.as_deref().and_then(|v| match v.chars().next() {
                Some('l') => Some(StereoChannel::Left),
                Some('r') => Some(StereoChannel::Right),
                _ => None,
            });
            if inside_rep {
                if let Some(rep) = representation.as_deref_mut() {
                    rep.stereo = channel;
                }
            } else if let Some(adaptation) = adaptation.as_deref_mut() {
                adaptation.stereo = channel;
            }
        }
        _ => {}
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASIC_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static"
     profiles="urn:mpeg:dash:profile:isoff-live:2011"
     mediaPresentationDuration="PT20S" minBufferTime="PT2S">
  <Period>
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4" codecs="hvc1.2.4.L120">
      <SegmentTemplate media="v_$RepresentationID$_$Number$.m4s"
                       initialization="v_$RepresentationID$_init.mp4"
                       duration="2000" timescale="1000" startNumber="1"/>
      <Representation id="B" bandwidth="2000000" width="3840" height="1920" frameRate="30"/>
      <Representation id="A" bandwidth="500000" width="1920" height="960" frameRate="30"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn representations_sorted_by_bandwidth() {
        let mpd = parse_mpd(BASIC_MPD).unwrap();
        assert_eq!(mpd.presentation_type, PresentationType::Static);
        assert_eq!(mpd.media_presentation_duration_ms, Some(20_000));
        let set = &mpd.adaptation_sets[0];
        assert_eq!(set.representations.len(), 2);
        assert_eq!(set.representations[0].id, "A");
        assert_eq!(set.representations[1].id, "B");
        assert_eq!(set.segment_template.as_ref().unwrap().segment_duration_ms(), Some(2000));
    }

    const OMAF_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:omaf="urn:mpeg:mpegI:omaf:2017" type="static"
     profiles="urn:mpeg:mpegI:omaf:dash:profile:indexed-isobmff:2020">
  <Period>
    <AdaptationSet id="10" contentType="video" codecs="hvc2.1.2.L120">
      <EssentialProperty schemeIdUri="urn:mpeg:mpegI:omaf:2017:pf" omaf:projection_type="1"/>
      <SupplementalProperty schemeIdUri="urn:mpeg:dash:preselection:2016" value="ext,10 11 12"/>
      <SegmentTemplate media="e_$Number$.m4s" initialization="e_init.mp4" duration="1000" timescale="1000"/>
      <Representation id="ext1" bandwidth="100000"/>
    </AdaptationSet>
    <AdaptationSet id="11" contentType="video" codecs="hvc1.1.2.L120">
      <EssentialProperty schemeIdUri="urn:mpeg:mpegI:omaf:2017:cc">
        <omaf:coverageInfo centre_azimuth="5898240" centre_elevation="0" azimuth_range="5898240" elevation_range="5898240"/>
      </EssentialProperty>
      <SegmentTemplate media="t1_$Number$.m4s" initialization="t1_init.mp4" duration="1000" timescale="1000"/>
      <Representation id="t1q1" bandwidth="800000" qualityRanking="1"/>
      <Representation id="t1q2" bandwidth="300000" qualityRanking="2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn omaf_descriptors_parsed() {
        let mpd = parse_mpd(OMAF_MPD).unwrap();
        assert!(mpd.is_on_demand());
        let extractor = mpd.adaptation_set_by_id(10).unwrap();
        assert!(extractor.is_extractor());
        assert_eq!(extractor.omaf.projection_type, Some(1));
        assert_eq!(
            extractor.omaf.preselection,
            Some(("ext".to_string(), vec![10, 11, 12]))
        );
        let tile = mpd.adaptation_set_by_id(11).unwrap();
        let coverage = tile.omaf.coverage.unwrap();
        assert_eq!(coverage.azimuth_center, 90.0);
        assert_eq!(coverage.azimuth_range, 90.0);
    }

    #[test]
    fn metadata_role_and_association() {
        let xml = r#"<MPD type="static" profiles="urn:mpeg:dash:profile:isoff-main:2011"><Period>
            <AdaptationSet id="7" contentType="application">
              <Role schemeIdUri="urn:mpeg:dash:role:2011" value="metadata"/>
              <SegmentTemplate media="m_$Number$.m4s" initialization="m_init.mp4" duration="1000" timescale="1000"/>
              <Representation id="meta" bandwidth="1000" associationId="v0" associationType="cdsc"/>
            </AdaptationSet></Period></MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        let set = &mpd.adaptation_sets[0];
        assert!(set.is_metadata);
        let rep = &set.representations[0];
        assert_eq!(rep.association_id.as_deref(), Some("v0"));
        assert_eq!(rep.association_type.as_deref(), Some("cdsc"));
    }

    #[test]
    fn timeline_entries_collected() {
        let xml = r#"<MPD type="static" profiles="urn:mpeg:dash:profile:isoff-live:2011"><Period>
            <AdaptationSet id="1" contentType="video">
              <SegmentTemplate media="v_$Time$.m4s" initialization="v_init.mp4" timescale="1000">
                <SegmentTimeline>
                  <S t="0" d="2000" r="2"/>
                  <S d="1000"/>
                </SegmentTimeline>
              </SegmentTemplate>
              <Representation id="v" bandwidth="1"/>
            </AdaptationSet></Period></MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        let template = mpd.adaptation_sets[0].segment_template.as_ref().unwrap();
        let expanded = template.expanded_timeline();
        assert_eq!(expanded.len(), 4);
        assert_eq!(expanded[3], (6000, 1000));
    }
}
