//! Adaptation sets: groups of interchangeable representations with the
//! bitrate/quality switching protocol, plus the extractor-bundle machinery
//! in [`extractor`].

pub mod extractor;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::StreamingError;
use crate::http::Transport;
use crate::media::adapter::{Mp4ParserAdapter, StreamInfo};
use crate::media::StreamId;
use crate::mpd::{AdaptationSetDesc, Mpd, PresentationType};
use crate::representation::{DashRepresentation, RepresentationEvent};
use crate::segment::stream::{LatencyRequirement, StreamConfig};
use crate::segment::{MediaKind, SegmentContent};
use crate::viewport::{LongitudeDirection, TileType, TileViewport};

/// What an adaptation set is for, derived from the MPD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Baseline,
    Audio,
    Subpicture,
    Tile,
    Extractor,
    ExtractorWithDependencies,
    Overlay,
    Metadata,
}

/// Role a supporting tile currently plays for the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRole {
    Foreground,
    ForegroundMargin,
    /// Pole tiles have no meaningful intersection metric; they follow the
    /// foreground quality.
    ForegroundPole,
    Background,
}

/// Download-timing feedback for upstream heuristics. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayIssue {
    BaselayerDelayed,
    EnhLayerDelayed,
    BaselayerBuffering,
}

/// Events bubbled from the per-tick processing.
#[derive(Debug)]
pub enum SetEvent {
    StreamsCreated {
        set_id: u32,
        streams: Vec<StreamInfo>,
    },
    SegmentDownloaded {
        set_id: u32,
        segment_id: u32,
        /// Segment duration over download time; 0 when unknown.
        speed_factor: f32,
    },
    DelayIssue(DelayIssue),
    Error {
        set_id: u32,
        error: StreamingError,
    },
}

/// Presentation-wide inputs for building sets.
pub struct SetContext {
    pub base_url: String,
    pub presentation: PresentationType,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub on_demand: bool,
    pub transport: Arc<dyn Transport>,
    pub stream_ids: Arc<AtomicU32>,
    pub buffering_time_ms: u64,
}

impl SetContext {
    pub fn from_mpd(
        mpd: &Mpd,
        base_url: String,
        transport: Arc<dyn Transport>,
        buffering_time_ms: u64,
    ) -> SetContext {
        SetContext {
            base_url,
            presentation: mpd.presentation_type,
            availability_start_time: mpd.availability_start_time,
            total_duration_ms: mpd.media_presentation_duration_ms.unwrap_or(0),
            on_demand: mpd.is_on_demand(),
            transport,
            stream_ids: Arc::new(AtomicU32::new(0)),
            buffering_time_ms,
        }
    }
}

pub use extractor::ExtractorState;

pub struct DashAdaptationSet {
    id: u32,
    kind: SetKind,
    desc: AdaptationSetDesc,
    /// Sorted ascending by bitrate; the order never changes.
    representations: Vec<DashRepresentation>,
    current: usize,
    /// A pending ABR switch; `Some` means a switch is in flight.
    next: Option<usize>,
    covered_viewport: Option<TileViewport>,
    /// Unique bit within an extractor bundle.
    tile_flag: u64,
    role: TileRole,
    quality_level_count: u8,
    video_stream_id: Option<StreamId>,
    download_start_time: Option<DateTime<Utc>>,
    buffering_time_ms: u64,
    was_buffering: bool,
    pub(crate) extractor: Option<ExtractorState>,
}

impl DashAdaptationSet {
    /// Builds a set and its representations from the MPD description.
    /// `init_segment_ids` hands out presentation-unique init segment ids.
    pub fn from_desc(
        desc: &AdaptationSetDesc,
        context: &SetContext,
        init_segment_ids: &mut u32,
    ) -> DashAdaptationSet {
        let kind = classify(desc);
        let is_extractor = matches!(
            kind,
            SetKind::Extractor | SetKind::ExtractorWithDependencies
        );

        let mut representations = Vec::new();
        for rep_desc in &desc.representations {
            let init_segment_id = *init_segment_ids;
            *init_segment_ids += 1;
            let template = desc.template_for(rep_desc).cloned();
            let config = StreamConfig {
                representation_id: rep_desc.id.clone(),
                bandwidth: rep_desc.bandwidth,
                base_url: context.base_url.clone(),
                single_file_path: if template.is_none() {
                    Some(
                        rep_desc
                            .base_url
                            .clone()
                            .unwrap_or_else(|| format!("{}.mp4", rep_desc.id)),
                    )
                } else {
                    None
                },
                template,
                presentation: context.presentation,
                availability_start_time: context.availability_start_time,
                total_duration_ms: context.total_duration_ms,
                init_segment_id,
            };
            let content = SegmentContent {
                representation_id: rep_desc.id.clone(),
                adaptation_set_id: desc.id,
                init_segment_id,
                associated_to_representation: rep_desc.association_id.clone(),
                association_type: rep_desc.association_type.clone(),
            };
            let adapter = Arc::new(Mp4ParserAdapter::new(Arc::clone(&context.stream_ids)));
            // tiles of a bundle queue their segments for concatenation and
            // never parse on their own; the extractor representation queues
            // too, but parses the concatenated result through its adapter
            let tile_mode = is_extractor;
            let initialize_independently = true;
            let mut representation = DashRepresentation::new(
                rep_desc.clone(),
                config,
                content,
                adapter,
                true,
                initialize_independently,
                tile_mode,
                Arc::clone(&context.transport),
                context.buffering_time_ms,
            );
            if is_extractor {
                // a long extractor pipeline is cheap; batch its requests
                representation.set_cache_fill_mode(true);
                representation.set_latency_requirement(LatencyRequirement::NonCritical);
            }
            representations.push(representation);
        }
        representations.sort_by_key(|r| r.bitrate());

        let covered_viewport = desc.omaf.coverage.map(|coverage| {
            let tile_type = match desc.omaf.projection_type {
                Some(1) => TileType::Cubemap,
                _ => TileType::Equirect,
            };
            let mut viewport = TileViewport::new(tile_type);
            viewport.set(
                coverage.azimuth_center,
                coverage.elevation_center,
                coverage.azimuth_range,
                coverage.elevation_range,
                LongitudeDirection::CounterClockwise,
            );
            viewport
        });

        let quality_level_count = assign_quality_levels(&mut representations);

        let extractor = is_extractor.then(|| {
            ExtractorState::new(
                desc.omaf
                    .preselection
                    .as_ref()
                    .map(|(_, ids)| ids.iter().filter(|id| **id != desc.id).copied().collect())
                    .unwrap_or_default(),
            )
        });

        let mut set = DashAdaptationSet {
            id: desc.id,
            kind,
            desc: desc.clone(),
            representations,
            current: 0,
            next: None,
            covered_viewport,
            tile_flag: 0,
            role: TileRole::Background,
            quality_level_count,
            video_stream_id: None,
            download_start_time: None,
            buffering_time_ms: context.buffering_time_ms,
            was_buffering: false,
            extractor,
        };
        // the decoder-visible stream id belongs to the set, not the
        // representation: it must survive ABR switches
        if !matches!(set.kind, SetKind::Audio | SetKind::Overlay | SetKind::Metadata) {
            let id = context.stream_ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            set.set_video_stream_id(id);
        }
        set
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> SetKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: SetKind) {
        self.kind = kind;
    }

    /// Converts a subpicture set into a supporting tile set of a bundle:
    /// its representations queue downloaded segments for concatenation and
    /// never parse an init segment of their own.
    pub fn mark_as_tile(&mut self) {
        self.kind = SetKind::Tile;
        for representation in &mut self.representations {
            representation.set_tile_mode(true);
            representation.set_initialize_independently(false);
        }
    }

    pub fn desc(&self) -> &AdaptationSetDesc {
        &self.desc
    }

    pub fn media_kind(&self) -> MediaKind {
        match self.kind {
            SetKind::Audio | SetKind::Overlay => MediaKind::Audio,
            SetKind::Metadata => MediaKind::TimedMetadata,
            _ => MediaKind::Video,
        }
    }

    /// Loops on-demand playback: past the last segment, downloads wrap to
    /// the start with a grown timestamp base.
    pub fn set_looping(&mut self) {
        for representation in &mut self.representations {
            representation.set_looping();
        }
    }

    pub fn covered_viewport(&self) -> Option<&TileViewport> {
        self.covered_viewport.as_ref()
    }

    pub fn role(&self) -> TileRole {
        self.role
    }

    pub fn set_role(&mut self, role: TileRole) {
        self.role = role;
    }

    pub fn tile_flag(&self) -> u64 {
        self.tile_flag
    }

    pub fn set_tile_flag(&mut self, flag: u64) {
        self.tile_flag = flag;
    }

    pub fn quality_level_count(&self) -> u8 {
        self.quality_level_count
    }

    pub fn representations(&self) -> &[DashRepresentation] {
        &self.representations
    }

    pub fn current_representation(&self) -> &DashRepresentation {
        &self.representations[self.current]
    }

    pub fn current_representation_mut(&mut self) -> &mut DashRepresentation {
        &mut self.representations[self.current]
    }

    pub fn next_representation(&self) -> Option<&DashRepresentation> {
        self.next.map(|i| &self.representations[i])
    }

    pub fn is_abr_switch_ongoing(&self) -> bool {
        self.next.is_some()
    }

    pub fn video_stream_id(&self) -> Option<StreamId> {
        self.video_stream_id
            .or_else(|| self.current_representation().video_stream_id())
    }

    /// Pins the decoder-visible video stream id for every representation.
    /// Extractor bundles share one id so ABR switches keep decoder
    /// identity stable.
    pub fn set_video_stream_id(&mut self, stream_id: StreamId) {
        self.video_stream_id = Some(stream_id);
        for representation in &mut self.representations {
            representation.set_video_stream_id(stream_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.representations.iter().any(|r| r.is_downloading())
    }

    pub fn is_error(&self) -> bool {
        self.current_representation().is_error()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.current_representation().is_end_of_stream()
    }

    pub fn is_buffering(&self) -> bool {
        self.current_representation().is_buffering()
    }

    pub fn set_buffering_time(&mut self, buffering_time_ms: u64) {
        self.buffering_time_ms = buffering_time_ms;
        for representation in &mut self.representations {
            representation.set_buffering_time(buffering_time_ms);
        }
    }

    /// Aggregate bandwidth of the active representation.
    pub fn current_bandwidth(&self) -> u32 {
        self.current_representation().bitrate()
    }

    pub fn bitrates(&self) -> Vec<u32> {
        self.representations.iter().map(|r| r.bitrate()).collect()
    }

    pub fn start_download(&mut self, start_time: DateTime<Utc>) {
        self.download_start_time = Some(start_time);
        self.representations[self.current].start_download(start_time);
    }

    pub fn start_download_from(&mut self, segment_id: u32) {
        self.download_start_time = Some(Utc::now());
        self.representations[self.current].start_download_from(segment_id);
    }

    pub fn start_download_with_override(&mut self, pts_us: Option<u64>, segment_id: u32) {
        self.download_start_time = Some(Utc::now());
        if let Some(next) = self.next {
            self.representations[next].start_download_with_override(pts_us, segment_id);
        } else {
            self.representations[self.current].start_download_with_override(pts_us, segment_id);
        }
    }

    pub fn stop_download(&mut self) {
        for representation in &mut self.representations {
            representation.stop_download();
        }
        self.next = None;
    }

    pub fn stop_download_async(&mut self, reset: bool) {
        for representation in &mut self.representations {
            representation.stop_download_async(reset);
        }
        self.next = None;
    }

    pub fn clear_downloaded_content(&mut self) {
        for representation in &mut self.representations {
            representation.clear_downloaded_content();
        }
    }

    /// Quality-ranked lookup: the representation whose level equals `q`,
    /// rounding down (towards lower quality) when that level is absent.
    /// Failed representations are never picked.
    pub fn representation_index_for_quality(&self, quality: u8, levels: u8) -> usize {
        let quality = quality.min(levels);
        // exact level
        if let Some(index) = self
            .representations
            .iter()
            .position(|r| r.quality_level() == quality && !r.is_error())
        {
            return index;
        }
        // nearest existing lower-quality level (numerically above)
        let mut best: Option<(u8, usize)> = None;
        for (index, representation) in self.representations.iter().enumerate() {
            if representation.is_error() {
                continue;
            }
            let level = representation.quality_level();
            if level > quality {
                if best.map_or(true, |(b, _)| level < b) {
                    best = Some((level, index));
                }
            }
        }
        best.map(|(_, i)| i).unwrap_or(self.current)
    }

    pub fn representation_for_quality(&self, quality: u8, levels: u8) -> &DashRepresentation {
        &self.representations[self.representation_index_for_quality(quality, levels)]
    }

    /// Starts an ABR switch to the representation carrying `bitrate`.
    /// The new representation resumes at the segment after the current
    /// one's last download; the switch commits in `process_downloads`.
    pub fn select_bitrate(&mut self, bitrate: u32) {
        if bitrate == self.current_bandwidth() && self.next.is_none() {
            return;
        }
        let Some(target) = self
            .representations
            .iter()
            .position(|r| r.bitrate() == bitrate)
        else {
            return;
        };
        if self.next == Some(target) || self.representations[target].is_error() {
            return;
        }
        if !self.is_active() {
            debug!("set {}: inactive, switching representation directly", self.id);
            self.current = target;
            self.next = None;
            return;
        }
        let resume_at = self.representations[self.current].last_segment_id() + 1;
        self.representations[self.current].stop_download_async(false);
        if let Some(previous) = self.next.take() {
            self.representations[previous].stop_download();
        }
        info!(
            "set {}: switching {} -> {} at segment {}",
            self.id,
            self.representations[self.current].id(),
            self.representations[target].id(),
            resume_at
        );
        self.next = Some(target);
        self.representations[target].start_download_from(resume_at);
    }

    /// Quality-index variant of [`select_bitrate`], used for tiles inside
    /// an extractor bundle. `resume_segment_id` is the bundle's
    /// concatenation cursor.
    pub fn select_quality(&mut self, quality: u8, levels: u8, resume_segment_id: u32) {
        let target = self.representation_index_for_quality(quality, levels);
        if target == self.current && self.next.is_none() {
            return;
        }
        if self.next == Some(target) {
            return;
        }
        if !self.is_active() {
            self.current = target;
            self.next = None;
            return;
        }
        let resume_at = resume_segment_id
            .max(self.representations[self.current].last_segment_id() + 1);
        self.representations[self.current].stop_download_async(false);
        if let Some(previous) = self.next.take() {
            self.representations[previous].stop_download();
        }
        debug!(
            "set {}: tile quality {} -> representation {} from segment {}",
            self.id,
            quality,
            self.representations[target].id(),
            resume_at
        );
        self.next = Some(target);
        self.representations[target].start_download_from(resume_at);
    }

    /// For tile sets: commit a pending switch when the new representation
    /// has delivered the segment the bundle needs next.
    pub fn try_switching_representation(&mut self, segment_id: u32) {
        let Some(next) = self.next else {
            return;
        };
        if self.representations[next].has_segment(segment_id).is_some() {
            // drop stale segments of the outgoing representation
            self.representations[self.current].clean_up_old_segments(None);
            self.current = next;
            self.next = None;
        }
    }

    /// One scheduler tick: pump current (and pending) representations and
    /// commit an ABR switch once it is safe. Emits delay issues from
    /// per-segment speed factors.
    pub fn process_downloads(&mut self) -> Vec<SetEvent> {
        let mut out = Vec::new();
        let set_id = self.id;
        let is_enhancement = matches!(self.kind, SetKind::Tile | SetKind::Subpicture);

        let mut indexes: Vec<usize> = vec![self.current];
        if let Some(next) = self.next {
            if next != self.current {
                indexes.push(next);
            }
        }
        for index in indexes {
            for event in self.representations[index].process() {
                match event {
                    RepresentationEvent::StreamsCreated(streams) => {
                        out.push(SetEvent::StreamsCreated { set_id, streams });
                    }
                    RepresentationEvent::SegmentDownloaded {
                        speed_factor,
                        segment_id,
                    } => {
                        if speed_factor > 0.0 && speed_factor < 1.2 {
                            warn!(
                                "set {}: download speed factor {:.2}",
                                set_id, speed_factor
                            );
                            out.push(SetEvent::DelayIssue(if is_enhancement {
                                DelayIssue::EnhLayerDelayed
                            } else {
                                DelayIssue::BaselayerDelayed
                            }));
                        }
                        out.push(SetEvent::SegmentDownloaded {
                            set_id,
                            segment_id,
                            speed_factor,
                        });
                    }
                    RepresentationEvent::TargetSegmentLocated {
                        segment_id,
                        segment_time_ms,
                    } => {
                        if let Some(extractor) = self.extractor.as_mut() {
                            extractor.on_target_segment_located(segment_id, segment_time_ms);
                        }
                    }
                    RepresentationEvent::ParseError(error) => {
                        // recovery policy: pick another representation when
                        // one exists, otherwise propagate the failure
                        if self.handle_representation_error(index) {
                            warn!(
                                "set {}: representation {} failed ({}), switched to {}",
                                set_id,
                                self.representations[index].id(),
                                error,
                                self.representations[self.current].id()
                            );
                        } else {
                            out.push(SetEvent::Error { set_id, error });
                        }
                    }
                }
            }
            self.representations[index].maintain_cache();
        }

        // stall feedback, raised on the transition into buffering
        let buffering = self.is_buffering();
        if buffering && !self.was_buffering && self.kind == SetKind::Baseline && self.is_active() {
            out.push(SetEvent::DelayIssue(DelayIssue::BaselayerBuffering));
        }
        self.was_buffering = buffering;

        // commit a pending switch: a base layer drains first, an
        // enhancement switches as soon as the new representation is ready;
        // tile sets commit at concatenation time, when the incoming
        // representation has the segment the bundle needs next
        if self.kind == SetKind::Tile {
            return out;
        }
        if let Some(next) = self.next {
            if next != self.current {
                let commit = if is_enhancement {
                    !self.representations[next].is_buffering()
                } else {
                    self.representations[self.current].is_done()
                };
                if commit {
                    info!(
                        "set {}: switch done, {} -> {}",
                        set_id,
                        self.representations[self.current].id(),
                        self.representations[next].id()
                    );
                    self.representations[self.current].clear_downloaded_content();
                    self.current = next;
                    self.next = None;
                }
            } else {
                self.next = None;
            }
        }
        out
    }

    /// Moves playback off a failed representation. Returns true when
    /// another representation took over; false means nothing usable is
    /// left and the error must propagate.
    fn handle_representation_error(&mut self, errored: usize) -> bool {
        let resume_at = self.representations[errored].last_segment_id() + 1;
        if Some(errored) == self.next {
            // abandon the pending switch, keep playing the current one
            self.representations[errored].stop_download();
            self.next = None;
            return !self.representations[self.current].is_error();
        }
        if errored != self.current {
            return !self.representations[self.current].is_error();
        }
        // prefer an already-downloading switch target, then any healthy
        // representation
        let fallback = self
            .next
            .filter(|&next| !self.representations[next].is_error())
            .or_else(|| {
                (0..self.representations.len())
                    .find(|&i| i != errored && !self.representations[i].is_error())
            });
        let Some(fallback) = fallback else {
            return false;
        };
        self.representations[errored].stop_download();
        self.representations[errored].clear_downloaded_content();
        self.next = None;
        self.current = fallback;
        if !self.representations[fallback].is_downloading() {
            self.representations[fallback].start_download_from(resume_at);
        }
        true
    }

    pub fn seek_to_ms(&mut self, target_ms: u64) -> crate::error::Result<(u64, u32)> {
        let current = self.current;
        self.representations[current].seek_to_ms(target_ms)
    }

    /// Applies a refreshed MPD description to the matching
    /// representations.
    pub fn update_mpd(&mut self, desc: &AdaptationSetDesc) {
        for rep_desc in &desc.representations {
            if let Some(representation) = self
                .representations
                .iter_mut()
                .find(|r| r.id() == rep_desc.id)
            {
                if let Some(template) = desc.template_for(rep_desc) {
                    representation.update_mpd(template);
                }
            }
        }
        self.desc = desc.clone();
    }
}

fn classify(desc: &AdaptationSetDesc) -> SetKind {
    if desc.is_metadata {
        SetKind::Metadata
    } else if desc.is_audio() {
        // an audio set tied to a video representation is an overlay track
        if desc.representations.iter().any(|r| {
            r.association_id.is_some() && r.association_type.as_deref() != Some("cdsc")
        }) {
            SetKind::Overlay
        } else {
            SetKind::Audio
        }
    } else if desc.is_extractor() {
        if desc
            .representations
            .iter()
            .any(|r| !r.dependency_ids.is_empty())
        {
            SetKind::ExtractorWithDependencies
        } else {
            SetKind::Extractor
        }
    } else if desc.omaf.coverage.is_some() {
        SetKind::Subpicture
    } else {
        SetKind::Baseline
    }
}

/// Assigns quality levels (1 = best) to the bitrate-sorted representation
/// list, preferring declared rankings; returns the level count.
fn assign_quality_levels(representations: &mut [DashRepresentation]) -> u8 {
    let declared = representations
        .iter()
        .all(|r| r.declared_quality_ranking().is_some());
    let count = representations.len() as u8;
    for (index, representation) in representations.iter_mut().enumerate() {
        let level = if declared {
            representation.declared_quality_ranking().unwrap()
        } else {
            // ascending bitrate: highest bitrate is quality 1
            count - index as u8
        };
        representation.assign_quality_level(level);
    }
    count
}
