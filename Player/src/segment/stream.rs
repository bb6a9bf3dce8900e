//! Segment stream drivers: produce a monotone sequence of
//! (segment-id, byte-range, URL) fetch requests and run the shared download
//! state machine around a poll-style HTTP connection.
//!
//! Four sequencer variants cover the §MPD shapes: number template over a
//! static or dynamic presentation, a segment timeline, and the on-demand
//! single-file form addressed through a `sidx`. The variants are a tagged
//! enum; they never compose and their count is fixed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mp4_box::boxes::sidx::SidxBox;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamingError};
use crate::http::{ByteRange, ConnectionState, HttpConnection, Transport};
use crate::mpd::{fill_template, PresentationType, SegmentTemplate};
use crate::segment::DashSegment;

const MAX_DOWNLOAD_RETRIES: u32 = 3;
const ABS_MIN_CACHE_BUFFERS: u32 = 2;
const ABS_MAX_CACHE_BUFFERS: u32 = 15;
const DYNAMIC_CACHE_BUFFERS: u32 = 4;
const DYNAMIC_MIN_DELAY_SEGMENTS: u32 = 2;
const PREBUFFER_MS: u64 = 2000;
/// Initial on-demand window: ftyp+moov+sidx for typical OMAF extractor
/// streams.
const INITIAL_INDEX_WINDOW: u64 = 5000;
const MAX_INDEX_WINDOW: u64 = 25 * INITIAL_INDEX_WINDOW;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared download state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Uninitialized,
    DownloadingInit,
    Idle,
    DownloadingMedia,
    Retry,
    EndOfStream,
    Error,
}

/// How aggressively on-demand subsegments may be merged into one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyRequirement {
    Low,
    Medium,
    NonCritical,
}

/// What a `process` tick produced.
#[derive(Debug)]
pub enum StreamEvent {
    /// A media segment finished downloading. `speed_factor` is
    /// segment-duration / download-time; 0 when timing was unavailable.
    MediaSegment {
        segment: DashSegment,
        speed_factor: f32,
    },
    /// The init section finished; `SegmentStream::init_segment` is set.
    InitReady,
    /// An on-demand stream resolved a deferred position to a segment id.
    TargetSegmentLocated {
        segment_id: u32,
        segment_time_ms: u64,
    },
}

/// Immutable inputs resolved from the MPD for one representation.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub representation_id: String,
    pub bandwidth: u32,
    /// Base the template output (or the single-file path) is joined to.
    pub base_url: String,
    pub template: Option<SegmentTemplate>,
    /// Representation-level BaseURL for on-demand single-file streams.
    pub single_file_path: Option<String>,
    pub presentation: PresentationType,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub init_segment_id: u32,
}

impl StreamConfig {
    fn join_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if self.base_url.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }
}

/// The per-variant segment-id bookkeeping.
enum SegmentSequencer {
    TemplateStatic {
        start_index: u32,
        current: u32,
        segment_count: u32,
    },
    TemplateDynamic {
        start_index: u32,
        current: Option<u32>,
        availability_start: DateTime<Utc>,
        min_delay_segments: u32,
    },
    TimelineStatic {
        start_number: u32,
        /// (start time, duration) pairs in timescale units.
        entries: Vec<(u64, u64)>,
        timescale: u64,
        /// 1-based index of the next entry.
        current: u32,
    },
    OnDemand {
        /// 1-based running index, may exceed the count when looping.
        current: u32,
        segment_count: u32,
        index_window: u64,
        sidx: Option<SidxBox>,
        merge_target: u32,
        looping: bool,
        /// Position to resolve once the sidx is known.
        pending_position_us: Option<u64>,
    },
}

struct PendingMedia {
    first_segment_id: u32,
    merged: u32,
    timestamp_base_ms: u64,
    /// Range actually requested, for on-demand subsegment splitting.
    range: Option<ByteRange>,
    /// A caller-supplied byte range must not be re-split by the sidx.
    range_overridden: bool,
}

pub struct SegmentStream {
    config: StreamConfig,
    sequencer: SegmentSequencer,
    state: DownloadState,
    connection: HttpConnection,
    init_segment: Option<DashSegment>,
    pending_media: Option<PendingMedia>,
    /// One-shot byte-range override for the next media request.
    byte_range_override: Option<ByteRange>,
    override_segment_id: Option<u32>,
    index_for_seek: Option<u32>,
    retry_index: u32,
    retry_counter: u32,
    running: bool,
    need_init: bool,
    download_start_time: Option<DateTime<Utc>>,
    segment_duration_ms: u64,
    total_duration_ms: u64,
    seekable: bool,
    buffering_time_ms: u64,
    max_cached_segments: u32,
    pre_buffer_segments: u32,
    pre_buffering: bool,
    auto_fill_cache: bool,
    cached_count: u32,
    total_segments_downloaded: u32,
    total_bytes_downloaded: u64,
    download_times_ms: VecDeque<u64>,
    latency_requirement: LatencyRequirement,
}

impl SegmentStream {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        buffering_time_ms: u64,
    ) -> SegmentStream {
        let template = config.template.clone();
        let segment_duration_ms = template
            .as_ref()
            .and_then(|t| t.segment_duration_ms())
            .unwrap_or(0);
        let total_duration_ms = config.total_duration_ms;

        let (sequencer, seekable, segment_duration_ms) = match &template {
            Some(template) if template.has_timeline() => {
                let entries = template.expanded_timeline();
                let first_duration_ms = entries
                    .first()
                    .map(|(_, d)| d * 1000 / template.timescale.max(1))
                    .unwrap_or(0);
                (
                    SegmentSequencer::TimelineStatic {
                        start_number: template.start_number,
                        entries,
                        timescale: template.timescale.max(1),
                        current: 1,
                    },
                    true,
                    first_duration_ms,
                )
            }
            Some(template) if config.presentation == PresentationType::Dynamic => (
                SegmentSequencer::TemplateDynamic {
                    start_index: template.start_number,
                    current: None,
                    availability_start: config.availability_start_time.unwrap_or_else(Utc::now),
                    min_delay_segments: DYNAMIC_MIN_DELAY_SEGMENTS,
                },
                false,
                segment_duration_ms,
            ),
            Some(template) => {
                let segment_count = if segment_duration_ms > 0 {
                    total_duration_ms.div_ceil(segment_duration_ms) as u32
                } else {
                    u32::MAX
                };
                (
                    SegmentSequencer::TemplateStatic {
                        start_index: template.start_number,
                        current: template.start_number,
                        segment_count,
                    },
                    true,
                    segment_duration_ms,
                )
            }
            None => (
                SegmentSequencer::OnDemand {
                    current: 1,
                    segment_count: 0,
                    index_window: INITIAL_INDEX_WINDOW,
                    sidx: None,
                    merge_target: 1,
                    looping: false,
                    pending_position_us: None,
                },
                true,
                0,
            ),
        };

        let is_dynamic = matches!(sequencer, SegmentSequencer::TemplateDynamic { .. });
        let mut stream = SegmentStream {
            config,
            sequencer,
            state: DownloadState::Uninitialized,
            connection: HttpConnection::new(transport, HTTP_TIMEOUT),
            init_segment: None,
            pending_media: None,
            byte_range_override: None,
            override_segment_id: None,
            index_for_seek: None,
            retry_index: 0,
            retry_counter: 0,
            running: false,
            need_init: true,
            download_start_time: None,
            segment_duration_ms,
            total_duration_ms,
            seekable,
            buffering_time_ms,
            max_cached_segments: if is_dynamic { DYNAMIC_CACHE_BUFFERS } else { 0 },
            pre_buffer_segments: 0,
            pre_buffering: false,
            auto_fill_cache: true,
            cached_count: 0,
            total_segments_downloaded: 0,
            total_bytes_downloaded: 0,
            download_times_ms: VecDeque::with_capacity(3),
            latency_requirement: LatencyRequirement::Low,
        };
        if !is_dynamic {
            stream.update_cache_bounds();
        }
        stream
    }

    /// `max_cached = max(2, ceil(buffering_time / segment_duration))`,
    /// clamped by the total segment count.
    fn update_cache_bounds(&mut self) {
        if self.segment_duration_ms == 0 {
            return;
        }
        let wanted = ABS_MIN_CACHE_BUFFERS
            .max(self.buffering_time_ms.div_ceil(self.segment_duration_ms) as u32)
            .min(ABS_MAX_CACHE_BUFFERS);
        self.max_cached_segments = match &self.sequencer {
            SegmentSequencer::TemplateStatic { segment_count, .. } => wanted.min(*segment_count),
            SegmentSequencer::OnDemand { segment_count, .. } if *segment_count > 0 => {
                wanted.min(*segment_count)
            }
            SegmentSequencer::TemplateDynamic { .. } => DYNAMIC_CACHE_BUFFERS,
            _ => wanted,
        }
        .max(1);
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn is_active(&self) -> bool {
        self.running
    }

    pub fn is_downloading(&self) -> bool {
        self.running
            && matches!(
                self.state,
                DownloadState::Uninitialized
                    | DownloadState::DownloadingInit
                    | DownloadState::Idle
                    | DownloadState::DownloadingMedia
                    | DownloadState::Retry
            )
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.state == DownloadState::EndOfStream
    }

    pub fn is_error(&self) -> bool {
        self.state == DownloadState::Error
    }

    /// Buffering: nothing cached and more downloads are expected, or the
    /// on-demand prebuffer target is not reached yet.
    pub fn is_buffering(&self) -> bool {
        if self.state == DownloadState::EndOfStream {
            return false;
        }
        if self.pre_buffering {
            return self.cached_count < self.pre_buffer_segments.max(1);
        }
        self.running && self.cached_count == 0
    }

    pub fn cached_segments(&self) -> u32 {
        self.cached_count
    }

    pub fn on_segments_released(&mut self, count: u32) {
        self.cached_count = self.cached_count.saturating_sub(count);
    }

    pub fn init_segment(&self) -> Option<&DashSegment> {
        self.init_segment.as_ref()
    }

    pub fn segment_duration_ms(&self) -> u64 {
        self.segment_duration_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.total_bytes_downloaded
    }

    pub fn avg_download_time_ms(&self) -> u64 {
        if self.download_times_ms.is_empty() {
            return 0;
        }
        self.download_times_ms.iter().sum::<u64>() / self.download_times_ms.len() as u64
    }

    pub fn set_buffering_time(&mut self, buffering_time_ms: u64) {
        self.buffering_time_ms = buffering_time_ms;
        self.update_cache_bounds();
    }

    pub fn set_cache_fill_mode(&mut self, auto_fill: bool) {
        self.auto_fill_cache = auto_fill;
    }

    pub fn set_looping(&mut self) {
        if let SegmentSequencer::OnDemand { looping, .. } = &mut self.sequencer {
            *looping = true;
        }
    }

    /// Chooses the merge factor: low latency fetches one subsegment at a
    /// time, medium about a second, non-critical about three.
    pub fn set_latency_requirement(&mut self, requirement: LatencyRequirement) {
        self.latency_requirement = requirement;
        if let SegmentSequencer::OnDemand { merge_target, .. } = &mut self.sequencer {
            if self.segment_duration_ms > 0 {
                *merge_target = merge_factor(requirement, self.segment_duration_ms);
                debug!(
                    "{} target segments merged per request: {}",
                    self.config.representation_id, merge_target
                );
            }
        }
    }

    /// Applies a refreshed MPD template: a grown timeline extends the
    /// entry table in place, template parameters update without touching
    /// the download position.
    pub fn update_template(&mut self, template: &crate::mpd::SegmentTemplate) {
        match &mut self.sequencer {
            SegmentSequencer::TimelineStatic { entries, .. } => {
                let updated = template.expanded_timeline();
                if updated.len() > entries.len() {
                    debug!(
                        "timeline grew from {} to {} entries",
                        entries.len(),
                        updated.len()
                    );
                    *entries = updated;
                }
            }
            SegmentSequencer::TemplateStatic { segment_count, .. } => {
                if let Some(duration_ms) = template.segment_duration_ms() {
                    if duration_ms > 0 && self.total_duration_ms > 0 {
                        self.segment_duration_ms = duration_ms;
                        *segment_count = self.total_duration_ms.div_ceil(duration_ms) as u32;
                    }
                }
            }
            _ => {}
        }
        self.config.template = Some(template.clone());
    }

    pub fn start(&mut self, download_start_time: DateTime<Utc>, independent: bool) {
        self.download_start_time = Some(download_start_time);
        self.start_downloader(None, independent);
    }

    pub fn start_from(&mut self, segment_id: u32, independent: bool) {
        self.start_downloader(Some(segment_id), independent);
    }

    pub fn start_with_override(&mut self, segment_id: u32, independent: bool) {
        self.start_downloader(Some(segment_id), independent);
    }

    pub fn start_with_byte_range(
        &mut self,
        segment_id: u32,
        start_byte: u64,
        end_byte: u64,
        independent: bool,
    ) {
        self.byte_range_override = Some((start_byte, end_byte));
        self.start_downloader(Some(segment_id), independent);
    }

    fn start_downloader(&mut self, override_segment_id: Option<u32>, independent: bool) {
        if self.running {
            return;
        }
        self.running = true;
        self.retry_counter = 0;
        self.override_segment_id = override_segment_id;
        // on-demand always parses its own index section
        self.need_init =
            independent || matches!(self.sequencer, SegmentSequencer::OnDemand { .. });
        if matches!(self.sequencer, SegmentSequencer::OnDemand { .. }) {
            self.pre_buffering = true;
        }
        if self.state == DownloadState::EndOfStream {
            self.state = if self.init_segment.is_some() || !self.need_init {
                DownloadState::Idle
            } else {
                DownloadState::Uninitialized
            };
        }
        if self.state == DownloadState::Uninitialized && !self.need_init {
            self.state = DownloadState::Idle;
        }
    }

    /// Synchronous stop: aborts any in-flight request.
    pub fn stop(&mut self) {
        self.running = false;
        self.connection.abort();
        if matches!(
            self.state,
            DownloadState::DownloadingMedia | DownloadState::DownloadingInit
        ) {
            self.on_download_aborted();
            self.state = if self.init_segment.is_some() {
                DownloadState::Idle
            } else {
                DownloadState::Uninitialized
            };
        }
        self.pending_media = None;
    }

    /// Deferred stop: lets an in-flight media request finish on later
    /// ticks unless `abort` is set.
    pub fn stop_async(&mut self, abort: bool) {
        self.running = false;
        if abort {
            self.stop();
        }
    }

    fn on_download_aborted(&mut self) {
        let merged = self
            .pending_media
            .as_ref()
            .map(|p| p.merged)
            .unwrap_or(1);
        match &mut self.sequencer {
            SegmentSequencer::TemplateStatic { current, .. } => {
                *current = current.saturating_sub(1)
            }
            SegmentSequencer::TemplateDynamic { current, .. } => {
                if let Some(current) = current.as_mut() {
                    *current = current.saturating_sub(1);
                }
            }
            SegmentSequencer::TimelineStatic { current, .. } => {
                *current = current.saturating_sub(1)
            }
            SegmentSequencer::OnDemand { current, .. } => {
                *current = current.saturating_sub(merged)
            }
        }
    }

    /// One scheduler tick. Polls the connection, advances the state
    /// machine and returns whatever finished.
    pub fn process(&mut self, forced_cache_update: bool) -> Vec<StreamEvent> {
        match self.state {
            DownloadState::Uninitialized if self.running => self.process_uninitialized(),
            DownloadState::DownloadingInit => self.process_downloading_init(),
            DownloadState::Idle | DownloadState::Retry => {
                self.process_idle_or_retry(forced_cache_update)
            }
            DownloadState::DownloadingMedia => self.process_downloading_media(),
            _ => Vec::new(),
        }
    }

    fn process_uninitialized(&mut self) -> Vec<StreamEvent> {
        if self.connection.is_busy() {
            return Vec::new();
        }
        match &self.sequencer {
            SegmentSequencer::OnDemand { index_window, .. } => {
                let url = self.single_file_url();
                debug!(
                    "{}: downloading index section, window {} bytes",
                    self.config.representation_id, index_window
                );
                self.connection.start_get(url, Some((0, index_window - 1)));
            }
            _ => {
                let Some(template) = &self.config.template else {
                    self.state = DownloadState::Error;
                    return Vec::new();
                };
                let path = fill_template(
                    &template.initialization,
                    &self.config.representation_id,
                    self.config.bandwidth,
                    0,
                    0,
                );
                let url = self.config.join_url(&path);
                debug!("{}: downloading init segment {}", self.config.representation_id, url);
                self.connection.start_get(url, None);
            }
        }
        self.state = DownloadState::DownloadingInit;
        Vec::new()
    }

    fn process_downloading_init(&mut self) -> Vec<StreamEvent> {
        let Some(result) = self.connection.take_result() else {
            return Vec::new();
        };
        match result {
            ConnectionState::Completed { status, bytes, .. }
                if (200..300).contains(&status) && !bytes.is_empty() =>
            {
                if matches!(self.sequencer, SegmentSequencer::OnDemand { .. }) {
                    self.handle_index_section(bytes)
                } else {
                    let mut segment =
                        DashSegment::init(self.config.init_segment_id, bytes);
                    segment.content.representation_id =
                        self.config.representation_id.clone();
                    self.total_bytes_downloaded += segment.size() as u64;
                    self.init_segment = Some(segment);
                    self.state = DownloadState::Idle;
                    vec![StreamEvent::InitReady]
                }
            }
            _ => {
                warn!(
                    "{}: initialization segment download failed",
                    self.config.representation_id
                );
                self.state = DownloadState::Error;
                Vec::new()
            }
        }
    }

    /// Grows the index window 5x (bounded at 25x the initial size) and
    /// re-issues the initial fetch. Returns false when the bound is hit.
    fn grow_index_window(&mut self, reason: &str) -> bool {
        let SegmentSequencer::OnDemand { index_window, .. } = &mut self.sequencer else {
            return false;
        };
        if *index_window >= MAX_INDEX_WINDOW {
            warn!(
                "index section parsing failed for {}: {}",
                self.config.representation_id, reason
            );
            self.state = DownloadState::Error;
            return false;
        }
        *index_window = (*index_window * 5).min(MAX_INDEX_WINDOW);
        let window = *index_window;
        debug!(
            "{}: index section parsing failed ({}), retry with a {} byte window",
            self.config.representation_id, reason, window
        );
        self.init_segment = None;
        self.state = DownloadState::Uninitialized;
        true
    }

    /// Parses the on-demand index window: `sidx` plus whatever part of the
    /// moov/mdat happens to be inside. Grows the window 5x (bounded) when
    /// either the sidx or the leading moov is not complete yet.
    fn handle_index_section(&mut self, bytes: Bytes) -> Vec<StreamEvent> {
        let parsed = match mp4_box::reader::parse_segment_index(&bytes, 0) {
            Ok(parsed) => parsed,
            Err(err) => {
                if self.grow_index_window(&err.to_string()) {
                    return self.process_uninitialized();
                }
                return Vec::new();
            }
        };

        // the init section is everything before the first subsegment; when
        // the window does not even reach the first mdat, part of the moov
        // may still be missing and the fetch is retried with a wider window
        let first_media_start = parsed
            .byte_range(0)
            .map(|(s, _)| s)
            .unwrap_or(bytes.len() as u64);
        if (bytes.len() as u64) < first_media_start {
            if self.grow_index_window("window ends before the first subsegment") {
                return self.process_uninitialized();
            }
            return Vec::new();
        }
        let init_data = bytes.slice(0..first_media_start as usize);

        self.segment_duration_ms = parsed.subsegment_duration_ms(0).unwrap_or(0);
        self.total_duration_ms = parsed.total_duration_ms();
        let segment_duration_ms = self.segment_duration_ms;
        let latency_requirement = self.latency_requirement;

        let SegmentSequencer::OnDemand {
            current,
            segment_count,
            sidx,
            merge_target,
            pending_position_us,
            ..
        } = &mut self.sequencer
        else {
            unreachable!("index section outside on-demand stream");
        };
        *segment_count = parsed.references.len() as u32;

        let mut events = Vec::new();
        if let Some(position_us) = pending_position_us.take() {
            if segment_duration_ms > 0 {
                let id = 1 + (position_us / 1000 / segment_duration_ms) as u32;
                *current = id;
                events.push(StreamEvent::TargetSegmentLocated {
                    segment_id: id,
                    segment_time_ms: (id - 1) as u64 * segment_duration_ms,
                });
            }
        }

        if segment_duration_ms > 0 {
            *merge_target = merge_factor(latency_requirement, segment_duration_ms);
            self.pre_buffer_segments = (PREBUFFER_MS.div_ceil(segment_duration_ms) as u32)
                .max(ABS_MIN_CACHE_BUFFERS)
                .min(*segment_count);
        }

        let mut init_segment = DashSegment::init(self.config.init_segment_id, init_data);
        init_segment.content.representation_id = self.config.representation_id.clone();
        self.init_segment = Some(init_segment);
        events.push(StreamEvent::InitReady);

        // synthesize media segments already inside the window
        let mut index = *current;
        while let Some((start, end)) = parsed.byte_range(index as usize - 1) {
            if end >= bytes.len() as u64 {
                break;
            }
            let mut segment = DashSegment::media(
                index,
                self.config.init_segment_id,
                bytes.slice(start as usize..=(end as usize)),
            );
            segment.range_start_byte = Some(start);
            segment.content.representation_id = self.config.representation_id.clone();
            debug!(
                "segment {} was downloaded within the index window, skip its fetch",
                index
            );
            events.push(StreamEvent::MediaSegment {
                segment,
                speed_factor: 0.0,
            });
            self.cached_count += 1;
            self.total_segments_downloaded += 1;
            index += 1;
        }
        *current = index;

        let segment_count = *segment_count;
        *sidx = Some(parsed);
        self.state = DownloadState::Idle;
        self.update_cache_bounds();
        self.max_cached_segments = self.max_cached_segments.min(segment_count.max(1));
        info!(
            "{}: segment index parsed, {} subsegments of {} ms",
            self.config.representation_id, segment_count, self.segment_duration_ms
        );
        events
    }

    fn has_cache_space(&self, forced: bool) -> bool {
        if forced {
            return true;
        }
        if !self.auto_fill_cache && !self.pre_buffering {
            return false;
        }
        self.cached_count < self.max_cached_segments.max(1)
    }

    fn process_idle_or_retry(&mut self, forced_cache_update: bool) -> Vec<StreamEvent> {
        if !self.running && self.state != DownloadState::Retry {
            return Vec::new();
        }
        if self.connection.is_busy() || !self.has_cache_space(forced_cache_update) {
            return Vec::new();
        }

        if let Some(index) = self.index_for_seek.take() {
            self.set_current_index(index);
        }
        if let Some(index) = self.override_segment_id.take() {
            self.set_current_index(index);
        }
        if self.state == DownloadState::Retry {
            self.set_current_index(self.retry_index);
        }

        let range_overridden = self.byte_range_override.is_some();
        match self.next_request() {
            Ok(Some(request)) => {
                self.retry_index = request.first_segment_id;
                debug!(
                    "{}: started downloading segment {} (merged {})",
                    self.config.representation_id, request.first_segment_id, request.merged
                );
                self.connection.start_get(request.url.clone(), request.range);
                self.pending_media = Some(PendingMedia {
                    first_segment_id: request.first_segment_id,
                    merged: request.merged,
                    timestamp_base_ms: request.timestamp_base_ms,
                    range: request.range,
                    range_overridden,
                });
                self.state = DownloadState::DownloadingMedia;
            }
            Ok(None) => {
                // either end of stream, or the stream head is not available
                // yet (dynamic) and we wait a tick
            }
            Err(_) => {
                self.state = DownloadState::Error;
            }
        }
        Vec::new()
    }

    fn set_current_index(&mut self, index: u32) {
        match &mut self.sequencer {
            SegmentSequencer::TemplateStatic { current, .. } => *current = index,
            SegmentSequencer::TemplateDynamic { current, .. } => *current = Some(index),
            SegmentSequencer::TimelineStatic { current, .. } => *current = index,
            SegmentSequencer::OnDemand { current, .. } => *current = index,
        }
    }

    fn single_file_url(&self) -> String {
        let path = self
            .config
            .single_file_path
            .clone()
            .unwrap_or_default();
        self.config.join_url(&path)
    }

    /// Computes the next fetch. `None` means nothing to do right now
    /// (stream head wait) or end of stream (state updated).
    fn next_request(&mut self) -> Result<Option<NextRequest>> {
        let representation_id = self.config.representation_id.clone();
        let bandwidth = self.config.bandwidth;
        match &mut self.sequencer {
            SegmentSequencer::TemplateStatic {
                current,
                segment_count,
                start_index,
            } => {
                if *current >= *start_index + *segment_count {
                    self.state = DownloadState::EndOfStream;
                    return Ok(None);
                }
                let template = self.config.template.as_ref().unwrap();
                let path = fill_template(
                    &template.media,
                    &representation_id,
                    bandwidth,
                    *current,
                    0,
                );
                let segment_id = *current;
                *current += 1;
                Ok(Some(NextRequest {
                    url: self.config.join_url(&path),
                    range: self.byte_range_override.take(),
                    first_segment_id: segment_id,
                    merged: 1,
                    timestamp_base_ms: 0,
                }))
            }
            SegmentSequencer::TemplateDynamic {
                current,
                start_index,
                availability_start,
                min_delay_segments,
            } => {
                let segment_duration_ms = self.segment_duration_ms.max(1);
                let segments_since = |at: DateTime<Utc>| -> u32 {
                    let elapsed_ms = (at - *availability_start).num_milliseconds().max(0) as u64;
                    (elapsed_ms / segment_duration_ms) as u32
                };
                let index = match current {
                    Some(index) => *index,
                    None => {
                        // start behind the live edge by the buffer plus the
                        // enforced stream-head delay
                        let start = self.download_start_time.unwrap_or_else(Utc::now);
                        let delay_ms = (self.max_cached_segments + *min_delay_segments) as u64
                            * segment_duration_ms;
                        let play_time =
                            start - chrono::Duration::milliseconds(delay_ms as i64);
                        let index = *start_index + segments_since(play_time);
                        info!(
                            "{}: initializing live position at segment {}",
                            representation_id, index
                        );
                        *current = Some(index);
                        index
                    }
                };
                // stream head enforcement: stay min_delay behind the newest
                // server-side segment
                let server_index = *start_index + segments_since(Utc::now());
                if server_index.saturating_sub(index) < *min_delay_segments {
                    debug!(
                        "{}: waiting for stream head (local {}, server {})",
                        representation_id, index, server_index
                    );
                    return Ok(None);
                }
                let template = self.config.template.as_ref().unwrap();
                let path =
                    fill_template(&template.media, &representation_id, bandwidth, index, 0);
                *current = Some(index + 1);
                Ok(Some(NextRequest {
                    url: self.config.join_url(&path),
                    range: self.byte_range_override.take(),
                    first_segment_id: index,
                    merged: 1,
                    timestamp_base_ms: 0,
                }))
            }
            SegmentSequencer::TimelineStatic {
                start_number,
                entries,
                timescale,
                current,
            } => {
                if *current as usize > entries.len() {
                    self.state = DownloadState::EndOfStream;
                    return Ok(None);
                }
                let (start_time, duration) = entries[*current as usize - 1];
                self.segment_duration_ms = duration * 1000 / *timescale;
                let number = *start_number + *current - 1;
                let template = self.config.template.as_ref().unwrap();
                let path = fill_template(
                    &template.media,
                    &representation_id,
                    bandwidth,
                    number,
                    start_time,
                );
                let segment_id = *current;
                *current += 1;
                Ok(Some(NextRequest {
                    url: self.config.join_url(&path),
                    range: self.byte_range_override.take(),
                    first_segment_id: segment_id,
                    merged: 1,
                    timestamp_base_ms: 0,
                }))
            }
            SegmentSequencer::OnDemand {
                current,
                segment_count,
                sidx,
                merge_target,
                looping,
                ..
            } => {
                let Some(sidx) = sidx.as_ref() else {
                    return Err(StreamingError::NotInitialized);
                };
                // loop handling: wrap the index and push the timestamp base
                // one full duration forward per lap, so client-visible time
                // keeps growing
                let count = (*segment_count).max(1);
                let laps = (*current - 1) / count;
                let timestamp_base_ms = laps as u64 * self.total_duration_ms;
                let looped_index = *current - laps * count;
                if *current > *segment_count {
                    if *looping {
                        debug!(
                            "{}: looped, next download segment {} running index {}",
                            representation_id, looped_index, current
                        );
                    } else {
                        debug!("{}: reached end of stream", representation_id);
                        self.state = DownloadState::EndOfStream;
                        return Ok(None);
                    }
                }
                let mut merged = *merge_target;
                if looped_index + merged > *segment_count + 1 {
                    merged = *segment_count + 1 - looped_index;
                }
                let (start, mut end) = sidx
                    .byte_range(looped_index as usize - 1)
                    .ok_or(StreamingError::ItemNotFound)?;
                if merged > 1 {
                    let (_, last_end) = sidx
                        .byte_range((looped_index + merged - 1) as usize - 1)
                        .ok_or(StreamingError::ItemNotFound)?;
                    end = last_end;
                }
                let range = self.byte_range_override.take().unwrap_or((start, end));
                let first_segment_id = *current;
                *current += merged;
                Ok(Some(NextRequest {
                    url: self.single_file_url(),
                    range: Some(range),
                    first_segment_id,
                    merged,
                    timestamp_base_ms,
                }))
            }
        }
    }

    fn process_downloading_media(&mut self) -> Vec<StreamEvent> {
        let Some(result) = self.connection.take_result() else {
            return Vec::new();
        };
        let Some(pending) = self.pending_media.take() else {
            return Vec::new();
        };
        match result {
            ConnectionState::Completed {
                status,
                bytes,
                duration,
            } if (200..300).contains(&status) && !bytes.is_empty() => {
                self.retry_counter = 0;
                self.state = DownloadState::Idle;
                self.handle_downloaded(pending, bytes, duration)
            }
            _ => {
                self.retry_counter += 1;
                if self.retry_counter > MAX_DOWNLOAD_RETRIES {
                    warn!(
                        "{}: segment {} failed after {} retries",
                        self.config.representation_id, pending.first_segment_id, MAX_DOWNLOAD_RETRIES
                    );
                    self.state = DownloadState::Error;
                } else {
                    debug!(
                        "{}: segment {} failed, retrying",
                        self.config.representation_id, pending.first_segment_id
                    );
                    self.retry_index = pending.first_segment_id;
                    self.on_download_aborted_for_retry(&pending);
                    self.state = DownloadState::Retry;
                }
                Vec::new()
            }
        }
    }

    fn on_download_aborted_for_retry(&mut self, pending: &PendingMedia) {
        match &mut self.sequencer {
            SegmentSequencer::OnDemand { current, .. } => {
                *current = current.saturating_sub(pending.merged)
            }
            _ => {}
        }
    }

    fn handle_downloaded(
        &mut self,
        pending: PendingMedia,
        bytes: Bytes,
        duration: Duration,
    ) -> Vec<StreamEvent> {
        let download_ms = duration.as_millis() as u64;
        self.total_bytes_downloaded += bytes.len() as u64;
        self.total_segments_downloaded += pending.merged;
        if download_ms > 0 {
            if self.download_times_ms.len() == 3 {
                self.download_times_ms.pop_front();
            }
            self.download_times_ms
                .push_back(download_ms / pending.merged as u64);
        }
        let mut speed_factor = if download_ms > 0 {
            (self.segment_duration_ms * pending.merged as u64) as f32 / download_ms as f32
        } else {
            0.0
        };

        let mut events = Vec::new();
        let sidx = match &self.sequencer {
            SegmentSequencer::OnDemand { sidx, .. } => sidx.as_ref(),
            _ => None,
        };
        if let (Some(sidx), Some((range_start, _)), false) =
            (sidx, pending.range, pending.range_overridden)
        {
            // split a (possibly merged) ranged response back into
            // per-subsegment blobs
            let count = sidx.references.len() as u32;
            for i in 0..pending.merged {
                let segment_id = pending.first_segment_id + i;
                let mut wrapped = segment_id;
                while wrapped > count {
                    wrapped -= count;
                }
                let Some((start, end)) = sidx.byte_range(wrapped as usize - 1) else {
                    break;
                };
                let local_start = (start - range_start) as usize;
                let local_end = (end - range_start) as usize;
                if local_end >= bytes.len() {
                    break;
                }
                let mut segment = DashSegment::media(
                    segment_id,
                    self.config.init_segment_id,
                    bytes.slice(local_start..=local_end),
                );
                segment.range_start_byte = Some(start);
                segment.timestamp_base_ms = pending.timestamp_base_ms;
                segment.content.representation_id = self.config.representation_id.clone();
                self.cached_count += 1;
                events.push(StreamEvent::MediaSegment {
                    segment,
                    speed_factor,
                });
                // only the first split segment carries the real timing
                speed_factor = 2.0;
            }
        } else {
            let mut segment = DashSegment::media(
                pending.first_segment_id,
                self.config.init_segment_id,
                bytes,
            );
            segment.range_start_byte = pending.range.map(|(start, _)| start);
            segment.timestamp_base_ms = pending.timestamp_base_ms;
            segment.content.representation_id = self.config.representation_id.clone();
            self.cached_count += 1;
            events.push(StreamEvent::MediaSegment {
                segment,
                speed_factor,
            });
        }

        if self.pre_buffering && self.cached_count >= self.pre_buffer_segments {
            debug!(
                "{}: prebuffering done at {} segments",
                self.config.representation_id, self.cached_count
            );
            self.pre_buffering = false;
        }
        if !self.running {
            // a deferred stop was requested while this request was in
            // flight
            self.connection.abort();
        }
        events
    }

    pub fn is_last_segment(&self) -> bool {
        match &self.sequencer {
            SegmentSequencer::TemplateStatic {
                current,
                start_index,
                segment_count,
            } => *current + 1 >= *start_index + *segment_count,
            SegmentSequencer::TimelineStatic { current, entries, .. } => {
                *current as usize >= entries.len()
            }
            SegmentSequencer::OnDemand {
                current,
                segment_count,
                looping,
                ..
            } => !*looping && *segment_count > 0 && *current + 1 >= *segment_count,
            SegmentSequencer::TemplateDynamic { .. } => false,
        }
    }

    /// Seeks the download position; returns the resolved time and the
    /// segment index it falls in.
    pub fn seek_to_ms(&mut self, target_ms: u64) -> Result<(u64, u32)> {
        if !self.seekable {
            return Err(StreamingError::NotSupported("stream is not seekable".into()));
        }
        match &self.sequencer {
            SegmentSequencer::TimelineStatic {
                entries, timescale, ..
            } => {
                if entries.is_empty() {
                    return Err(StreamingError::NotReady);
                }
                let target = target_ms * *timescale / 1000 + entries[0].0;
                let mut index = 0usize;
                while index + 1 < entries.len() {
                    if entries[index].0 <= target && entries[index + 1].0 > target {
                        break;
                    }
                    index += 1;
                }
                self.index_for_seek = Some(index as u32 + 1);
                let result_ms = (entries[index].0 - entries[0].0) * 1000 / *timescale;
                Ok((result_ms, index as u32 + 1))
            }
            _ => {
                if self.segment_duration_ms == 0 {
                    return Err(StreamingError::NotReady);
                }
                let start_index = match &self.sequencer {
                    SegmentSequencer::TemplateStatic { start_index, .. } => *start_index,
                    SegmentSequencer::OnDemand { .. } => 1,
                    _ => 1,
                };
                let index = start_index + (target_ms / self.segment_duration_ms) as u32;
                debug!("seeking to {} ms, segment index {}", target_ms, index);
                self.index_for_seek = Some(index);
                Ok((target_ms, index))
            }
        }
    }

    /// Maps a presentation time to the segment id that should be fetched
    /// for it, compensating for the observed download latency. The second
    /// value is the time aligned to the resolved segment's start (on
    /// demand) or the input time.
    pub fn calculate_segment_id(&mut self, pts_us: u64) -> (u32, u64) {
        let avg_download_time_ms = self.avg_download_time_ms();
        match &mut self.sequencer {
            SegmentSequencer::OnDemand {
                pending_position_us,
                ..
            } => {
                if self.segment_duration_ms == 0 {
                    // index not parsed yet: remember the target and resolve
                    // it when the sidx arrives
                    *pending_position_us = Some(pts_us);
                    return (1, pts_us);
                }
                let id = 1 + (pts_us / 1000 / self.segment_duration_ms) as u32;
                let aligned = (id - 1) as u64 * self.segment_duration_ms * 1000;
                (id, aligned)
            }
            SegmentSequencer::TimelineStatic {
                entries, timescale, ..
            } => {
                let target_ms = pts_us / 1000 + avg_download_time_ms;
                let mut index = 1u32;
                let target = target_ms * *timescale / 1000
                    + entries.first().map(|(s, _)| *s).unwrap_or(0);
                for (i, (start, duration)) in entries.iter().enumerate() {
                    if *start <= target && target < *start + *duration {
                        index = i as u32 + 1;
                        break;
                    }
                }
                (index, pts_us)
            }
            SegmentSequencer::TemplateStatic { start_index, .. }
            | SegmentSequencer::TemplateDynamic { start_index, .. } => {
                let target_ms = pts_us / 1000 + avg_download_time_ms;
                let id = *start_index
                    + (target_ms / self.segment_duration_ms.max(1)) as u32;
                debug!("calculated segment id {} from {} us", id, pts_us);
                (id, pts_us)
            }
        }
    }
}

struct NextRequest {
    url: String,
    range: Option<ByteRange>,
    first_segment_id: u32,
    merged: u32,
    timestamp_base_ms: u64,
}

fn merge_factor(requirement: LatencyRequirement, segment_duration_ms: u64) -> u32 {
    match requirement {
        LatencyRequirement::Low => 1,
        LatencyRequirement::Medium => 1000u64.div_ceil(segment_duration_ms) as u32,
        LatencyRequirement::NonCritical => 3000u64.div_ceil(segment_duration_ms) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StubTransport;
    use crate::mpd::SegmentTemplate;

    fn template_config(presentation: PresentationType, duration_ms: u64) -> StreamConfig {
        StreamConfig {
            representation_id: "v0".to_string(),
            bandwidth: 500_000,
            base_url: "http://test".to_string(),
            template: Some(SegmentTemplate {
                media: "seg_$RepresentationID$_$Number$.m4s".to_string(),
                initialization: "init_$RepresentationID$.mp4".to_string(),
                duration: Some(duration_ms),
                timescale: 1000,
                start_number: 1,
                timeline: Vec::new(),
            }),
            presentation,
            total_duration_ms: 10_000,
            ..Default::default()
        }
    }

    async fn settle(stream: &mut SegmentStream, forced: bool) -> Vec<StreamEvent> {
        let mut events = stream.process(forced);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            events.extend(stream.process(forced));
            if !events.is_empty() {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn template_static_fetches_in_order() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://test/init_v0.mp4", Bytes::from_static(b"init"));
        for i in 1..=5 {
            transport.insert(
                &format!("http://test/seg_v0_{}.m4s", i),
                Bytes::from(vec![i as u8; 10]),
            );
        }
        let mut stream =
            SegmentStream::new(template_config(PresentationType::Static, 2000), transport, 4000);
        stream.start(Utc::now(), true);

        let events = settle(&mut stream, false).await;
        assert!(matches!(events[0], StreamEvent::InitReady));
        assert!(stream.init_segment().is_some());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let events = settle(&mut stream, false).await;
            for event in events {
                if let StreamEvent::MediaSegment { segment, .. } = event {
                    ids.push(segment.segment_id);
                    stream.on_segments_released(1);
                }
            }
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn template_static_ends_after_last_segment() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://test/init_v0.mp4", Bytes::from_static(b"init"));
        for i in 1..=5 {
            transport.insert(
                &format!("http://test/seg_v0_{}.m4s", i),
                Bytes::from(vec![0u8; 4]),
            );
        }
        let mut stream =
            SegmentStream::new(template_config(PresentationType::Static, 2000), transport, 2000);
        stream.start(Utc::now(), true);
        let mut downloaded = 0;
        for _ in 0..20 {
            let events = settle(&mut stream, false).await;
            for event in events {
                if matches!(event, StreamEvent::MediaSegment { .. }) {
                    downloaded += 1;
                    stream.on_segments_released(1);
                }
            }
            if stream.is_end_of_stream() {
                break;
            }
        }
        // 10s of 2s segments
        assert_eq!(downloaded, 5);
        assert!(stream.is_end_of_stream());
    }

    #[tokio::test]
    async fn failed_download_retries_same_segment() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://test/init_v0.mp4", Bytes::from_static(b"init"));
        transport.insert("http://test/seg_v0_1.m4s", Bytes::from(vec![0u8; 4]));
        let mut stream = SegmentStream::new(
            template_config(PresentationType::Static, 2000),
            Arc::clone(&transport) as Arc<dyn Transport>,
            2000,
        );
        stream.start(Utc::now(), true);
        settle(&mut stream, false).await; // init
        *transport.fail_next.lock().unwrap() = 1;

        // first media attempt fails
        let mut got = None;
        for _ in 0..30 {
            let events = settle(&mut stream, false).await;
            if let Some(StreamEvent::MediaSegment { segment, .. }) = events
                .into_iter()
                .find(|e| matches!(e, StreamEvent::MediaSegment { .. }))
            {
                got = Some(segment.segment_id);
                break;
            }
        }
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn dynamic_start_respects_stream_head_delay() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://test/init_v0.mp4", Bytes::from_static(b"init"));
        for i in 1..=60 {
            transport.insert(
                &format!("http://test/seg_v0_{}.m4s", i),
                Bytes::from(vec![0u8; 4]),
            );
        }
        let mut config = template_config(PresentationType::Dynamic, 2000);
        let now = Utc::now();
        config.availability_start_time = Some(now - chrono::Duration::seconds(60));
        let mut stream = SegmentStream::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            2000,
        );
        stream.start(now, true);
        settle(&mut stream, false).await; // init
        let events = settle(&mut stream, false).await;
        let first = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MediaSegment { segment, .. } => Some(segment.segment_id),
                _ => None,
            })
            .expect("first live segment");
        // start = 1 + (60s - (4 cache + 2 delay) * 2s) / 2s = 1 + 24
        assert_eq!(first, 25);
        // nothing newer than now - min_delay may ever be fetched
        let server_edge = 1 + 60 / 2;
        assert!(first + DYNAMIC_MIN_DELAY_SEGMENTS <= server_edge);
    }

    fn on_demand_config() -> StreamConfig {
        StreamConfig {
            representation_id: "od0".to_string(),
            bandwidth: 1_000_000,
            base_url: "http://test".to_string(),
            template: None,
            single_file_path: Some("od0.mp4".to_string()),
            presentation: PresentationType::Static,
            total_duration_ms: 0,
            ..Default::default()
        }
    }

    /// A fake on-demand file: `moov`-ish filler, a real sidx, then the
    /// subsegment payload.
    fn on_demand_file(subsegments: &[(u32, u32)], filler: usize) -> Bytes {
        let mut sidx_payload = Vec::new();
        sidx_payload.extend_from_slice(&[0, 0, 0, 0]);
        sidx_payload.extend_from_slice(&1u32.to_be_bytes());
        sidx_payload.extend_from_slice(&1000u32.to_be_bytes());
        sidx_payload.extend_from_slice(&0u32.to_be_bytes());
        sidx_payload.extend_from_slice(&0u32.to_be_bytes());
        sidx_payload.extend_from_slice(&0u16.to_be_bytes());
        sidx_payload.extend_from_slice(&(subsegments.len() as u16).to_be_bytes());
        for (size, duration) in subsegments {
            sidx_payload.extend_from_slice(&size.to_be_bytes());
            sidx_payload.extend_from_slice(&duration.to_be_bytes());
            sidx_payload.extend_from_slice(&0x9000_0000u32.to_be_bytes());
        }
        let mut out = Vec::new();
        // leading filler box stands in for ftyp+moov
        out.extend_from_slice(&((filler as u32 + 8).to_be_bytes()));
        out.extend_from_slice(b"free");
        out.extend_from_slice(&vec![0u8; filler]);
        out.extend_from_slice(&((sidx_payload.len() as u32 + 8).to_be_bytes()));
        out.extend_from_slice(b"sidx");
        out.extend_from_slice(&sidx_payload);
        for (i, (size, _)) in subsegments.iter().enumerate() {
            out.extend_from_slice(&vec![i as u8 + 1; *size as usize]);
        }
        Bytes::from(out)
    }

    #[tokio::test]
    async fn on_demand_grows_index_window() {
        let transport = Arc::new(StubTransport::new());
        // sidx placed beyond the initial 5000-byte window
        let file = on_demand_file(&[(500, 2000), (500, 2000), (500, 2000)], 7000);
        transport.insert("http://test/od0.mp4", file);
        let mut stream = SegmentStream::new(
            on_demand_config(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            4000,
        );
        stream.start(Utc::now(), true);
        let events = settle(&mut stream, false).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::InitReady)));
        // the first window failed and was retried 5x larger
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].1, Some((0, INITIAL_INDEX_WINDOW - 1)));
        assert_eq!(requests[1].1, Some((0, INITIAL_INDEX_WINDOW * 5 - 1)));
    }

    #[tokio::test]
    async fn on_demand_synthesizes_windowed_segments_and_range_fetches_rest() {
        let transport = Arc::new(StubTransport::new());
        let file = on_demand_file(&[(100, 2000), (100, 2000), (8000, 2000)], 200);
        let file_len = file.len() as u64;
        transport.insert("http://test/od0.mp4", file);
        let mut stream = SegmentStream::new(
            on_demand_config(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            10_000,
        );
        stream.start(Utc::now(), true);
        let events = settle(&mut stream, false).await;
        // segments 1 and 2 are fully inside the 5000-byte window
        let synthesized: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::MediaSegment { segment, .. } => Some(segment.segment_id),
                _ => None,
            })
            .collect();
        assert_eq!(synthesized, vec![1, 2]);

        // the third goes over HTTP as a byte range
        let events = settle(&mut stream, false).await;
        let segment = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MediaSegment { segment, .. } => Some(segment),
                _ => None,
            })
            .expect("third segment");
        assert_eq!(segment.segment_id, 3);
        let requests = transport.requests.lock().unwrap();
        let last = requests.last().unwrap();
        let range = last.1.unwrap();
        assert_eq!(range.1, file_len - 1);
    }

    #[tokio::test]
    async fn on_demand_calculate_segment_id_matches_sidx() {
        let transport = Arc::new(StubTransport::new());
        let file = on_demand_file(&[(50, 2000), (50, 2000), (50, 2000), (50, 2000)], 100);
        transport.insert("http://test/od0.mp4", file);
        let mut stream = SegmentStream::new(
            on_demand_config(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            4000,
        );
        stream.start(Utc::now(), true);
        settle(&mut stream, false).await;
        // earliest pts of subsegment k resolves to segment k+1 (1-based)
        for k in 0..4u64 {
            let (id, aligned) = stream.calculate_segment_id(k * 2_000_000);
            assert_eq!(id as u64, k + 1);
            assert_eq!(aligned, k * 2_000_000);
        }
    }

    #[tokio::test]
    async fn template_calculate_round_trips_with_next_segment() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://test/init_v0.mp4", Bytes::from_static(b"init"));
        transport.insert("http://test/seg_v0_1.m4s", Bytes::from(vec![0u8; 4]));
        let mut stream =
            SegmentStream::new(template_config(PresentationType::Static, 2000), transport, 2000);
        stream.start(Utc::now(), true);
        settle(&mut stream, false).await;
        // the id computed for t=0 equals the first id the driver fetches
        let (id, _) = stream.calculate_segment_id(0);
        let events = settle(&mut stream, false).await;
        let first = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MediaSegment { segment, .. } => Some(segment.segment_id),
                _ => None,
            })
            .unwrap();
        assert_eq!(id, first);
    }
}
