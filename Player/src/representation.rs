//! A single encoded variant of a media component: owns its segment stream
//! driver, feeds downloaded segments to a parser adapter (or queues them
//! for extractor concatenation), and tracks the download/buffering state
//! the adaptation set schedules against.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Result, StreamingError};
use crate::geometry::VideoSource;
use crate::http::Transport;
use crate::media::adapter::{Mp4ParserAdapter, SeekAccuracy, SeekDirection, StreamInfo};
use crate::media::{MediaPacket, StreamId};
use crate::mpd::RepresentationDesc;
use crate::segment::stream::{LatencyRequirement, SegmentStream, StreamConfig, StreamEvent};
use crate::segment::{DashSegment, SegmentContent};

/// What a representation reported from one scheduler tick.
#[derive(Debug)]
pub enum RepresentationEvent {
    /// New elementary streams exist (init segment was parsed).
    StreamsCreated(Vec<StreamInfo>),
    SegmentDownloaded {
        segment_id: u32,
        speed_factor: f32,
    },
    TargetSegmentLocated {
        segment_id: u32,
        segment_time_ms: u64,
    },
    ParseError(StreamingError),
}

pub struct DashRepresentation {
    desc: RepresentationDesc,
    content: SegmentContent,
    quality_level: u8,
    stream: SegmentStream,
    adapter: Arc<Mp4ParserAdapter>,
    /// False when the adapter belongs to an associated media
    /// representation or an owning extractor.
    owns_adapter: bool,
    /// Parse our own init segment; tile representations of an extractor
    /// bundle do not.
    initialize_independently: bool,
    /// Queue downloaded segments for concatenation instead of parsing.
    tile_mode: bool,
    tile_queue: VecDeque<DashSegment>,
    downloading: bool,
    initialized: bool,
    restarted: bool,
    errored: bool,
    /// Pre-assigned video stream id (extractor bundles share one).
    video_stream_id: Option<StreamId>,
    streams: Vec<StreamInfo>,
    last_segment_id: u32,
    /// Deferred seek executed once the overriding segment has arrived.
    seek_when_complete_us: Option<u64>,
    download_subsegment: bool,
    subsegment_supported: bool,
    sources: Vec<VideoSource>,
}

impl DashRepresentation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desc: RepresentationDesc,
        config: StreamConfig,
        content: SegmentContent,
        adapter: Arc<Mp4ParserAdapter>,
        owns_adapter: bool,
        initialize_independently: bool,
        tile_mode: bool,
        transport: Arc<dyn Transport>,
        buffering_time_ms: u64,
    ) -> DashRepresentation {
        let stream = SegmentStream::new(config, transport, buffering_time_ms);
        DashRepresentation {
            desc,
            content,
            quality_level: 0,
            stream,
            adapter,
            owns_adapter,
            initialize_independently,
            tile_mode,
            tile_queue: VecDeque::new(),
            downloading: false,
            initialized: false,
            restarted: false,
            errored: false,
            video_stream_id: None,
            streams: Vec::new(),
            last_segment_id: 0,
            seek_when_complete_us: None,
            download_subsegment: false,
            subsegment_supported: true,
            sources: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.desc.id
    }

    pub fn bitrate(&self) -> u32 {
        self.desc.bandwidth
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn frame_rate(&self) -> f64 {
        self.desc.frame_rate
    }

    pub fn declared_quality_ranking(&self) -> Option<u8> {
        self.desc.quality_ranking
    }

    pub fn dependency_ids(&self) -> &[String] {
        &self.desc.dependency_ids
    }

    pub fn association(&self) -> Option<(&str, &str)> {
        match (&self.desc.association_id, &self.desc.association_type) {
            (Some(id), Some(kind)) => Some((id.as_str(), kind.as_str())),
            _ => None,
        }
    }

    pub fn assign_quality_level(&mut self, level: u8) {
        self.quality_level = level;
    }

    pub fn quality_level(&self) -> u8 {
        self.quality_level
    }

    pub fn adapter(&self) -> &Arc<Mp4ParserAdapter> {
        &self.adapter
    }

    pub fn set_adapter(&mut self, adapter: Arc<Mp4ParserAdapter>, owns: bool) {
        self.adapter = adapter;
        self.owns_adapter = owns;
    }

    pub fn set_tile_mode(&mut self, tile_mode: bool) {
        self.tile_mode = tile_mode;
    }

    pub fn set_initialize_independently(&mut self, independent: bool) {
        self.initialize_independently = independent;
    }

    /// Whether the parser is ready to take `segment_id`: its tables are
    /// close to drained and the segment is not parsed yet.
    pub fn ready_for_segment(&self, segment_id: u32) -> bool {
        self.adapter
            .ready_for_segment(self.content.init_segment_id, segment_id)
    }

    pub fn set_video_stream_id(&mut self, stream_id: StreamId) {
        self.video_stream_id = Some(stream_id);
    }

    pub fn video_stream_id(&self) -> Option<StreamId> {
        self.video_stream_id
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn sources(&self) -> &[VideoSource] {
        &self.sources
    }

    pub fn set_sources(&mut self, sources: Vec<VideoSource>) {
        self.sources = sources;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading
    }

    pub fn is_error(&self) -> bool {
        self.errored || self.stream.is_error()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.stream.is_end_of_stream()
    }

    pub fn last_segment_id(&self) -> u32 {
        self.last_segment_id
    }

    pub fn segment_duration_ms(&self) -> u64 {
        self.stream.segment_duration_ms()
    }

    pub fn duration_ms(&self) -> u64 {
        self.stream.duration_ms()
    }

    pub fn avg_download_time_ms(&self) -> u64 {
        self.stream.avg_download_time_ms()
    }

    pub fn is_seekable(&self) -> bool {
        self.stream.is_seekable()
    }

    pub fn set_buffering_time(&mut self, buffering_time_ms: u64) {
        self.stream.set_buffering_time(buffering_time_ms);
    }

    pub fn set_cache_fill_mode(&mut self, auto_fill: bool) {
        self.stream.set_cache_fill_mode(auto_fill);
    }

    pub fn set_latency_requirement(&mut self, requirement: LatencyRequirement) {
        self.stream.set_latency_requirement(requirement);
    }

    pub fn set_looping(&mut self) {
        self.stream.set_looping();
    }

    /// Buffering: the driver has nothing cached and the sample tables (or
    /// the tile queue) are empty too.
    pub fn is_buffering(&self) -> bool {
        if self.tile_mode {
            return self.tile_queue.is_empty() && self.stream.is_buffering();
        }
        if !self.initialized {
            return self.downloading;
        }
        self.stream.is_buffering() && self.samples_left() == 0
    }

    fn samples_left(&self) -> usize {
        self.streams
            .iter()
            .map(|s| self.adapter.samples_left(s.stream_id))
            .sum()
    }

    /// Done: the last segment is served and every queued sample was read.
    pub fn is_done(&self) -> bool {
        !self.downloading
            || (self.stream.is_end_of_stream() && self.samples_left() == 0)
            || (self.stream.is_last_segment() && self.samples_left() == 0 && !self.tile_mode)
    }

    pub fn start_download(&mut self, start_time: DateTime<Utc>) {
        if self.downloading {
            return;
        }
        debug!("start downloading representation {}", self.desc.id);
        self.downloading = true;
        self.stream.start(start_time, self.initialize_independently);
    }

    /// Resumes at a specific segment id, reusing newer cached segments and
    /// discarding older ones.
    pub fn start_download_from(&mut self, segment_id: u32) {
        if self.downloading {
            return;
        }
        self.downloading = true;
        if let Some(newest) = self.adapter.newest_segment_id(self.content.init_segment_id) {
            let released = self.adapter.release_segments_until(segment_id);
            self.stream.on_segments_released(released);
            if newest >= segment_id {
                debug!(
                    "{}: reusing cached segments up to {}, continuing at {}",
                    self.desc.id,
                    newest,
                    newest + 1
                );
                self.stream
                    .start_from(newest + 1, self.initialize_independently);
                return;
            }
        }
        debug!("{}: starting download at segment {}", self.desc.id, segment_id);
        self.stream
            .start_from(segment_id, self.initialize_independently);
    }

    /// ABR/viewport switch entry: computes the segment id from the
    /// presentation time when the driver can, then arms a deferred seek so
    /// the parser lands on `pts_us` once the segment arrives.
    pub fn start_download_with_override(&mut self, pts_us: Option<u64>, segment_id: u32) {
        if self.downloading {
            return;
        }
        let mut segment_id = segment_id;
        if let Some(pts) = pts_us {
            if segment_id == 0 || self.stream.is_seekable() {
                let (id, _aligned) = self.stream.calculate_segment_id(pts);
                debug!(
                    "{}: recalculated override segment {} from {} us",
                    self.desc.id, id, pts
                );
                segment_id = id;
            }
        }
        self.seek_when_complete_us = None;
        self.restarted = true;
        self.downloading = true;

        if let Some(newest) = self.adapter.newest_segment_id(self.content.init_segment_id) {
            let released = self.adapter.release_segments_until(segment_id);
            self.stream.on_segments_released(released);
            if let Some(pts) = pts_us {
                if self
                    .adapter
                    .seek_to_us(pts, SeekDirection::Previous, SeekAccuracy::FrameAccurate)
                    .is_err()
                {
                    self.seek_when_complete_us = Some(pts);
                }
            }
            if newest >= segment_id {
                self.stream
                    .start_with_override(newest + 1, self.initialize_independently);
                return;
            }
        } else if let Some(pts) = pts_us {
            self.seek_when_complete_us = Some(pts);
        }

        if self.download_subsegment {
            if let Some(pts) = pts_us {
                if let Ok(subsegment) = self.adapter.segment_index_for(segment_id, pts) {
                    debug!(
                        "{}: subsegment fetch {}..{} for segment {}",
                        self.desc.id, subsegment.start_byte, subsegment.end_byte, segment_id
                    );
                    self.download_subsegment = false;
                    self.stream.start_with_byte_range(
                        segment_id,
                        subsegment.start_byte,
                        subsegment.end_byte,
                        self.initialize_independently,
                    );
                    return;
                }
            }
        }
        self.stream
            .start_with_override(segment_id, self.initialize_independently);
    }

    /// Fetches only the subsegment containing `pts_us`, via the stored
    /// segment index.
    pub fn start_subsegment_download(&mut self, pts_us: u64, segment_id: u32) -> Result<()> {
        if self.downloading {
            return Ok(());
        }
        if !self.subsegment_supported {
            return Err(StreamingError::NotSupported(
                "no usable segment index".into(),
            ));
        }
        self.download_subsegment = true;
        self.start_download_with_override(Some(pts_us), segment_id);
        Ok(())
    }

    /// Checks subsegment availability for a time/segment pair; flags the
    /// representation when indexes turn out unusable.
    pub fn has_subsegments_for(&mut self, pts_us: u64, segment_id: u32) -> Result<()> {
        let segment_id = if segment_id == 0 {
            self.stream.calculate_segment_id(pts_us).0
        } else {
            segment_id
        };
        let result = self.adapter.has_segment_index_for(segment_id, pts_us);
        if matches!(result, Err(StreamingError::NotSupported(_))) {
            self.subsegment_supported = false;
        }
        result
    }

    pub fn stop_download(&mut self) {
        if !self.downloading {
            return;
        }
        self.downloading = false;
        self.stream.stop();
        self.seek_when_complete_us = None;
    }

    /// Deferred stop. With `reset`, queued packets for this stream are
    /// dropped so the decoder can flush cleanly.
    pub fn stop_download_async(&mut self, reset: bool) {
        if reset {
            let released = self.adapter.release_all_segments(false);
            self.stream.on_segments_released(released);
        }
        if !self.downloading {
            return;
        }
        self.downloading = false;
        self.stream.stop_async(false);
    }

    pub fn clear_downloaded_content(&mut self) {
        self.tile_queue.clear();
        if self.owns_adapter {
            let released = self.adapter.release_all_segments(false);
            self.stream.on_segments_released(released);
        }
    }

    /// One scheduler tick: pump the driver and absorb whatever completed.
    pub fn process(&mut self) -> Vec<RepresentationEvent> {
        // when cache auto-fill is off, force one fetch if playback is about
        // to starve
        let mut forced = false;
        if self.downloading && !self.tile_mode && self.initialized {
            if self.stream.cached_segments() <= 1 && !self.streams.is_empty() {
                let frame_rate = self.desc.frame_rate.max(1.0);
                let left_ms = (self.samples_left() as f64 * 1000.0 / frame_rate) as u64;
                if left_ms < self.stream.avg_download_time_ms() {
                    forced = true;
                }
            }
        }
        let events = self.stream.process(forced);
        let mut out = Vec::new();
        for event in events {
            match event {
                StreamEvent::InitReady => {}
                StreamEvent::TargetSegmentLocated {
                    segment_id,
                    segment_time_ms,
                } => out.push(RepresentationEvent::TargetSegmentLocated {
                    segment_id,
                    segment_time_ms,
                }),
                StreamEvent::MediaSegment {
                    segment,
                    speed_factor,
                } => match self.accept_segment(segment, speed_factor, false) {
                    Ok(mut events) => out.append(&mut events),
                    Err(err) => {
                        warn!("{}: segment rejected: {}", self.desc.id, err);
                        self.errored = true;
                        out.push(RepresentationEvent::ParseError(err));
                    }
                },
            }
        }
        out
    }

    fn accept_segment(
        &mut self,
        mut segment: DashSegment,
        speed_factor: f32,
        force_parse: bool,
    ) -> Result<Vec<RepresentationEvent>> {
        segment.content = self.content.clone();
        let mut out = Vec::new();

        if self.initialize_independently && !self.initialized {
            let init = self
                .stream
                .init_segment()
                .ok_or(StreamingError::NotInitialized)?;
            let mut init = init.clone();
            init.content = self.content.clone();
            // init parse failure is fatal to the representation
            let created = self
                .adapter
                .open_initialization(&init, self.video_stream_id)?;
            if !created.is_empty() {
                self.streams = created;
            }
            if let Some(video) = self
                .streams
                .iter()
                .find(|s| s.kind == crate::segment::MediaKind::Video)
            {
                self.video_stream_id = Some(video.stream_id);
            }
            self.initialized = true;
            out.push(RepresentationEvent::StreamsCreated(self.streams.clone()));
        } else if !self.initialize_independently {
            self.initialized = true;
        }

        let segment_id = segment.segment_id;
        if self.tile_mode && !force_parse {
            self.tile_queue.push_back(segment);
        } else {
            // a malformed media segment is skipped; the stream carries on
            self.adapter.add_segment(&segment)?;
        }
        self.last_segment_id = self.last_segment_id.max(segment_id);

        if self.restarted {
            self.restarted = false;
        }
        if let Some(pts) = self.seek_when_complete_us {
            if self
                .adapter
                .seek_to_us(pts, SeekDirection::Previous, SeekAccuracy::FrameAccurate)
                .is_ok()
            {
                self.seek_when_complete_us = None;
            }
        }
        out.push(RepresentationEvent::SegmentDownloaded {
            segment_id,
            speed_factor,
        });
        Ok(out)
    }

    /// Reads the next packet for one of this representation's streams.
    pub fn read_frame(&self, stream_id: StreamId, now_us: u64) -> Result<MediaPacket> {
        self.adapter.read_frame(stream_id, now_us)
    }

    /// Reclaims consumed segments and returns the released count to the
    /// driver's cache accounting. Queue-mode representations track their
    /// driver cache through the queue instead.
    pub fn maintain_cache(&mut self) {
        if self.owns_adapter {
            let released = self.adapter.release_used_segments();
            if released > 0 && !self.tile_mode {
                self.stream.on_segments_released(released);
            }
        }
    }

    pub fn update_mpd(&mut self, template: &crate::mpd::SegmentTemplate) {
        self.stream.update_template(template);
    }

    pub fn seek_to_ms(&mut self, target_ms: u64) -> Result<(u64, u32)> {
        let (result_ms, segment_index) = self.stream.seek_to_ms(target_ms)?;
        Ok((result_ms, segment_index))
    }

    pub fn seek_streams_to_us(
        &self,
        target_us: u64,
        direction: SeekDirection,
        accuracy: SeekAccuracy,
    ) -> Result<u64> {
        self.adapter.seek_to_us(target_us, direction, accuracy)
    }

    pub fn calculate_segment_id(&mut self, pts_us: u64) -> (u32, u64) {
        self.stream.calculate_segment_id(pts_us)
    }

    /// Position of the next unread sample of the first stream.
    pub fn read_position_us(&self) -> Option<(u64, u32)> {
        self.streams
            .first()
            .and_then(|s| self.adapter.read_position_us(s.stream_id))
    }

    // Tile-queue surface, used by the owning extractor set.

    pub fn peek_segment(&self) -> Option<&DashSegment> {
        self.tile_queue.front()
    }

    pub fn has_segment(&self, segment_id: u32) -> Option<usize> {
        self.tile_queue
            .iter()
            .find(|s| s.segment_id == segment_id)
            .map(|s| s.size())
    }

    pub fn take_segment(&mut self, segment_id: u32) -> Option<DashSegment> {
        let index = self
            .tile_queue
            .iter()
            .position(|s| s.segment_id == segment_id)?;
        self.stream.on_segments_released(1);
        self.tile_queue.remove(index)
    }

    /// Drops queued tile segments older than `before_segment_id`; `None`
    /// clears the whole queue.
    pub fn clean_up_old_segments(&mut self, before_segment_id: Option<u32>) {
        let before = self.tile_queue.len();
        match before_segment_id {
            Some(id) => self.tile_queue.retain(|s| s.segment_id >= id),
            None => self.tile_queue.clear(),
        }
        let dropped = (before - self.tile_queue.len()) as u32;
        if dropped > 0 {
            self.stream.on_segments_released(dropped);
        }
    }

    /// Feeds an already-concatenated segment (extractor + tiles) to the
    /// adapter as a single media segment, bypassing the raw-segment queue.
    pub fn parse_concatenated_segment(
        &mut self,
        segment: DashSegment,
    ) -> Result<Vec<RepresentationEvent>> {
        self.accept_segment(segment, 2.0, true)
    }

    pub fn content(&self) -> &SegmentContent {
        &self.content
    }

    pub fn init_segment_id(&self) -> u32 {
        self.content.init_segment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StubTransport;
    use crate::media::test_media;
    use crate::mpd::{PresentationType, RepresentationDesc, SegmentTemplate};
    use crate::segment::stream::StreamConfig;
    use bytes::Bytes;
    use chrono::Utc;

    fn build_representation(transport: Arc<StubTransport>) -> DashRepresentation {
        let template = SegmentTemplate {
            media: "seg_$RepresentationID$_$Number$.m4s".to_string(),
            initialization: "init_$RepresentationID$.mp4".to_string(),
            duration: Some(20_000),
            timescale: 1000,
            start_number: 1,
            timeline: Vec::new(),
        };
        let config = StreamConfig {
            representation_id: "v0".to_string(),
            bandwidth: 1_000_000,
            base_url: "http://cdn".to_string(),
            template: Some(template),
            single_file_path: None,
            presentation: PresentationType::Static,
            availability_start_time: None,
            total_duration_ms: 20_000,
            init_segment_id: 1,
        };
        let content = crate::segment::SegmentContent {
            representation_id: "v0".to_string(),
            adaptation_set_id: 1,
            init_segment_id: 1,
            ..Default::default()
        };
        DashRepresentation::new(
            RepresentationDesc {
                id: "v0".to_string(),
                bandwidth: 1_000_000,
                frame_rate: 30.0,
                ..Default::default()
            },
            config,
            content,
            Arc::new(Mp4ParserAdapter::default()),
            true,
            true,
            false,
            transport as Arc<dyn Transport>,
            4000,
        )
    }

    async fn settle(representation: &mut DashRepresentation) -> Vec<RepresentationEvent> {
        let mut events = representation.process();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            events.extend(representation.process());
            if !events.is_empty() {
                break;
            }
        }
        events
    }

    fn sidx_bytes(subsegments: &[(u32, u32)]) -> Bytes {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&1000u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&(subsegments.len() as u16).to_be_bytes());
        for (size, duration) in subsegments {
            payload.extend_from_slice(&size.to_be_bytes());
            payload.extend_from_slice(&duration.to_be_bytes());
            payload.extend_from_slice(&0x9000_0000u32.to_be_bytes());
        }
        Bytes::from(test_media::plain_box(b"sidx", &payload))
    }

    #[tokio::test]
    async fn subsegment_download_issues_one_ranged_fetch() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/init_v0.mp4", test_media::init_segment(2000, false));
        // the 20 s segment is large; only a byte range of it is wanted
        transport.insert("http://cdn/seg_v0_1.m4s", Bytes::from(vec![0u8; 2000]));
        let mut representation = build_representation(Arc::clone(&transport));

        // fetch the init segment but hold back media downloads
        representation.set_cache_fill_mode(false);
        representation.start_download(Utc::now());
        for _ in 0..20 {
            representation.process();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        representation.stop_download();

        // a segment index for segment 1: 10 subsegments of 2 s
        let mut index_segment = DashSegment::media(1, 1, sidx_bytes(&[(100, 2000); 10]));
        index_segment.range_start_byte = Some(0);
        representation.adapter().add_segment_index(&index_segment).unwrap();
        let expected = representation
            .adapter()
            .segment_index_for(1, 7_000_000)
            .unwrap();
        // the subsegment begins at the prior sync point, 6 s
        assert_eq!(expected.earliest_presentation_time_ms, 6000);

        let requests_before = transport.request_count();
        representation
            .start_subsegment_download(7_000_000, 1)
            .unwrap();
        settle(&mut representation).await;

        let requests = transport.requests.lock().unwrap();
        let issued: Vec<_> = requests[requests_before..].to_vec();
        // exactly one media fetch, no init refetch, covering the
        // subsegment containing 7 s through the end of the segment
        assert_eq!(issued.len(), 1);
        assert!(issued[0].0.contains("seg_v0_1.m4s"));
        assert_eq!(
            issued[0].1,
            Some((expected.start_byte, expected.end_byte))
        );
    }

    #[tokio::test]
    async fn tile_mode_queues_instead_of_parsing() {
        let transport = Arc::new(StubTransport::new());
        transport.insert(
            "http://cdn/seg_v0_1.m4s",
            test_media::media_segment(1, 1, 0, &[32]),
        );
        let mut representation = build_representation(Arc::clone(&transport));
        representation.set_tile_mode(true);
        representation.set_initialize_independently(false);

        representation.start_download(Utc::now());
        settle(&mut representation).await;

        assert!(representation.has_segment(1).is_some());
        let segment = representation.take_segment(1).unwrap();
        assert_eq!(segment.segment_id, 1);
        // nothing was parsed into the adapter
        assert!(representation.adapter().newest_segment_id(1).is_none());
    }
}
