//! The media stream manager: owns the adaptation-set registry for the
//! active presentation, wires extractor bundles and metadata associations,
//! drives the per-tick download processing, and exposes the stream handles
//! and projection sources the decoder/renderer side consumes.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::adaptation::{
    extractor, DashAdaptationSet, SetContext, SetEvent, SetKind,
};
use crate::error::{Result, StreamingError};
use crate::geometry::{
    cubemap_from_rwpk, equirect_regions, source_direction_from_stereo, CubemapSource,
    EquirectSource, Rotation, SourceDirection, SourceType, StereoPosition, VideoSource,
};
use crate::media::adapter::{Mp4ParserAdapter, SeekAccuracy, SeekDirection, StreamInfo};
use crate::media::{MediaPacket, StreamId};
use crate::mpd::{FramePacking, Mpd};
use crate::segment::MediaKind;
use crate::viewport::RenderedViewport;

/// A stream handle plus its published projection source.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub info: StreamInfo,
    pub adaptation_set_id: u32,
    pub source: Option<VideoSource>,
    /// Media stream a metadata/audio stream is associated to.
    pub associated_stream: Option<StreamId>,
}

/// Local (non-DASH) playback state: one adapter over the whole file.
struct LocalPlayback {
    adapter: Arc<Mp4ParserAdapter>,
    streams: Vec<StreamInfo>,
}

pub struct MediaStreamManager {
    sets: Vec<DashAdaptationSet>,
    context: Option<SetContext>,
    local: Option<LocalPlayback>,
    handles: Vec<StreamHandle>,
    viewport: RenderedViewport,
    /// Extractor-set indexes acting as viewpoints; the first is active by
    /// default.
    viewpoints: Vec<usize>,
    active_viewpoint: usize,
    issues: Vec<crate::adaptation::DelayIssue>,
}

impl MediaStreamManager {
    /// Builds the set registry from a parsed MPD and wires the bundles.
    pub fn from_mpd(mpd: &Mpd, context: SetContext) -> Result<MediaStreamManager> {
        let mut init_segment_ids = 1u32;
        let mut sets = Vec::new();
        for desc in &mpd.adaptation_sets {
            sets.push(DashAdaptationSet::from_desc(
                desc,
                &context,
                &mut init_segment_ids,
            ));
        }

        // preselection bundles first, then dependency-declared ones
        for index in 0..sets.len() {
            match sets[index].kind() {
                SetKind::Extractor => extractor::register_bundle(&mut sets, index),
                SetKind::ExtractorWithDependencies => {
                    extractor::resolve_dependencies(&mut sets, index)
                }
                _ => {}
            }
        }
        let viewpoints: Vec<usize> = sets
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(
                    s.kind(),
                    SetKind::Extractor | SetKind::ExtractorWithDependencies
                )
            })
            .map(|(i, _)| i)
            .collect();

        // every extractor set of the active viewpoint shares one video
        // stream id
        let mut manager = MediaStreamManager {
            sets,
            context: Some(context),
            local: None,
            handles: Vec::new(),
            viewport: RenderedViewport::default(),
            viewpoints,
            active_viewpoint: 0,
            issues: Vec::new(),
        };
        manager.assign_bundle_stream_id();
        Ok(manager)
    }

    /// Opens a local ISOBMFF file instead of a DASH presentation.
    pub fn from_file(data: Bytes) -> Result<MediaStreamManager> {
        let adapter = Arc::new(Mp4ParserAdapter::default());
        let streams = adapter.open_file(data)?;
        let mut manager = MediaStreamManager {
            sets: Vec::new(),
            context: None,
            local: Some(LocalPlayback { adapter, streams }),
            handles: Vec::new(),
            viewport: RenderedViewport::default(),
            viewpoints: Vec::new(),
            active_viewpoint: 0,
            issues: Vec::new(),
        };
        manager.publish_local_handles();
        Ok(manager)
    }

    fn assign_bundle_stream_id(&mut self) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        if let Some(&viewpoint) = self.viewpoints.get(self.active_viewpoint) {
            let id = context.stream_ids.fetch_add(1, Ordering::Relaxed);
            self.sets[viewpoint].set_video_stream_id(id);
        }
    }

    fn publish_local_handles(&mut self) {
        let Some(local) = self.local.as_ref() else {
            return;
        };
        let mut handles = Vec::new();
        for info in &local.streams {
            let source = (info.kind == MediaKind::Video).then(|| {
                local
                    .adapter
                    .stream_omaf_properties(info.stream_id)
                    .map(|props| video_source_from_omaf(&props, None))
                    .unwrap_or(VideoSource::Identity)
            });
            handles.push(StreamHandle {
                info: info.clone(),
                adaptation_set_id: 0,
                source,
                associated_stream: None,
            });
        }
        // resolve cdsc references into stream associations
        for handle in handles.clone() {
            if handle.info.kind == MediaKind::TimedMetadata {
                for described in &handle.info.describes_tracks {
                    if let Some(target) = handles
                        .iter()
                        .find(|h| h.info.track_id == *described)
                        .map(|h| h.info.stream_id)
                    {
                        local
                            .adapter
                            .associate_streams(handle.info.stream_id, target);
                        if let Some(own) = handles
                            .iter_mut()
                            .find(|h| h.info.stream_id == handle.info.stream_id)
                        {
                            own.associated_stream = Some(target);
                        }
                    }
                }
            }
        }
        self.handles = handles;
    }

    /// Index of the bundle the active viewpoint plays, if any.
    fn active_bundle(&self) -> Option<usize> {
        self.viewpoints.get(self.active_viewpoint).copied()
    }

    /// Sets that read/publish independently on every tick: the active
    /// bundle, plus every non-tile set outside inactive viewpoints.
    fn active_set_indexes(&self) -> Vec<usize> {
        let active_bundle = self.active_bundle();
        self.sets
            .iter()
            .enumerate()
            .filter(|(index, set)| match set.kind() {
                SetKind::Tile => false,
                SetKind::Extractor | SetKind::ExtractorWithDependencies => {
                    Some(*index) == active_bundle
                }
                _ => true,
            })
            .map(|(index, _)| index)
            .collect()
    }

    pub fn start(&mut self, start_time: DateTime<Utc>) {
        for index in self.active_set_indexes() {
            self.sets[index].start_download(start_time);
        }
    }

    pub fn stop(&mut self) {
        for set in &mut self.sets {
            set.stop_download();
        }
    }

    pub fn pause(&mut self) {
        for set in &mut self.sets {
            set.stop_download_async(false);
        }
    }

    pub fn resume(&mut self) {
        for index in self.active_set_indexes() {
            let resume_at = self.sets[index]
                .current_representation()
                .last_segment_id()
                + 1;
            self.sets[index].start_download_from(resume_at);
        }
    }

    /// One pipeline tick: segment acceptance, concatenation, ABR commits
    /// and stream publication across every active set.
    pub fn process_downloads(&mut self) -> Vec<SetEvent> {
        let mut events = Vec::new();
        let active_bundle = self.active_bundle();
        for index in 0..self.sets.len() {
            match self.sets[index].kind() {
                SetKind::Tile => {}
                SetKind::Extractor | SetKind::ExtractorWithDependencies => {
                    if Some(index) == active_bundle {
                        events.append(&mut extractor::process_bundle(&mut self.sets, index));
                    }
                }
                _ => events.append(&mut self.sets[index].process_downloads()),
            }
        }
        for event in &events {
            match event {
                SetEvent::StreamsCreated { set_id, streams } => {
                    self.on_streams_created(*set_id, streams.clone());
                }
                SetEvent::SegmentDownloaded { .. } => {}
                SetEvent::DelayIssue(issue) => self.issues.push(*issue),
                SetEvent::Error { set_id, error } => {
                    warn!("set {}: {}", set_id, error);
                }
            }
        }
        events
    }

    fn on_streams_created(&mut self, set_id: u32, streams: Vec<StreamInfo>) {
        let Some(set_index) = self.sets.iter().position(|s| s.id() == set_id) else {
            return;
        };
        // metadata representations borrow the adapter of the media
        // representation they associate to; wire on first sight
        self.wire_associations(set_index);

        let (source, _) = self.source_for_set(set_index);
        // `associationId` ties overlay audio and timed metadata to the
        // media stream they annotate
        let associated_stream = self.sets[set_index]
            .current_representation()
            .association()
            .map(|(target, _)| target.to_string())
            .and_then(|target| {
                self.sets
                    .iter()
                    .find(|s| s.representations().iter().any(|r| r.id() == target))
                    .and_then(|s| s.video_stream_id())
            });
        for info in streams {
            if self.handles.iter().any(|h| h.info.stream_id == info.stream_id) {
                continue;
            }
            let source = (info.kind == MediaKind::Video)
                .then(|| source.clone().unwrap_or(VideoSource::Identity));
            let associated_stream =
                (info.kind != MediaKind::Video).then_some(associated_stream).flatten();
            if let (MediaKind::TimedMetadata, Some(target)) = (info.kind, associated_stream) {
                self.sets[set_index]
                    .current_representation()
                    .adapter()
                    .associate_streams(info.stream_id, target);
            }
            info!(
                "stream {} created for set {} ({:?})",
                info.stream_id, set_id, info.kind
            );
            self.handles.push(StreamHandle {
                info,
                adaptation_set_id: set_id,
                source,
                associated_stream,
            });
        }
    }

    /// Builds the projection source for a set: parsed OMAF boxes win,
    /// otherwise the MPD-declared projection applies.
    fn source_for_set(&self, set_index: usize) -> (Option<VideoSource>, Option<FramePacking>) {
        let set = &self.sets[set_index];
        if set.media_kind() != MediaKind::Video {
            return (None, None);
        }
        let desc = set.desc();
        let frame_packing = desc.frame_packing;
        let representation = set.current_representation();
        let source = representation
            .streams()
            .iter()
            .find(|s| s.kind == MediaKind::Video)
            .and_then(|s| representation.adapter().stream_omaf_properties(s.stream_id))
            .map(|props| video_source_from_omaf(&props, frame_packing))
            .or_else(|| {
                desc.omaf.projection_type.map(|projection| {
                    let stereo = match (desc.stereo, frame_packing) {
                        (Some(_), _) => StereoPosition::FramePacked,
                        (_, Some(_)) => StereoPosition::FramePacked,
                        _ => StereoPosition::Mono,
                    };
                    if projection == 1 {
                        VideoSource::Cubemap(CubemapSource {
                            stereo,
                            ..Default::default()
                        })
                    } else {
                        VideoSource::Equirect(EquirectSource {
                            stereo,
                            span_longitude: desc
                                .omaf
                                .coverage
                                .map(|c| c.azimuth_range)
                                .unwrap_or(360.0),
                            ..Default::default()
                        })
                    }
                })
            });
        (source, frame_packing)
    }

    /// Ties metadata representations (`associationType="cdsc"`) to the
    /// media representation they describe: shared adapter and stream
    /// association.
    fn wire_associations(&mut self, created_index: usize) {
        for index in 0..self.sets.len() {
            if self.sets[index].kind() != SetKind::Metadata {
                continue;
            }
            let association = self.sets[index]
                .current_representation()
                .association()
                .map(|(id, kind)| (id.to_string(), kind.to_string()));
            let Some((target_id, kind)) = association else {
                continue;
            };
            if kind != "cdsc" {
                continue;
            }
            let target_set = created_index;
            let matches = self.sets[target_set]
                .representations()
                .iter()
                .any(|r| r.id() == target_id);
            if !matches {
                continue;
            }
            let adapter = Arc::clone(self.sets[target_set].current_representation().adapter());
            let metadata_set = &mut self.sets[index];
            if !Arc::ptr_eq(metadata_set.current_representation().adapter(), &adapter) {
                debug!(
                    "metadata set {} shares the adapter of representation {}",
                    metadata_set.id(),
                    target_id
                );
                metadata_set
                    .current_representation_mut()
                    .set_adapter(adapter, false);
            }
        }
    }

    pub fn video_streams(&self) -> Vec<StreamHandle> {
        self.handles
            .iter()
            .filter(|h| h.info.kind == MediaKind::Video)
            .cloned()
            .collect()
    }

    pub fn audio_streams(&self) -> Vec<StreamHandle> {
        self.handles
            .iter()
            .filter(|h| h.info.kind == MediaKind::Audio)
            .cloned()
            .collect()
    }

    pub fn metadata_streams(&self) -> Vec<StreamHandle> {
        self.handles
            .iter()
            .filter(|h| h.info.kind == MediaKind::TimedMetadata)
            .cloned()
            .collect()
    }

    /// The source geometry list the renderer composits from.
    pub fn video_source_types(&self) -> Vec<SourceType> {
        self.handles
            .iter()
            .filter_map(|h| h.source.as_ref().map(|s| s.source_type()))
            .collect()
    }

    fn adapter_for_stream(&self, stream_id: StreamId) -> Option<Arc<Mp4ParserAdapter>> {
        if let Some(local) = self.local.as_ref() {
            return Some(Arc::clone(&local.adapter));
        }
        let handle = self.handles.iter().find(|h| h.info.stream_id == stream_id)?;
        let set = self
            .sets
            .iter()
            .find(|s| s.id() == handle.adaptation_set_id)?;
        Some(Arc::clone(set.current_representation().adapter()))
    }

    /// Pulls the next decodable video packet per video stream.
    pub fn read_video_frames(&mut self, now_us: u64) -> Vec<MediaPacket> {
        let mut packets = Vec::new();
        for handle in self.video_streams() {
            if let Some(adapter) = self.adapter_for_stream(handle.info.stream_id) {
                match adapter.read_frame(handle.info.stream_id, now_us) {
                    Ok(packet) => packets.push(packet),
                    Err(StreamingError::EndOfFile) => {}
                    Err(err) => warn!("video read failed: {}", err),
                }
            }
        }
        packets
    }

    pub fn read_audio_frames(&mut self) -> Vec<MediaPacket> {
        let mut packets = Vec::new();
        for handle in self.audio_streams() {
            if let Some(adapter) = self.adapter_for_stream(handle.info.stream_id) {
                match adapter.read_frame(handle.info.stream_id, 0) {
                    Ok(packet) => packets.push(packet),
                    Err(StreamingError::EndOfFile) => {}
                    Err(err) => warn!("audio read failed: {}", err),
                }
            }
        }
        packets
    }

    /// Pulls metadata packets whose presentation time has arrived.
    pub fn read_metadata(&mut self, now_us: u64) -> Vec<MediaPacket> {
        let mut packets = Vec::new();
        for handle in self.metadata_streams() {
            let Some(adapter) = self.adapter_for_stream(handle.info.stream_id) else {
                continue;
            };
            if let Some((pts_us, _)) = adapter.read_position_us(handle.info.stream_id) {
                if pts_us <= now_us {
                    if let Ok(packet) = adapter.read_frame(handle.info.stream_id, now_us) {
                        packets.push(packet);
                    }
                }
            }
        }
        packets
    }

    /// Viewport update: recompute tile roles of the active bundle.
    pub fn set_viewport(
        &mut self,
        longitude: f64,
        latitude: f64,
        horizontal_fov: f64,
        vertical_fov: f64,
    ) {
        let tile_type = self
            .active_bundle()
            .and_then(|index| self.sets[index].covered_viewport().map(|v| v.tile_type()))
            .unwrap_or(crate::viewport::TileType::Equirect);
        self.viewport
            .set_position(longitude, latitude, horizontal_fov, vertical_fov, tile_type);
        if let Some(index) = self.active_bundle() {
            extractor::update_tile_roles(&mut self.sets, index, &self.viewport);
        }
    }

    /// Quality fan-out to the active bundle.
    pub fn set_quality_levels(&mut self, foreground: u8, margin: u8, background: u8) {
        if let Some(index) = self.active_bundle() {
            let levels = self.sets[index].quality_level_count();
            extractor::set_quality_levels(
                &mut self.sets,
                index,
                foreground,
                margin,
                background,
                levels,
            );
        }
    }

    /// ABR entry point: picks the highest selectable aggregate bitrate at
    /// or under `bits_per_second` for every non-bundle video set, and maps
    /// the bundle bitrates to a quality triple for the active bundle.
    pub fn select_bitrate(&mut self, bits_per_second: u32) {
        let active_bundle = self.active_bundle();
        for index in 0..self.sets.len() {
            let set = &self.sets[index];
            match set.kind() {
                SetKind::Baseline | SetKind::Subpicture => {
                    let bitrates = set.bitrates();
                    let chosen = bitrates
                        .iter()
                        .copied()
                        .filter(|b| *b <= bits_per_second)
                        .max()
                        .or_else(|| bitrates.iter().copied().min());
                    if let Some(bitrate) = chosen {
                        self.sets[index].select_bitrate(bitrate);
                    }
                }
                SetKind::Extractor | SetKind::ExtractorWithDependencies
                    if Some(index) == active_bundle =>
                {
                    let bitrates = extractor::bundle_bitrates(&self.sets, index);
                    let levels = self.sets[index].quality_level_count().max(1);
                    // bitrates are ordered worst-foreground first
                    let step = bitrates
                        .iter()
                        .rposition(|b| *b <= bits_per_second)
                        .unwrap_or(0);
                    let foreground = levels.saturating_sub(step as u8).max(1);
                    let margin = (foreground + 1).min(levels);
                    let background = levels;
                    extractor::set_quality_levels(
                        &mut self.sets,
                        index,
                        foreground,
                        margin,
                        background,
                        levels,
                    );
                }
                _ => {}
            }
        }
    }

    pub fn is_buffering(&self) -> bool {
        if self.local.is_some() {
            return false;
        }
        self.active_set_indexes().iter().any(|&index| {
            match self.sets[index].kind() {
                SetKind::Extractor | SetKind::ExtractorWithDependencies => {
                    extractor::is_bundle_buffering(&self.sets, index)
                }
                _ => self.sets[index].is_buffering(),
            }
        })
    }

    pub fn is_end_of_stream(&self) -> bool {
        if self.local.is_some() {
            return false;
        }
        let indexes = self.active_set_indexes();
        !indexes.is_empty()
            && indexes.iter().all(|&index| match self.sets[index].kind() {
                SetKind::Extractor | SetKind::ExtractorWithDependencies => {
                    extractor::is_bundle_end_of_stream(&self.sets, index)
                }
                _ => self.sets[index].is_end_of_stream(),
            })
    }

    /// A non-recoverable failure somewhere in the active presentation: an
    /// errored set that had no representation left to fall back to, or a
    /// bundle with a failed extractor or tile.
    pub fn is_error(&self) -> bool {
        if self.local.is_some() {
            return false;
        }
        self.active_set_indexes()
            .iter()
            .any(|&index| match self.sets[index].kind() {
                SetKind::Extractor | SetKind::ExtractorWithDependencies => {
                    extractor::is_bundle_error(&self.sets, index)
                }
                _ => self.sets[index].is_error(),
            })
    }

    /// Seeks the whole presentation. Download positions move per driver,
    /// parsed samples per adapter.
    pub fn seek_to_ms(&mut self, target_ms: u64) -> Result<u64> {
        if let Some(local) = self.local.as_ref() {
            let result = local.adapter.seek_to_us(
                target_ms * 1000,
                SeekDirection::Previous,
                SeekAccuracy::NearestSyncFrame,
            )?;
            return Ok(result / 1000);
        }
        let mut result_ms = target_ms;
        let mut any_seeked = false;
        let active_bundle = self.active_bundle();
        for index in self.active_set_indexes() {
            // a non-seekable set (live template) keeps its position
            let Ok((resolved, segment_index)) = self.sets[index].seek_to_ms(target_ms) else {
                continue;
            };
            any_seeked = true;
            result_ms = resolved;
            if Some(index) == active_bundle {
                if let Some(state) = self.sets[index].extractor.as_mut() {
                    state.seek_to_segment(segment_index);
                }
                // tiles follow the bundle cursor on their next start
                let ids: Vec<u32> = self.sets[index]
                    .extractor
                    .as_ref()
                    .map(|s| s.supporting_ids.clone())
                    .unwrap_or_default();
                for id in ids {
                    if let Some(tile_index) = self.sets.iter().position(|s| s.id() == id) {
                        let _ = self.sets[tile_index].seek_to_ms(target_ms);
                    }
                }
            }
            let _ = self.sets[index]
                .current_representation()
                .seek_streams_to_us(
                    result_ms * 1000,
                    SeekDirection::Previous,
                    SeekAccuracy::NearestSyncFrame,
                );
        }
        if !any_seeked {
            return Err(StreamingError::NotSupported("presentation is not seekable".into()));
        }
        Ok(result_ms)
    }

    pub fn viewpoint_count(&self) -> usize {
        self.viewpoints.len()
    }

    /// Viewpoint switch: stop the old bundle (dropping queued decoder
    /// packets), move the new bundle to the presentation time, hand it a
    /// fresh video stream id and start it.
    pub fn switch_viewpoint(&mut self, viewpoint: usize) -> Result<()> {
        if viewpoint >= self.viewpoints.len() {
            return Err(StreamingError::ItemNotFound);
        }
        if viewpoint == self.active_viewpoint {
            return Ok(());
        }
        let old_index = self.active_bundle();
        let position_us = old_index.and_then(|index| {
            self.sets[index]
                .current_representation()
                .read_position_us()
                .map(|(us, _)| us)
        });
        if let Some(old) = old_index {
            info!("stopping viewpoint bundle {}", self.sets[old].id());
            self.sets[old].stop_download_async(true);
            self.sets[old].clear_downloaded_content();
            let ids: Vec<u32> = self.sets[old]
                .extractor
                .as_ref()
                .map(|s| s.supporting_ids.clone())
                .unwrap_or_default();
            for id in ids {
                if let Some(tile_index) = self.sets.iter().position(|s| s.id() == id) {
                    self.sets[tile_index].stop_download_async(true);
                    self.sets[tile_index].clear_downloaded_content();
                }
            }
            // drop the old bundle's published video handle; the new bundle
            // publishes under a fresh id
            if let Some(stream_id) = self.sets[old].video_stream_id() {
                self.handles.retain(|h| h.info.stream_id != stream_id);
            }
        }
        self.active_viewpoint = viewpoint;
        self.assign_bundle_stream_id();
        if let Some(new_index) = self.active_bundle() {
            let segment_id = position_us
                .map(|us| {
                    self.sets[new_index]
                        .current_representation_mut()
                        .calculate_segment_id(us)
                        .0
                })
                .unwrap_or(1);
            if let Some(state) = self.sets[new_index].extractor.as_mut() {
                state.seek_to_segment(segment_id);
            }
            info!(
                "starting viewpoint bundle {} at segment {}",
                self.sets[new_index].id(),
                segment_id
            );
            self.sets[new_index].start_download_with_override(position_us, segment_id);
        }
        Ok(())
    }

    pub fn set_buffering_time(&mut self, buffering_time_ms: u64) {
        for set in &mut self.sets {
            set.set_buffering_time(buffering_time_ms);
        }
    }

    /// Loops on-demand playback; timestamps keep growing across laps.
    pub fn set_looping(&mut self) {
        for set in &mut self.sets {
            set.set_looping();
        }
    }

    /// Applies a refreshed dynamic MPD: timelines may have grown, template
    /// attributes may have changed; download state is untouched.
    pub fn update_mpd(&mut self, mpd: &Mpd) {
        for desc in &mpd.adaptation_sets {
            if let Some(set) = self.sets.iter_mut().find(|s| s.id() == desc.id) {
                set.update_mpd(desc);
            }
        }
    }

    /// Drains the delay issues collected since the last call.
    pub fn take_issues(&mut self) -> Vec<crate::adaptation::DelayIssue> {
        std::mem::take(&mut self.issues)
    }

    pub fn sets(&self) -> &[DashAdaptationSet] {
        &self.sets
    }

    pub fn sets_mut(&mut self) -> &mut [DashAdaptationSet] {
        &mut self.sets
    }
}

/// Translates parsed OMAF sample-entry properties into a renderer source.
pub fn video_source_from_omaf(
    props: &mp4_box::boxes::omaf::OmafProperties,
    mpd_frame_packing: Option<FramePacking>,
) -> VideoSource {
    let direction = match (source_direction_from_stereo(props.stereo.as_ref()), mpd_frame_packing) {
        (SourceDirection::Mono, Some(FramePacking::TopBottom)) => SourceDirection::TopBottom,
        (SourceDirection::Mono, Some(FramePacking::SideBySide)) => SourceDirection::LeftRight,
        (direction, _) => direction,
    };
    let stereo = match direction {
        SourceDirection::Mono => StereoPosition::Mono,
        _ => StereoPosition::FramePacked,
    };
    let rotation = props
        .rotation
        .as_ref()
        .map(Rotation::from_box)
        .unwrap_or_default();

    let projection = props.projection.map(|p| p.projection_type).unwrap_or(0);
    if projection == 1 {
        match props.packing.as_ref() {
            Some(rwpk) => VideoSource::Cubemap(cubemap_from_rwpk(rwpk, direction, rotation, stereo)),
            None => VideoSource::Cubemap(CubemapSource {
                rotation,
                stereo,
                ..Default::default()
            }),
        }
    } else {
        let regions = props
            .packing
            .as_ref()
            .map(|rwpk| equirect_regions(rwpk, direction))
            .unwrap_or_default();
        let span_longitude = props
            .coverage
            .as_ref()
            .and_then(|c| c.regions.first())
            .map(|r| r.azimuth_range)
            .unwrap_or(360.0);
        VideoSource::Equirect(EquirectSource {
            regions,
            rotation,
            stereo,
            span_longitude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StubTransport;
    use crate::media::test_media;
    use crate::mpd::{
        AdaptationSetDesc, CoverageInfo, OmafAttributes, PresentationType, RepresentationDesc,
        SegmentTemplate,
    };

    fn template(media_prefix: &str) -> SegmentTemplate {
        SegmentTemplate {
            media: format!("{media_prefix}_$RepresentationID$_$Number$.m4s"),
            initialization: format!("{media_prefix}_$RepresentationID$_init.mp4"),
            duration: Some(2000),
            timescale: 1000,
            start_number: 1,
            timeline: Vec::new(),
        }
    }

    fn representation(id: &str, bandwidth: u32) -> RepresentationDesc {
        RepresentationDesc {
            id: id.to_string(),
            bandwidth,
            width: 1920,
            height: 960,
            frame_rate: 30.0,
            codecs: "hvc1.2.4.L120".to_string(),
            ..Default::default()
        }
    }

    fn simple_mpd(total_ms: u64) -> Mpd {
        Mpd {
            presentation_type: PresentationType::Static,
            media_presentation_duration_ms: Some(total_ms),
            adaptation_sets: vec![AdaptationSetDesc {
                id: 1,
                content_type: "video".to_string(),
                mime_type: "video/mp4".to_string(),
                segment_template: Some(template("v")),
                representations: vec![representation("A", 500_000), representation("B", 2_000_000)],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn insert_media(transport: &StubTransport, prefix: &str, rep: &str, ids: std::ops::RangeInclusive<u32>) {
        for id in ids {
            transport.insert(
                &format!("http://cdn/{prefix}_{rep}_{id}.m4s"),
                test_media::media_segment(1, id, (id - 1) * 2000, &[64]),
            );
        }
    }

    fn manager_with(mpd: &Mpd, transport: Arc<StubTransport>) -> MediaStreamManager {
        let context = SetContext::from_mpd(
            mpd,
            "http://cdn".to_string(),
            transport as Arc<dyn crate::http::Transport>,
            4000,
        );
        MediaStreamManager::from_mpd(mpd, context).unwrap()
    }

    async fn settle(manager: &mut MediaStreamManager, ticks: usize) {
        for _ in 0..ticks {
            manager.process_downloads();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn abr_switch_commits_and_keeps_stream_id() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/v_A_init.mp4", test_media::init_segment(2000, false));
        transport.insert("http://cdn/v_B_init.mp4", test_media::init_segment(2000, false));
        insert_media(&transport, "v", "A", 1..=5);
        insert_media(&transport, "v", "B", 1..=5);

        let mpd = simple_mpd(10_000);
        let mut manager = manager_with(&mpd, Arc::clone(&transport));
        manager.start(Utc::now());
        settle(&mut manager, 40).await;

        let streams = manager.video_streams();
        assert_eq!(streams.len(), 1);
        let stream_id = streams[0].info.stream_id;

        // representations are ordered ascending by bitrate and A is active
        {
            let set = &manager.sets()[0];
            let bitrates = set.bitrates();
            assert!(bitrates.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(set.current_representation().id(), "A");
        }

        // ask for the 2 Mbps representation
        manager.sets_mut()[0].select_bitrate(2_000_000);
        assert!(manager.sets()[0].is_abr_switch_ongoing());
        settle(&mut manager, 60).await;

        let set = &manager.sets()[0];
        assert_eq!(set.current_representation().id(), "B");
        assert!(!set.is_abr_switch_ongoing());
        // the decoder handle survived the switch
        assert_eq!(manager.video_streams()[0].info.stream_id, stream_id);

        // B resumed after A's last downloaded segment, never overlapping
        let requests = transport.requests.lock().unwrap();
        let first_b_media = requests
            .iter()
            .find(|(url, _)| url.contains("v_B_") && !url.contains("init"))
            .map(|(url, _)| url.clone())
            .expect("B downloaded media");
        let last_a_media = requests
            .iter()
            .filter(|(url, _)| url.contains("v_A_") && !url.contains("init"))
            .last()
            .map(|(url, _)| url.clone())
            .unwrap();
        let a_last: u32 = last_a_media
            .rsplit('_')
            .next()
            .unwrap()
            .trim_end_matches(".m4s")
            .parse()
            .unwrap();
        let b_first: u32 = first_b_media
            .rsplit('_')
            .next()
            .unwrap()
            .trim_end_matches(".m4s")
            .parse()
            .unwrap();
        assert_eq!(b_first, a_last + 1);
    }

    #[tokio::test]
    async fn reads_are_monotone_across_the_switch() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/v_A_init.mp4", test_media::init_segment(2000, false));
        transport.insert("http://cdn/v_B_init.mp4", test_media::init_segment(2000, false));
        insert_media(&transport, "v", "A", 1..=5);
        insert_media(&transport, "v", "B", 1..=5);

        let mpd = simple_mpd(10_000);
        let mut manager = manager_with(&mpd, Arc::clone(&transport));
        manager.start(Utc::now());
        settle(&mut manager, 40).await;
        manager.sets_mut()[0].select_bitrate(2_000_000);
        settle(&mut manager, 60).await;

        let mut last_pts = None;
        let mut read = 0;
        for _ in 0..20 {
            for packet in manager.read_video_frames(u64::MAX) {
                if let Some(last) = last_pts {
                    assert!(packet.presentation_time_us >= last);
                }
                last_pts = Some(packet.presentation_time_us);
                read += 1;
            }
            settle(&mut manager, 5).await;
        }
        assert!(read >= 3, "only {} packets read", read);
    }

    #[tokio::test]
    async fn parse_failure_falls_back_to_another_representation() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/v_A_init.mp4", test_media::init_segment(2000, false));
        transport.insert("http://cdn/v_B_init.mp4", test_media::init_segment(2000, false));
        // A serves garbage media, B is healthy
        transport.insert("http://cdn/v_A_1.m4s", Bytes::from(vec![0u8; 64]));
        insert_media(&transport, "v", "B", 1..=5);

        let mpd = simple_mpd(10_000);
        let mut manager = manager_with(&mpd, Arc::clone(&transport));
        manager.start(Utc::now());
        settle(&mut manager, 60).await;

        // the set dropped A and kept going on B; nothing fatal surfaced
        let set = &manager.sets()[0];
        assert_eq!(set.current_representation().id(), "B");
        assert!(!manager.is_error());
        let requests = transport.requests.lock().unwrap();
        assert!(requests
            .iter()
            .any(|(url, _)| url.contains("v_B_1.m4s")));
    }

    #[tokio::test]
    async fn parse_failure_without_fallback_propagates() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/v_A_init.mp4", test_media::init_segment(2000, false));
        transport.insert("http://cdn/v_A_1.m4s", Bytes::from(vec![0u8; 64]));

        let mut mpd = simple_mpd(10_000);
        mpd.adaptation_sets[0].representations.truncate(1);
        let mut manager = manager_with(&mpd, Arc::clone(&transport));
        manager.start(Utc::now());

        let mut saw_error = false;
        for _ in 0..60 {
            for event in manager.process_downloads() {
                if matches!(event, SetEvent::Error { .. }) {
                    saw_error = true;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert!(saw_error);
        assert!(manager.is_error());
    }

    fn bundle_mpd() -> Mpd {
        let coverage = |azimuth: f64| {
            OmafAttributes {
                projection_type: Some(0),
                coverage: Some(CoverageInfo {
                    azimuth_center: azimuth,
                    elevation_center: 0.0,
                    azimuth_range: 180.0,
                    elevation_range: 180.0,
                }),
                ..Default::default()
            }
        };
        let tile = |id: u32, azimuth: f64| AdaptationSetDesc {
            id,
            content_type: "video".to_string(),
            codecs: "hvc1.2.4.L120".to_string(),
            segment_template: Some({
                let mut t = template("t");
                t.duration = Some(1000);
                t
            }),
            representations: vec![RepresentationDesc {
                quality_ranking: Some(1),
                ..representation(&format!("t{id}"), 1_000_000)
            }],
            omaf: coverage(azimuth),
            ..Default::default()
        };
        Mpd {
            presentation_type: PresentationType::Static,
            media_presentation_duration_ms: Some(4000),
            adaptation_sets: vec![
                AdaptationSetDesc {
                    id: 10,
                    content_type: "video".to_string(),
                    codecs: "hvc2.1.2.L120".to_string(),
                    segment_template: Some({
                        let mut t = template("e");
                        t.duration = Some(1000);
                        t
                    }),
                    representations: vec![representation("ext", 100_000)],
                    omaf: OmafAttributes {
                        projection_type: Some(0),
                        preselection: Some(("ext".to_string(), vec![10, 11, 12])),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                tile(11, -90.0),
                tile(12, 90.0),
            ],
            ..Default::default()
        }
    }

    fn insert_tile_media(transport: &StubTransport, rep: &str, id: u32) {
        transport.insert(
            &format!("http://cdn/t_{rep}_{id}.m4s"),
            test_media::media_segment(1, id, (id - 1) * 1000, &[32]),
        );
    }

    #[tokio::test]
    async fn extractor_emits_only_complete_bundles() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/e_ext_init.mp4", test_media::init_segment(1000, false));
        transport.insert(
            "http://cdn/e_ext_1.m4s",
            test_media::media_segment(1, 1, 0, &[16]),
        );
        // only the first tile delivers segment 1 at the start
        insert_tile_media(&transport, "t11", 1);

        let mpd = bundle_mpd();
        let mut manager = manager_with(&mpd, Arc::clone(&transport));

        // supporting sets became tiles under the bundle
        assert_eq!(manager.sets()[1].kind(), SetKind::Tile);
        assert_eq!(manager.sets()[2].kind(), SetKind::Tile);
        assert_eq!(manager.sets()[1].tile_flag(), 0b01);
        assert_eq!(manager.sets()[2].tile_flag(), 0b10);

        manager.start(Utc::now());
        settle(&mut manager, 60).await;

        // tile 12 has not delivered segment 1: nothing may be emitted
        assert!(manager.read_video_frames(u64::MAX).is_empty());

        // the missing tile segment arrives; concatenation fires
        insert_tile_media(&transport, "t12", 1);
        settle(&mut manager, 80).await;
        let packets = manager.read_video_frames(u64::MAX);
        assert!(!packets.is_empty());
        // extractor first: three moofs were concatenated, samples flow in
        // order
        assert_eq!(packets[0].presentation_time_us, 0);
    }

    #[tokio::test]
    async fn viewport_update_reranks_tile_roles() {
        let transport = Arc::new(StubTransport::new());
        transport.insert("http://cdn/e_ext_init.mp4", test_media::init_segment(1000, false));
        let mpd = bundle_mpd();
        let mut manager = manager_with(&mpd, Arc::clone(&transport));

        // look straight at tile 12's half of the sphere
        manager.set_viewport(90.0, 0.0, 90.0, 90.0);
        let roles: Vec<TileRole> = manager.sets()[1..=2].iter().map(|s| s.role()).collect();
        assert_eq!(roles[1], TileRole::Foreground);
        assert!(matches!(
            roles[0],
            TileRole::Background | TileRole::ForegroundMargin
        ));
    }

    #[test]
    fn local_file_playback_creates_streams() {
        let data = test_media::init_segment(1000, false);
        // a pure init segment has no samples but enumerates tracks
        let manager = MediaStreamManager::from_file(data).unwrap();
        assert_eq!(manager.video_streams().len(), 1);
        assert_eq!(manager.video_source_types().len(), 1);
    }

    use crate::adaptation::TileRole;
}
