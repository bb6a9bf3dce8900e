//! The segment parser adapter: wraps the box-level reader with the stateful
//! registries a streaming session needs. Init segments are parsed once per
//! logical track, media segments append to per-stream sample tables,
//! segment indexes serve subsegment addressing, and sample extraction
//! delivers monotone presentation time.
//!
//! A single mutex guards every registry and sample table: segment insertion
//! and sample extraction never run concurrently. Timed-metadata
//! representations share the adapter of the media representation they
//! associate to.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mp4_box::boxes::omaf::OmafProperties;
use mp4_box::boxes::sidx::SidxBox;
use mp4_box::boxes::stsd::SampleEntry;
use mp4_box::reader::{InitializationInfo, TrackDescription};
use tracing::{debug, warn};

use crate::error::{Result, StreamingError};
use crate::media::{MediaPacket, StreamId};
use crate::segment::{DashSegment, MediaKind, SubSegment};

/// How precisely a seek must land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekAccuracy {
    FrameAccurate,
    NearestSyncFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Previous,
    Next,
}

/// Everything the pipeline needs to know about one created stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub kind: MediaKind,
    pub track_id: u32,
    pub init_segment_id: u32,
    pub width: u16,
    pub height: u16,
    pub codec: String,
    /// `cdsc` track references of this track, as track ids.
    pub describes_tracks: Vec<u32>,
}

const SEGMENT_INDEX_WINDOW: u32 = 10;

struct QueuedSample {
    /// Running sample number within the stream, monotone across segments.
    sequence: u32,
    segment_id: u32,
    /// Offset/size of the payload inside the segment blob.
    offset: usize,
    size: usize,
    duration_ms: u64,
    /// Track-local presentation time, milliseconds, before the timestamp
    /// base is applied.
    pts_ms: u64,
    is_sync: bool,
    description_index: u32,
}

struct StreamState {
    id: StreamId,
    kind: MediaKind,
    track_id: u32,
    init_segment_id: u32,
    samples: Vec<QueuedSample>,
    read_index: usize,
    next_sequence: u32,
    current_description_index: u32,
    /// Segment id of the most recently returned sample.
    current_segment_id: u32,
    /// Sample count of the most recently appended fragment; used to judge
    /// whether the stream is about to run dry.
    last_fragment_samples: usize,
    /// Media stream a metadata stream follows on seeks.
    follows_stream: Option<StreamId>,
}

impl StreamState {
    fn samples_left(&self) -> usize {
        self.samples.len().saturating_sub(self.read_index)
    }

    /// Index of the last sample at or before `target_ms`.
    fn sample_index_for_time(&self, target_ms: u64) -> Option<usize> {
        if self.samples.is_empty() {
            return None;
        }
        let mut found = None;
        for (i, sample) in self.samples.iter().enumerate() {
            if sample.pts_ms <= target_ms {
                found = Some(i);
            } else {
                break;
            }
        }
        found
    }

    fn nearest_sync_index(&self, from: usize, direction: SeekDirection) -> Option<usize> {
        match direction {
            SeekDirection::Previous => self.samples[..=from.min(self.samples.len() - 1)]
                .iter()
                .rposition(|s| s.is_sync),
            SeekDirection::Next => self.samples[from..]
                .iter()
                .position(|s| s.is_sync)
                .map(|i| from + i),
        }
    }
}

struct InitEntry {
    init_segment_id: u32,
    info: InitializationInfo,
}

struct SegmentEntry {
    segment_id: u32,
    data: Bytes,
}

#[derive(Default)]
struct AdapterInner {
    inits: Vec<InitEntry>,
    /// Media segment payloads per init segment id, ordered by arrival.
    segments: HashMap<u32, Vec<SegmentEntry>>,
    indexes: Vec<(u32, SidxBox)>,
    streams: BTreeMap<StreamId, StreamState>,
    timestamp_base_ms: u64,
    /// `(base, segment id)` armed by a segment carrying a new base; swapped
    /// in when a sample of that segment is read.
    pending_base: Option<(u64, u32)>,
}

/// See module docs. Shared between the owning representation and any
/// associated timed-metadata representations.
pub struct Mp4ParserAdapter {
    inner: Mutex<AdapterInner>,
    /// Stream-id allocator shared across every adapter of a presentation,
    /// so ids stay unique over representation boundaries.
    ids: Arc<AtomicU32>,
}

impl Default for Mp4ParserAdapter {
    fn default() -> Self {
        Self::new(Arc::new(AtomicU32::new(0)))
    }
}

impl Mp4ParserAdapter {
    pub fn new(ids: Arc<AtomicU32>) -> Mp4ParserAdapter {
        Mp4ParserAdapter {
            inner: Mutex::new(AdapterInner::default()),
            ids,
        }
    }

    /// Parses an initialization segment and creates streams for its
    /// tracks. Idempotent per init segment id: a repeat call returns no new
    /// streams. A caller-assigned video stream id keeps decoder identity
    /// stable across representations of an extractor bundle.
    pub fn open_initialization(
        &self,
        segment: &DashSegment,
        video_stream_id: Option<StreamId>,
    ) -> Result<Vec<StreamInfo>> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .inits
            .iter()
            .any(|e| e.init_segment_id == segment.init_segment_id)
        {
            return Ok(Vec::new());
        }
        let info = mp4_box::reader::parse_initialization(&segment.data)?;
        let mut created = Vec::new();
        for track in &info.tracks {
            let kind = if track.is_video() {
                MediaKind::Video
            } else if track.is_audio() {
                MediaKind::Audio
            } else if track.is_timed_metadata() {
                MediaKind::TimedMetadata
            } else {
                continue;
            };
            let id = match (kind, video_stream_id) {
                (MediaKind::Video, Some(id)) => id,
                _ => self.ids.fetch_add(1, Ordering::Relaxed),
            };
            inner.streams.insert(
                id,
                StreamState {
                    id,
                    kind,
                    track_id: track.track_id,
                    init_segment_id: segment.init_segment_id,
                    samples: Vec::new(),
                    read_index: 0,
                    next_sequence: 0,
                    current_description_index: 0,
                    current_segment_id: 0,
                    last_fragment_samples: 0,
                    follows_stream: None,
                },
            );
            created.push(stream_info(id, kind, segment.init_segment_id, track));
        }
        debug!(
            "initialization segment {} opened, {} streams",
            segment.init_segment_id,
            created.len()
        );
        inner.inits.push(InitEntry {
            init_segment_id: segment.init_segment_id,
            info,
        });
        Ok(created)
    }

    /// Parses a media segment (`moof`+`mdat`) and appends its samples to
    /// the per-track tables. The matching init segment must have been
    /// opened first.
    pub fn add_segment(&self, segment: &DashSegment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let init_index = inner
            .inits
            .iter()
            .position(|e| e.init_segment_id == segment.init_segment_id)
            .ok_or(StreamingError::InvalidState(
                "media segment before its initialization segment",
            ))?;

        // a segment carrying a different timestamp base arms the pending
        // swap; the base goes live when its first sample is read
        if inner.pending_base.is_none() && segment.timestamp_base_ms != inner.timestamp_base_ms {
            inner.pending_base = Some((segment.timestamp_base_ms, segment.segment_id));
        }

        let defaults = inner.inits[init_index].info.track_extends.clone();
        let timescales: HashMap<u32, u32> = inner.inits[init_index]
            .info
            .tracks
            .iter()
            .map(|t| (t.track_id, t.timescale))
            .collect();
        let fragments = mp4_box::reader::parse_media_segment(&segment.data, &defaults)?;

        for fragment in &fragments {
            let Some(stream) = inner
                .streams
                .values_mut()
                .find(|s| {
                    s.init_segment_id == segment.init_segment_id
                        && s.track_id == fragment.track_id
                })
            else {
                continue;
            };
            let timescale = timescales
                .get(&fragment.track_id)
                .copied()
                .unwrap_or(1000)
                .max(1) as u64;
            let mut decode_time = fragment.base_decode_time.unwrap_or(0);
            stream.last_fragment_samples = fragment.samples.len();
            for sample in &fragment.samples {
                let pts_ms = decode_time * 1000 / timescale;
                let duration_ms = sample.duration as u64 * 1000 / timescale;
                let sequence = stream.next_sequence;
                stream.next_sequence += 1;
                stream.samples.push(QueuedSample {
                    sequence,
                    segment_id: segment.segment_id,
                    offset: sample.offset as usize,
                    size: sample.size as usize,
                    duration_ms,
                    pts_ms,
                    is_sync: sample.is_sync,
                    description_index: sample.sample_description_index,
                });
                decode_time += sample.duration as u64;
            }
        }

        inner
            .segments
            .entry(segment.init_segment_id)
            .or_default()
            .push(SegmentEntry {
                segment_id: segment.segment_id,
                data: segment.data.clone(),
            });
        Ok(())
    }

    /// Stores a parsed segment index, keyed by segment id. Single-entry
    /// indexes are rejected: a subsegment fetch over them would be the
    /// whole segment anyway.
    pub fn add_segment_index(&self, segment: &DashSegment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let segment_id = segment.segment_id;
        if inner.indexes.iter().any(|(id, _)| *id == segment_id) {
            return Ok(());
        }
        // age out indexes far outside the current window in either
        // direction (seeking back leaves stale entries too)
        if inner.indexes.len() >= SEGMENT_INDEX_WINDOW as usize {
            inner.indexes.retain(|(id, _)| {
                *id + SEGMENT_INDEX_WINDOW > segment_id
                    && *id <= segment_id + SEGMENT_INDEX_WINDOW
            });
        }
        let sidx = mp4_box::reader::parse_segment_index(
            &segment.data,
            segment.range_start_byte.unwrap_or(0),
        )?;
        if sidx.references.len() < 2 {
            return Err(StreamingError::NotSupported(
                "segment index has no subsegments".into(),
            ));
        }
        inner.indexes.push((segment_id, sidx));
        Ok(())
    }

    /// Checks whether a stored index can resolve `pts_us` inside
    /// `segment_id` to a proper subsegment.
    pub fn has_segment_index_for(&self, segment_id: u32, pts_us: u64) -> Result<()> {
        self.segment_index_for(segment_id, pts_us).map(|_| ())
    }

    /// Resolves a presentation time to the byte range that covers it: from
    /// the containing subsegment to the end of the segment. The first
    /// subsegment never qualifies, since fetching from there means
    /// fetching the whole segment.
    pub fn segment_index_for(&self, segment_id: u32, pts_us: u64) -> Result<SubSegment> {
        let inner = self.inner.lock().unwrap();
        let pts_ms = pts_us / 1000;
        for (id, sidx) in &inner.indexes {
            if *id != segment_id {
                continue;
            }
            if sidx.references.len() < 2 {
                return Err(StreamingError::NotSupported(
                    "segment index has no subsegments".into(),
                ));
            }
            let mut found: Option<SubSegment> = None;
            for index in 1..sidx.references.len() {
                let start_ms = sidx.earliest_pts(index).unwrap_or(0) * 1000
                    / sidx.timescale.max(1) as u64;
                let duration_ms = sidx.subsegment_duration_ms(index).unwrap_or(0);
                let (start_byte, end_byte) = sidx.byte_range(index).unwrap_or((0, 0));
                if let Some(found) = found.as_mut() {
                    // extend to the end of the segment
                    found.end_byte = end_byte;
                } else if start_ms <= pts_ms && pts_ms < start_ms + duration_ms {
                    found = Some(SubSegment {
                        segment_id,
                        earliest_presentation_time_ms: start_ms,
                        start_byte,
                        end_byte,
                    });
                }
            }
            if let Some(found) = found {
                return Ok(found);
            }
        }
        Err(StreamingError::ItemNotFound)
    }

    /// Reads the next sample of `stream_id` into a packet.
    /// `EndOfFile` means no sample is queued right now; the caller decides
    /// whether that is a stall or the end of the stream.
    pub fn read_frame(&self, stream_id: StreamId, _now_us: u64) -> Result<MediaPacket> {
        let mut inner = self.inner.lock().unwrap();
        let pending_base = inner.pending_base;
        let stream = inner
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamingError::ItemNotFound)?;
        if stream.read_index >= stream.samples.len() {
            return Err(StreamingError::EndOfFile);
        }
        let sample = &stream.samples[stream.read_index];
        let (sequence, segment_id, offset, size) =
            (sample.sequence, sample.segment_id, sample.offset, sample.size);
        let (duration_ms, pts_ms, is_sync, description_index) = (
            sample.duration_ms,
            sample.pts_ms,
            sample.is_sync,
            sample.description_index,
        );
        let init_segment_id = stream.init_segment_id;
        let track_id = stream.track_id;

        let config_changed = description_index != stream.current_description_index;
        stream.current_description_index = description_index;
        stream.current_segment_id = segment_id;
        stream.read_index += 1;

        // swap in a pending timestamp base once its segment is reached
        if let Some((base, base_segment)) = pending_base {
            if segment_id == base_segment {
                inner.timestamp_base_ms = base;
                inner.pending_base = None;
                debug!("timestamp base {} ms now in use", base);
            }
        }
        let timestamp_base_ms = inner.timestamp_base_ms;

        let data = {
            let entries = inner
                .segments
                .get(&init_segment_id)
                .ok_or(StreamingError::EndOfFile)?;
            let entry = entries
                .iter()
                .find(|e| e.segment_id == segment_id)
                .ok_or(StreamingError::EndOfFile)?;
            if offset + size > entry.data.len() {
                return Err(StreamingError::InvalidData(format!(
                    "sample at {}+{} outside segment of {} bytes",
                    offset,
                    size,
                    entry.data.len()
                )));
            }
            entry.data[offset..offset + size].to_vec()
        };

        let decoder_config = if config_changed {
            lookup_decoder_config(&inner, init_segment_id, track_id, description_index)
        } else {
            None
        };

        Ok(MediaPacket {
            stream_id,
            data,
            sample_id: sequence,
            presentation_time_us: (timestamp_base_ms + pts_ms) * 1000,
            duration_us: duration_ms * 1000,
            is_sync,
            config_changed,
            decoder_config,
        })
    }

    /// Positions every stream at `target_us`. Video resolves first (to the
    /// sample at or before the target, then to the nearest sync sample when
    /// requested); metadata streams follow the resolved media time; audio
    /// seeks to its own sample at or before the resolved time.
    pub fn seek_to_us(
        &self,
        target_us: u64,
        direction: SeekDirection,
        accuracy: SeekAccuracy,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let base_ms = inner.timestamp_base_ms;
        let target_ms = (target_us / 1000).saturating_sub(base_ms);

        let mut resolved_ms: Option<u64> = None;
        let video_ids: Vec<StreamId> = inner
            .streams
            .values()
            .filter(|s| s.kind == MediaKind::Video)
            .map(|s| s.id)
            .collect();
        for id in &video_ids {
            let stream = inner.streams.get_mut(id).unwrap();
            let Some(mut index) = stream.sample_index_for_time(target_ms) else {
                continue;
            };
            if accuracy == SeekAccuracy::NearestSyncFrame {
                match stream.nearest_sync_index(index, direction) {
                    Some(sync) => index = sync,
                    None => continue,
                }
            }
            stream.read_index = index;
            resolved_ms = Some(stream.samples[index].pts_ms);
        }

        let Some(resolved) = resolved_ms.or_else(|| {
            // no video: let audio resolve the position
            let audio = inner
                .streams
                .values_mut()
                .find(|s| s.kind == MediaKind::Audio)?;
            let index = audio.sample_index_for_time(target_ms)?;
            audio.read_index = index;
            Some(audio.samples[index].pts_ms)
        }) else {
            warn!("cannot seek to {} us", target_us);
            return Err(StreamingError::ItemNotFound);
        };

        // non-resolving streams follow the resolved time
        for stream in inner.streams.values_mut() {
            match stream.kind {
                MediaKind::Video => {}
                MediaKind::Audio => {
                    if let Some(index) = stream.sample_index_for_time(resolved) {
                        stream.read_index = index;
                    }
                }
                MediaKind::TimedMetadata => {
                    // first metadata sample at or after the resolved time
                    let index = stream
                        .samples
                        .iter()
                        .position(|s| s.pts_ms >= resolved)
                        .unwrap_or(stream.samples.len());
                    stream.read_index = index;
                }
            }
        }
        Ok((resolved + base_ms) * 1000)
    }

    /// Invalidates every cached media segment strictly older than
    /// `segment_id`; returns how many were dropped.
    pub fn release_segments_until(&self, segment_id: u32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0;
        for entries in inner.segments.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.segment_id >= segment_id);
            released += (before - entries.len()) as u32;
        }
        for stream in inner.streams.values_mut() {
            // keep the cursor on the same sample if it survives the trim
            let cursor_sequence = stream.samples.get(stream.read_index).map(|s| s.sequence);
            stream.samples.retain(|s| s.segment_id >= segment_id);
            stream.read_index = match cursor_sequence {
                Some(sequence) => stream
                    .samples
                    .iter()
                    .position(|s| s.sequence >= sequence)
                    .unwrap_or(stream.samples.len()),
                None => stream.samples.len(),
            };
        }
        released
    }

    /// Drops segments every stream has fully consumed; returns the count
    /// for the download cache bookkeeping.
    pub fn release_used_segments(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0;
        let init_ids: Vec<u32> = inner.segments.keys().copied().collect();
        for init_id in init_ids {
            // the oldest segment any stream of this init still needs
            let mut needed: Option<u32> = None;
            for stream in inner.streams.values() {
                if stream.init_segment_id != init_id {
                    continue;
                }
                // a fully drained stream needs nothing at or before its
                // last returned segment
                let oldest = stream
                    .samples
                    .get(stream.read_index)
                    .map(|s| s.segment_id)
                    .unwrap_or(stream.current_segment_id + 1);
                needed = Some(needed.map_or(oldest, |n: u32| n.min(oldest)));
            }
            let Some(needed) = needed else { continue };
            let entries = inner.segments.get_mut(&init_id).unwrap();
            let before = entries.len();
            entries.retain(|e| e.segment_id >= needed);
            released += (before - entries.len()) as u32;
            for stream in inner.streams.values_mut() {
                if stream.init_segment_id != init_id {
                    continue;
                }
                let before_len = stream.samples.len();
                let removed_prefix = stream
                    .samples
                    .iter()
                    .take_while(|s| s.segment_id < needed)
                    .count();
                stream.samples.drain(..removed_prefix);
                stream.read_index = stream
                    .read_index
                    .saturating_sub(before_len - stream.samples.len());
            }
        }
        released
    }

    /// Unconditional flush. With `reset_init` the init registries go too,
    /// forcing a re-fetch and re-parse on the next resume.
    pub fn release_all_segments(&self, reset_init: bool) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let released: usize = inner.segments.values().map(|v| v.len()).sum();
        inner.segments.clear();
        inner.indexes.clear();
        if reset_init {
            inner.inits.clear();
            inner.streams.clear();
        } else {
            for stream in inner.streams.values_mut() {
                stream.samples.clear();
                stream.read_index = 0;
            }
        }
        released as u32
    }

    pub fn newest_segment_id(&self, init_segment_id: u32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .get(&init_segment_id)?
            .iter()
            .map(|e| e.segment_id)
            .max()
    }

    /// Whether the streams of `init_segment_id` are ready to take segment
    /// `segment_id`: it is not parsed yet and the tables are close to
    /// running dry. Keeps concatenation (and hence quality switches) from
    /// running far ahead of playback.
    pub fn ready_for_segment(&self, init_segment_id: u32, segment_id: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        for stream in inner.streams.values() {
            if stream.init_segment_id != init_segment_id || stream.kind != MediaKind::Video {
                continue;
            }
            if stream
                .samples
                .iter()
                .any(|s| s.segment_id >= segment_id)
            {
                return false;
            }
            if stream.samples_left() > stream.last_fragment_samples.max(1) {
                return false;
            }
        }
        true
    }

    pub fn samples_left(&self, stream_id: StreamId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .get(&stream_id)
            .map(|s| s.samples_left())
            .unwrap_or(0)
    }

    /// Track-local position of the next unread sample, with the timestamp
    /// base applied, plus its segment id.
    pub fn read_position_us(&self, stream_id: StreamId) -> Option<(u64, u32)> {
        let inner = self.inner.lock().unwrap();
        let stream = inner.streams.get(&stream_id)?;
        let sample = stream.samples.get(stream.read_index)?;
        Some((
            (inner.timestamp_base_ms + sample.pts_ms) * 1000,
            sample.segment_id,
        ))
    }

    /// Opens a whole (non-fragmented) local file: creates streams with the
    /// complete sample tables expanded from the `stbl`. The file acts as
    /// its own single media segment.
    pub fn open_file(&self, data: Bytes) -> Result<Vec<StreamInfo>> {
        const LOCAL_INIT_ID: u32 = 0;
        const LOCAL_SEGMENT_ID: u32 = 1;
        let mut inner = self.inner.lock().unwrap();
        if !inner.inits.is_empty() {
            return Err(StreamingError::AlreadySet);
        }
        let info = mp4_box::reader::parse_file(&data)?;
        let mut created = Vec::new();
        for track in &info.tracks {
            let kind = if track.is_video() {
                MediaKind::Video
            } else if track.is_audio() {
                MediaKind::Audio
            } else if track.is_timed_metadata() {
                MediaKind::TimedMetadata
            } else {
                continue;
            };
            let id = self.ids.fetch_add(1, Ordering::Relaxed);
            let timescale = track.timescale.max(1) as u64;
            let mut decode_time = 0u64;
            let mut samples = Vec::with_capacity(track.samples.len());
            for (sequence, sample) in track.samples.iter().enumerate() {
                samples.push(QueuedSample {
                    sequence: sequence as u32,
                    segment_id: LOCAL_SEGMENT_ID,
                    offset: sample.offset as usize,
                    size: sample.size as usize,
                    duration_ms: sample.duration as u64 * 1000 / timescale,
                    pts_ms: decode_time * 1000 / timescale,
                    is_sync: sample.is_sync,
                    description_index: sample.sample_description_index,
                });
                decode_time += sample.duration as u64;
            }
            let next_sequence = samples.len() as u32;
            inner.streams.insert(
                id,
                StreamState {
                    id,
                    kind,
                    track_id: track.track_id,
                    init_segment_id: LOCAL_INIT_ID,
                    samples,
                    read_index: 0,
                    next_sequence,
                    current_description_index: 0,
                    current_segment_id: 0,
                    last_fragment_samples: 0,
                    follows_stream: None,
                },
            );
            created.push(stream_info(id, kind, LOCAL_INIT_ID, track));
        }
        inner.inits.push(InitEntry {
            init_segment_id: LOCAL_INIT_ID,
            info,
        });
        inner.segments.insert(
            LOCAL_INIT_ID,
            vec![SegmentEntry {
                segment_id: LOCAL_SEGMENT_ID,
                data,
            }],
        );
        Ok(created)
    }

    /// Media stream a metadata stream was associated to.
    pub fn followed_stream(&self, stream_id: StreamId) -> Option<StreamId> {
        let inner = self.inner.lock().unwrap();
        inner.streams.get(&stream_id)?.follows_stream
    }

    pub fn associate_streams(&self, metadata_stream: StreamId, media_stream: StreamId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stream) = inner.streams.get_mut(&metadata_stream) {
            stream.follows_stream = Some(media_stream);
        }
    }

    /// Viewpoint switches reassign the decoder-visible id of a video
    /// stream.
    pub fn reassign_stream_id(&self, old: StreamId, new: StreamId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut stream) = inner.streams.remove(&old) {
            stream.id = new;
            inner.streams.insert(new, stream);
        }
    }

    /// OMAF properties of the sample entry a video stream currently
    /// decodes from.
    pub fn stream_omaf_properties(&self, stream_id: StreamId) -> Option<OmafProperties> {
        let inner = self.inner.lock().unwrap();
        let stream = inner.streams.get(&stream_id)?;
        let init = inner
            .inits
            .iter()
            .find(|e| e.init_segment_id == stream.init_segment_id)?;
        let track = init
            .info
            .tracks
            .iter()
            .find(|t| t.track_id == stream.track_id)?;
        track.sample_entries.iter().find_map(|e| match e {
            SampleEntry::Visual(v) if v.omaf.any() => Some(v.omaf.clone()),
            _ => None,
        })
    }

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .values()
            .filter_map(|s| {
                let init = inner
                    .inits
                    .iter()
                    .find(|e| e.init_segment_id == s.init_segment_id)?;
                let track = init.info.tracks.iter().find(|t| t.track_id == s.track_id)?;
                Some(stream_info(s.id, s.kind, s.init_segment_id, track))
            })
            .collect()
    }
}

fn stream_info(
    id: StreamId,
    kind: MediaKind,
    init_segment_id: u32,
    track: &TrackDescription,
) -> StreamInfo {
    let codec = track
        .sample_entries
        .first()
        .map(|e| {
            let format = e.format();
            match e {
                SampleEntry::Visual(v) => v
                    .original_format
                    .map(|f| mp4_box::format_fourcc(&f))
                    .unwrap_or_else(|| mp4_box::format_fourcc(&format)),
                _ => mp4_box::format_fourcc(&format),
            }
        })
        .unwrap_or_default();
    StreamInfo {
        stream_id: id,
        kind,
        track_id: track.track_id,
        init_segment_id,
        width: track.width,
        height: track.height,
        codec,
        describes_tracks: track
            .references
            .iter()
            .filter(|r| &r.reference_type == b"cdsc")
            .flat_map(|r| r.track_ids.iter().copied())
            .collect(),
    }
}

fn lookup_decoder_config(
    inner: &AdapterInner,
    init_segment_id: u32,
    track_id: u32,
    description_index: u32,
) -> Option<Vec<u8>> {
    let init = inner
        .inits
        .iter()
        .find(|e| e.init_segment_id == init_segment_id)?;
    let track = init.info.tracks.iter().find(|t| t.track_id == track_id)?;
    let entry = track
        .sample_entries
        .get(description_index.saturating_sub(1) as usize)?;
    entry.codec_config().map(|c| c.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::test_media;

    fn init_segment(id: u32, with_metadata: bool) -> DashSegment {
        DashSegment::init(id, test_media::init_segment(100, with_metadata))
    }

    fn media_segment(
        init_id: u32,
        segment_id: u32,
        base_time_ms: u32,
        sizes: &[u32],
    ) -> DashSegment {
        DashSegment::media(
            segment_id,
            init_id,
            test_media::media_segment(1, segment_id, base_time_ms, sizes),
        )
    }

    #[test]
    fn init_opens_once_and_assigns_preset_video_id() {
        let adapter = Mp4ParserAdapter::default();
        let created = adapter
            .open_initialization(&init_segment(1, false), Some(7))
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].stream_id, 7);
        assert_eq!(created[0].kind, MediaKind::Video);
        assert_eq!(created[0].codec, "hvc1");
        // idempotent per init segment id
        let repeat = adapter
            .open_initialization(&init_segment(1, false), Some(7))
            .unwrap();
        assert!(repeat.is_empty());
    }

    #[test]
    fn media_segment_requires_init() {
        let adapter = Mp4ParserAdapter::default();
        let err = adapter
            .add_segment(&media_segment(1, 1, 0, &[10]))
            .unwrap_err();
        assert!(matches!(err, StreamingError::InvalidState(_)));
    }

    #[test]
    fn read_frame_delivers_monotone_presentation_times() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = streams[0].stream_id;
        adapter
            .add_segment(&media_segment(1, 1, 0, &[10, 20, 30]))
            .unwrap();
        adapter
            .add_segment(&media_segment(1, 2, 300, &[10, 20]))
            .unwrap();

        let mut last_pts = 0;
        for i in 0..5 {
            let packet = adapter.read_frame(video, 0).unwrap();
            assert_eq!(packet.sample_id, i);
            assert!(packet.presentation_time_us >= last_pts);
            last_pts = packet.presentation_time_us;
            assert_eq!(packet.duration_us, 100_000);
        }
        assert!(matches!(
            adapter.read_frame(video, 0),
            Err(StreamingError::EndOfFile)
        ));
    }

    #[test]
    fn first_frame_reports_decoder_config() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        adapter.add_segment(&media_segment(1, 1, 0, &[10])).unwrap();
        let packet = adapter.read_frame(streams[0].stream_id, 0).unwrap();
        assert!(packet.config_changed);
        assert_eq!(packet.decoder_config.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(packet.is_sync);
    }

    #[test]
    fn timestamp_base_applies_from_marked_segment() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = streams[0].stream_id;
        adapter.add_segment(&media_segment(1, 1, 0, &[10])).unwrap();
        let mut looped = media_segment(1, 2, 0, &[10]);
        looped.timestamp_base_ms = 10_000;
        adapter.add_segment(&looped).unwrap();

        let first = adapter.read_frame(video, 0).unwrap();
        assert_eq!(first.presentation_time_us, 0);
        let second = adapter.read_frame(video, 0).unwrap();
        // base swaps in exactly at the marked segment
        assert_eq!(second.presentation_time_us, 10_000_000);
    }

    #[test]
    fn frame_accurate_seek_lands_at_or_before_target() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = streams[0].stream_id;
        adapter
            .add_segment(&media_segment(1, 1, 0, &[10, 10, 10, 10, 10]))
            .unwrap();

        let resolved = adapter
            .seek_to_us(250_000, SeekDirection::Previous, SeekAccuracy::FrameAccurate)
            .unwrap();
        assert!(resolved <= 250_000);
        let packet = adapter.read_frame(video, 0).unwrap();
        assert_eq!(packet.presentation_time_us, resolved);
        assert_eq!(resolved, 200_000);
    }

    #[test]
    fn sync_seek_rewinds_to_sync_sample_and_metadata_follows() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, true), None)
            .unwrap();
        let video = streams
            .iter()
            .find(|s| s.kind == MediaKind::Video)
            .unwrap()
            .stream_id;
        let metadata = streams
            .iter()
            .find(|s| s.kind == MediaKind::TimedMetadata)
            .unwrap()
            .stream_id;
        adapter.associate_streams(metadata, video);
        // only the first sample of each fragment is a sync sample
        adapter
            .add_segment(&media_segment(1, 1, 0, &[10, 10, 10, 10]))
            .unwrap();
        adapter
            .add_segment(&DashSegment::media(
                1,
                1,
                test_media::media_segment(2, 1, 0, &[4, 4, 4, 4]),
            ))
            .unwrap();

        let resolved = adapter
            .seek_to_us(
                350_000,
                SeekDirection::Previous,
                SeekAccuracy::NearestSyncFrame,
            )
            .unwrap();
        // rewound to the fragment-leading sync sample
        assert_eq!(resolved, 0);
        let video_packet = adapter.read_frame(video, 0).unwrap();
        assert_eq!(video_packet.presentation_time_us, resolved);
        let metadata_packet = adapter.read_frame(metadata, 0).unwrap();
        assert_eq!(metadata_packet.presentation_time_us, resolved);
        assert_eq!(adapter.followed_stream(metadata), Some(video));
    }

    #[test]
    fn release_drops_only_older_segments() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = streams[0].stream_id;
        for id in 1..=4 {
            adapter
                .add_segment(&media_segment(1, id, (id - 1) * 100, &[10]))
                .unwrap();
        }
        assert_eq!(adapter.newest_segment_id(1), Some(4));
        let released = adapter.release_segments_until(3);
        assert_eq!(released, 2);
        // reading resumes at segment 3
        let packet = adapter.read_frame(video, 0).unwrap();
        assert_eq!(packet.presentation_time_us, 200_000);
    }

    #[test]
    fn consumed_segments_are_reclaimed() {
        let adapter = Mp4ParserAdapter::default();
        let streams = adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = streams[0].stream_id;
        adapter.add_segment(&media_segment(1, 1, 0, &[10])).unwrap();
        adapter.add_segment(&media_segment(1, 2, 100, &[10])).unwrap();
        adapter.read_frame(video, 0).unwrap();
        // segment 1 is fully consumed, segment 2 still unread
        assert_eq!(adapter.release_used_segments(), 1);
        let packet = adapter.read_frame(video, 0).unwrap();
        assert_eq!(packet.presentation_time_us, 100_000);
    }

    fn sidx_segment(segment_id: u32, subsegments: &[(u32, u32)]) -> DashSegment {
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
        let data = test_media::plain_box(b"sidx", &payload);
        let mut segment = DashSegment::media(segment_id, 1, bytes::Bytes::from(data));
        segment.range_start_byte = Some(0);
        segment
    }

    #[test]
    fn single_subsegment_index_rejected() {
        let adapter = Mp4ParserAdapter::default();
        let err = adapter
            .add_segment_index(&sidx_segment(1, &[(100, 2000)]))
            .unwrap_err();
        assert!(matches!(err, StreamingError::NotSupported(_)));
    }

    #[test]
    fn subsegment_range_extends_to_segment_end() {
        let adapter = Mp4ParserAdapter::default();
        adapter
            .add_segment_index(&sidx_segment(
                1,
                &[(100, 2000), (200, 2000), (300, 2000), (400, 2000)],
            ))
            .unwrap();
        // pts 3s falls in the second subsegment (2s..4s)
        let subsegment = adapter.segment_index_for(1, 3_000_000).unwrap();
        assert_eq!(subsegment.earliest_presentation_time_ms, 2000);
        // range runs from that subsegment to the end of the segment
        let anchor = subsegment.start_byte - 100;
        assert_eq!(subsegment.end_byte, anchor + 100 + 200 + 300 + 400 - 1);
        assert!(adapter.has_segment_index_for(1, 3_000_000).is_ok());
        assert!(matches!(
            adapter.segment_index_for(2, 3_000_000),
            Err(StreamingError::ItemNotFound)
        ));
    }

    #[test]
    fn readiness_tracks_table_depth() {
        let adapter = Mp4ParserAdapter::default();
        adapter
            .open_initialization(&init_segment(1, false), None)
            .unwrap();
        let video = adapter.stream_infos()[0].stream_id;
        assert!(adapter.ready_for_segment(1, 1));
        adapter
            .add_segment(&media_segment(1, 1, 0, &[10, 10]))
            .unwrap();
        // already has segment 1, and two fragments of backlog for 2
        assert!(!adapter.ready_for_segment(1, 1));
        adapter.read_frame(video, 0).unwrap();
        adapter.read_frame(video, 0).unwrap();
        assert!(adapter.ready_for_segment(1, 2));
    }
}
