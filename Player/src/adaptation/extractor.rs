//! The extractor-bundle protocol: one logical video synthesized by
//! concatenating, per segment id, the extractor track's segment with the
//! segments of every supporting tile set.
//!
//! The extractor set holds only the ids of its supporting sets; the bundle
//! functions resolve them through the set registry owned by the stream
//! manager, so no back-pointers exist between sets.

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::adaptation::{DashAdaptationSet, SetEvent, TileRole};
use crate::representation::RepresentationEvent;
use crate::segment::DashSegment;
use crate::viewport::RenderedViewport;

/// Per-bundle download and concatenation bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct ExtractorState {
    /// Supporting tile adaptation-set ids, in bundle (concatenation)
    /// order.
    pub supporting_ids: Vec<u32>,
    /// Next segment id to emit downstream. Monotone; never skips a
    /// successfully produced segment.
    next_to_concatenate: u32,
    /// Segment id new tile downloads are started from.
    target_segment_id: u32,
    /// Largest segment id currently being pulled from the supporting sets.
    highest_to_download: u32,
    /// Bits of tiles that have delivered `highest_to_download`.
    arrival_mask: u64,
    full_mask: u64,
    segments_processed: u64,
}

impl ExtractorState {
    pub fn new(supporting_ids: Vec<u32>) -> ExtractorState {
        ExtractorState {
            supporting_ids,
            next_to_concatenate: 1,
            target_segment_id: 1,
            highest_to_download: 1,
            ..Default::default()
        }
    }

    pub fn next_to_concatenate(&self) -> u32 {
        self.next_to_concatenate
    }

    pub fn segments_processed(&self) -> u64 {
        self.segments_processed
    }

    /// An on-demand stream resolved a deferred start position.
    pub fn on_target_segment_located(&mut self, segment_id: u32, _segment_time_ms: u64) {
        self.target_segment_id = segment_id;
        self.next_to_concatenate = segment_id;
        self.highest_to_download = self.highest_to_download.max(segment_id);
    }

    pub fn seek_to_segment(&mut self, segment_id: u32) {
        self.target_segment_id = segment_id;
        self.next_to_concatenate = segment_id;
        self.highest_to_download = segment_id;
        self.arrival_mask = 0;
    }
}

fn index_of(sets: &[DashAdaptationSet], id: u32) -> Option<usize> {
    sets.iter().position(|s| s.id() == id)
}

/// Registers the bundle: marks each supporting set as a tile set and
/// assigns it a unique bit; the full mask is their OR.
pub fn register_bundle(sets: &mut [DashAdaptationSet], extractor_index: usize) {
    let Some(mut state) = sets[extractor_index].extractor.take() else {
        return;
    };
    state.full_mask = 0;
    for (position, id) in state.supporting_ids.clone().into_iter().enumerate() {
        let Some(tile_index) = index_of(sets, id) else {
            warn!("supporting set {} missing from the registry", id);
            continue;
        };
        let flag = 1u64 << position;
        sets[tile_index].mark_as_tile();
        sets[tile_index].set_tile_flag(flag);
        state.full_mask |= flag;
        info!(
            "registered supporting set {} for extractor {} (flag {:#x})",
            id,
            sets[extractor_index].id(),
            flag
        );
    }
    sets[extractor_index].extractor = Some(state);
}

/// Resolves dependency-id based bundles: the extractor's representations
/// name the tile representations they depend on; the owning sets become
/// the supporting sets, in dependency order.
pub fn resolve_dependencies(sets: &mut [DashAdaptationSet], extractor_index: usize) {
    let dependency_ids: Vec<String> = sets[extractor_index]
        .current_representation()
        .dependency_ids()
        .to_vec();
    if dependency_ids.is_empty() {
        return;
    }
    let mut supporting = Vec::new();
    for dependency in &dependency_ids {
        for set in sets.iter() {
            if set
                .representations()
                .iter()
                .any(|r| r.id() == dependency.as_str())
                && !supporting.contains(&set.id())
            {
                supporting.push(set.id());
            }
        }
    }
    if let Some(state) = sets[extractor_index].extractor.as_mut() {
        if state.supporting_ids.is_empty() {
            state.supporting_ids = supporting;
        }
    }
    register_bundle(sets, extractor_index);
}

/// One scheduler tick for an extractor bundle: pump the extractor's own
/// representation, drive the supporting tiles behind the shared
/// `highest_to_download` cursor, then concatenate at
/// `next_to_concatenate` when everything has arrived.
pub fn process_bundle(sets: &mut [DashAdaptationSet], extractor_index: usize) -> Vec<SetEvent> {
    let mut events = sets[extractor_index].process_downloads();

    let Some(mut state) = sets[extractor_index].extractor.take() else {
        return events;
    };
    let extractor_active = sets[extractor_index]
        .current_representation()
        .is_downloading();
    let buffering_time_ms = sets[extractor_index].buffering_time_ms;
    let download_start = sets[extractor_index].download_start_time;

    if extractor_active {
        for (position, id) in state.supporting_ids.clone().into_iter().enumerate() {
            let Some(tile_index) = index_of(sets, id) else {
                continue;
            };
            let flag = 1u64 << position;
            let tile = &mut sets[tile_index];
            if tile.is_active() {
                let last = tile.current_representation().last_segment_id();
                if last < state.highest_to_download {
                    events.append(&mut tile.process_downloads());
                    if tile.current_representation().last_segment_id()
                        == state.highest_to_download
                    {
                        state.arrival_mask |= flag;
                    }
                } else {
                    // already past the shared cursor
                    state.arrival_mask |= flag;
                }
                if state.arrival_mask == state.full_mask && state.full_mask != 0 {
                    state.highest_to_download += 1;
                    debug!("bundle cursor advanced to {}", state.highest_to_download);
                    state.arrival_mask = 0;
                }
            } else {
                debug!(
                    "starting supporting set {} for extractor {}",
                    id,
                    sets[extractor_index].id()
                );
                let tile = &mut sets[tile_index];
                tile.set_buffering_time(buffering_time_ms);
                if state.target_segment_id > 0 {
                    tile.start_download_from(state.target_segment_id);
                } else if let Some(start) = download_start {
                    tile.start_download(start);
                }
            }
        }
    }

    let mut concat_events = concatenate_if_ready(sets, extractor_index, &mut state);
    events.append(&mut concat_events);
    sets[extractor_index].extractor = Some(state);
    events
}

/// Emits the concatenated segment `next_to_concatenate` once the extractor
/// and every supporting tile have it: a single buffer with the extractor's
/// bytes first, then each tile in bundle order, fed to the extractor's
/// parser adapter as one media segment.
fn concatenate_if_ready(
    sets: &mut [DashAdaptationSet],
    extractor_index: usize,
    state: &mut ExtractorState,
) -> Vec<SetEvent> {
    let set_id = sets[extractor_index].id();
    let mut events = Vec::new();

    // drop queued extractor segments the cursor has moved past
    {
        let representation = sets[extractor_index].current_representation_mut();
        if representation
            .peek_segment()
            .is_some_and(|s| s.segment_id < state.next_to_concatenate)
        {
            debug!("dropping stale extractor segments before {}", state.next_to_concatenate);
            representation.clean_up_old_segments(Some(state.next_to_concatenate));
        }
    }
    let Some(front) = sets[extractor_index]
        .current_representation()
        .peek_segment()
        .cloned()
    else {
        return events;
    };
    let segment_id = front.segment_id;
    if segment_id != state.next_to_concatenate {
        return events;
    }
    // pace concatenation against playback: only feed the parser when the
    // previous segment is nearly drained
    if !sets[extractor_index]
        .current_representation()
        .ready_for_segment(segment_id)
    {
        return events;
    }

    let mut total_size = front.size();
    let mut available = true;
    for id in state.supporting_ids.clone() {
        let Some(tile_index) = index_of(sets, id) else {
            available = false;
            break;
        };
        sets[tile_index].try_switching_representation(segment_id);
        match sets[tile_index]
            .current_representation()
            .has_segment(segment_id)
        {
            Some(size) => total_size += size,
            None => {
                available = false;
                break;
            }
        }
    }
    if !available {
        return events;
    }

    let mut buffer = BytesMut::with_capacity(total_size);
    let extractor_segment = sets[extractor_index]
        .current_representation_mut()
        .take_segment(segment_id)
        .expect("peeked segment vanished");
    buffer.extend_from_slice(&extractor_segment.data);
    for id in state.supporting_ids.clone() {
        let tile_index = index_of(sets, id).unwrap();
        let Some(tile_segment) = sets[tile_index]
            .current_representation_mut()
            .take_segment(segment_id)
        else {
            warn!("segment {} missing from set {} after the check", segment_id, id);
            return events;
        };
        buffer.extend_from_slice(&tile_segment.data);
        sets[tile_index]
            .current_representation_mut()
            .clean_up_old_segments(Some(segment_id + 1));
    }

    let mut concatenated = DashSegment::media(
        segment_id,
        extractor_segment.init_segment_id,
        buffer.freeze(),
    );
    concatenated.timestamp_base_ms = extractor_segment.timestamp_base_ms;
    info!(
        "concatenated segment {} for extractor {} ({} bytes)",
        segment_id,
        set_id,
        total_size
    );
    state.next_to_concatenate = segment_id + 1;
    state.segments_processed += 1;

    match sets[extractor_index]
        .current_representation_mut()
        .parse_concatenated_segment(concatenated)
    {
        Ok(rep_events) => {
            for event in rep_events {
                match event {
                    RepresentationEvent::StreamsCreated(streams) => {
                        events.push(SetEvent::StreamsCreated { set_id, streams })
                    }
                    RepresentationEvent::ParseError(error) => {
                        events.push(SetEvent::Error { set_id, error })
                    }
                    _ => {}
                }
            }
        }
        Err(error) => events.push(SetEvent::Error { set_id, error }),
    }
    events
}

/// Bundle-level buffering: the extractor's next segment has not arrived, or
/// any active supporting tile lacks it. During the very first segment every
/// tile must reach the start before playback begins.
pub fn is_bundle_buffering(sets: &[DashAdaptationSet], extractor_index: usize) -> bool {
    let set = &sets[extractor_index];
    let Some(state) = set.extractor.as_ref() else {
        return set.is_buffering();
    };
    if !set
        .current_representation()
        .ready_for_segment(state.next_to_concatenate)
    {
        // the next segment is not needed yet
        return false;
    }
    if set.current_representation().is_buffering() {
        return true;
    }
    for id in &state.supporting_ids {
        let Some(tile_index) = index_of(sets, *id) else {
            continue;
        };
        let tile = &sets[tile_index];
        if state.segments_processed == 0 {
            if tile.is_buffering() {
                debug!("set {} still prebuffering", tile.id());
                return true;
            }
        } else if tile.is_active()
            && tile
                .current_representation()
                .has_segment(state.next_to_concatenate)
                .is_none()
        {
            return true;
        }
    }
    false
}

pub fn is_bundle_end_of_stream(sets: &[DashAdaptationSet], extractor_index: usize) -> bool {
    let set = &sets[extractor_index];
    if set.is_end_of_stream() {
        return true;
    }
    let Some(state) = set.extractor.as_ref() else {
        return false;
    };
    state.supporting_ids.iter().any(|id| {
        index_of(sets, *id).is_some_and(|tile_index| sets[tile_index].is_end_of_stream())
    })
}

pub fn is_bundle_error(sets: &[DashAdaptationSet], extractor_index: usize) -> bool {
    let set = &sets[extractor_index];
    if set.is_error() {
        return true;
    }
    let Some(state) = set.extractor.as_ref() else {
        return false;
    };
    state.supporting_ids.iter().any(|id| {
        index_of(sets, *id).is_some_and(|tile_index| sets[tile_index].is_error())
    })
}

/// Aggregate bundle bandwidth: the extractor plus all supporting sets at
/// their current representations.
pub fn bundle_bandwidth(sets: &[DashAdaptationSet], extractor_index: usize) -> u32 {
    let set = &sets[extractor_index];
    let mut bandwidth = set.current_bandwidth();
    if let Some(state) = set.extractor.as_ref() {
        for id in &state.supporting_ids {
            if let Some(tile_index) = index_of(sets, *id) {
                bandwidth += sets[tile_index].current_bandwidth();
            }
        }
    }
    bandwidth
}

const BITRATE_SAFETY_MARGIN: f64 = 1.15;

/// Selectable bundle bitrates in increasing order: foreground tiles
/// stepped from background quality up to the best level, background tiles
/// pinned, scaled by a viewport-switch safety margin.
pub fn bundle_bitrates(sets: &[DashAdaptationSet], extractor_index: usize) -> Vec<u32> {
    let set = &sets[extractor_index];
    let Some(state) = set.extractor.as_ref() else {
        return set.bitrates();
    };
    let levels = set.quality_level_count().max(1);
    let mut bitrates = Vec::new();
    for quality_fg in (1..=levels).rev() {
        let mut bitrate = set.representation_for_quality(1, levels).bitrate();
        for id in &state.supporting_ids {
            let Some(tile_index) = index_of(sets, *id) else {
                continue;
            };
            let tile = &sets[tile_index];
            let tile_levels = tile.quality_level_count().max(1);
            let quality = match tile.role() {
                TileRole::Foreground | TileRole::ForegroundPole | TileRole::ForegroundMargin => {
                    quality_fg.min(tile_levels)
                }
                TileRole::Background => tile_levels,
            };
            bitrate += tile
                .representation_for_quality(quality, tile_levels)
                .bitrate();
        }
        bitrates.push((bitrate as f64 * BITRATE_SAFETY_MARGIN) as u32);
    }
    bitrates
}

/// Fans the (foreground, margin, background) quality triple out to the
/// supporting tiles according to their current roles. Pole tiles take the
/// foreground level.
pub fn set_quality_levels(
    sets: &mut [DashAdaptationSet],
    extractor_index: usize,
    foreground: u8,
    margin: u8,
    background: u8,
    levels: u8,
) {
    let Some(state) = sets[extractor_index].extractor.clone() else {
        return;
    };
    let resume_at = state.next_to_concatenate;
    for id in state.supporting_ids {
        let Some(tile_index) = index_of(sets, id) else {
            continue;
        };
        let tile = &mut sets[tile_index];
        let quality = match tile.role() {
            TileRole::Foreground | TileRole::ForegroundPole => foreground,
            TileRole::ForegroundMargin => margin,
            TileRole::Background => background,
        };
        let target = tile.representation_index_for_quality(quality, levels);
        let pending = tile
            .next_representation()
            .unwrap_or_else(|| tile.current_representation());
        if !std::ptr::eq(pending, &tile.representations()[target]) {
            debug!("set tile {} quality to {}", id, quality);
            tile.select_quality(quality, levels, resume_at);
        }
    }
}

/// Re-ranks the supporting tiles against the rendered viewport:
/// intersection area orders them, the covering tiles become foreground,
/// marginally visible ones margin, the rest background. Tiles whose
/// coverage reaches a pole are treated as pole tiles.
pub fn update_tile_roles(
    sets: &mut [DashAdaptationSet],
    extractor_index: usize,
    viewport: &RenderedViewport,
) {
    let Some(state) = sets[extractor_index].extractor.clone() else {
        return;
    };
    let mut scores = Vec::new();
    let mut max_score = 0.0f64;
    for id in &state.supporting_ids {
        let Some(tile_index) = index_of(sets, *id) else {
            continue;
        };
        let tile = &sets[tile_index];
        let Some(covered) = tile.covered_viewport() else {
            continue;
        };
        let (latitude, (_, ver_span)) = (covered.center_latitude(), covered.span());
        // dedicated polar-cap tiles sit near a pole; full-height tiles are
        // ordinary
        let covers_pole = latitude.abs() > 45.0 && latitude.abs() + ver_span / 2.0 >= 90.0;
        let score = viewport.intersect(covered);
        max_score = max_score.max(score);
        scores.push((tile_index, score, covers_pole));
    }
    // largest first
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (tile_index, score, covers_pole) in scores {
        let role = if score > 0.0 && covers_pole {
            TileRole::ForegroundPole
        } else if score >= max_score * 0.25 && score > 0.0 {
            TileRole::Foreground
        } else if score > 0.0 {
            TileRole::ForegroundMargin
        } else {
            TileRole::Background
        };
        sets[tile_index].set_role(role);
    }
}
