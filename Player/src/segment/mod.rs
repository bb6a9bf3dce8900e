//! Segment identity and payload types shared between the download drivers,
//! the representations and the parser adapter.

pub mod stream;

use bytes::Bytes;

/// What an elementary stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    TimedMetadata,
}

/// Content descriptor travelling with every segment so the parser adapter
/// can route it without consulting the representation again.
#[derive(Debug, Clone, Default)]
pub struct SegmentContent {
    pub representation_id: String,
    pub adaptation_set_id: u32,
    pub init_segment_id: u32,
    /// Representation this one associates to (`cdsc` timed metadata).
    pub associated_to_representation: Option<String>,
    pub association_type: Option<String>,
}

/// A downloaded byte blob with its identity in the segment sequence.
#[derive(Debug, Clone)]
pub struct DashSegment {
    pub data: Bytes,
    pub segment_id: u32,
    pub init_segment_id: u32,
    pub is_init: bool,
    /// Byte offset of this blob inside the enclosing file, for on-demand
    /// subsegment fetches.
    pub range_start_byte: Option<u64>,
    /// Offset (ms) applied to every sample parsed from this segment; used
    /// for looping and viewpoint transitions.
    pub timestamp_base_ms: u64,
    pub content: SegmentContent,
}

impl DashSegment {
    pub fn media(segment_id: u32, init_segment_id: u32, data: Bytes) -> DashSegment {
        DashSegment {
            data,
            segment_id,
            init_segment_id,
            is_init: false,
            range_start_byte: None,
            timestamp_base_ms: 0,
            content: SegmentContent::default(),
        }
    }

    pub fn init(init_segment_id: u32, data: Bytes) -> DashSegment {
        DashSegment {
            data,
            segment_id: 0,
            init_segment_id,
            is_init: true,
            range_start_byte: None,
            timestamp_base_ms: 0,
            content: SegmentContent::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A `sidx`-resolved subsegment: the byte range to fetch for a given
/// presentation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSegment {
    pub segment_id: u32,
    pub earliest_presentation_time_ms: u64,
    pub start_byte: u64,
    pub end_byte: u64,
}
