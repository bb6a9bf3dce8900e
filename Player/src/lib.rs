//! # OMAF viewport-adaptive streaming player core
//!
//! A client for OMAF (Omnidirectional Media Application Format) VR video:
//! consumes a local ISOBMFF file or an MPEG-DASH MPD referencing ISOBMFF
//! segments and delivers decoded-ready, spatially-attributed samples to a
//! renderer, with quality, bandwidth and viewport feedback loops.
//!
//! The pipeline, leaves first: HTTP → segment stream driver →
//! segment parser adapter → representation → adaptation set →
//! stream manager → decoder boundary. Control flows the other way:
//! viewport and playback clock drive quality selection, tile activation and
//! download pacing.

pub mod adaptation;
pub mod error;
pub mod geometry;
pub mod http;
pub mod media;
pub mod mpd;
pub mod player;
pub mod representation;
pub mod segment;
pub mod stream_manager;
pub mod viewport;

pub use adaptation::{DashAdaptationSet, DelayIssue, SetContext, SetEvent, SetKind, TileRole};
pub use error::{Result, StreamingError};
pub use geometry::{SourceType, VideoSource};
pub use media::adapter::{Mp4ParserAdapter, SeekAccuracy, SeekDirection};
pub use media::{MediaPacket, StreamId};
pub use player::{EventCallback, OmafPlayer, PlayerEvent};
pub use stream_manager::{MediaStreamManager, StreamHandle};
