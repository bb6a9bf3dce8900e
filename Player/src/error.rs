use thiserror::Error;

/// The player-wide error surface. Every fallible operation in the pipeline
/// returns one of these kinds; transport and parsing layers are mapped in
/// at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    /// No more samples available right now. During an active download this
    /// means "wait and retry", from a drained stream it means the stream
    /// ended.
    #[error("end of file")]
    EndOfFile,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("not initialized")]
    NotInitialized,
    #[error("item not found")]
    ItemNotFound,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("not ready")]
    NotReady,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("already set")]
    AlreadySet,
    #[error("file not found")]
    FileNotFound,
    #[error("file open failed")]
    FileOpenFailed,
    #[error("file is not an mp4")]
    FileNotMp4,
    #[error("file not supported: {0}")]
    FileNotSupported(String),
    #[error("segment change failed")]
    SegmentChangeFailed,
    #[error("network access failed: {0}")]
    NetworkAccessFailed(String),
}

pub type Result<T> = std::result::Result<T, StreamingError>;

impl From<mp4_box::BoxError> for StreamingError {
    fn from(err: mp4_box::BoxError) -> Self {
        match err {
            mp4_box::BoxError::NotMp4 => StreamingError::FileNotMp4,
            mp4_box::BoxError::Unsupported(s) => StreamingError::FileNotSupported(s),
            mp4_box::BoxError::Truncated(what) => {
                StreamingError::InvalidData(format!("truncated {}", what))
            }
            mp4_box::BoxError::Malformed(what, detail) => {
                StreamingError::InvalidData(format!("{}: {}", what, detail))
            }
        }
    }
}
