/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header announced a length outside the accepted range.
    #[error("invalid message size ({len} bytes, at most {max} supported)")]
    InvalidLength { len: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("EOF reached during read")]
    Eof,
}

pub type Result<T> = std::result::Result<T, FrameError>;
