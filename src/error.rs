use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid sample rate: {0} Hz (100ms must divide into a whole number of frames)")]
    InvalidSampleRate(u32),

    #[error("unsupported channel count: {0} (must be < 64)")]
    UnsupportedChannelCount(u32),

    #[error("failed to open decoder for {path}: {source}")]
    DecoderOpenFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to read frames from {path}: {source}")]
    DecoderReadFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read tags from {path}: {source}")]
    TagReadFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to write tags to {path}: {source}")]
    TagWriteFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("malformed Opus identification header: {0}")]
    OpusHeaderMalformed(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
