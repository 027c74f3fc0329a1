use thiserror::Error;

pub type Result<T> = std::result::Result<T, EncodingError>;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("stream exhausted: needed {needed} more bytes, {available} available")]
    Exhausted { needed: usize, available: usize },

    #[error("sub-stream allocation of {size} bytes failed")]
    AllocFailed { size: usize },

    #[error("value block size {got} does not match natural size {want}")]
    SizeMismatch { got: usize, want: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("backing stream error: {0}")]
    Backend(String),
}
