//! Error types for the wire codec.

use thiserror::Error;

/// Result type alias for codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
