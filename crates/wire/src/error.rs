//! Wire error types

use std::io;
use thiserror::Error;

/// Result type alias for wire operations
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Errors raised while framing or decoding queue messages
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying pipe failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a message
    #[error("message truncated: expected {expected} more bytes")]
    Truncated {
        /// Bytes still missing
        expected: u64,
    },

    /// A frame header is inconsistent
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Declared message size exceeds the protocol maximum
    #[error("message of {size} bytes exceeds limit of {max}")]
    Oversized {
        /// Declared size
        size: u64,
        /// Protocol maximum
        max: u64,
    },

    /// Payload failed to encode or decode
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<rmp_serde::encode::Error> for WireError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        WireError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for WireError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        WireError::Codec(e.to_string())
    }
}
