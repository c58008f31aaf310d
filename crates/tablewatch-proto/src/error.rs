//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding channel traffic.
#[derive(Debug, Error)]
pub enum Error {
    /// A message or payload could not be encoded as JSON.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame or payload did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message carried a different event than the operation expects.
    #[error("unexpected event: expected {expected}, got {actual}")]
    UnexpectedEvent {
        /// Event the operation expects.
        expected: &'static str,
        /// Event the message carried.
        actual: String,
    },
}
