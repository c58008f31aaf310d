//! Client error types.

use thiserror::Error;

use crate::channel::ChannelState;

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backend unreachable, socket lost, or channel join rejected.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials refused while opening the socket.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] tablewatch_proto::Error),

    /// Operation not allowed in the channel's current state.
    #[error("invalid channel state: expected {expected}, got {actual:?}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the channel was in.
        actual: ChannelState,
    },

    /// Dialing the socket timed out.
    #[error("connection timed out")]
    Timeout,

    /// The client's socket task has stopped.
    #[error("client closed")]
    Closed,
}

impl Error {
    /// Whether a reconnect attempt may succeed after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout)
    }
}

/// Error returned by a change handler.
///
/// Handler errors are logged by the delivery task and never stop delivery.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Create a callback error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for CallbackError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("io error: {}", err))
    }
}
