//! Error types for the client connection.

use std::time::Duration;

use thiserror::Error;

use boxproto_wire::WireError;

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by a connection.
///
/// `Application` is a normal remote failure and says nothing about the
/// health of the connection; everything else either kills the connect
/// attempt (`Auth`, `Config`) or the connection itself.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed frame or unexpected protocol structure. Fatal to the
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// The server rejected the credentials. Fatal to the connect attempt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Socket reset, closed, or otherwise unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request's deadline expired before a response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request executed and the remote logic raised an error.
    #[error("server error {code}: {message}")]
    Application { code: u32, message: String },

    /// Invalid caller-supplied configuration; never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl ClientError {
    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Application { .. } | ClientError::Config(_))
    }
}
