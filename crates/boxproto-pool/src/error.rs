//! Pool error taxonomy.

use thiserror::Error;

/// Errors surfaced by [`crate::Pool`] operations.
///
/// Note that an unreachable or invalidated instance is NOT an error:
/// [`crate::Pool::get`] reports that case as
/// [`crate::PoolGet::Unavailable`] so callers can retry or fail over.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No group with that tag, or index past the group's size.
    #[error("unknown instance: {0}")]
    NotFound(String),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,
}

pub type PoolResult<T> = Result<T, PoolError>;
