//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to a session asking for a backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Connecting failed on every allowed attempt.
    #[error("backend unavailable for {target} after {attempts} attempt(s): {reason}")]
    BackendUnavailable {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// The request waited in the queue until its deadline.
    #[error("pool exhausted for {target}: no connection within {waited:?}")]
    PoolExhausted { target: String, waited: Duration },

    /// The wait queue was full; the request was never queued.
    #[error("pool overloaded for {target}: wait queue is full")]
    Overloaded { target: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("pool for {0} is closed")]
    Closed(String),

    #[error("unknown database: {0}")]
    UnknownTarget(String),
}

/// A single failed attempt to open a backend connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend rejected startup: {0}")]
    Rejected(String),

    #[error("unexpected startup response: {0}")]
    Protocol(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}
