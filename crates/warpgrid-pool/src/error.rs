//! Error types for the client pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by [`ClientPool`](crate::pool::ClientPool) and
/// [`ClientPools`](crate::registry::ClientPools).
///
/// None of these are fatal to the pool itself: a failed `send_request`
/// leaves the pool usable and callers decide whether to retry.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to {host} after {attempts} attempt(s): {source}")]
    Connect {
        host: String,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("no endpoints resolved for {host}")]
    Resolve { host: String },

    #[error("connection pool exhausted for {host} (waited {waited:?})")]
    Exhausted { host: String, waited: Duration },

    #[error("connection pool for {host} is closed")]
    Closed { host: String },

    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

/// Errors reported by a [`PoolClient`](crate::client::PoolClient) while connecting.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no endpoints to connect to")]
    NoEndpoints,

    #[error("connect timed out")]
    Timeout,

    #[error("client is closed")]
    Closed,
}
