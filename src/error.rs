//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors raised by the pool, its connections and the transport beneath them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No connection became available within the acquire timeout.
    #[error("pool exhausted: no connection available within {0:?}")]
    PoolExhausted(Duration),

    /// Wire or protocol failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The idle-in-transaction deadline elapsed while a transaction was open.
    #[error("terminating connection due to idle-in-transaction timeout ({0:?})")]
    IdleInTransactionTimeout(Duration),

    /// The connection was terminated while an operation was pending on it.
    #[error("connection {0} terminated")]
    ConnectionTerminated(ConnectionId),

    /// Best-effort rollback did not go through.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// The pool has been shut down.
    #[error("pool is closed")]
    Closed,
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
