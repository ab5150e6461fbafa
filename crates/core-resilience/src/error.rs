//! Error types shared by the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the resilience primitives.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// No pooled connection became available within the caller's deadline.
    #[error("connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(Duration),

    /// The batch queue is at capacity and cannot accept more items.
    #[error("batch queue full: {len} items queued (limit {limit})")]
    QueueFull { len: usize, limit: usize },

    /// The underlying transport failed (network error, daemon error).
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded wait expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A recovery operation used up all of its retry attempts.
    #[error("recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// The recovery ledger has no active operation with this id.
    ///
    /// Also returned when another task has already claimed the operation,
    /// which keeps retries for a given id strictly sequential.
    #[error("no active recovery operation with id {0}")]
    UnknownOperation(String),

    /// The component has been shut down and no longer accepts work.
    #[error("component is shut down")]
    Shutdown,
}

impl ResilienceError {
    /// Whether the error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transport(_) | ResilienceError::Timeout(_)
        )
    }

    /// Whether the error is permanent and must not be retried.
    ///
    /// Pool exhaustion and queue rejection are backpressure signals: the
    /// caller should shed load or slow down, not hammer the same bound.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}
