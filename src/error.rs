/*!
 * Error types for Chainward
 */

use chainward_core_resilience::ResilienceError;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The entity is absent from both cache and backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// No pooled connection became available within the deadline. A
    /// backpressure signal; never retried internally.
    #[error("connection pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    /// The backend or network failed. Transient; retried through the
    /// recovery ledger when auto-recovery is enabled.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed input. Surfaced immediately, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The batch queue is full. A backpressure signal; never retried.
    #[error("batch queue full ({len}/{limit})")]
    QueueFull { len: usize, limit: usize },

    /// Recovery retries were exhausted; the failure is terminal.
    #[error("recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the error is transient and eligible for auto-recovery.
    ///
    /// Backpressure signals (`PoolExhausted`, `QueueFull`) and input
    /// problems (`Validation`, `NotFound`) are deliberately not here:
    /// retrying them either worsens the overload or cannot change the
    /// answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Timeout(_))
    }

    /// Whether the failure is terminal from the caller's point of view.
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

impl From<ResilienceError> for ClientError {
    fn from(e: ResilienceError) -> Self {
        match e {
            ResilienceError::PoolExhausted(d) => ClientError::PoolExhausted(d),
            ResilienceError::QueueFull { len, limit } => ClientError::QueueFull { len, limit },
            ResilienceError::Transport(msg) => ClientError::Transport(msg),
            ResilienceError::Timeout(d) => ClientError::Timeout(d),
            ResilienceError::RecoveryExhausted { attempts } => {
                ClientError::RecoveryExhausted { attempts }
            }
            ResilienceError::UnknownOperation(id) => {
                ClientError::Transport(format!("unknown recovery operation {}", id))
            }
            ResilienceError::Shutdown => ClientError::Shutdown,
        }
    }
}
