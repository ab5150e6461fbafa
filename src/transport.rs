/*!
 * Transport seam to the blockchain daemon
 *
 * The client never speaks a wire protocol itself. Everything it knows
 * about the daemon goes through the [`Transport`] trait, implemented
 * elsewhere (an RPC proxy, a test double). A [`TransportConnector`] dials
 * the daemon and yields transport sessions; the connection pool owns the
 * sessions through the [`SessionFactory`] adapter.
 */

use crate::types::{BlockInfo, TransactionInfo};
use chainward_core_resilience::{ConnectionFactory, ResilienceError};
use std::fmt;
use std::sync::Arc;

/// Error raised by a transport implementation.
#[derive(Debug, Clone)]
pub struct TransportError(String);

impl TransportError {
    /// Wrap a failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// One session against the daemon.
///
/// Read methods return `Ok(None)` when the daemon definitively does not
/// know the requested entity, so absence is distinguishable from failure.
/// Submit methods return `Ok(false)` when the daemon rejects the record
/// outright (malformed, already known); transport-level problems are
/// `Err`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a block by hash.
    async fn fetch_block(&self, hash: &str) -> Result<Option<BlockInfo>, TransportError>;

    /// Fetch a block by height.
    async fn fetch_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<BlockInfo>, TransportError>;

    /// Fetch a transaction by id.
    async fn fetch_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<TransactionInfo>, TransportError>;

    /// Fetch the confirmed balance of an address, in base units.
    async fn fetch_balance(&self, address: &str) -> Result<Option<u64>, TransportError>;

    /// Current chain height as the daemon sees it.
    async fn fetch_height(&self) -> Result<u64, TransportError>;

    /// Broadcast a block. `Ok(false)` means the daemon rejected it.
    async fn submit_block(&self, block: &BlockInfo) -> Result<bool, TransportError>;

    /// Broadcast a transaction. `Ok(false)` means the daemon rejected it.
    async fn submit_transaction(&self, tx: &TransactionInfo) -> Result<bool, TransportError>;

    /// Cheap liveness probe used by the pool before reusing a session.
    async fn ping(&self) -> bool {
        true
    }
}

/// Dials the daemon and yields transport sessions.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Adapts a [`TransportConnector`] to the pool's factory seam.
pub(crate) struct SessionFactory {
    connector: Arc<dyn TransportConnector>,
}

impl SessionFactory {
    pub(crate) fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<Box<dyn Transport>> for SessionFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, ResilienceError> {
        self.connector
            .connect()
            .await
            .map_err(|e| ResilienceError::Transport(e.to_string()))
    }

    async fn is_healthy(&self, conn: &Box<dyn Transport>) -> bool {
        conn.ping().await
    }
}
