/*!
 * Domain records served and submitted by the client
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A block as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block hash, lowercase hex.
    pub hash: String,

    /// Hash of the parent block; empty for the genesis block.
    #[serde(default)]
    pub previous_hash: String,

    /// Height in the chain.
    pub height: u64,

    /// Unix timestamp of the block.
    pub timestamp: u64,

    /// Difficulty target the block was mined at.
    #[serde(default)]
    pub difficulty: u64,

    /// Transaction ids included in the block.
    #[serde(default)]
    pub transactions: Vec<String>,

    /// Daemon-specific extras that callers may want to carry along.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Confirmation state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// In the mempool, not yet mined.
    #[default]
    Pending,
    /// Included in a block.
    Confirmed,
    /// Rejected or dropped.
    Failed,
}

/// A transaction as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id, lowercase hex.
    pub txid: String,

    /// Containing block hash, if mined.
    #[serde(default)]
    pub block_hash: Option<String>,

    /// Containing block height, if mined.
    #[serde(default)]
    pub block_height: Option<u64>,

    /// Unix timestamp the transaction was first seen.
    pub timestamp: u64,

    /// Sending address.
    pub from_address: String,

    /// Receiving address.
    pub to_address: String,

    /// Amount transferred, in base units.
    pub amount: u64,

    /// Fee paid, in base units.
    #[serde(default)]
    pub fee: u64,

    /// Confirmation state.
    #[serde(default)]
    pub status: TxStatus,

    /// Daemon-specific extras.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A record accepted for batched submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRecord {
    /// A block to broadcast.
    Block(BlockInfo),
    /// A transaction to broadcast.
    Transaction(TransactionInfo),
}

impl ChainRecord {
    /// The record's own identifier (block hash or txid).
    pub fn id(&self) -> &str {
        match self {
            ChainRecord::Block(b) => &b.hash,
            ChainRecord::Transaction(t) => &t.txid,
        }
    }
}

/// Result of a [`sync_to_height`](crate::ResilientClient::sync_to_height)
/// run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Height the sync started from.
    pub start_height: u64,
    /// Height the sync was asked to reach.
    pub target_height: u64,
    /// Blocks actually fetched and cached.
    pub blocks_synced: u64,
    /// False when the run was cut short by shutdown.
    pub completed: bool,
}

/// Point-in-time snapshot of client internals.
#[derive(Debug, Clone)]
pub struct ClientStatistics {
    /// Block cache counters.
    pub block_cache: chainward_core_resilience::CacheStats,
    /// Transaction cache counters.
    pub transaction_cache: chainward_core_resilience::CacheStats,
    /// Balance cache counters.
    pub balance_cache: chainward_core_resilience::CacheStats,
    /// Connection pool occupancy.
    pub pool: chainward_core_resilience::PoolStats,
    /// Batch queue throughput.
    pub batch: chainward_core_resilience::BatchStats,
    /// Recovery ledger occupancy.
    pub recovery: chainward_core_resilience::RecoveryStats,
}
