//! Chainward Core Resilience: pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks Chainward composes into a
//! resilient client for a slow, occasionally-unreliable backend:
//!
//! - **Timed Cache**: capacity- and TTL-bounded LRU store for hot reads
//! - **Connection Pool**: bounded pool with deadline acquisition, idle
//!   reaping, and per-connection failure cooldowns
//! - **Batch Queue**: bounded write buffer drained in FIFO batches by a
//!   background task, with fail-fast backpressure
//! - **Recovery Ledger**: failed-operation bookkeeping driving bounded,
//!   backed-off retries
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The backend being talked to (blockchain daemon, database, anything)
//! - Wire protocols or serialization formats
//! - Application-specific record types
//!
//! Callers plug their own connection and processing logic in through the
//! [`ConnectionFactory`] and [`BatchProcessor`] seams.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Your Client Facade             │
//! └───────┬──────────┬──────────┬───────────┘
//!         │          │          │
//!         ▼          │          ▼
//! ┌──────────────┐   │   ┌──────────────┐
//! │ Timed Cache  │   │   │ Batch Queue  │  ← bounded writes,
//! │ (hot reads)  │   │   │ (drain task) │    fail-fast when full
//! └──────────────┘   │   └──────┬───────┘
//!                    ▼          │
//!            ┌──────────────┐   │
//!            │  Connection  │◄──┘ batches submit over
//!            │     Pool     │     pooled connections
//!            └──────┬───────┘
//!                   ▼
//!             Backend service
//!                   │
//!              on failure:
//!                   ▼
//!            ┌──────────────┐
//!            │   Recovery   │  ← bounded retries with
//!            │    Ledger    │    exponential backoff
//!            └──────────────┘
//! ```

pub mod batch_queue;
pub mod connection_pool;
pub mod error;
pub mod recovery;
pub mod timed_cache;

// Re-export main types for convenience
pub use batch_queue::{BatchConfig, BatchProcessor, BatchQueue, BatchStats};
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolGuard, PoolStats,
};
pub use error::ResilienceError;
pub use recovery::{
    OperationKind, RecoveryConfig, RecoveryLedger, RecoveryOperation, RecoveryOutcome,
    RecoveryRecord, RecoveryStats,
};
pub use timed_cache::{CacheStats, TimedCache, Touch};
