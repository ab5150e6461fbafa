/*!
 * Resilient client facade
 *
 * Composes the resilience primitives behind the public query/write API:
 * three independent timed caches for hot reads, a bounded connection
 * pool, a batch queue absorbing write bursts, and a recovery ledger
 * driving bounded retries of transient transport failures.
 *
 * A query runs cache-first: a hit returns immediately; a miss acquires a
 * pooled session, calls the transport, and populates the cache on
 * success. The session is held through an RAII guard, so no error path
 * can leak it. A transient transport failure is recorded in the ledger
 * and, when auto-recovery is enabled, retried synchronously inside the
 * failing call; the caller then sees either a delayed success or the
 * typed error once recovery is exhausted.
 *
 * Two background tasks run per client: the batch drain task owned by the
 * queue, and a maintenance task that reaps idle connections, restores
 * the pool minimum, and sweeps expired cache entries. Both are stopped
 * and awaited by [`ResilientClient::shutdown`].
 */

use crate::callbacks::{
    BlockCallback, CallbackRegistry, ErrorCallback, ProgressCallback, TransactionCallback,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::{SessionFactory, Transport, TransportConnector};
use crate::types::{BlockInfo, ChainRecord, ClientStatistics, SyncReport, TransactionInfo};
use chainward_core_resilience::{
    BatchProcessor, BatchQueue, ConnectionPool, OperationKind, RecoveryLedger, RecoveryOperation,
    RecoveryRecord, ResilienceError, TimedCache, Touch,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resilience layer between a blockchain-query API and a slow, unreliable
/// daemon reachable through a [`Transport`].
pub struct ResilientClient {
    config: ClientConfig,
    block_cache: Arc<TimedCache<String, BlockInfo>>,
    tx_cache: Arc<TimedCache<String, TransactionInfo>>,
    balance_cache: Arc<TimedCache<String, u64>>,
    pool: ConnectionPool<Box<dyn Transport>>,
    queue: BatchQueue<ChainRecord>,
    ledger: Arc<RecoveryLedger>,
    callbacks: Arc<CallbackRegistry>,
    stop: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl ResilientClient {
    /// Construct a client over the given transport connector and start
    /// its background tasks.
    ///
    /// The pool is topped up to its configured minimum best-effort; an
    /// unreachable daemon does not fail construction, since the
    /// maintenance task keeps retrying.
    pub async fn new(
        config: ClientConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let block_cache = Arc::new(TimedCache::new(
            config.caches.block.max_size,
            config.caches.block.ttl(),
        ));
        let tx_cache = Arc::new(TimedCache::new(
            config.caches.transaction.max_size,
            config.caches.transaction.ttl(),
        ));
        let balance_cache = Arc::new(TimedCache::new(
            config.caches.balance.max_size,
            config.caches.balance.ttl(),
        ));

        let pool = ConnectionPool::new(
            Arc::new(SessionFactory::new(connector)),
            config.pool.to_pool_config(),
        );
        let ledger = Arc::new(RecoveryLedger::new(config.recovery.to_recovery_config()));
        let callbacks = Arc::new(CallbackRegistry::new());

        let submitter = BatchSubmitter {
            pool: pool.clone(),
            block_cache: Arc::clone(&block_cache),
            tx_cache: Arc::clone(&tx_cache),
            callbacks: Arc::clone(&callbacks),
            ledger: Arc::clone(&ledger),
            deadline: config.pool.connection_timeout(),
        };
        let queue = BatchQueue::start(config.batch.to_batch_config(), Arc::new(submitter));

        if let Err(e) = pool.ensure_min().await {
            tracing::warn!(error = %e, "could not pre-warm connection pool");
        }

        let (stop, stop_rx) = watch::channel(false);
        let maintenance = tokio::spawn(maintenance_loop(
            pool.clone(),
            Arc::clone(&block_cache),
            Arc::clone(&tx_cache),
            Arc::clone(&balance_cache),
            config.maintenance_interval(),
            stop_rx,
        ));

        tracing::info!(
            block_cache = config.caches.block.max_size,
            tx_cache = config.caches.transaction.max_size,
            balance_cache = config.caches.balance.max_size,
            pool_max = config.pool.max_connections,
            "client initialized"
        );

        Ok(Self {
            config,
            block_cache,
            tx_cache,
            balance_cache,
            pool,
            queue,
            ledger,
            callbacks,
            stop,
            maintenance: Mutex::new(Some(maintenance)),
            is_shutdown: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch a block by hash, serving from cache when possible.
    pub async fn get_block_info(&self, hash: &str) -> Result<BlockInfo> {
        self.ensure_running()?;
        validate_hex_id("block hash", hash)?;

        let key = hash.to_string();
        if let Some(block) = self.block_cache.lookup(&key, Touch::Refresh) {
            tracing::trace!(hash, "block served from cache");
            return Ok(block);
        }

        let pool = self.pool.clone();
        let deadline = self.config.pool.connection_timeout();
        let found = self
            .with_recovery(OperationKind::Fetch, &[("entity", "block"), ("hash", hash)], move || {
                let pool = pool.clone();
                let key = key.clone();
                async move {
                    let mut session = pool.acquire(deadline).await?;
                    match session.fetch_block(&key).await {
                        Ok(block) => Ok(block),
                        Err(e) => {
                            session.mark_failure();
                            Err(ResilienceError::Transport(e.to_string()))
                        }
                    }
                }
            })
            .await?;

        match found {
            Some(block) => {
                self.block_cache.insert(hash.to_string(), block.clone());
                self.callbacks.notify_block(hash, &block);
                Ok(block)
            }
            None => Err(ClientError::NotFound(format!("block {}", hash))),
        }
    }

    /// Fetch a transaction by id, serving from cache when possible.
    pub async fn get_transaction_info(&self, txid: &str) -> Result<TransactionInfo> {
        self.ensure_running()?;
        validate_hex_id("transaction id", txid)?;

        let key = txid.to_string();
        if let Some(tx) = self.tx_cache.lookup(&key, Touch::Refresh) {
            tracing::trace!(txid, "transaction served from cache");
            return Ok(tx);
        }

        let pool = self.pool.clone();
        let deadline = self.config.pool.connection_timeout();
        let found = self
            .with_recovery(
                OperationKind::Fetch,
                &[("entity", "transaction"), ("txid", txid)],
                move || {
                    let pool = pool.clone();
                    let key = key.clone();
                    async move {
                        let mut session = pool.acquire(deadline).await?;
                        match session.fetch_transaction(&key).await {
                            Ok(tx) => Ok(tx),
                            Err(e) => {
                                session.mark_failure();
                                Err(ResilienceError::Transport(e.to_string()))
                            }
                        }
                    }
                },
            )
            .await?;

        match found {
            Some(tx) => {
                self.tx_cache.insert(txid.to_string(), tx.clone());
                self.callbacks.notify_transaction(txid, &tx);
                Ok(tx)
            }
            None => Err(ClientError::NotFound(format!("transaction {}", txid))),
        }
    }

    /// Fetch the confirmed balance of an address, serving from cache when
    /// possible.
    pub async fn get_balance(&self, address: &str) -> Result<u64> {
        self.ensure_running()?;
        validate_address(address)?;

        let key = address.to_string();
        if let Some(balance) = self.balance_cache.lookup(&key, Touch::Refresh) {
            tracing::trace!(address, "balance served from cache");
            return Ok(balance);
        }

        let pool = self.pool.clone();
        let deadline = self.config.pool.connection_timeout();
        let found = self
            .with_recovery(
                OperationKind::Fetch,
                &[("entity", "balance"), ("address", address)],
                move || {
                    let pool = pool.clone();
                    let key = key.clone();
                    async move {
                        let mut session = pool.acquire(deadline).await?;
                        match session.fetch_balance(&key).await {
                            Ok(balance) => Ok(balance),
                            Err(e) => {
                                session.mark_failure();
                                Err(ResilienceError::Transport(e.to_string()))
                            }
                        }
                    }
                },
            )
            .await?;

        match found {
            Some(balance) => {
                self.balance_cache.insert(address.to_string(), balance);
                Ok(balance)
            }
            None => Err(ClientError::NotFound(format!("address {}", address))),
        }
    }

    /// Current chain height as reported by the daemon. Not cached.
    pub async fn current_height(&self) -> Result<u64> {
        self.ensure_running()?;

        let pool = self.pool.clone();
        let deadline = self.config.pool.connection_timeout();
        self.with_recovery(OperationKind::Fetch, &[("entity", "height")], move || {
            let pool = pool.clone();
            async move {
                let mut session = pool.acquire(deadline).await?;
                match session.fetch_height().await {
                    Ok(height) => Ok(height),
                    Err(e) => {
                        session.mark_failure();
                        Err(ResilienceError::Transport(e.to_string()))
                    }
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Queue a block for batched submission to the daemon.
    ///
    /// Fails fast with `QueueFull` when the write buffer is at capacity;
    /// the caller is expected to back off and resubmit.
    pub fn submit_block(&self, block: BlockInfo) -> Result<()> {
        self.ensure_running()?;
        validate_block(&block)?;
        self.enqueue(ChainRecord::Block(block))
    }

    /// Queue a transaction for batched submission to the daemon.
    pub fn submit_transaction(&self, tx: TransactionInfo) -> Result<()> {
        self.ensure_running()?;
        validate_transaction(&tx)?;
        self.enqueue(ChainRecord::Transaction(tx))
    }

    fn enqueue(&self, record: ChainRecord) -> Result<()> {
        match self.queue.enqueue(record) {
            Ok(()) => Ok(()),
            Err(e) => {
                let error: ClientError = e.into();
                if matches!(error, ClientError::QueueFull { .. }) {
                    self.callbacks.notify_error(&error.to_string());
                }
                Err(error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Walk blocks from `start_height` through `target_height`, pulling
    /// each through the cache/pool/recovery path and reporting progress.
    ///
    /// Stops early, reporting `completed: false`, when the client shuts
    /// down mid-run.
    pub async fn sync_blocks(&self, start_height: u64, target_height: u64) -> Result<SyncReport> {
        self.ensure_running()?;
        if start_height > target_height {
            return Err(ClientError::Validation(format!(
                "sync range is inverted ({} > {})",
                start_height, target_height
            )));
        }

        let sync_id = self.ledger.next_operation_id(OperationKind::Sync);
        let span = target_height - start_height + 1;
        let mut synced = 0u64;
        tracing::info!(sync_id = %sync_id, start_height, target_height, "starting block sync");

        for height in start_height..=target_height {
            if self.is_shutdown.load(Ordering::SeqCst) {
                tracing::info!(sync_id = %sync_id, height, "sync interrupted by shutdown");
                return Ok(SyncReport {
                    start_height,
                    target_height,
                    blocks_synced: synced,
                    completed: false,
                });
            }

            let pool = self.pool.clone();
            let deadline = self.config.pool.connection_timeout();
            let found = self
                .with_recovery(
                    OperationKind::Sync,
                    &[("height", &height.to_string())],
                    move || {
                        let pool = pool.clone();
                        async move {
                            let mut session = pool.acquire(deadline).await?;
                            match session.fetch_block_by_height(height).await {
                                Ok(block) => Ok(block),
                                Err(e) => {
                                    session.mark_failure();
                                    Err(ResilienceError::Transport(e.to_string()))
                                }
                            }
                        }
                    },
                )
                .await?;

            let block = found.ok_or_else(|| {
                ClientError::NotFound(format!("block at height {}", height))
            })?;
            self.block_cache.insert(block.hash.clone(), block.clone());
            self.callbacks.notify_block(&block.hash, &block);
            synced += 1;

            let percent = ((height - start_height + 1) * 100 / span) as u8;
            self.callbacks.notify_progress(&sync_id, percent);
        }

        tracing::info!(sync_id = %sync_id, blocks = synced, "block sync complete");
        Ok(SyncReport {
            start_height,
            target_height,
            blocks_synced: synced,
            completed: true,
        })
    }

    // ------------------------------------------------------------------
    // Recovery surface
    // ------------------------------------------------------------------

    /// Whether a recovery run is executing right now.
    pub fn is_recovery_in_progress(&self) -> bool {
        self.ledger.is_recovery_in_progress()
    }

    /// Snapshot of completed recovery runs.
    pub fn recovery_history(&self) -> Vec<RecoveryRecord> {
        self.ledger.history()
    }

    /// Discard recovery history.
    pub fn clear_recovery_history(&self) {
        self.ledger.clear_history()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Register a callback fired after a block lands in the cache.
    pub fn on_block_update(&self, callback: BlockCallback) {
        self.callbacks.on_block_update(callback);
    }

    /// Register a callback fired after a transaction lands in the cache.
    pub fn on_transaction_update(&self, callback: TransactionCallback) {
        self.callbacks.on_transaction_update(callback);
    }

    /// Register a callback fired on terminal failures.
    pub fn on_error(&self, callback: ErrorCallback) {
        self.callbacks.on_error(callback);
    }

    /// Register a callback fired as long-running operations advance.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.callbacks.on_progress(callback);
    }

    // ------------------------------------------------------------------
    // Maintenance and lifecycle
    // ------------------------------------------------------------------

    /// Drop every cached entry.
    pub fn clear_caches(&self) {
        self.block_cache.clear();
        self.tx_cache.clear();
        self.balance_cache.clear();
    }

    /// Point-in-time snapshot of component counters.
    pub fn statistics(&self) -> ClientStatistics {
        ClientStatistics {
            block_cache: self.block_cache.stats(),
            transaction_cache: self.tx_cache.stats(),
            balance_cache: self.balance_cache.stats(),
            pool: self.pool.stats(),
            batch: self.queue.stats(),
            recovery: self.ledger.stats(),
        }
    }

    /// Stop background tasks, flush pending writes, and close pooled
    /// connections. Idempotent; queries after shutdown yield `Shutdown`.
    pub async fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down client");
        let _ = self.stop.send(true);

        // Flush pending writes before the pool goes away; the final
        // drain still needs connections.
        self.queue.shutdown().await;

        let handle = self.maintenance.lock().expect("maintenance lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "maintenance task panicked");
            }
        }
        self.pool.close().await;
        tracing::info!("client shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            Err(ClientError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Run one transport attempt; on a transient failure, record it and
    /// (when enabled) drive auto-recovery with the same attempt closure.
    ///
    /// Non-transient failures such as pool exhaustion propagate
    /// unchanged: they signal backpressure and must not add retry load.
    async fn with_recovery<T, F, Fut>(
        &self,
        kind: OperationKind,
        context: &[(&str, &str)],
        attempt: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ResilienceError>>,
    {
        match attempt().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() => {
                let operation_id = self.ledger.next_operation_id(kind);
                let mut op =
                    RecoveryOperation::new(operation_id.clone(), kind, e.to_string());
                for (key, value) in context {
                    op = op.with_context(key, value);
                }
                self.ledger.record_failure(op);

                if !self.config.recovery.auto_recover {
                    let error: ClientError = e.into();
                    self.callbacks.notify_error(&error.to_string());
                    return Err(error);
                }

                tracing::debug!(operation_id = %operation_id, "attempting auto-recovery");
                match self.ledger.attempt_recovery(&operation_id, || attempt()).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        let error: ClientError = e.into();
                        self.callbacks.notify_error(&error.to_string());
                        Err(error)
                    }
                }
            }
            Err(e) => {
                let error: ClientError = e.into();
                self.callbacks.notify_error(&error.to_string());
                Err(error)
            }
        }
    }
}

/// Background maintenance: reap idle connections, restore the pool
/// minimum, and sweep expired cache entries.
async fn maintenance_loop(
    pool: ConnectionPool<Box<dyn Transport>>,
    block_cache: Arc<TimedCache<String, BlockInfo>>,
    tx_cache: Arc<TimedCache<String, TransactionInfo>>,
    balance_cache: Arc<TimedCache<String, u64>>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => break,
        }
        pool.reap_idle().await;
        if let Err(e) = pool.ensure_min().await {
            tracing::warn!(error = %e, "could not restore minimum pool size");
        }
        let swept = block_cache.sweep_expired()
            + tx_cache.sweep_expired()
            + balance_cache.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "swept expired cache entries");
        }
    }
}

/// Drains write batches over pooled sessions and writes accepted records
/// through to the caches.
struct BatchSubmitter {
    pool: ConnectionPool<Box<dyn Transport>>,
    block_cache: Arc<TimedCache<String, BlockInfo>>,
    tx_cache: Arc<TimedCache<String, TransactionInfo>>,
    callbacks: Arc<CallbackRegistry>,
    ledger: Arc<RecoveryLedger>,
    deadline: Duration,
}

#[async_trait::async_trait]
impl BatchProcessor<ChainRecord> for BatchSubmitter {
    async fn process(&self, batch: Vec<ChainRecord>) -> std::result::Result<(), ResilienceError> {
        let mut session = self.pool.acquire(self.deadline).await?;
        for record in batch {
            match record {
                ChainRecord::Block(block) => match session.submit_block(&block).await {
                    Ok(true) => {
                        self.block_cache.insert(block.hash.clone(), block.clone());
                        self.callbacks.notify_block(&block.hash, &block);
                    }
                    Ok(false) => {
                        tracing::warn!(hash = %block.hash, "daemon rejected block");
                        self.callbacks
                            .notify_error(&format!("daemon rejected block {}", block.hash));
                    }
                    Err(e) => {
                        session.mark_failure();
                        return Err(ResilienceError::Transport(e.to_string()));
                    }
                },
                ChainRecord::Transaction(tx) => match session.submit_transaction(&tx).await {
                    Ok(true) => {
                        self.tx_cache.insert(tx.txid.clone(), tx.clone());
                        self.callbacks.notify_transaction(&tx.txid, &tx);
                    }
                    Ok(false) => {
                        tracing::warn!(txid = %tx.txid, "daemon rejected transaction");
                        self.callbacks
                            .notify_error(&format!("daemon rejected transaction {}", tx.txid));
                    }
                    Err(e) => {
                        session.mark_failure();
                        return Err(ResilienceError::Transport(e.to_string()));
                    }
                },
            }
        }
        Ok(())
    }

    async fn on_batch_dropped(&self, batch: Vec<ChainRecord>, error: &ResilienceError) {
        let ids: Vec<&str> = batch.iter().map(|r| r.id()).collect();
        tracing::error!(
            dropped = batch.len(),
            %error,
            "dropping write batch after exhausting retries"
        );
        let operation_id = self.ledger.next_operation_id(OperationKind::Submit);
        self.ledger.record_terminal(
            RecoveryOperation::new(operation_id, OperationKind::Submit, error.to_string())
                .with_context("records", &ids.join(",")),
        );
        self.callbacks.notify_error(&format!(
            "dropped batch of {} records after retries: {}",
            batch.len(),
            error
        ));
    }
}

// ----------------------------------------------------------------------
// Input validation
// ----------------------------------------------------------------------

fn validate_hex_id(label: &str, value: &str) -> Result<()> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ClientError::Validation(format!(
            "{} must be 64 hex characters, got {:?}",
            label, value
        )))
    }
}

fn validate_address(address: &str) -> Result<()> {
    let ok = (26..=64).contains(&address.len())
        && address.chars().all(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(ClientError::Validation(format!(
            "address is not well-formed: {:?}",
            address
        )))
    }
}

fn validate_block(block: &BlockInfo) -> Result<()> {
    validate_hex_id("block hash", &block.hash)?;
    if !block.previous_hash.is_empty() {
        validate_hex_id("previous block hash", &block.previous_hash)?;
    }
    Ok(())
}

fn validate_transaction(tx: &TransactionInfo) -> Result<()> {
    validate_hex_id("transaction id", &tx.txid)?;
    validate_address(&tx.from_address)?;
    validate_address(&tx.to_address)?;
    if tx.amount == 0 {
        return Err(ClientError::Validation(
            "transaction amount must be positive".to_string(),
        ));
    }
    Ok(())
}
