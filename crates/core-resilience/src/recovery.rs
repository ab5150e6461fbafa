//! Recovery ledger: failed-operation bookkeeping and bounded retry
//!
//! When an operation against the backend fails, the caller records it
//! here and may then drive recovery: a bounded sequence of retries with
//! exponentially growing, capped, jittered delays. An operation that
//! recovers is removed from the active set and logged to history as
//! resolved; one that exhausts its attempts is promoted to a terminal
//! history record and never retried again.
//!
//! Both the active set and the history are bounded, oldest-first, so the
//! ledger cannot grow without limit during a long outage.
//!
//! Retries for a given operation id are strictly sequential: a retry run
//! *claims* the operation out of the active set before sleeping, so a
//! second caller racing on the same id observes `UnknownOperation`
//! instead of starting a concurrent retry.

use super::error::ResilienceError;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// What kind of backend operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A read from the backend (block, transaction, balance).
    Fetch,
    /// A write to the backend (block or transaction submission).
    Submit,
    /// A chain synchronization step.
    Sync,
}

impl OperationKind {
    fn tag(&self) -> &'static str {
        match self {
            OperationKind::Fetch => "fetch",
            OperationKind::Submit => "submit",
            OperationKind::Sync => "sync",
        }
    }
}

/// A recorded failure eligible for recovery.
#[derive(Debug, Clone)]
pub struct RecoveryOperation {
    /// Ledger-unique id, see [`RecoveryLedger::next_operation_id`].
    pub operation_id: String,
    /// What failed.
    pub kind: OperationKind,
    /// When the failure was recorded.
    pub timestamp: SystemTime,
    /// Message of the most recent error.
    pub error_message: String,
    /// Retries performed so far.
    pub attempt_count: u32,
    /// Free-form context (e.g. the block hash being fetched).
    pub context: HashMap<String, String>,
}

impl RecoveryOperation {
    /// Convenience constructor for a fresh failure record.
    pub fn new(operation_id: String, kind: OperationKind, error_message: String) -> Self {
        Self {
            operation_id,
            kind,
            timestamp: SystemTime::now(),
            error_message,
            attempt_count: 0,
            context: HashMap::new(),
        }
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

/// How a recovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A retry succeeded.
    Resolved,
    /// All attempts failed; the operation is terminal.
    Exhausted,
    /// The overall recovery deadline expired mid-run.
    TimedOut,
}

/// A completed recovery run, kept in bounded history.
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    /// The operation as of its final attempt.
    pub operation: RecoveryOperation,
    /// Terminal state of the run.
    pub outcome: RecoveryOutcome,
    /// When the run completed.
    pub completed_at: SystemTime,
}

/// Configuration for retry pacing and ledger bounds.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum retry attempts per operation.
    pub max_attempts: u32,
    /// Base delay before the first retry; doubles per attempt.
    pub retry_delay: Duration,
    /// Cap on the per-attempt delay.
    pub max_backoff: Duration,
    /// Overall deadline for one recovery run.
    pub recovery_timeout: Duration,
    /// Bound on the active set and on history, oldest evicted first.
    pub max_queue_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            max_queue_size: 1000,
        }
    }
}

struct LedgerState {
    /// Active operations by id, with insertion order kept for eviction.
    active: HashMap<String, RecoveryOperation>,
    order: VecDeque<String>,
    history: VecDeque<RecoveryRecord>,
}

/// Ledger of failed operations and driver of their recovery.
pub struct RecoveryLedger {
    config: RecoveryConfig,
    state: Mutex<LedgerState>,
    in_flight: AtomicUsize,
    next_id: AtomicU64,
}

impl RecoveryLedger {
    /// Create an empty ledger.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState {
                active: HashMap::new(),
                order: VecDeque::new(),
                history: VecDeque::new(),
            }),
            in_flight: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    /// Mint a ledger-unique operation id such as `fetch-17`.
    pub fn next_operation_id(&self, kind: OperationKind) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", kind.tag(), n)
    }

    /// Record a failure, inserting a new active operation or updating an
    /// existing one in place. The oldest active operation is evicted when
    /// the bound is exceeded.
    pub fn record_failure(&self, op: RecoveryOperation) {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        let id = op.operation_id.clone();
        if state.active.insert(id.clone(), op).is_none() {
            state.order.push_back(id);
        }
        while state.active.len() > self.config.max_queue_size {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.active.remove(&oldest);
                    tracing::debug!(operation_id = %oldest, "evicting oldest recovery operation");
                }
                None => break,
            }
        }
    }

    /// Drive recovery for one active operation.
    ///
    /// The operation is claimed out of the active set first; an unknown or
    /// already-claimed id yields `UnknownOperation`. Each attempt sleeps
    /// `retry_delay * 2^attempt_count` (capped, with a little jitter),
    /// increments the attempt count, then invokes `retry_fn`. Success
    /// resolves the operation and returns the retry function's value.
    /// Exhausting `max_attempts` promotes the operation to a terminal
    /// history record and returns `RecoveryExhausted`; the run as a whole
    /// is bounded by `recovery_timeout`.
    pub async fn attempt_recovery<T, F, Fut>(
        &self,
        operation_id: &str,
        mut retry_fn: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let mut op = {
            let mut state = self.state.lock().expect("ledger lock poisoned");
            match state.active.remove(operation_id) {
                Some(op) => {
                    state.order.retain(|id| id != operation_id);
                    op
                }
                None => {
                    return Err(ResilienceError::UnknownOperation(operation_id.to_string()))
                }
            }
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.run_retries(&mut op, &mut retry_fn).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            RunResult::Recovered(value) => {
                tracing::info!(
                    operation_id = %op.operation_id,
                    attempts = op.attempt_count,
                    "operation recovered"
                );
                self.push_history(op, RecoveryOutcome::Resolved);
                Ok(value)
            }
            RunResult::Exhausted => {
                tracing::warn!(
                    operation_id = %op.operation_id,
                    attempts = op.attempt_count,
                    last_error = %op.error_message,
                    "recovery exhausted"
                );
                let attempts = op.attempt_count;
                self.push_history(op, RecoveryOutcome::Exhausted);
                Err(ResilienceError::RecoveryExhausted { attempts })
            }
            RunResult::TimedOut => {
                tracing::warn!(
                    operation_id = %op.operation_id,
                    attempts = op.attempt_count,
                    "recovery deadline expired"
                );
                self.push_history(op, RecoveryOutcome::TimedOut);
                Err(ResilienceError::Timeout(self.config.recovery_timeout))
            }
        }
    }

    async fn run_retries<T, F, Fut>(&self, op: &mut RecoveryOperation, retry_fn: &mut F) -> RunResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let deadline = Instant::now() + self.config.recovery_timeout;
        while op.attempt_count < self.config.max_attempts {
            let delay = backoff_delay(
                self.config.retry_delay,
                self.config.max_backoff,
                op.attempt_count,
            );
            let now = Instant::now();
            if now >= deadline {
                return RunResult::TimedOut;
            }
            // The sleep itself never overshoots the overall deadline.
            tokio::time::sleep(delay.min(deadline - now)).await;
            if Instant::now() >= deadline {
                return RunResult::TimedOut;
            }

            op.attempt_count += 1;
            tracing::debug!(
                operation_id = %op.operation_id,
                attempt = op.attempt_count,
                "retrying failed operation"
            );
            match retry_fn().await {
                Ok(value) => return RunResult::Recovered(value),
                Err(e) => {
                    op.error_message = e.to_string();
                }
            }
        }
        RunResult::Exhausted
    }

    fn push_history(&self, operation: RecoveryOperation, outcome: RecoveryOutcome) {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.history.push_back(RecoveryRecord {
            operation,
            outcome,
            completed_at: SystemTime::now(),
        });
        while state.history.len() > self.config.max_queue_size {
            state.history.pop_front();
        }
    }

    /// Record an already-terminal failure straight into history, without
    /// it ever entering the active set. Used for failures whose retry
    /// budget was spent elsewhere (e.g. a dropped batch).
    pub fn record_terminal(&self, op: RecoveryOperation) {
        self.push_history(op, RecoveryOutcome::Exhausted);
    }

    /// Whether any recovery run is currently executing.
    pub fn is_recovery_in_progress(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Snapshot of completed recovery runs, oldest first. Never a live
    /// reference, so iteration is safe against concurrent writes.
    pub fn history(&self) -> Vec<RecoveryRecord> {
        let state = self.state.lock().expect("ledger lock poisoned");
        state.history.iter().cloned().collect()
    }

    /// Snapshot of the active (not yet recovered) operations.
    pub fn active_operations(&self) -> Vec<RecoveryOperation> {
        let state = self.state.lock().expect("ledger lock poisoned");
        state.order.iter().filter_map(|id| state.active.get(id).cloned()).collect()
    }

    /// Discard all history records.
    pub fn clear_history(&self) {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.history.clear();
    }

    /// Snapshot of ledger occupancy.
    pub fn stats(&self) -> RecoveryStats {
        let state = self.state.lock().expect("ledger lock poisoned");
        RecoveryStats {
            active: state.active.len(),
            history: state.history.len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

enum RunResult<T> {
    Recovered(T),
    Exhausted,
    TimedOut,
}

/// Exponential backoff with a cap and up to 10% jitter.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    let delay = base.saturating_mul(factor).min(cap);
    let jitter_range = delay.as_millis() as u64 / 10;
    if jitter_range == 0 {
        return delay;
    }
    let jitter = rand::rng().random_range(0..jitter_range);
    delay + Duration::from_millis(jitter)
}

/// Ledger occupancy counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Operations awaiting recovery.
    pub active: usize,
    /// Completed recovery records retained.
    pub history: usize,
    /// Recovery runs currently executing.
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            recovery_timeout: Duration::from_secs(5),
            max_queue_size: 100,
        }
    }

    fn failure(ledger: &RecoveryLedger, kind: OperationKind) -> String {
        let id = ledger.next_operation_id(kind);
        ledger.record_failure(RecoveryOperation::new(
            id.clone(),
            kind,
            "connection refused".into(),
        ));
        id
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let ledger = RecoveryLedger::new(fast_config());
        let id = failure(&ledger, OperationKind::Fetch);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = ledger
            .attempt_recovery(&id, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ResilienceError::Transport("still down".into())) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::RecoveryExhausted { attempts: 3 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let history = ledger.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RecoveryOutcome::Exhausted);
        assert_eq!(history[0].operation.attempt_count, 3);
        assert_eq!(history[0].operation.error_message, "transport error: still down");
        assert_eq!(ledger.stats().active, 0);
    }

    #[tokio::test]
    async fn test_recovery_succeeds_mid_run() {
        let ledger = RecoveryLedger::new(fast_config());
        let id = failure(&ledger, OperationKind::Submit);
        let calls = Arc::new(AtomicU32::new(0));

        let result = ledger
            .attempt_recovery(&id, || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(ResilienceError::Transport("flaky".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let history = ledger.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RecoveryOutcome::Resolved);
        assert_eq!(history[0].operation.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let ledger = RecoveryLedger::new(fast_config());
        let result: Result<(), _> = ledger
            .attempt_recovery("fetch-999", || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ResilienceError::UnknownOperation(_))));
    }

    #[tokio::test]
    async fn test_claim_makes_retries_sequential() {
        let ledger = Arc::new(RecoveryLedger::new(RecoveryConfig {
            retry_delay: Duration::from_millis(50),
            ..fast_config()
        }));
        let id = failure(&ledger, OperationKind::Fetch);

        let slow = {
            let ledger = Arc::clone(&ledger);
            let id = id.clone();
            tokio::spawn(async move {
                ledger
                    .attempt_recovery(&id, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(1u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ledger.is_recovery_in_progress());

        // The operation is claimed; a second run on the same id is refused.
        let second: Result<u32, _> = ledger.attempt_recovery(&id, || async { Ok(2u32) }).await;
        assert!(matches!(second, Err(ResilienceError::UnknownOperation(_))));

        assert_eq!(slow.await.unwrap().unwrap(), 1);
        assert!(!ledger.is_recovery_in_progress());
    }

    #[tokio::test]
    async fn test_active_set_bounded() {
        let ledger = RecoveryLedger::new(RecoveryConfig {
            max_queue_size: 2,
            ..fast_config()
        });
        let first = failure(&ledger, OperationKind::Fetch);
        failure(&ledger, OperationKind::Fetch);
        failure(&ledger, OperationKind::Fetch);

        assert_eq!(ledger.stats().active, 2);
        // The oldest was evicted and can no longer be recovered.
        let result: Result<(), _> = ledger.attempt_recovery(&first, || async { Ok(()) }).await;
        assert!(matches!(result, Err(ResilienceError::UnknownOperation(_))));
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let ledger = RecoveryLedger::new(RecoveryConfig {
            max_queue_size: 2,
            max_attempts: 1,
            ..fast_config()
        });
        for _ in 0..3 {
            let id = failure(&ledger, OperationKind::Sync);
            let _: Result<(), _> = ledger
                .attempt_recovery(&id, || async {
                    Err(ResilienceError::Transport("down".into()))
                })
                .await;
        }
        assert_eq!(ledger.history().len(), 2);
    }

    #[tokio::test]
    async fn test_overall_deadline() {
        let ledger = RecoveryLedger::new(RecoveryConfig {
            max_attempts: 50,
            retry_delay: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            recovery_timeout: Duration::from_millis(60),
            max_queue_size: 10,
        });
        let id = failure(&ledger, OperationKind::Fetch);

        let start = Instant::now();
        let result: Result<(), _> = ledger
            .attempt_recovery(&id, || async {
                Err(ResilienceError::Transport("down".into()))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_millis(500));
        let history = ledger.history();
        assert_eq!(history[0].outcome, RecoveryOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_record_failure_updates_in_place() {
        let ledger = RecoveryLedger::new(fast_config());
        let id = ledger.next_operation_id(OperationKind::Fetch);
        ledger.record_failure(RecoveryOperation::new(
            id.clone(),
            OperationKind::Fetch,
            "first".into(),
        ));
        ledger.record_failure(RecoveryOperation::new(
            id.clone(),
            OperationKind::Fetch,
            "second".into(),
        ));

        let active = ledger.active_operations();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].error_message, "second");
    }

    #[tokio::test]
    async fn test_clear_history() {
        let ledger = RecoveryLedger::new(RecoveryConfig {
            max_attempts: 1,
            ..fast_config()
        });
        let id = failure(&ledger, OperationKind::Fetch);
        let _: Result<(), _> = ledger
            .attempt_recovery(&id, || async {
                Err(ResilienceError::Transport("down".into()))
            })
            .await;
        assert_eq!(ledger.history().len(), 1);

        ledger.clear_history();
        assert!(ledger.history().is_empty());
    }

    #[tokio::test]
    async fn test_context_preserved_into_history() {
        let ledger = RecoveryLedger::new(RecoveryConfig {
            max_attempts: 1,
            ..fast_config()
        });
        let id = ledger.next_operation_id(OperationKind::Fetch);
        ledger.record_failure(
            RecoveryOperation::new(id.clone(), OperationKind::Fetch, "down".into())
                .with_context("block_hash", "00ff"),
        );
        let _: Result<(), _> = ledger
            .attempt_recovery(&id, || async {
                Err(ResilienceError::Transport("down".into()))
            })
            .await;

        let history = ledger.history();
        assert_eq!(
            history[0].operation.context.get("block_hash").map(String::as_str),
            Some("00ff")
        );
    }

    #[tokio::test]
    async fn test_record_terminal_goes_straight_to_history() {
        let ledger = RecoveryLedger::new(fast_config());
        let id = ledger.next_operation_id(OperationKind::Submit);
        ledger.record_terminal(RecoveryOperation::new(
            id.clone(),
            OperationKind::Submit,
            "batch dropped".into(),
        ));

        assert_eq!(ledger.stats().active, 0);
        let history = ledger.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RecoveryOutcome::Exhausted);
        // Never active, so it cannot be claimed for retry.
        let result: Result<(), _> = ledger.attempt_recovery(&id, || async { Ok(()) }).await;
        assert!(matches!(result, Err(ResilienceError::UnknownOperation(_))));
    }

    #[test]
    fn test_operation_id_format() {
        let ledger = RecoveryLedger::new(fast_config());
        assert_eq!(ledger.next_operation_id(OperationKind::Fetch), "fetch-1");
        assert_eq!(ledger.next_operation_id(OperationKind::Submit), "submit-2");
        assert_eq!(ledger.next_operation_id(OperationKind::Sync), "sync-3");
    }

    #[test]
    fn test_backoff_delay_growth() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(10);
        // Jitter adds at most 10%, so growth is still strictly visible.
        assert!(backoff_delay(base, cap, 0) >= base);
        assert!(backoff_delay(base, cap, 1) >= base * 2);
        assert!(backoff_delay(base, cap, 2) >= base * 4);
        assert!(backoff_delay(base, cap, 10) <= cap + cap / 10);
    }
}
