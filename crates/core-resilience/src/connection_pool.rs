//! Bounded pool of backend connections
//!
//! Connections are created through a [`ConnectionFactory`] and handed out
//! as RAII [`PoolGuard`]s, so a connection returns to the pool on every
//! exit path, including early returns through `?`. A semaphore caps the
//! number of concurrently checked-out connections; acquisition waits for
//! a release only up to the caller's deadline and then fails with
//! `PoolExhausted` rather than blocking forever.
//!
//! A connection that keeps failing is not reused immediately: each failure
//! puts it on an exponentially growing cooldown, and once its consecutive
//! failure count passes the configured bound it is closed and replaced
//! instead of being handed out again.
//!
//! The pool does not run its own timers. The owner drives
//! [`ConnectionPool::reap_idle`] and [`ConnectionPool::ensure_min`] from a
//! periodic maintenance task.

use super::error::ResilienceError;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Configuration for pool behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections the pool keeps alive even when idle.
    pub min_connections: usize,
    /// Hard cap on concurrently existing connections.
    pub max_connections: usize,
    /// Default deadline for acquiring a connection.
    pub connection_timeout: Duration,
    /// Idle connections older than this are reaped, down to the minimum.
    pub idle_timeout: Duration,
    /// Consecutive failures after which a connection is closed and
    /// replaced; also bounds the cooldown escalation.
    pub max_retries: u32,
    /// Base cooldown applied after a connection's first failure; doubles
    /// per consecutive failure up to `max_retries` escalations.
    pub failure_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 10,
            max_connections: 100,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            failure_backoff: Duration::from_millis(250),
        }
    }
}

impl PoolConfig {
    /// Cooldown before a connection with `failures` consecutive failures
    /// may be handed out again.
    fn cooldown_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let escalation = failures.min(self.max_retries).saturating_sub(1);
        self.failure_backoff.saturating_mul(1u32 << escalation.min(16))
    }
}

/// Factory seam for creating and validating connections.
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Open a new connection.
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check whether a pooled connection is still usable.
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup).
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

struct PooledConnection<T> {
    id: u64,
    conn: T,
    last_used: Instant,
    consecutive_failures: u32,
    cooldown_until: Instant,
}

struct PoolState<T> {
    idle: Vec<PooledConnection<T>>,
    active: usize,
    next_id: u64,
    closed: bool,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.idle.len() + self.active
    }
}

struct Shared<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    semaphore: Semaphore,
}

/// A bounded connection pool with failure cooldowns and idle reaping.
pub struct ConnectionPool<T> {
    shared: Arc<Shared<T>>,
    factory: Arc<dyn ConnectionFactory<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a pool around a connection factory.
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let max = config.max_connections;
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active: 0,
                    next_id: 0,
                    closed: false,
                }),
                semaphore: Semaphore::new(max),
            }),
            factory,
        }
    }

    /// Acquire a connection, waiting at most `deadline` for one to free up.
    ///
    /// An idle connection is reused when one is available and not cooling
    /// down after failures; otherwise a new connection is created while
    /// the pool is below its cap. When the pool is saturated the call
    /// waits for a release until the deadline and then fails with
    /// `PoolExhausted`.
    pub async fn acquire(&self, deadline: Duration) -> Result<PoolGuard<T>, ResilienceError> {
        let permit = tokio::time::timeout(deadline, self.shared.semaphore.acquire())
            .await
            .map_err(|_| ResilienceError::PoolExhausted(deadline))?
            .map_err(|_| ResilienceError::Shutdown)?;
        // The guard's Drop hands the permit back.
        permit.forget();

        loop {
            let (candidate, stale) = {
                let mut state = self.shared.state.lock().expect("pool lock poisoned");
                if state.closed {
                    drop(state);
                    self.shared.semaphore.add_permits(1);
                    return Err(ResilienceError::Shutdown);
                }
                let stale = take_stale_idle(&mut state.idle, self.shared.config.idle_timeout);
                let now = Instant::now();
                let usable = state.idle.iter().position(|c| now >= c.cooldown_until);
                let candidate = usable.map(|i| state.idle.swap_remove(i));
                if candidate.is_some() {
                    state.active += 1;
                }
                (candidate, stale)
            };
            for conn in stale {
                self.factory.close(conn.conn).await;
            }

            let mut pooled = match candidate {
                Some(pooled) => pooled,
                None => break,
            };
            if self.factory.is_healthy(&pooled.conn).await {
                pooled.last_used = Instant::now();
                tracing::trace!(conn_id = pooled.id, "reusing pooled connection");
                return Ok(PoolGuard {
                    shared: Arc::clone(&self.shared),
                    pooled: Some(pooled),
                    failed: false,
                });
            }
            tracing::debug!(conn_id = pooled.id, "closing unhealthy pooled connection");
            {
                let mut state = self.shared.state.lock().expect("pool lock poisoned");
                state.active -= 1;
            }
            self.factory.close(pooled.conn).await;
        }

        // Nothing reusable; create a fresh connection. The permit already
        // reserves a slot under max_connections.
        let id = {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.active += 1;
            state.next_id += 1;
            state.next_id
        };
        match self.factory.create().await {
            Ok(conn) => {
                tracing::debug!(conn_id = id, "opened new pooled connection");
                Ok(PoolGuard {
                    shared: Arc::clone(&self.shared),
                    pooled: Some(PooledConnection {
                        id,
                        conn,
                        last_used: Instant::now(),
                        consecutive_failures: 0,
                        cooldown_until: Instant::now(),
                    }),
                    failed: false,
                })
            }
            Err(e) => {
                let mut state = self.shared.state.lock().expect("pool lock poisoned");
                state.active -= 1;
                drop(state);
                self.shared.semaphore.add_permits(1);
                Err(e)
            }
        }
    }

    /// Close idle connections older than the idle timeout, never dropping
    /// the pool below its minimum size.
    pub async fn reap_idle(&self) {
        let to_close = {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            let min = self.shared.config.min_connections;
            let timeout = self.shared.config.idle_timeout;
            let mut keep = Vec::with_capacity(state.idle.len());
            let mut reap = Vec::new();
            let mut total = state.total();
            for conn in state.idle.drain(..) {
                if total > min && conn.last_used.elapsed() > timeout {
                    total -= 1;
                    reap.push(conn);
                } else {
                    keep.push(conn);
                }
            }
            state.idle = keep;
            reap
        };
        for conn in to_close {
            tracing::debug!(conn_id = conn.id, "reaping idle connection");
            self.factory.close(conn.conn).await;
        }
    }

    /// Open connections until the pool holds at least its configured
    /// minimum, without exceeding the maximum.
    pub async fn ensure_min(&self) -> Result<(), ResilienceError> {
        loop {
            {
                let state = self.shared.state.lock().expect("pool lock poisoned");
                if state.closed
                    || state.total() >= self.shared.config.min_connections
                    || state.total() >= self.shared.config.max_connections
                {
                    return Ok(());
                }
            }
            let conn = self.factory.create().await?;
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.next_id += 1;
            let id = state.next_id;
            state.idle.push(PooledConnection {
                id,
                conn,
                last_used: Instant::now(),
                consecutive_failures: 0,
                cooldown_until: Instant::now(),
            });
        }
    }

    /// Shut the pool down: refuse new acquisitions and close all idle
    /// connections. Checked-out connections are closed as their guards
    /// drop.
    pub async fn close(&self) {
        self.shared.semaphore.close();
        let idle = {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        for conn in idle {
            self.factory.close(conn.conn).await;
        }
    }

    /// Snapshot of pool occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().expect("pool lock poisoned");
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            total: state.total(),
            max_size: self.shared.config.max_connections,
        }
    }
}

fn take_stale_idle<T>(
    idle: &mut Vec<PooledConnection<T>>,
    timeout: Duration,
) -> Vec<PooledConnection<T>> {
    let mut stale = Vec::new();
    let mut i = 0;
    while i < idle.len() {
        if idle[i].last_used.elapsed() > timeout {
            stale.push(idle.swap_remove(i));
        } else {
            i += 1;
        }
    }
    stale
}

/// Scoped ownership of a pooled connection.
///
/// Dropping the guard returns the connection to the pool. A guard whose
/// connection failed should call [`PoolGuard::mark_failure`] first so the
/// pool can apply its cooldown and replacement policy.
pub struct PoolGuard<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    pooled: Option<PooledConnection<T>>,
    failed: bool,
}

impl<T: Send + 'static> PoolGuard<T> {
    /// Identifier of the held connection, stable across reuse.
    pub fn id(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.id).unwrap_or(0)
    }

    /// Record a failure on the held connection. The pool will keep it out
    /// of circulation for an exponentially growing cooldown and close it
    /// outright once its consecutive failures pass the configured bound.
    pub fn mark_failure(&mut self) {
        self.failed = true;
        if let Some(pooled) = &mut self.pooled {
            pooled.consecutive_failures += 1;
        }
    }
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.pooled.as_ref().expect("guard holds connection").conn
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.pooled.as_mut().expect("guard holds connection").conn
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock().expect("pool lock poisoned");
            state.active -= 1;
            let config = &self.shared.config;

            if state.closed {
                // Pool is shutting down; the connection drops here.
            } else if self.failed && pooled.consecutive_failures > config.max_retries {
                tracing::warn!(
                    conn_id = pooled.id,
                    failures = pooled.consecutive_failures,
                    "closing connection after repeated failures"
                );
            } else {
                let now = Instant::now();
                if self.failed {
                    pooled.cooldown_until = now + config.cooldown_after(pooled.consecutive_failures);
                } else {
                    pooled.consecutive_failures = 0;
                    pooled.cooldown_until = now;
                }
                pooled.last_used = now;
                state.idle.push(pooled);
            }
        }
        self.shared.semaphore.add_permits(1);
    }
}

/// Pool occupancy counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections sitting idle.
    pub idle: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Idle plus active.
    pub total: usize,
    /// Configured maximum.
    pub max_size: usize,
}

impl PoolStats {
    /// Pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestConnection {
        serial: usize,
    }

    struct TestFactory {
        created: AtomicUsize,
        healthy: AtomicBool,
        fail_create: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
                fail_create: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self) -> Result<TestConnection, ResilienceError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ResilienceError::Transport("dial failed".into()));
            }
            let serial = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestConnection { serial })
        }

        async fn is_healthy(&self, _conn: &TestConnection) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            connection_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(300),
            max_retries: 2,
            failure_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);

        drop(guard);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let factory = TestFactory::new();
        let pool: ConnectionPool<TestConnection> = ConnectionPool::new(Arc::clone(&factory) as _, small_config());

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first_serial = guard.serial;
        drop(guard);

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(guard.serial, first_serial);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let g1 = pool.acquire(Duration::ZERO).await;
        let g2 = pool.acquire(Duration::ZERO).await;
        let g3 = pool.acquire(Duration::ZERO).await;

        let successes = [g1.is_ok(), g2.is_ok(), g3.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(successes, 2);
        assert!(matches!(g3, Err(ResilienceError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let factory = TestFactory::new();
        let config = PoolConfig {
            max_connections: 1,
            min_connections: 0,
            ..small_config()
        };
        let pool = Arc::new(ConnectionPool::new(factory, config));

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_connection_cools_down() {
        let factory = TestFactory::new();
        let pool: ConnectionPool<TestConnection> = ConnectionPool::new(Arc::clone(&factory) as _, small_config());

        let mut guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let failed_serial = guard.serial;
        guard.mark_failure();
        drop(guard);

        // The failed connection is cooling down, so a fresh one is opened.
        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(guard.serial, failed_serial);
        drop(guard);

        // Once the cooldown lapses the connection circulates again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let serials = [a.serial, b.serial];
        assert!(serials.contains(&failed_serial));
    }

    #[tokio::test]
    async fn test_repeatedly_failing_connection_is_replaced() {
        let factory = TestFactory::new();
        let config = PoolConfig {
            max_retries: 1,
            failure_backoff: Duration::from_millis(1),
            ..small_config()
        };
        let pool = ConnectionPool::new(factory, config);

        let mut guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        guard.mark_failure();
        guard.mark_failure();
        drop(guard);

        // Two consecutive failures exceed max_retries = 1: closed, not pooled.
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_discarded() {
        let factory = TestFactory::new();
        let pool: ConnectionPool<TestConnection> = ConnectionPool::new(Arc::clone(&factory) as _, small_config());

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        drop(guard);
        factory.healthy.store(false, Ordering::SeqCst);

        let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        // The idle connection failed its health check and was replaced.
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        drop(guard);
    }

    #[tokio::test]
    async fn test_create_failure_releases_slot() {
        let factory = TestFactory::new();
        factory.fail_create.store(true, Ordering::SeqCst);
        let pool: ConnectionPool<TestConnection> = ConnectionPool::new(Arc::clone(&factory) as _, small_config());

        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ResilienceError::Transport(_))));

        // The failed creation did not leak the capacity slot.
        factory.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.acquire(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_min() {
        let factory = TestFactory::new();
        let config = PoolConfig {
            min_connections: 2,
            max_connections: 4,
            ..small_config()
        };
        let pool = ConnectionPool::new(factory, config);

        pool.ensure_min().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_reap_idle_respects_minimum() {
        let factory = TestFactory::new();
        let config = PoolConfig {
            min_connections: 1,
            max_connections: 4,
            idle_timeout: Duration::from_millis(10),
            ..small_config()
        };
        let pool = ConnectionPool::new(factory, config);

        let g1 = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let g2 = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let g3 = pool.acquire(Duration::from_secs(1)).await.unwrap();
        drop(g1);
        drop(g2);
        drop(g3);
        assert_eq!(pool.stats().idle, 3);

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.reap_idle().await;

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_acquire_after_close() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        pool.close().await;
        let result = pool.acquire(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ResilienceError::Shutdown)));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_stats_utilization() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let _guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.max_size, 2);
        assert!((stats.utilization() - 50.0).abs() < f64::EPSILON);
    }
}
