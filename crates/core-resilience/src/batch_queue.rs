//! Bounded batch queue with a background drain task
//!
//! Producers enqueue individual items and never block: when the queue is
//! at capacity, `enqueue` fails fast with `QueueFull` so the caller sees
//! backpressure instead of unbounded buffering. A background task drains
//! the queue in FIFO batches, triggered by whichever comes first: the
//! batch size being reached, or the oldest queued item aging past the
//! batch timeout.
//!
//! A batch whose processor fails is retried whole, in the same order, up
//! to the configured retry count. After that the batch is dropped and
//! handed to [`BatchProcessor::on_batch_dropped`] so no data disappears
//! without notification.
//!
//! Shutdown stops the drain task and flushes whatever is still queued
//! through one final processor call.

use super::error::ResilienceError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Base delay between retries of a failed batch; doubles per attempt.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Configuration for batching behavior.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items handed to the processor in one batch.
    pub max_batch_size: usize,
    /// Oldest-item age that forces a drain of a partial batch.
    pub batch_timeout: Duration,
    /// Times a failed batch is retried before being dropped.
    pub max_retries: u32,
    /// Queue capacity; enqueues beyond this fail fast.
    pub max_queue_length: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            batch_timeout: Duration::from_millis(100),
            max_retries: 3,
            max_queue_length: 10_000,
        }
    }
}

/// Consumer seam invoked by the drain task.
#[async_trait::async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync {
    /// Handle one batch. An error causes the whole batch to be retried in
    /// the same order.
    async fn process(&self, batch: Vec<T>) -> Result<(), ResilienceError>;

    /// Called once when a batch has exhausted its retries and is being
    /// dropped.
    async fn on_batch_dropped(&self, batch: Vec<T>, error: &ResilienceError) {
        tracing::error!(
            dropped = batch.len(),
            %error,
            "batch dropped after exhausting retries"
        );
    }
}

struct QueueItem<T> {
    payload: T,
    enqueued_at: Instant,
}

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    stopping: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    drained: AtomicU64,
    dropped: AtomicU64,
}

/// A bounded producer/consumer queue drained in batches by a background
/// task.
pub struct BatchQueue<T> {
    config: Arc<BatchConfig>,
    state: Arc<Mutex<QueueState<T>>>,
    notify: Arc<Notify>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl<T: Clone + Send + 'static> BatchQueue<T> {
    /// Create the queue and start its drain task.
    pub fn start(config: BatchConfig, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(Mutex::new(QueueState {
            items: VecDeque::new(),
            stopping: false,
        }));
        let notify = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(drain_loop(
            Arc::clone(&config),
            Arc::clone(&state),
            Arc::clone(&notify),
            stop_rx,
            processor,
            Arc::clone(&counters),
        ));

        Self {
            config,
            state,
            notify,
            stop,
            handle: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Add an item to the queue.
    ///
    /// Fails immediately with `QueueFull` at capacity and with `Shutdown`
    /// once [`BatchQueue::shutdown`] has begun. Never blocks.
    pub fn enqueue(&self, payload: T) -> Result<(), ResilienceError> {
        let wake = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.stopping {
                return Err(ResilienceError::Shutdown);
            }
            if state.items.len() >= self.config.max_queue_length {
                return Err(ResilienceError::QueueFull {
                    len: state.items.len(),
                    limit: self.config.max_queue_length,
                });
            }
            state.items.push_back(QueueItem {
                payload,
                enqueued_at: Instant::now(),
            });
            // Wake the drain task when the timer needs arming (first item)
            // or a full batch is ready.
            state.items.len() == 1 || state.items.len() >= self.config.max_batch_size
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if wake {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            queued: self.len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the drain task, flushing any queued items through one final
    /// processor call, and wait for it to finish.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.stopping = true;
        }
        let _ = self.stop.send(true);
        self.notify.notify_one();

        let handle = self.handle.lock().expect("queue lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "batch drain task panicked");
            }
        }
    }
}

enum Next<T> {
    Process(Vec<T>),
    WaitUntil(Instant),
    WaitForItems,
}

async fn drain_loop<T: Clone + Send + 'static>(
    config: Arc<BatchConfig>,
    state: Arc<Mutex<QueueState<T>>>,
    notify: Arc<Notify>,
    mut stop_rx: watch::Receiver<bool>,
    processor: Arc<dyn BatchProcessor<T>>,
    counters: Arc<Counters>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        let next = {
            let mut st = state.lock().expect("queue lock poisoned");
            if st.items.len() >= config.max_batch_size {
                Next::Process(take_batch(&mut st.items, config.max_batch_size))
            } else {
                match st.items.front() {
                    Some(oldest) => {
                        let due = oldest.enqueued_at + config.batch_timeout;
                        if Instant::now() >= due {
                            Next::Process(take_batch(&mut st.items, config.max_batch_size))
                        } else {
                            Next::WaitUntil(due)
                        }
                    }
                    None => Next::WaitForItems,
                }
            }
        };

        match next {
            Next::Process(batch) => {
                process_with_retries(&*processor, &config, &counters, batch).await;
            }
            Next::WaitUntil(due) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep_until(due.into()) => {}
                    _ = stop_rx.changed() => {}
                }
            }
            Next::WaitForItems => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }
    }

    // Final flush: everything still queued goes out as one batch.
    let remaining = {
        let mut st = state.lock().expect("queue lock poisoned");
        let len = st.items.len();
        take_batch(&mut st.items, len)
    };
    if !remaining.is_empty() {
        tracing::debug!(items = remaining.len(), "flushing batch queue on shutdown");
        process_with_retries(&*processor, &config, &counters, remaining).await;
    }
}

fn take_batch<T>(items: &mut VecDeque<QueueItem<T>>, limit: usize) -> Vec<T> {
    let n = items.len().min(limit);
    items.drain(..n).map(|item| item.payload).collect()
}

async fn process_with_retries<T: Clone + Send + 'static>(
    processor: &dyn BatchProcessor<T>,
    config: &BatchConfig,
    counters: &Counters,
    batch: Vec<T>,
) {
    let size = batch.len() as u64;
    let mut attempt = 0u32;
    let mut backoff = RETRY_BACKOFF_BASE;
    loop {
        match processor.process(batch.clone()).await {
            Ok(()) => {
                counters.drained.fetch_add(size, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    counters.dropped.fetch_add(size, Ordering::Relaxed);
                    processor.on_batch_dropped(batch, &e).await;
                    return;
                }
                tracing::warn!(attempt, error = %e, "batch processing failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
            }
        }
    }
}

/// Queue throughput counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStats {
    /// Items currently queued.
    pub queued: usize,
    /// Items ever accepted.
    pub enqueued: u64,
    /// Items successfully processed.
    pub drained: u64,
    /// Items dropped after retry exhaustion.
    pub dropped: u64,
}
