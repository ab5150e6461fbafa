/*!
 * Callback registry for client events
 *
 * Registrations append under a lock; notification snapshots the current
 * list under the lock and invokes the callbacks after releasing it, so a
 * callback that calls back into the client cannot deadlock against the
 * registry. Callbacks run synchronously on whichever task completed the
 * triggering operation and should not block.
 */

use crate::types::{BlockInfo, TransactionInfo};
use std::sync::{Arc, RwLock};

/// Invoked after a block lands in the cache.
pub type BlockCallback = Arc<dyn Fn(&str, &BlockInfo) + Send + Sync>;
/// Invoked after a transaction lands in the cache.
pub type TransactionCallback = Arc<dyn Fn(&str, &TransactionInfo) + Send + Sync>;
/// Invoked on every terminal failure.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked as long-running operations advance, with a percentage.
pub type ProgressCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Holds registered callbacks for the client.
#[derive(Default)]
pub struct CallbackRegistry {
    block: RwLock<Vec<BlockCallback>>,
    transaction: RwLock<Vec<TransactionCallback>>,
    error: RwLock<Vec<ErrorCallback>>,
    progress: RwLock<Vec<ProgressCallback>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block update callback.
    pub fn on_block_update(&self, callback: BlockCallback) {
        self.block.write().expect("callback lock poisoned").push(callback);
    }

    /// Register a transaction update callback.
    pub fn on_transaction_update(&self, callback: TransactionCallback) {
        self.transaction
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    /// Register an error callback.
    pub fn on_error(&self, callback: ErrorCallback) {
        self.error.write().expect("callback lock poisoned").push(callback);
    }

    /// Register a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.progress
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    pub(crate) fn notify_block(&self, hash: &str, block: &BlockInfo) {
        let snapshot: Vec<BlockCallback> = self
            .block
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in snapshot {
            callback(hash, block);
        }
    }

    pub(crate) fn notify_transaction(&self, txid: &str, tx: &TransactionInfo) {
        let snapshot: Vec<TransactionCallback> = self
            .transaction
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in snapshot {
            callback(txid, tx);
        }
    }

    pub(crate) fn notify_error(&self, message: &str) {
        let snapshot: Vec<ErrorCallback> =
            self.error.read().expect("callback lock poisoned").clone();
        for callback in snapshot {
            callback(message);
        }
    }

    pub(crate) fn notify_progress(&self, id: &str, percent: u8) {
        let snapshot: Vec<ProgressCallback> = self
            .progress
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in snapshot {
            callback(id, percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn block(hash: &str) -> BlockInfo {
        BlockInfo {
            hash: hash.to_string(),
            previous_hash: String::new(),
            height: 1,
            timestamp: 0,
            difficulty: 0,
            transactions: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_block_callbacks_fire_in_registration_order() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            registry.on_block_update(Arc::new(move |hash, _| {
                seen.lock().unwrap().push(format!("{}:{}", tag, hash));
            }));
        }

        registry.notify_block("00ff", &block("00ff"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:00ff".to_string(), "second:00ff".to_string()]
        );
    }

    #[test]
    fn test_error_and_progress_callbacks() {
        let registry = CallbackRegistry::new();
        let errors = Arc::new(AtomicU32::new(0));
        let last_percent = Arc::new(AtomicU32::new(0));

        {
            let errors = Arc::clone(&errors);
            registry.on_error(Arc::new(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let last_percent = Arc::clone(&last_percent);
            registry.on_progress(Arc::new(move |_, percent| {
                last_percent.store(percent as u32, Ordering::SeqCst);
            }));
        }

        registry.notify_error("backend down");
        registry.notify_progress("sync-1", 40);

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(last_percent.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn test_callback_may_register_more_callbacks() {
        // The registry must not hold its lock while invoking, so a
        // callback that re-enters the registry completes without
        // deadlocking.
        let registry = Arc::new(CallbackRegistry::new());
        let reentered = Arc::new(AtomicU32::new(0));

        {
            let registry2 = Arc::clone(&registry);
            let reentered = Arc::clone(&reentered);
            registry.on_error(Arc::new(move |_| {
                let reentered = Arc::clone(&reentered);
                registry2.on_error(Arc::new(move |_| {
                    reentered.fetch_add(1, Ordering::SeqCst);
                }));
            }));
        }

        registry.notify_error("first");
        registry.notify_error("second");
        assert_eq!(reentered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_callbacks_is_fine() {
        let registry = CallbackRegistry::new();
        registry.notify_block("00", &block("00"));
        registry.notify_error("nothing listens");
    }
}
