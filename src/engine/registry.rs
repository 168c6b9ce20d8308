//! Correlation registry for in-flight stage requests.
//!
//! Maps a stage key to a pending one-shot continuation. At most one
//! registration may exist per key, and each continuation is settled exactly
//! once. Settlements with no registered waiter are orphans: the engine may
//! emit late or duplicate notifications after a caller gave up, so an
//! unmatched outcome is counted and dropped, never fatal.

use crate::engine::protocol::{OutputBlob, StageKey};
use crate::error::PipelineError;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Terminal outcome of one stage request: the output blob, or the engine's
/// error message text.
pub type StageOutcome = Result<OutputBlob, String>;

/// What happened to a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// A waiter was registered for the key and received the outcome.
    Delivered,
    /// No waiter (or a waiter that already went away); outcome dropped.
    Orphaned,
}

pub struct CorrelationRegistry {
    pending: Mutex<HashMap<StageKey, oneshot::Sender<StageOutcome>>>,
    orphaned: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            orphaned: AtomicU64::new(0),
        }
    }

    /// Create and store the pending continuation for `key`.
    ///
    /// Strict stage sequencing means a duplicate key is a programming
    /// invariant violation, rejected loudly rather than silently replacing
    /// the previous waiter.
    pub fn register(
        &self,
        key: StageKey,
    ) -> Result<oneshot::Receiver<StageOutcome>, PipelineError> {
        let mut pending = self.pending.lock().unwrap();
        match pending.entry(key) {
            Entry::Occupied(entry) => Err(PipelineError::DuplicateKey(entry.key().clone())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Look up, remove, and settle the continuation for `key`.
    ///
    /// The check-and-remove is atomic per key, so a result and an error
    /// racing for the same request can never both deliver.
    pub fn settle(&self, key: &StageKey, outcome: StageOutcome) -> Settlement {
        let waiter = self.pending.lock().unwrap().remove(key);
        match waiter {
            Some(tx) => {
                if tx.send(outcome).is_ok() {
                    Settlement::Delivered
                } else {
                    // waiter dropped its receiver before settlement
                    self.orphaned.fetch_add(1, Ordering::Relaxed);
                    Settlement::Orphaned
                }
            }
            None => {
                self.orphaned.fetch_add(1, Ordering::Relaxed);
                Settlement::Orphaned
            }
        }
    }

    /// Settle every pending continuation with the same failure message.
    /// Used when the engine connection is lost as a whole; a request that
    /// would otherwise dangle forever is rejected instead.
    pub fn fail_all(&self, message: &str) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_key, tx) in drained {
            if tx.send(Err(message.to_string())).is_err() {
                self.orphaned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn orphaned_count(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
