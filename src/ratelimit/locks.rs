//! Per-key mutual exclusion for read-modify-write sequences.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of async locks, one per key currently in use.
///
/// Tasks locking the same key queue behind each other; tasks locking
/// different keys never contend beyond the map shard. An entry is removed
/// when its last user releases it.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held while a key's record is being read and rewritten.
pub(crate) struct KeyGuard<'a> {
    // Declared before `slot` so the mutex is released before the entry is
    // considered for removal.
    _guard: OwnedMutexGuard<()>,
    _slot: Slot<'a>,
}

/// One task's claim on a table entry, from the moment it starts waiting.
///
/// Dropping it removes the entry once nobody else holds or awaits it. This
/// also runs when a waiter is cancelled before acquiring the lock.
struct Slot<'a> {
    table: &'a KeyLocks,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let slot = Slot {
            table: self,
            key: key.to_string(),
            lock,
        };
        let guard = Arc::clone(&slot.lock).lock_owned().await;

        KeyGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Number of keys with a live lock entry.
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        // Two references left means the table and us: nobody is waiting
        self.table.locks.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}
