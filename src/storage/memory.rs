//! Process-local storage backed by DashMap.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{expiry, StorageAdapter, StorageError};
use crate::clock::{self, Clock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: u64,
}

/// In-memory storage with lazy expiry.
///
/// Expired entries are dropped when read. [`MemoryStorage::spawn_sweeper`]
/// can additionally purge them in the background to bound memory for keys
/// that are never read again.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty store using the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Purge expired entries every `every` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let storage: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                let purged = storage.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = storage.len(), "Swept expired entries");
                }
            }
        })
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = self.clock.now_ms();

        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }

        // Only drop the entry if it is still the expired one we saw
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        trace!(key, "Dropped expired entry on read");
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let expires_at = expiry(self.clock.now_ms(), ttl);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn storage() -> (MemoryStorage, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (MemoryStorage::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (storage, _) = storage();

        storage.set("k", "v".to_string(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let (storage, clock) = storage();

        storage.set("k", "v".to_string(), Duration::from_millis(100)).await.unwrap();
        clock.advance(Duration::from_millis(99));
        assert!(storage.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_millis(1));
        assert_eq!(storage.get("k").await.unwrap(), None);
        // Lazy expiry removed it
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_set_replaces_value_and_ttl() {
        let (storage, clock) = storage();

        storage.set("k", "old".to_string(), Duration::from_millis(10)).await.unwrap();
        storage.set("k", "new".to_string(), Duration::from_millis(500)).await.unwrap();
        clock.advance(Duration::from_millis(100));

        assert_eq!(storage.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, _) = storage();

        storage.set("k", "v".to_string(), Duration::from_secs(1)).await.unwrap();
        storage.delete("k").await.unwrap();
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (storage, _) = storage();

        storage.set("a", "1".to_string(), Duration::from_secs(1)).await.unwrap();
        storage.set("b", "2".to_string(), Duration::from_secs(1)).await.unwrap();
        storage.delete("a").await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), None);
        assert_eq!(storage.get("b").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_immediately_absent() {
        let (storage, _) = storage();

        storage.set("k", "v".to_string(), Duration::ZERO).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (storage, clock) = storage();

        storage.set("short", "1".to_string(), Duration::from_millis(10)).await.unwrap();
        storage.set("long", "2".to_string(), Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_millis(50));

        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_and_stops_on_drop() {
        let clock = ManualClock::new(0);
        let storage = Arc::new(MemoryStorage::with_clock(Arc::new(clock.clone())));

        storage.set("k", "v".to_string(), Duration::from_millis(10)).await.unwrap();
        let handle = storage.spawn_sweeper(Duration::from_secs(1));

        clock.advance(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(storage.is_empty());

        drop(storage);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
