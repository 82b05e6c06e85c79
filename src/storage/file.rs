//! Durable storage backed by a JSON file.
//!
//! Intended for a single client (a CLI, a desktop agent, a test harness)
//! that needs its quota state to survive restarts. The whole document is
//! rewritten on every mutation, so it suits small key counts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use super::{expiry, StorageAdapter, StorageError};
use crate::clock::{self, Clock};

/// Namespace applied to keys when none is configured.
pub const DEFAULT_NAMESPACE: &str = "turnstile";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    value: String,
    expires_at: u64,
}

/// File-backed storage adapter.
///
/// Each mutation serializes the next state, writes it to a temporary file
/// and renames it over the target before the in-memory view is updated. A
/// failed write therefore leaves both the file and the view unchanged.
///
/// Once a write has been handed to the blocking pool it runs to completion
/// even if the calling future is dropped, so disk and memory never diverge.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    namespace: String,
    quota: Option<usize>,
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, Envelope>>>,
}

/// Temporary file removed on drop unless it has been renamed into place.
struct TempFile {
    path: PathBuf,
    renamed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.renamed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl FileStorage {
    /// Open the store at `path`, loading any existing state.
    ///
    /// A missing file starts an empty store; its parent directory is created
    /// if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries: HashMap<String, Envelope> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened file storage");

        Ok(Self {
            path,
            namespace: DEFAULT_NAMESPACE.to_string(),
            quota: None,
            clock: clock::system(),
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    /// Store keys under `namespace` instead of the default.
    ///
    /// Stores sharing a file need namespaces that do not contain `:`, or
    /// their keys can overlap.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Refuse writes that would make the file larger than `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Use the given clock for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn encode(&self, next: &HashMap<String, Envelope>) -> Result<Vec<u8>, StorageError> {
        let bytes = serde_json::to_vec(next)?;
        if let Some(quota) = self.quota {
            if bytes.len() > quota {
                warn!(
                    path = %self.path.display(),
                    needed = bytes.len(),
                    quota,
                    "File storage quota exceeded"
                );
                return Err(StorageError::QuotaExceeded {
                    needed: bytes.len(),
                    quota,
                });
            }
        }
        Ok(bytes)
    }

    /// Write `next` to disk and then make it the in-memory view.
    ///
    /// `entries` stays locked until the commit finishes, including when the
    /// caller stops waiting for it.
    async fn commit(
        &self,
        mut entries: OwnedMutexGuard<HashMap<String, Envelope>>,
        next: HashMap<String, Envelope>,
    ) -> Result<(), StorageError> {
        let bytes = self.encode(&next)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            write_atomically(&path, &bytes)?;
            *entries = next;
            trace!(path = %path.display(), bytes = bytes.len(), "Persisted file storage");
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("file write task failed: {}", e)))?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let mut tmp = TempFile {
        path: path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4())),
        renamed: false,
    };

    std::fs::write(&tmp.path, bytes)?;
    std::fs::rename(&tmp.path, path)?;
    tmp.renamed = true;
    Ok(())
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().await;

        Ok(entries
            .get(&self.namespaced(key))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError> {
        let entries = Arc::clone(&self.entries).lock_owned().await;
        let now = self.clock.now_ms();

        let mut next = entries.clone();
        next.retain(|_, entry| entry.expires_at > now);
        next.insert(
            self.namespaced(key),
            Envelope {
                value,
                expires_at: expiry(now, ttl),
            },
        );

        self.commit(entries, next).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = self.namespaced(key);
        let entries = Arc::clone(&self.entries).lock_owned().await;
        if !entries.contains_key(&key) {
            return Ok(());
        }

        let mut next = entries.clone();
        next.remove(&key);

        self.commit(entries, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn open_at(path: &Path, clock: &ManualClock) -> FileStorage {
        FileStorage::open(path)
            .await
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(5_000);
        let storage = open_at(&dir.path().join("quota.json"), &clock).await;

        storage.set("k", "v".to_string(), Duration::from_millis(100)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));

        clock.advance(Duration::from_millis(100));
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quota.json");
        let clock = ManualClock::new(5_000);

        {
            let storage = open_at(&path, &clock).await;
            storage.set("k", "v".to_string(), Duration::from_secs(60)).await.unwrap();
        }

        let reopened = open_at(&path, &clock).await;
        assert_eq!(reopened.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_keys_are_namespaced_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);

        let storage = open_at(&path, &clock).await.with_namespace("app");
        storage.set("k", "v".to_string(), Duration::from_secs(1)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"app:k\""));

        let other = open_at(&path, &clock).await.with_namespace("other");
        assert_eq!(other.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);

        let storage = open_at(&path, &clock).await.with_quota(64);
        storage.set("a", "1".to_string(), Duration::from_secs(1)).await.unwrap();

        let err = storage
            .set("b", "x".repeat(128), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 64, .. }));

        assert_eq!(storage.get("b").await.unwrap(), None);
        assert_eq!(storage.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileStorage::open(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);

        let storage = open_at(&path, &clock).await;
        storage.set("k", "v".to_string(), Duration::from_secs(60)).await.unwrap();
        storage.delete("k").await.unwrap();
        storage.delete("k").await.unwrap();

        let reopened = open_at(&path, &clock).await;
        assert_eq!(reopened.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_pruned_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);

        let storage = open_at(&path, &clock).await;
        storage.set("old", "1".to_string(), Duration::from_millis(10)).await.unwrap();
        clock.advance(Duration::from_millis(20));
        storage.set("new", "2".to_string(), Duration::from_secs(1)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("turnstile:old"));
        assert!(raw.contains("turnstile:new"));
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);

        let storage = open_at(&path, &clock).await;
        // A directory at the target makes the rename fail after the write
        std::fs::create_dir(&path).unwrap();

        let err = storage
            .set("k", "v".to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(storage.get("k").await.unwrap(), None);
        assert_eq!(dir_entries(dir.path()), vec!["quota.json".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_write_still_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = ManualClock::new(0);
        let storage = open_at(&path, &clock).await;

        {
            let mut write = storage.set("k", "v".to_string(), Duration::from_secs(60));
            let _ = futures::poll!(&mut write);
        }

        // The next operation waits for the abandoned write to finish
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(dir_entries(dir.path()), vec!["quota.json".to_string()]);

        let reopened = open_at(&path, &clock).await;
        assert_eq!(reopened.get("k").await.unwrap(), Some("v".to_string()));
    }
}
