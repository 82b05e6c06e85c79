//! Storage adapters for quota state.
//!
//! The limiter only ever talks to [`StorageAdapter`]. Two implementations
//! ship with the crate: [`MemoryStorage`] for process-local state and
//! [`FileStorage`] for state that has to survive restarts.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod file;
mod memory;

pub use file::{FileStorage, DEFAULT_NAMESPACE};
pub use memory::MemoryStorage;

/// Errors raised by storage adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing medium failed
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Writing would exceed the adapter's capacity
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded {
        /// Bytes the write would occupy
        needed: usize,
        /// Configured capacity in bytes
        quota: usize,
    },

    /// The backend cannot serve requests right now
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Key/value store with per-entry expiry.
///
/// Implementations must treat an entry as absent once its TTL has elapsed,
/// without the caller having to clean up. A `set` replaces both the value and
/// the TTL. Operations on different keys must not affect each other.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub(crate) fn expiry(now_ms: u64, ttl: Duration) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_add(ttl_ms)
}
