//! Configuration management for Turnstile.
//!
//! A configuration file names a set of limiters and the storage they share:
//!
//! ```yaml
//! storage:
//!   kind: file
//!   path: /var/lib/turnstile/quota.json
//! limiters:
//!   - name: login
//!     key: "login-{actor}"
//!     max: 5
//!     window: 15m
//!   - name: global
//!     key: global
//!     max: 100
//!     window: 60000
//!     failure_policy: open
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    FailurePolicy, KeySpec, RateLimiter, RateLimiterOptions, WindowSpec, KEY_SEPARATOR,
};
use crate::storage::{FileStorage, MemoryStorage, StorageAdapter};

/// Placeholder in a key template replaced by the actor of each call.
pub const ACTOR_PLACEHOLDER: &str = "{actor}";

/// Main configuration for a set of limiters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Storage shared by every limiter
    #[serde(default)]
    pub storage: StorageConfig,

    /// Limiter definitions
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local store
    Memory {
        /// How often to purge expired entries; `None` disables the sweeper
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: Option<u64>,
    },
    /// JSON file on disk
    File {
        /// Location of the file
        path: PathBuf,
        /// Key namespace inside the file
        #[serde(default)]
        namespace: Option<String>,
        /// Maximum file size in bytes
        #[serde(default)]
        quota_bytes: Option<usize>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> Option<u64> {
    Some(60)
}

/// One named limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Name, also used as the limiter's key prefix
    pub name: String,

    /// Key template; `{actor}` is replaced per call
    #[serde(default = "default_key_template")]
    pub key: String,

    /// Admissions per window
    pub max: u32,

    /// Window length, e.g. `15m` or `60000`
    pub window: WindowSpec,

    /// Decision taken when storage fails or times out
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Deadline for a single check in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_key_template() -> String {
    ACTOR_PLACEHOLDER.to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

impl LimiterConfig {
    /// Deadline for a single check.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Key spec for this limiter. Templates without `{actor}` are static.
    pub fn key_spec(&self) -> KeySpec<String> {
        if self.key.contains(ACTOR_PLACEHOLDER) {
            let template = self.key.clone();
            KeySpec::from_fn(move |actor: &String| template.replace(ACTOR_PLACEHOLDER, actor))
        } else {
            KeySpec::fixed(self.key.clone())
        }
    }

    /// Build the limiter over `storage`.
    pub fn build(&self, storage: Arc<dyn StorageAdapter>) -> Result<RateLimiter<String>> {
        RateLimiter::new(
            RateLimiterOptions::new(self.key_spec(), self.max, self.window.clone())
                .prefix(self.name.clone())
                .storage(storage),
        )
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that limiter names are present, unique and usable as prefixes.
    pub fn validate(&self) -> Result<()> {
        if let StorageConfig::File {
            namespace: Some(namespace),
            ..
        } = &self.storage
        {
            if namespace.is_empty() || namespace.contains(KEY_SEPARATOR) {
                return Err(TurnstileError::config(format!(
                    "file storage namespace {:?} must be non-empty and not contain {:?}",
                    namespace, KEY_SEPARATOR
                )));
            }
        }

        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            if limiter.name.is_empty() {
                return Err(TurnstileError::config("limiter name must not be empty"));
            }
            if limiter.name.contains(KEY_SEPARATOR) {
                return Err(TurnstileError::config(format!(
                    "limiter name {:?} must not contain {:?}",
                    limiter.name, KEY_SEPARATOR
                )));
            }
            if !seen.insert(limiter.name.as_str()) {
                return Err(TurnstileError::config(format!(
                    "duplicate limiter name {:?}",
                    limiter.name
                )));
            }
        }
        Ok(())
    }

    /// Open the configured storage backend.
    ///
    /// For memory storage with a sweep interval this spawns the sweeper, so
    /// it must run inside a tokio runtime.
    pub async fn open_storage(&self) -> Result<Arc<dyn StorageAdapter>> {
        match &self.storage {
            StorageConfig::Memory {
                sweep_interval_secs,
            } => {
                let storage = Arc::new(MemoryStorage::new());
                if let Some(secs) = sweep_interval_secs.filter(|secs| *secs > 0) {
                    storage.spawn_sweeper(Duration::from_secs(secs));
                }
                Ok(storage)
            }
            StorageConfig::File {
                path,
                namespace,
                quota_bytes,
            } => {
                let mut storage = FileStorage::open(path).await?;
                if let Some(namespace) = namespace {
                    storage = storage.with_namespace(namespace.clone());
                }
                if let Some(bytes) = quota_bytes {
                    storage = storage.with_quota(*bytes);
                }
                Ok(Arc::new(storage))
            }
        }
    }
}
