//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::duration::{parse_duration, WindowSpec};
use super::key::{KeySpec, QuotaKey, DEFAULT_PREFIX, KEY_SEPARATOR};
use super::locks::KeyLocks;
use super::policy::FailurePolicy;
use super::record::{AdmissionResult, QuotaRecord};
use crate::clock::{self, Clock};
use crate::error::{Result, TurnstileError};
use crate::storage::{MemoryStorage, StorageAdapter, StorageError};

/// Options for building a [`RateLimiter`].
pub struct RateLimiterOptions<C = ()> {
    key: KeySpec<C>,
    max: u32,
    window: WindowSpec,
    storage: Option<Arc<dyn StorageAdapter>>,
    prefix: Option<String>,
    clock: Option<Arc<dyn Clock>>,
}

impl<C> RateLimiterOptions<C> {
    /// Allow `max` actions per `window` for each key produced by `key`.
    pub fn new(key: impl Into<KeySpec<C>>, max: u32, window: impl Into<WindowSpec>) -> Self {
        Self {
            key: key.into(),
            max,
            window: window.into(),
            storage: None,
            prefix: None,
            clock: None,
        }
    }

    /// Keep quota state in `storage` instead of a private in-memory store.
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Namespace for this limiter's keys inside the store.
    ///
    /// Must be non-empty and free of [`KEY_SEPARATOR`], so that no two
    /// prefixes can produce the same stored key.
    ///
    /// Limiters sharing a store need distinct prefixes. Two limiters with the
    /// same prefix over the same store serialize their updates independently
    /// and may together admit more than either quota allows.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Time source for window arithmetic.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// Fixed-window rate limiter.
///
/// Each resolved key gets `max` admissions per window. The first admission
/// opens the window; once it closes the next admission opens a fresh one
/// with the full quota. Rejected checks never consume quota.
///
/// The limiter holds no quota state itself. Checks for the same key are
/// serialized so concurrent callers cannot both observe the same count.
pub struct RateLimiter<C = ()> {
    key: KeySpec<C>,
    max: u32,
    window_ms: u64,
    prefix: String,
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl<C> RateLimiter<C> {
    /// Build a limiter, validating its options.
    pub fn new(options: RateLimiterOptions<C>) -> Result<Self> {
        options.key.validate().map_err(TurnstileError::config)?;

        if options.max == 0 {
            return Err(TurnstileError::config("max must be a positive integer"));
        }

        let window_ms = parse_duration(options.window.clone()).map_err(|e| {
            TurnstileError::InvalidConfig {
                reason: format!("invalid window {}", options.window),
                source: Some(e),
            }
        })?;

        let prefix = options.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if prefix.is_empty() {
            return Err(TurnstileError::config("prefix must not be empty"));
        }
        if prefix.contains(KEY_SEPARATOR) {
            return Err(TurnstileError::config(format!(
                "prefix {:?} must not contain {:?}",
                prefix, KEY_SEPARATOR
            )));
        }

        let clock = options.clock.unwrap_or_else(clock::system);
        let storage = options
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::with_clock(Arc::clone(&clock))));

        debug!(
            prefix = %prefix,
            key = ?options.key,
            max = options.max,
            window_ms,
            "Created rate limiter"
        );

        Ok(Self {
            key: options.key,
            max: options.max,
            window_ms,
            prefix,
            storage,
            clock,
            locks: KeyLocks::new(),
        })
    }

    /// The configured quota.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Namespace of this limiter's keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decide whether the actor behind `ctx` may act now, consuming one unit
    /// of quota if so.
    pub async fn check(&self, ctx: &C) -> Result<AdmissionResult> {
        let key = self.quota_key(ctx)?;
        let storage_key = key.to_storage_key();

        let _guard = self.locks.lock(&storage_key).await;
        let now = self.clock.now_ms();

        let result = match self.load(&storage_key).await? {
            Some(record) if !record.is_expired(now) => {
                if record.count < self.max {
                    let next = record.incremented();
                    let ttl = Duration::from_millis(next.remaining_ms(now));
                    self.store(&storage_key, &next, ttl).await?;
                    AdmissionResult::allowed(self.max, self.max - next.count, next.expires_at)
                } else {
                    AdmissionResult::denied(self.max, record.remaining_ms(now), record.expires_at)
                }
            }
            _ => {
                let next = QuotaRecord::open(now, self.window_ms);
                self.store(&storage_key, &next, self.window()).await?;
                AdmissionResult::allowed(self.max, self.max - 1, next.expires_at)
            }
        };

        if result.allowed {
            debug!(
                key = %key,
                remaining = result.remaining,
                "Admitted"
            );
        } else {
            debug!(
                key = %key,
                retry_after_ms = result.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Like [`check`](Self::check), failing with
    /// [`TurnstileError::Timeout`] if it does not finish within `timeout`.
    pub async fn check_within(&self, ctx: &C, timeout: Duration) -> Result<AdmissionResult> {
        tokio::time::timeout(timeout, self.check(ctx))
            .await
            .map_err(|_| TurnstileError::Timeout(timeout))?
    }

    /// Check within `timeout`, resolving storage failures and timeouts with
    /// `policy`. Fail-closed rejections ask the caller to retry after one
    /// window.
    pub async fn check_with_policy(
        &self,
        ctx: &C,
        timeout: Duration,
        policy: FailurePolicy,
    ) -> Result<AdmissionResult> {
        let outcome = self.check_within(ctx, timeout).await;
        policy.apply(outcome, self.max, self.window())
    }

    /// Report the actor's current standing without consuming quota.
    ///
    /// `remaining` is the quota left before any further action, and
    /// `allowed` says whether the next [`check`](Self::check) would admit.
    pub async fn peek(&self, ctx: &C) -> Result<AdmissionResult> {
        let key = self.quota_key(ctx)?;
        let now = self.clock.now_ms();

        let result = match self.load(&key.to_storage_key()).await? {
            Some(record) if !record.is_expired(now) && record.count < self.max => {
                AdmissionResult::allowed(self.max, self.max - record.count, record.expires_at)
            }
            Some(record) if !record.is_expired(now) => {
                AdmissionResult::denied(self.max, record.remaining_ms(now), record.expires_at)
            }
            _ => AdmissionResult::allowed(self.max, self.max, now.saturating_add(self.window_ms)),
        };

        trace!(key = %key, ?result, "Peeked");
        Ok(result)
    }

    /// Forget the actor's current window, restoring its full quota.
    pub async fn reset(&self, ctx: &C) -> Result<()> {
        let key = self.quota_key(ctx)?;
        let storage_key = key.to_storage_key();

        let _guard = self.locks.lock(&storage_key).await;
        self.storage.delete(&storage_key).await?;

        debug!(key = %key, "Reset quota");
        Ok(())
    }

    fn quota_key(&self, ctx: &C) -> Result<QuotaKey> {
        let key = self.key.resolve(ctx)?;
        Ok(QuotaKey::new(&self.prefix, &key))
    }

    async fn load(&self, storage_key: &str) -> Result<Option<QuotaRecord>> {
        let Some(raw) = self.storage.get(storage_key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).map_err(StorageError::from)?;
        trace!(key = storage_key, ?record, "Loaded quota record");
        Ok(Some(record))
    }

    async fn store(&self, storage_key: &str, record: &QuotaRecord, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(record).map_err(StorageError::from)?;
        self.storage.set(storage_key, raw, ttl).await?;
        trace!(key = storage_key, ?record, ?ttl, "Stored quota record");
        Ok(())
    }

    #[cfg(test)]
    fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

impl<C> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key", &self.key)
            .field("max", &self.max)
            .field("window_ms", &self.window_ms)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
