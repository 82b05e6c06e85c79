//! Wall-clock sources.
//!
//! Quota records and stored envelopes carry absolute timestamps (milliseconds
//! since the Unix epoch) so that persisted state stays meaningful across
//! restarts. Everything that needs "now" goes through [`Clock`], which lets
//! tests drive time with [`ManualClock`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Pre-epoch system time clamps to zero
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock whose time only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// limiter and its storage and advance the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Create a manual clock starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(by.as_millis() as u64);
    }

    /// Set the clock to an absolute time. May move backwards.
    pub fn set(&self, now_ms: u64) {
        *self.now.lock() = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now.lock()
    }
}

pub(crate) fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock::new())
}
