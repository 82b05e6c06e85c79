//! Quota records and admission results.

use serde::{Deserialize, Serialize};

/// Per-key state of one fixed window.
///
/// `expires_at` is always `window_start + window_ms`; a record whose
/// `expires_at` has passed describes a window that is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Admissions granted in this window
    pub count: u32,
    /// When the window opened (epoch ms)
    pub window_start: u64,
    /// When the window closes (epoch ms)
    pub expires_at: u64,
}

impl QuotaRecord {
    /// Open a new window at `now` holding one admission.
    pub fn open(now: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            window_start: now,
            expires_at: now.saturating_add(window_ms),
        }
    }

    /// Whether the window is over at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// The same window with one more admission.
    pub fn incremented(&self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            ..*self
        }
    }

    /// Time left in the window, clamped at zero.
    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    /// Whether the action may proceed
    pub allowed: bool,
    /// Further admissions possible in the current window
    pub remaining: u32,
    /// Milliseconds until the window resets; zero when allowed
    pub retry_after_ms: u64,
    /// The configured quota
    pub limit: u32,
    /// When the current window closes (epoch ms)
    pub reset_at_ms: u64,
}

impl AdmissionResult {
    pub(crate) fn allowed(limit: u32, remaining: u32, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
            limit,
            reset_at_ms,
        }
    }

    pub(crate) fn denied(limit: u32, retry_after_ms: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_ms,
            limit,
            reset_at_ms,
        }
    }

    /// Retry hint in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }

    /// Headers an HTTP adapter would attach to its response.
    ///
    /// `X-RateLimit-Reset` is the number of seconds until the window closes,
    /// measured from `now_ms`. `Retry-After` is only present on rejection.
    pub fn headers(&self, now_ms: u64) -> Vec<(&'static str, String)> {
        let reset_secs = self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000);
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", reset_secs.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_record() {
        let record = QuotaRecord::open(1_000, 500);
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, 1_000);
        assert_eq!(record.expires_at, 1_500);
        assert!(!record.is_expired(1_499));
        assert!(record.is_expired(1_500));
    }

    #[test]
    fn test_increment_keeps_window() {
        let record = QuotaRecord::open(0, 100).incremented().incremented();
        assert_eq!(record.count, 3);
        assert_eq!(record.window_start, 0);
        assert_eq!(record.expires_at, 100);
    }

    #[test]
    fn test_remaining_ms_clamps() {
        let record = QuotaRecord::open(1_000, 500);
        assert_eq!(record.remaining_ms(1_200), 300);
        assert_eq!(record.remaining_ms(9_000), 0);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        assert_eq!(AdmissionResult::denied(5, 1, 0).retry_after_secs(), 1);
        assert_eq!(AdmissionResult::denied(5, 1000, 0).retry_after_secs(), 1);
        assert_eq!(AdmissionResult::denied(5, 1001, 0).retry_after_secs(), 2);
        assert_eq!(AdmissionResult::allowed(5, 4, 0).retry_after_secs(), 0);
    }

    #[test]
    fn test_headers() {
        let allowed = AdmissionResult::allowed(50, 49, 61_000);
        assert_eq!(
            allowed.headers(1_000),
            vec![
                ("X-RateLimit-Limit", "50".to_string()),
                ("X-RateLimit-Remaining", "49".to_string()),
                ("X-RateLimit-Reset", "60".to_string()),
            ]
        );

        let denied = AdmissionResult::denied(50, 1_500, 2_500);
        let headers = denied.headers(1_000);
        assert_eq!(headers.last(), Some(&("Retry-After", "2".to_string())));
    }

    #[test]
    fn test_record_serializes_as_json() {
        let record = QuotaRecord::open(10, 20);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"count":1,"window_start":10,"expires_at":30}"#);
    }
}
