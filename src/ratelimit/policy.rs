//! What to do when an admission check cannot be completed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::AdmissionResult;
use crate::error::{Result, TurnstileError};

/// Decision applied when storage fails or a check times out.
///
/// Only storage failures and timeouts are mapped. Key resolution and
/// configuration errors are always returned, since no safe decision exists
/// for an actor that cannot be identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the action through
    Open,
    /// Reject the action
    #[default]
    Closed,
}

impl FailurePolicy {
    /// Map a failed check to a decision.
    ///
    /// `retry_after` is reported on fail-closed rejections.
    pub fn apply(
        &self,
        outcome: Result<AdmissionResult>,
        limit: u32,
        retry_after: Duration,
    ) -> Result<AdmissionResult> {
        let err = match outcome {
            Ok(result) => return Ok(result),
            Err(err @ (TurnstileError::Storage(_) | TurnstileError::Timeout(_))) => err,
            Err(err) => return Err(err),
        };

        warn!(error = %err, policy = ?self, "Admission check failed, applying failure policy");

        Ok(match self {
            FailurePolicy::Open => AdmissionResult::allowed(limit, 0, 0),
            FailurePolicy::Closed => {
                let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                AdmissionResult::denied(limit, retry_after_ms, 0)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::KeyResolutionError;
    use crate::storage::StorageError;

    fn storage_failure() -> Result<AdmissionResult> {
        Err(StorageError::Unavailable("down".to_string()).into())
    }

    #[test]
    fn test_success_passes_through() {
        let ok = AdmissionResult::allowed(10, 9, 100);
        let result = FailurePolicy::Closed.apply(Ok(ok), 10, Duration::from_secs(1));
        assert_eq!(result.unwrap(), ok);
    }

    #[test]
    fn test_fail_open() {
        let result = FailurePolicy::Open
            .apply(storage_failure(), 10, Duration::from_secs(1))
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.retry_after_ms, 0);
    }

    #[test]
    fn test_fail_closed() {
        let result = FailurePolicy::Closed
            .apply(
                Err(TurnstileError::Timeout(Duration::from_millis(5))),
                10,
                Duration::from_secs(2),
            )
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_ms, 2_000);
    }

    #[test]
    fn test_key_resolution_error_is_not_mapped() {
        let outcome = Err(KeyResolutionError::new("no key").into());
        let result = FailurePolicy::Open.apply(outcome, 10, Duration::from_secs(1));
        assert!(matches!(result, Err(TurnstileError::KeyResolution(_))));
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: FailurePolicy = serde_yaml::from_str("open").unwrap();
        assert_eq!(policy, FailurePolicy::Open);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Closed);
    }
}
