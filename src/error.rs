//! Error types for Turnstile.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::{DurationError, KeyResolutionError};
use crate::storage::StorageError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Limiter options were rejected at construction time
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the options
        reason: String,
        /// The window parse failure, when that was the cause
        #[source]
        source: Option<DurationError>,
    },

    /// A window specification could not be parsed
    #[error("Invalid duration: {0}")]
    InvalidDuration(#[from] DurationError),

    /// The key resolver failed for this call
    #[error("Key resolution failed: {0}")]
    KeyResolution(#[from] KeyResolutionError),

    /// The storage adapter failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A caller-imposed deadline elapsed before the check completed
    #[error("Admission check timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
            source: None,
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
