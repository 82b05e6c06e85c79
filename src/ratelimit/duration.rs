//! Window duration parsing.
//!
//! A window is written either as a positive number of milliseconds or as a
//! positive integer followed by a unit suffix (`10s`, `15m`, `1h`, `1d`).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unit suffix accepted in a textual window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowUnit {
    /// `s`
    Second,
    /// `m`
    Minute,
    /// `h`
    Hour,
    /// `d`
    Day,
}

impl WindowUnit {
    /// Length of one unit in milliseconds.
    pub fn millis(&self) -> u64 {
        match self {
            WindowUnit::Second => 1_000,
            WindowUnit::Minute => 60_000,
            WindowUnit::Hour => 3_600_000,
            WindowUnit::Day => 86_400_000,
        }
    }

    /// Look up a unit by its suffix character.
    pub fn from_suffix(suffix: char) -> Option<Self> {
        match suffix {
            's' => Some(WindowUnit::Second),
            'm' => Some(WindowUnit::Minute),
            'h' => Some(WindowUnit::Hour),
            'd' => Some(WindowUnit::Day),
            _ => None,
        }
    }

    /// The suffix character for this unit.
    pub fn suffix(&self) -> char {
        match self {
            WindowUnit::Second => 's',
            WindowUnit::Minute => 'm',
            WindowUnit::Hour => 'h',
            WindowUnit::Day => 'd',
        }
    }
}

/// Errors produced while parsing a window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    /// Numeric window that is zero or negative
    #[error("duration must be positive, got {0}")]
    NonPositive(i64),

    /// Text that is not `<digits><unit>`
    #[error("malformed duration {0:?}, expected <positive integer><s|m|h|d>")]
    Malformed(String),

    /// Text whose suffix is not one of `s`, `m`, `h`, `d`
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit {
        /// The full input
        input: String,
        /// The offending suffix
        unit: char,
    },

    /// Value does not fit in 64-bit milliseconds
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

/// A window as written by the caller, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    /// Milliseconds
    Millis(i64),
    /// Human-readable form such as `"15m"`
    Text(String),
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpec::Millis(ms) => write!(f, "{}ms", ms),
            WindowSpec::Text(text) => write!(f, "{}", text),
        }
    }
}

impl From<&str> for WindowSpec {
    fn from(text: &str) -> Self {
        WindowSpec::Text(text.to_string())
    }
}

impl From<String> for WindowSpec {
    fn from(text: String) -> Self {
        WindowSpec::Text(text)
    }
}

impl From<i64> for WindowSpec {
    fn from(ms: i64) -> Self {
        WindowSpec::Millis(ms)
    }
}

impl From<i32> for WindowSpec {
    fn from(ms: i32) -> Self {
        WindowSpec::Millis(ms as i64)
    }
}

impl From<u32> for WindowSpec {
    fn from(ms: u32) -> Self {
        WindowSpec::Millis(ms as i64)
    }
}

impl From<u64> for WindowSpec {
    fn from(ms: u64) -> Self {
        WindowSpec::Millis(i64::try_from(ms).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for WindowSpec {
    fn from(duration: Duration) -> Self {
        WindowSpec::Millis(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Normalize a window into milliseconds.
///
/// ```
/// use turnstile::ratelimit::parse_duration;
///
/// assert_eq!(parse_duration("15m").unwrap(), 900_000);
/// assert_eq!(parse_duration(5_000i64).unwrap(), 5_000);
/// assert!(parse_duration("bogus").is_err());
/// ```
pub fn parse_duration(input: impl Into<WindowSpec>) -> Result<u64, DurationError> {
    match input.into() {
        WindowSpec::Millis(ms) if ms > 0 => Ok(ms as u64),
        WindowSpec::Millis(ms) => Err(DurationError::NonPositive(ms)),
        WindowSpec::Text(text) => parse_text(&text),
    }
}

fn parse_text(text: &str) -> Result<u64, DurationError> {
    let malformed = || DurationError::Malformed(text.to_string());

    let suffix = text.chars().last().ok_or_else(malformed)?;
    let digits = &text[..text.len() - suffix.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let unit = match WindowUnit::from_suffix(suffix) {
        Some(unit) => unit,
        None if suffix.is_ascii_digit() => return Err(malformed()),
        None => {
            return Err(DurationError::UnknownUnit {
                input: text.to_string(),
                unit: suffix,
            })
        }
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| DurationError::Overflow(text.to_string()))?;
    if amount == 0 {
        return Err(DurationError::NonPositive(0));
    }

    amount
        .checked_mul(unit.millis())
        .ok_or_else(|| DurationError::Overflow(text.to_string()))
}
