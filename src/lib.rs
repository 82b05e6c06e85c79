//! Turnstile - fixed-window request admission
//!
//! This crate decides whether an actor's next action fits within a quota of
//! `max` actions per window. Quota state lives behind a pluggable
//! [`StorageAdapter`](storage::StorageAdapter); an in-memory store and a
//! file-backed store ship with the crate.
//!
//! ```
//! use turnstile::ratelimit::{RateLimiter, RateLimiterOptions};
//!
//! # tokio_test::block_on(async {
//! let limiter: RateLimiter = RateLimiter::new(RateLimiterOptions::new("api", 2, "1m"))?;
//!
//! assert!(limiter.check(&()).await?.allowed);
//! assert!(limiter.check(&()).await?.allowed);
//! assert!(!limiter.check(&()).await?.allowed);
//! # Ok::<(), turnstile::error::TurnstileError>(())
//! # }).unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;
