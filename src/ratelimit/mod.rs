//! Rate limiting logic.

mod duration;
mod key;
mod limiter;
mod locks;
mod policy;
mod record;

pub use duration::{parse_duration, DurationError, WindowSpec, WindowUnit};
pub use key::{
    FnResolver, KeyResolutionError, KeyResolver, KeySpec, QuotaKey, TryFnResolver, DEFAULT_PREFIX,
    KEY_SEPARATOR,
};
pub use limiter::{RateLimiter, RateLimiterOptions};
pub use policy::FailurePolicy;
pub use record::{AdmissionResult, QuotaRecord};
