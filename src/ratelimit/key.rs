//! Key resolution: turning a per-call context into the identity a quota is
//! tracked against.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Namespace applied to stored keys when a limiter is not given one.
pub const DEFAULT_PREFIX: &str = "turnstile";

/// Joins a limiter's prefix to a resolved key. Prefixes may not contain it.
pub const KEY_SEPARATOR: char = ':';

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The key resolver could not produce a key for this call.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct KeyResolutionError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl KeyResolutionError {
    /// Create an error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an error wrapping the resolver's own failure.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Capability that derives a quota key from a call context.
pub trait KeyResolver<C>: Send + Sync {
    /// Resolve the key for this call.
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError>;
}

/// Resolver wrapping an infallible closure.
pub struct FnResolver<F>(F);

impl<C, F> KeyResolver<C> for FnResolver<F>
where
    F: Fn(&C) -> String + Send + Sync,
{
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        Ok((self.0)(ctx))
    }
}

/// Resolver wrapping a fallible closure.
pub struct TryFnResolver<F>(F);

impl<C, F, E> KeyResolver<C> for TryFnResolver<F>
where
    F: Fn(&C) -> Result<String, E> + Send + Sync,
    E: Into<BoxError>,
{
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        (self.0)(ctx).map_err(|e| KeyResolutionError::with_source("key function failed", e))
    }
}

/// How a limiter names the actor behind each call.
pub enum KeySpec<C> {
    /// One key for every call; the context is ignored
    Static(String),
    /// Key computed per call
    Dynamic(Arc<dyn KeyResolver<C>>),
}

impl<C: 'static> KeySpec<C> {
    /// A fixed key.
    pub fn fixed(key: impl Into<String>) -> Self {
        KeySpec::Static(key.into())
    }

    /// A key computed by a resolver object.
    pub fn resolver(resolver: impl KeyResolver<C> + 'static) -> Self {
        KeySpec::Dynamic(Arc::new(resolver))
    }

    /// A key computed by an infallible closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        Self::resolver(FnResolver(f))
    }

    /// A key computed by a closure that may fail.
    pub fn try_from_fn<F, E>(f: F) -> Self
    where
        F: Fn(&C) -> Result<String, E> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::resolver(TryFnResolver(f))
    }
}

impl<C> KeySpec<C> {
    /// Resolve the key for one call. An empty key counts as a failure.
    pub fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        let key = match self {
            KeySpec::Static(key) => key.clone(),
            KeySpec::Dynamic(resolver) => resolver.resolve(ctx)?,
        };

        if key.is_empty() {
            return Err(KeyResolutionError::new("resolved key is empty"));
        }
        Ok(key)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            KeySpec::Static(key) if key.is_empty() => Err("static key must not be empty".to_string()),
            _ => Ok(()),
        }
    }
}

impl<C> Clone for KeySpec<C> {
    fn clone(&self) -> Self {
        match self {
            KeySpec::Static(key) => KeySpec::Static(key.clone()),
            KeySpec::Dynamic(resolver) => KeySpec::Dynamic(Arc::clone(resolver)),
        }
    }
}

impl<C> fmt::Debug for KeySpec<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Static(key) => f.debug_tuple("Static").field(key).finish(),
            KeySpec::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl<C> From<&str> for KeySpec<C> {
    fn from(key: &str) -> Self {
        KeySpec::Static(key.to_string())
    }
}

impl<C> From<String> for KeySpec<C> {
    fn from(key: String) -> Self {
        KeySpec::Static(key)
    }
}

/// A resolved key placed inside a limiter's namespace.
///
/// This is the key actually handed to the storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    /// Namespace of the owning limiter
    pub prefix: String,
    /// Key produced by the resolver
    pub key: String,
}

impl QuotaKey {
    /// Create a namespaced key.
    pub fn new(prefix: &str, key: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
        }
    }

    /// Convert to the storage key string.
    pub fn to_storage_key(&self) -> String {
        format!("{}{}{}", self.prefix, KEY_SEPARATOR, self.key)
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
