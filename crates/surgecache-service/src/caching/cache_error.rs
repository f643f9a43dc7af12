use thiserror::Error;

use super::CacheKey;

/// An error that happens somewhere in the caching layer.
///
/// This error is [`Clone`] so that the outcome of a single deduplicated computation can be handed
/// out to every waiter of that computation.
///
/// Only [`MalformedKey`](Self::MalformedKey) and [`GenerationFailed`](Self::GenerationFailed) are
/// ever returned to callers of the read path. The other variants are absorbed internally and only
/// degrade behavior, see the individual variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A cache key could not be built or parsed.
    ///
    /// This is a programmer error, for example an identifier containing the `:` separator, or a
    /// wrong number of identifiers for the resource type.
    #[error("malformed cache key: {0}")]
    MalformedKey(String),
    /// A resource type name that was never registered.
    ///
    /// This is a configuration error, and is surfaced when validating the TTL policy at startup.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
    /// A configured time-to-live that can not be used.
    ///
    /// Like [`UnknownResourceType`](Self::UnknownResourceType), this is surfaced at startup.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    /// The underlying key-value store could not be reached.
    ///
    /// The read path bypasses the cache when this happens and goes straight to the durable store
    /// and the generator.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    /// Neither the durable store nor the generator produced a value.
    ///
    /// This is handed verbatim to every waiter of the failed computation, and never cached.
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    /// Some of the keys of a bulk delete could not be deleted, even after a retry.
    #[error("failed to invalidate {} keys", failed.len())]
    InvalidationPartialFailure {
        /// The keys that are possibly still cached.
        failed: Vec<CacheKey>,
    },
}

impl CacheError {
    /// Returns `true` for errors that callers of the read path are supposed to see.
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::MalformedKey(_) | Self::GenerationFailed(_))
    }

    /// A short name of the error kind, used as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::MalformedKey(_) => "malformed_key",
            Self::UnknownResourceType(_) => "unknown_resource_type",
            Self::InvalidTtl(_) => "invalid_ttl",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::GenerationFailed(_) => "generation_failed",
            Self::InvalidationPartialFailure { .. } => "invalidation_partial_failure",
        }
    }
}

/// The result of any operation in the caching layer.
///
/// Contains either `Ok(T)` or the [`CacheError`] describing why no value could be produced.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
