use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{CacheEntry, CacheKey, KeyPrefix};

/// The approximate memory usage of a [`CacheStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes currently in use.
    pub used: u64,
    /// The configured upper bound.
    pub max: u64,
}

impl MemoryUsage {
    /// The used memory in percent of the maximum.
    ///
    /// A store without a limit always reports `0`.
    pub fn percent(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.max as f64
    }
}

/// The key-value primitive underlying the cache.
///
/// Every operation is atomic per key, there is no atomicity across keys. In particular, deleting
/// multiple keys is a sequence of independent deletes, and concurrent readers might observe any
/// intermediate state.
///
/// Expiry is owned by the store: once the time-to-live of an entry has elapsed, it is gone, even
/// if nobody explicitly observed it.
///
/// Implementations signal that they can not be reached with
/// [`CacheError::StoreUnavailable`](super::CacheError::StoreUnavailable).
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync + 'static {
    /// Returns the value stored under `key`, or `None` on a miss.
    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<Bytes>>;

    /// Stores `value` under `key`, replacing any previous value, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> CacheEntry<()>;

    /// Deletes all the given keys, returning how many of them actually existed.
    async fn delete(&self, keys: &[CacheKey]) -> CacheEntry<usize>;

    /// Returns whether an entry for `key` exists.
    async fn exists(&self, key: &CacheKey) -> CacheEntry<bool> {
        Ok(self.ttl_remaining(key).await?.is_some())
    }

    /// Returns the remaining time-to-live of `key`, or `None` if there is no such entry.
    async fn ttl_remaining(&self, key: &CacheKey) -> CacheEntry<Option<Duration>>;

    /// Sets a new time-to-live for an existing entry, counted from now.
    ///
    /// Returns `false` if there was no entry to extend.
    async fn extend_ttl(&self, key: &CacheKey, ttl: Duration) -> CacheEntry<bool>;

    /// Returns the approximate memory usage of the store.
    async fn memory_usage(&self) -> CacheEntry<MemoryUsage>;

    /// Enumerates all the live keys matching `prefix`.
    async fn scan(&self, prefix: &KeyPrefix) -> CacheEntry<Vec<CacheKey>>;

    /// Enumerates all the live keys of `namespace`.
    async fn scan_namespace(&self, namespace: &str) -> CacheEntry<Vec<CacheKey>>;

    /// Releases any resources held by the store.
    async fn close(&self) {}
}
