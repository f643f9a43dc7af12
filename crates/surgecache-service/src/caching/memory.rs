use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

use super::{CacheEntry, CacheKey, CacheStore, KeyPrefix, MemoryUsage};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When this item expires.
    ///
    /// This is a [`tokio::time::Instant`], so that expiry follows a paused clock in tests.
    deadline: Instant,
    /// The actual data.
    data: Bytes,
}

impl InMemoryItem {
    fn new(data: Bytes, ttl: Duration) -> Self {
        Self {
            deadline: Instant::now() + ttl,
            data,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn is_expired(&self) -> bool {
        self.deadline <= Instant::now()
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the explicit
/// expiration time.
struct CacheExpiration;

impl moka::Expiry<CacheKey, InMemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.remaining())
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining())
    }
}

/// A [`CacheStore`] living in the memory of this process.
///
/// The store is bounded by a maximum number of bytes, which accounts for both keys and values,
/// and is enforced by moka's own eviction policy. Expiry is checked on every access, in addition
/// to moka evicting expired items on its own.
///
/// All writes go through moka's per-key `and_compute_with`, so they are serialized per key.
#[derive(Clone)]
pub struct InMemoryStore {
    cache: moka::sync::Cache<CacheKey, InMemoryItem>,
    max_bytes: u64,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl InMemoryStore {
    /// Creates a new store holding at most `max_bytes`.
    pub fn new(name: &str, max_bytes: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(max_bytes)
            .expire_after(CacheExpiration)
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|k: &CacheKey, v: &InMemoryItem| {
                let size = k.as_ref().len() + v.data.len() + std::mem::size_of::<InMemoryItem>();
                u32::try_from(size).unwrap_or(u32::MAX)
            })
            .build();

        Self { cache, max_bytes }
    }

    /// Returns the item for `key` if it is still alive.
    fn live(&self, key: &CacheKey) -> Option<InMemoryItem> {
        let item = self.cache.get(key)?;
        if item.is_expired() {
            // only drop the item if it was not replaced in the meantime
            self.cache
                .entry(key.clone())
                .and_compute_with(|entry| match entry {
                    Some(entry) if entry.value().is_expired() => Op::Remove,
                    _ => Op::Nop,
                });
            return None;
        }
        Some(item)
    }

    fn scan_by(&self, mut predicate: impl FnMut(&CacheKey) -> bool) -> Vec<CacheKey> {
        self.cache
            .iter()
            .filter(|(key, item)| !item.is_expired() && predicate(key))
            .map(|(key, _)| CacheKey::clone(&key))
            .collect()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<Bytes>> {
        Ok(self.live(key).map(|item| item.data))
    }

    async fn set_with_ttl(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> CacheEntry<()> {
        let item = InMemoryItem::new(value, ttl);
        self.cache
            .entry(key.clone())
            .and_compute_with(|_| Op::Put(item));
        Ok(())
    }

    async fn delete(&self, keys: &[CacheKey]) -> CacheEntry<usize> {
        let removed = keys
            .iter()
            .filter(|key| {
                let result = self
                    .cache
                    .entry(CacheKey::clone(key))
                    .and_compute_with(|entry| match entry {
                        Some(_) => Op::Remove,
                        None => Op::Nop,
                    });
                matches!(result, CompResult::Removed(entry) if !entry.value().is_expired())
            })
            .count();
        Ok(removed)
    }

    async fn ttl_remaining(&self, key: &CacheKey) -> CacheEntry<Option<Duration>> {
        Ok(self.live(key).map(|item| item.remaining()))
    }

    async fn extend_ttl(&self, key: &CacheKey, ttl: Duration) -> CacheEntry<bool> {
        // Re-deadlines whatever value is current, atomically with respect to concurrent writes.
        let result = self
            .cache
            .entry(key.clone())
            .and_compute_with(|entry| match entry {
                Some(entry) if !entry.value().is_expired() => {
                    Op::Put(InMemoryItem::new(entry.into_value().data, ttl))
                }
                _ => Op::Nop,
            });
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn memory_usage(&self) -> CacheEntry<MemoryUsage> {
        // the weighted size is only updated by moka's housekeeping
        self.cache.run_pending_tasks();
        Ok(MemoryUsage {
            used: self.cache.weighted_size(),
            max: self.max_bytes,
        })
    }

    async fn scan(&self, prefix: &KeyPrefix) -> CacheEntry<Vec<CacheKey>> {
        Ok(self.scan_by(|key| prefix.matches(key)))
    }

    async fn scan_namespace(&self, namespace: &str) -> CacheEntry<Vec<CacheKey>> {
        Ok(self.scan_by(|key| key.namespace() == namespace))
    }

    async fn close(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::caching::ResourceType;

    fn key(ticker: &str, date: &str) -> CacheKey {
        CacheKey::builder("cache", ResourceType::Analysis)
            .ids([ticker, date])
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = InMemoryStore::new("test", 1024 * 1024);
        let key = key("005930", "2025-11-06");
        let ttl = Duration::from_secs(60);

        store
            .set_with_ttl(&key, Bytes::from_static(b"payload"), ttl)
            .await
            .unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some(&b"payload"[..])
        );

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(
            store.ttl_remaining(&key).await.unwrap(),
            Some(Duration::from_secs(1))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert_eq!(store.ttl_remaining(&key).await.unwrap(), None);
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_ttl() {
        let store = InMemoryStore::new("test", 1024 * 1024);
        let key = key("005930", "2025-11-06");

        assert!(!store.extend_ttl(&key, Duration::from_secs(10)).await.unwrap());

        store
            .set_with_ttl(&key, Bytes::from_static(b"payload"), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.extend_ttl(&key, Duration::from_secs(30)).await.unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(
            store.ttl_remaining(&key).await.unwrap(),
            Some(Duration::from_secs(10))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_extend_ttl_never_restores_replaced_value() {
        let store = Arc::new(InMemoryStore::new("test", 1024 * 1024));
        let key = key("005930", "2025-11-06");
        let ttl = Duration::from_secs(60);
        store
            .set_with_ttl(&key, Bytes::from("0"), ttl)
            .await
            .unwrap();

        let writer = tokio::spawn({
            let (store, key) = (store.clone(), key.clone());
            async move {
                for i in 1..=500u32 {
                    store
                        .set_with_ttl(&key, Bytes::from(i.to_string()), ttl)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }
        });
        let extender = tokio::spawn({
            let (store, key) = (store.clone(), key.clone());
            async move {
                for _ in 0..500 {
                    assert!(store.extend_ttl(&key, ttl * 2).await.unwrap());
                    tokio::task::yield_now().await;
                }
            }
        });
        writer.await.unwrap();
        extender.await.unwrap();

        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some(&b"500"[..])
        );
    }

    #[tokio::test]
    async fn test_delete_counts_existing() {
        let store = InMemoryStore::new("test", 1024 * 1024);
        let a = key("005930", "2025-11-06");
        let b = key("005930", "2025-11-07");
        let c = key("000660", "2025-11-06");

        for key in [&a, &b] {
            store
                .set_with_ttl(key, Bytes::from_static(b"x"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(store.delete(&[a.clone(), c.clone()]).await.unwrap(), 1);
        // deleting again is a no-op
        assert_eq!(store.delete(&[a.clone(), c]).await.unwrap(), 0);
        assert!(store.get(&a).await.unwrap().is_none());
        assert!(store.get(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan() {
        let store = InMemoryStore::new("test", 1024 * 1024);
        let keys = [
            key("005930", "2025-11-06"),
            key("005930", "2025-11-07"),
            key("000660", "2025-11-06"),
        ];
        for key in &keys {
            store
                .set_with_ttl(key, Bytes::from_static(b"x"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let prefix = KeyPrefix::new("cache", ResourceType::Analysis, &["005930"]).unwrap();
        let mut found = store.scan(&prefix).await.unwrap();
        found.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        assert_eq!(found, [keys[0].clone(), keys[1].clone()]);

        assert_eq!(store.scan_namespace("cache").await.unwrap().len(), 3);
        assert!(store.scan_namespace("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_usage() {
        let store = InMemoryStore::new("test", 1024 * 1024);
        let empty = store.memory_usage().await.unwrap();
        assert_eq!(empty.used, 0);
        assert_eq!(empty.max, 1024 * 1024);

        store
            .set_with_ttl(
                &key("005930", "2025-11-06"),
                Bytes::from(vec![0u8; 4096]),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let usage = store.memory_usage().await.unwrap();
        assert!(usage.used >= 4096);
        assert!(usage.percent() > 0.0 && usage.percent() < 1.0);
    }
}
