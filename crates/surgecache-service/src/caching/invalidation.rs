use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::{CacheEntry, CacheError, CacheKey, CacheStore, KeyPrefix, ResourceType, TagIndex};

/// A real-world event that makes cached artifacts about a resource stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A large price movement of a stock.
    PriceShock,
    /// A regulatory disclosure of a company.
    Disclosure,
}

impl EventKind {
    /// The resource types whose entries are invalidated by this event.
    pub fn affected_resources(&self) -> &'static [ResourceType] {
        match self {
            Self::PriceShock => &[ResourceType::Analysis],
            Self::Disclosure => &[ResourceType::Analysis, ResourceType::StockMetadata],
        }
    }
}

impl AsRef<str> for EventKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::PriceShock => "price_shock",
            Self::Disclosure => "disclosure",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for EventKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_shock" => Ok(Self::PriceShock),
            "disclosure" => Ok(Self::Disclosure),
            _ => Err(CacheError::MalformedKey(format!("unknown event type `{s}`"))),
        }
    }
}

/// The outcome of an invalidation.
///
/// Invalidation never fails as a whole, keys that could not be deleted are reported in
/// [`failed`](Self::failed) and might still be served until they expire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// The number of entries that existed and were deleted.
    pub deleted: usize,
    /// Keys that could not be deleted, even after a retry.
    pub failed: Vec<CacheKey>,
}

impl InvalidationReport {
    /// Returns `true` if no key failed to be deleted.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Converts the report into a [`CacheError::InvalidationPartialFailure`] if any key failed.
    pub fn into_result(self) -> CacheEntry<usize> {
        if self.failed.is_empty() {
            Ok(self.deleted)
        } else {
            Err(CacheError::InvalidationPartialFailure {
                failed: self.failed,
            })
        }
    }

    fn merge(&mut self, other: InvalidationReport) {
        self.deleted += other.deleted;
        self.failed.extend(other.failed);
    }
}

/// Deletes cache entries and keeps the [`TagIndex`] in line.
///
/// All modes are best effort and idempotent: invalidating the same thing twice is harmless, and
/// failures only ever leave entries behind that expire on their own. The durable store is never
/// touched, the cache only ever holds copies of what is stored there.
#[derive(Debug, Clone)]
pub struct InvalidationCoordinator {
    store: Arc<dyn CacheStore>,
    tags: Arc<TagIndex>,
    namespace: String,
    chunk_size: usize,
    price_shock_threshold_percent: f64,
}

impl InvalidationCoordinator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        tags: Arc<TagIndex>,
        namespace: &str,
        chunk_size: usize,
        price_shock_threshold_percent: f64,
    ) -> Self {
        Self {
            store,
            tags,
            namespace: namespace.to_owned(),
            chunk_size: chunk_size.max(1),
            price_shock_threshold_percent,
        }
    }

    /// Invalidates a single key.
    pub async fn invalidate(&self, key: &CacheKey) -> InvalidationReport {
        self.invalidate_keys(std::slice::from_ref(key)).await
    }

    /// Deletes all of `keys` in chunks.
    ///
    /// A chunk that fails as a whole is retried once key by key. Deleted keys are untagged,
    /// except for tag references added while the deletes were running.
    pub async fn invalidate_keys(&self, keys: &[CacheKey]) -> InvalidationReport {
        let before = self.tags.watermark();
        let mut report = InvalidationReport::default();
        for chunk in keys.chunks(self.chunk_size) {
            report.merge(self.delete_chunk(chunk).await);
        }

        if report.failed.is_empty() {
            self.tags.untag_everywhere(keys, before);
        } else {
            let deleted: Vec<_> = keys
                .iter()
                .filter(|key| !report.failed.contains(key))
                .cloned()
                .collect();
            self.tags.untag_everywhere(&deleted, before);

            let error = CacheError::InvalidationPartialFailure {
                failed: report.failed.clone(),
            };
            tracing::warn!(error = %error, keys = ?report.failed, "Invalidation left entries behind");
            metric!(counter("caches.invalidation.failed") += report.failed.len() as i64);
        }
        metric!(counter("caches.invalidation.deleted") += report.deleted as i64);

        report
    }

    async fn delete_chunk(&self, chunk: &[CacheKey]) -> InvalidationReport {
        let error = match self.store.delete(chunk).await {
            Ok(deleted) => {
                return InvalidationReport {
                    deleted,
                    failed: vec![],
                };
            }
            Err(error) => error,
        };
        tracing::debug!(%error, keys = chunk.len(), "Bulk delete failed, retrying key by key");

        let mut report = InvalidationReport::default();
        for key in chunk {
            match self.store.delete(std::slice::from_ref(key)).await {
                Ok(deleted) => report.deleted += deleted,
                Err(error) => {
                    tracing::debug!(%key, %error, "Failed to delete cache entry");
                    report.failed.push(key.clone());
                }
            }
        }
        report
    }

    /// Invalidates every key tagged with `tag`, dropping the tag once it references nothing.
    ///
    /// Only the keys read at the start are untagged. Keys which could not be deleted, and keys
    /// tagged by writes racing with the invalidation, stay tagged, so that a repeated
    /// invalidation can pick them up again.
    pub async fn invalidate_by_tag(&self, tag: &str) -> InvalidationReport {
        let keys = self.tags.keys_for_tag(tag);
        let report = self.invalidate_keys(&keys).await;

        tracing::debug!(tag, deleted = report.deleted, "Invalidated tag");
        report
    }

    /// Invalidates all entries about `resource_id` affected by `event`.
    ///
    /// This covers every date, sub-resource and version of the affected resource types. An
    /// unavailable store results in an empty report, as there is nothing we could delete anyway.
    pub async fn invalidate_by_event(
        &self,
        event: EventKind,
        resource_id: &str,
    ) -> CacheEntry<InvalidationReport> {
        let mut report = InvalidationReport::default();
        for resource_type in event.affected_resources() {
            let prefix = KeyPrefix::new(&self.namespace, *resource_type, &[resource_id])?;
            let keys = match self.store.scan(&prefix).await {
                Ok(keys) => keys,
                Err(error) => {
                    tracing::warn!(%error, %prefix, "Failed to enumerate keys to invalidate");
                    continue;
                }
            };
            report.merge(self.invalidate_keys(&keys).await);
        }

        tracing::info!(
            event = %event,
            resource_id,
            deleted = report.deleted,
            failed = report.failed.len(),
            "Invalidated cache entries on event",
        );
        metric!(counter("caches.invalidation.event") += 1, "event" => event.as_ref());
        Ok(report)
    }

    /// Treats a price change of at least the configured threshold as a
    /// [price shock](EventKind::PriceShock).
    ///
    /// Returns `None` if the change was too small to invalidate anything.
    pub async fn on_price_change(
        &self,
        ticker: &str,
        change_percent: f64,
    ) -> CacheEntry<Option<InvalidationReport>> {
        if change_percent.abs() < self.price_shock_threshold_percent {
            return Ok(None);
        }
        self.invalidate_by_event(EventKind::PriceShock, ticker)
            .await
            .map(Some)
    }
}
