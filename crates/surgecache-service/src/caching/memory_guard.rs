use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{CacheStore, InvalidationCoordinator, MemoryUsage};
use crate::utils::periodic;

/// Settings of the [`MemoryGuard`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryGuardConfig {
    /// Usage in percent of the maximum at which the guard kicks in.
    pub threshold_percent: f64,
    /// Whether to actively evict entries above the threshold.
    pub assist_enabled: bool,
    /// The maximum number of entries evicted per check.
    pub batch_size: usize,
}

/// The result of a single [`MemoryGuard::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryCheck {
    pub usage: MemoryUsage,
    pub over_threshold: bool,
    /// The number of entries that were evicted.
    pub evicted: usize,
}

/// Watches the memory usage of the cache store.
///
/// The store enforces its own hard limit through its native eviction policy. Above a soft
/// threshold, the guard warns and helps out by evicting the entries closest to their expiry,
/// which are the ones losing the least value.
#[derive(Debug, Clone)]
pub struct MemoryGuard {
    store: Arc<dyn CacheStore>,
    invalidation: InvalidationCoordinator,
    namespace: String,
    config: MemoryGuardConfig,
}

impl MemoryGuard {
    pub fn new(
        store: Arc<dyn CacheStore>,
        invalidation: InvalidationCoordinator,
        namespace: &str,
        config: MemoryGuardConfig,
    ) -> Self {
        Self {
            store,
            invalidation,
            namespace: namespace.to_owned(),
            config,
        }
    }

    /// Samples the memory usage once, evicting entries if needed.
    pub async fn check(&self) -> MemoryCheck {
        let usage = match self.store.memory_usage().await {
            Ok(usage) => usage,
            Err(error) => {
                tracing::warn!(%error, "Failed to sample cache memory usage");
                return MemoryCheck::default();
            }
        };

        let percent = usage.percent();
        metric!(gauge("caches.memory.used") = usage.used);
        metric!(gauge("caches.memory.percent") = percent.round() as u64);

        let mut check = MemoryCheck {
            usage,
            ..Default::default()
        };
        if percent < self.config.threshold_percent {
            return check;
        }

        check.over_threshold = true;
        tracing::warn!(
            used = usage.used,
            max = usage.max,
            percent,
            threshold = self.config.threshold_percent,
            "Cache memory usage above threshold",
        );
        metric!(counter("caches.memory.over_threshold") += 1);

        if self.config.assist_enabled && self.config.batch_size > 0 {
            check.evicted = self.evict_nearest_expiry().await;
        }
        check
    }

    /// Evicts up to one batch of the entries that expire soonest.
    async fn evict_nearest_expiry(&self) -> usize {
        let keys = match self.store.scan_namespace(&self.namespace).await {
            Ok(keys) => keys,
            Err(error) => {
                tracing::warn!(%error, "Failed to enumerate cache entries for eviction");
                return 0;
            }
        };

        let mut candidates = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(remaining)) = self.store.ttl_remaining(&key).await {
                candidates.push((remaining, key));
            }
        }
        candidates.sort_by_key(|(remaining, _)| *remaining);
        candidates.truncate(self.config.batch_size);

        let batch: Vec<_> = candidates.into_iter().map(|(_, key)| key).collect();
        let report = self.invalidation.invalidate_keys(&batch).await;

        tracing::info!(evicted = report.deleted, "Evicted cache entries nearest to expiry");
        metric!(counter("caches.memory.evicted") += report.deleted as i64);
        report.deleted
    }

    /// Runs [`check`](Self::check) every `interval` until `token` is cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        let guard = &self;
        periodic::every(interval, token, move || async move {
            guard.check().await;
        })
        .await;
        tracing::debug!("Memory guard stopped");
    }
}
