//! Provides the process-scoped [`CacheService`] and a way to initialize it.
//!
//! [`CacheService`] wires the cache store, the tag index, the durable store and all the
//! orchestrators in [`crate::caching`] together according to the provided [`Config`], and is the
//! only entry point callers and periodic jobs are supposed to use.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheAside, CacheEntry, CacheKey, CacheStore, EventKind, InMemoryStore,
    InvalidationCoordinator, InvalidationReport, MemoryCheck, MemoryGuard, MetricsRecorder,
    MetricsSnapshot, ResourceType, SweepStats, TagIndex, TtlPolicy, WarmItem, WarmReport,
    validate_tag,
};
use crate::config::{CacheSettings, Config};
use crate::durable::{DurableStore, FilesystemDurableStore};
use crate::types::Artifact;
use crate::utils::periodic;

/// The cache with all of its operations.
///
/// This is cheap to clone, all clones share the same state.
#[derive(Debug, Clone)]
pub struct CacheService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: CacheSettings,
    policy: TtlPolicy,
    version: AtomicU32,
    store: Arc<dyn CacheStore>,
    tags: Arc<TagIndex>,
    recorder: Arc<MetricsRecorder>,
    aside: CacheAside,
    invalidation: InvalidationCoordinator,
    memory_guard: MemoryGuard,
}

impl CacheService {
    /// Creates the service with an in-process cache store, and the filesystem durable store if a
    /// `durable_dir` is configured.
    pub fn create(config: &Config) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new(
            "artifacts",
            config.cache.max_memory_bytes,
        ));
        let durable = match &config.durable_dir {
            Some(dir) => {
                let durable = FilesystemDurableStore::new(dir)
                    .context("failed to open durable store")?;
                Some(Arc::new(durable) as Arc<dyn DurableStore>)
            }
            None => None,
        };

        Self::with_stores(config.cache.clone(), store, durable)
    }

    /// Creates the service on top of the given stores.
    pub fn with_stores(
        settings: CacheSettings,
        store: Arc<dyn CacheStore>,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Result<Self> {
        let policy = settings.ttl_policy()?;
        let tags = Arc::new(TagIndex::new(settings.single_flight_buckets));
        let recorder = Arc::new(MetricsRecorder::new());

        let aside = CacheAside::new(
            store.clone(),
            tags.clone(),
            durable,
            recorder.clone(),
            settings.single_flight_buckets,
        );
        let invalidation = InvalidationCoordinator::new(
            store.clone(),
            tags.clone(),
            &settings.namespace,
            settings.invalidation_chunk_size,
            settings.price_shock_threshold_percent,
        );
        let memory_guard = MemoryGuard::new(
            store.clone(),
            invalidation.clone(),
            &settings.namespace,
            settings.memory_guard(),
        );

        tracing::info!(
            namespace = %settings.namespace,
            version = settings.cache_version,
            max_memory_bytes = settings.max_memory_bytes,
            "Cache service created",
        );

        let inner = Inner {
            version: AtomicU32::new(settings.cache_version),
            settings,
            policy,
            store,
            tags,
            recorder,
            aside,
            invalidation,
            memory_guard,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.inner.policy
    }

    /// The current global cache version.
    pub fn version(&self) -> u32 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Builds the key of a resource for the current cache version.
    pub fn key<I, S>(&self, resource_type: ResourceType, ids: I) -> CacheEntry<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CacheKey::builder(&self.inner.settings.namespace, resource_type)
            .ids(ids)
            .version(self.version())
            .build()
    }

    /// Increments the global cache version, returning the new version.
    ///
    /// All keys built afterwards differ from the ones built before. Nothing is deleted, entries of
    /// the previous version simply expire.
    pub fn bump_version(&self) -> u32 {
        let version = self.inner.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(version, "Bumped cache version");
        metric!(gauge("caches.version") = version as u64);
        version
    }

    /// Looks up `key` in the cache.
    pub async fn get(&self, key: &CacheKey) -> Option<Artifact> {
        self.inner.aside.get(key).await
    }

    /// Returns the artifact for `key`, from the cache, `fetch`, or `generate`, in that order.
    ///
    /// The time-to-live comes from the policy of the key's resource type. See
    /// [`CacheAside::read_through`] for the details.
    pub async fn read_through<S, Fe, G>(
        &self,
        key: &CacheKey,
        tags: &[S],
        fetch: Fe,
        generate: G,
    ) -> CacheEntry<Artifact>
    where
        S: AsRef<str> + Sync,
        Fe: Future<Output = anyhow::Result<Option<Artifact>>>,
        G: Future<Output = anyhow::Result<Artifact>>,
    {
        validate_tags(tags)?;
        let ttl = self.inner.policy.ttl_for(key.resource_type());
        self.inner
            .aside
            .read_through(key, ttl, tags, fetch, generate)
            .await
    }

    /// Like [`read_through`](Self::read_through), querying the configured durable store.
    pub async fn read_through_durable<S, G>(
        &self,
        key: &CacheKey,
        tags: &[S],
        generate: G,
    ) -> CacheEntry<Artifact>
    where
        S: AsRef<str> + Sync,
        G: Future<Output = anyhow::Result<Artifact>>,
    {
        let fetch = async {
            match self.inner.aside.durable() {
                Some(durable) => durable.get(key).await,
                None => Ok(None),
            }
        };
        self.read_through(key, tags, fetch, generate).await
    }

    /// Writes `artifact` to the durable store and the cache.
    pub async fn write_through<S: AsRef<str> + Sync>(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        tags: &[S],
    ) -> CacheEntry<()> {
        validate_tags(tags)?;
        let ttl = self.inner.policy.ttl_for(key.resource_type());
        self.inner
            .aside
            .write_through(key, artifact, ttl, tags)
            .await
    }

    /// Removes `key` from the cache.
    pub async fn invalidate(&self, key: &CacheKey) -> InvalidationReport {
        self.inner.invalidation.invalidate(key).await
    }

    /// Removes every entry tagged with `tag` from the cache.
    pub async fn invalidate_by_tag(&self, tag: &str) -> CacheEntry<InvalidationReport> {
        validate_tag(tag)?;
        Ok(self.inner.invalidation.invalidate_by_tag(tag).await)
    }

    /// Removes all entries about `resource_id` affected by the event named `event_type`.
    ///
    /// Known events are `price_shock` and `disclosure`.
    pub async fn invalidate_by_event(
        &self,
        event_type: &str,
        resource_id: &str,
    ) -> CacheEntry<InvalidationReport> {
        let event: EventKind = event_type.parse()?;
        self.inner
            .invalidation
            .invalidate_by_event(event, resource_id)
            .await
    }

    /// Invalidates the analyses of `ticker` if its price changed by at least the price shock
    /// threshold.
    pub async fn on_price_change(
        &self,
        ticker: &str,
        change_percent: f64,
    ) -> CacheEntry<Option<InvalidationReport>> {
        self.inner
            .invalidation
            .on_price_change(ticker, change_percent)
            .await
    }

    /// The metrics of the current window, including the memory usage of the cache store.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let snapshot = self.inner.recorder.snapshot();
        match self.inner.store.memory_usage().await {
            Ok(usage) => snapshot.with_memory(usage),
            Err(error) => {
                tracing::warn!(%error, "Failed to sample cache memory usage");
                snapshot
            }
        }
    }

    /// Closes the current metrics window and reports it.
    pub async fn rollover_metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.recorder.rollover();
        if let Ok(usage) = self.inner.store.memory_usage().await {
            snapshot = snapshot.with_memory(usage);
        }

        tracing::info!(
            hits = snapshot.hits,
            misses = snapshot.misses,
            hit_rate = snapshot.hit_rate,
            p99_latency = ?snapshot.p99_latency,
            memory_percent = snapshot.memory_percent,
            "Cache metrics window closed",
        );
        metric!(gauge("caches.hit_rate") = (snapshot.hit_rate * 100.0).round() as u64);
        snapshot
    }

    /// Samples the memory usage, evicting entries above the threshold.
    pub async fn check_memory(&self) -> MemoryCheck {
        self.inner.memory_guard.check().await
    }

    /// Drops references to entries that are gone from the tag index.
    pub async fn sweep_tags(&self) -> SweepStats {
        let stats = self.inner.tags.sweep(&*self.inner.store).await;
        tracing::debug!(
            dropped_refs = stats.dropped_refs,
            dropped_tags = stats.dropped_tags,
            "Swept tag index",
        );
        stats
    }

    /// Writes all `items` through, with bounded concurrency, until done or `token` is cancelled.
    pub async fn warm(&self, items: Vec<WarmItem>, token: &CancellationToken) -> WarmReport {
        let concurrency = self.inner.settings.warm_concurrency;
        crate::caching::warm(items, concurrency, token, move |item| async move {
            let key = self.key(item.resource_type, item.ids)?;
            self.write_through(&key, &item.payload, &item.tags).await
        })
        .await
    }

    /// Spawns the periodic jobs: the memory guard, the tag sweep and the metrics rollover.
    ///
    /// All of them stop once `token` is cancelled.
    pub fn spawn_background(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let settings = &self.inner.settings;

        let memory_guard = tokio::spawn(
            self.inner
                .memory_guard
                .clone()
                .run(settings.memory_check_interval, token.clone()),
        );

        let service = self.clone();
        let tag_sweep = tokio::spawn(periodic::every(
            settings.tag_sweep_interval,
            token.clone(),
            move || {
                let service = service.clone();
                async move {
                    service.sweep_tags().await;
                }
            },
        ));

        let service = self.clone();
        let rollover = tokio::spawn(periodic::every(
            settings.metrics_rollover_interval,
            token.clone(),
            move || {
                let service = service.clone();
                async move {
                    service.rollover_metrics().await;
                }
            },
        ));

        vec![memory_guard, tag_sweep, rollover]
    }

    /// Flushes the metrics window and releases the cache store.
    pub async fn shutdown(&self) -> MetricsSnapshot {
        let snapshot = self.rollover_metrics().await;
        self.inner.store.close().await;
        tracing::info!("Cache service shut down");
        snapshot
    }
}

fn validate_tags<S: AsRef<str>>(tags: &[S]) -> CacheEntry<()> {
    tags.iter().try_for_each(|tag| validate_tag(tag.as_ref()))
}
