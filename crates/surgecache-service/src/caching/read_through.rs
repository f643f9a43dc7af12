use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheEntry, CacheError, CacheKey, CacheStore, MetricsRecorder, SingleFlight, TagIndex};
use crate::durable::DurableStore;
use crate::types::Artifact;

/// Implements the cache-aside read path and the write-through write path.
///
/// Reads first consult the [`CacheStore`]. On a miss, exactly one caller per key queries the
/// durable store and, failing that, the generator, while concurrent callers for the same key
/// wait for its result. Whatever is produced is written back into the cache and tagged.
///
/// The cache store being unavailable only degrades performance: lookups are treated as misses,
/// and failed writes are logged and skipped.
#[derive(Debug, Clone)]
pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    tags: Arc<TagIndex>,
    durable: Option<Arc<dyn DurableStore>>,
    recorder: Arc<MetricsRecorder>,
    current_computations: SingleFlight<Artifact>,
}

impl CacheAside {
    pub fn new(
        store: Arc<dyn CacheStore>,
        tags: Arc<TagIndex>,
        durable: Option<Arc<dyn DurableStore>>,
        recorder: Arc<MetricsRecorder>,
        single_flight_buckets: usize,
    ) -> Self {
        Self {
            store,
            tags,
            durable,
            recorder,
            current_computations: SingleFlight::new(single_flight_buckets),
        }
    }

    /// The durable store artifacts are written through to, if any.
    pub fn durable(&self) -> Option<&Arc<dyn DurableStore>> {
        self.durable.as_ref()
    }

    /// Looks up `key` in the cache, recording a hit or a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Artifact> {
        let start = Instant::now();
        let artifact = self.lookup(key).await;
        self.record(key, artifact.is_some(), start.elapsed());
        artifact
    }

    /// Returns the artifact for `key` from the cache, or computes it.
    ///
    /// On a miss, `fetch` is queried first, then `generate` if `fetch` did not find anything or
    /// failed. Only one of all the concurrent callers for `key` does so, and all of them receive
    /// the same result.
    ///
    /// Fails with [`CacheError::GenerationFailed`] if the generator fails. Failures are never
    /// cached.
    pub async fn read_through<S, Fe, G>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        tags: &[S],
        fetch: Fe,
        generate: G,
    ) -> CacheEntry<Artifact>
    where
        S: AsRef<str> + Sync,
        Fe: Future<Output = anyhow::Result<Option<Artifact>>>,
        G: Future<Output = anyhow::Result<Artifact>>,
    {
        if let Some(artifact) = self.get(key).await {
            return Ok(artifact);
        }

        let computation = async {
            // Another computation might have just finished and written the artifact.
            if let Some(artifact) = self.lookup(key).await {
                return Ok(artifact);
            }

            match fetch.await {
                Ok(Some(artifact)) if artifact.resource_type() == key.resource_type() => {
                    metric!(counter("caches.durable.hit") += 1, "resource" => key.resource_type().as_ref());
                    self.store_in_cache(key, &artifact, ttl, tags).await;
                    return Ok(artifact);
                }
                Ok(Some(artifact)) => {
                    tracing::error!(
                        %key,
                        found = %artifact.resource_type(),
                        "Durable store returned an artifact of the wrong type",
                    );
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%key, error = %format!("{error:#}"), "Failed to query durable store");
                }
            }
            metric!(counter("caches.durable.miss") += 1, "resource" => key.resource_type().as_ref());

            let start = Instant::now();
            let artifact = match generate.await {
                Ok(artifact) => artifact,
                Err(error) => {
                    metric!(counter("caches.generation.failed") += 1, "resource" => key.resource_type().as_ref());
                    return Err(CacheError::GenerationFailed(format!("{error:#}")));
                }
            };
            metric!(timer("caches.generation.duration") = start.elapsed(), "resource" => key.resource_type().as_ref());

            if artifact.resource_type() != key.resource_type() {
                return Err(CacheError::GenerationFailed(format!(
                    "generated a `{}` artifact for `{key}`",
                    artifact.resource_type()
                )));
            }

            self.put_durable(key, &artifact).await;
            self.store_in_cache(key, &artifact, ttl, tags).await;
            Ok(artifact)
        };

        self.current_computations
            .run_exclusive(key, computation)
            .await
    }

    /// Writes `artifact` to the durable store and the cache, unconditionally.
    ///
    /// A failing durable store does not prevent the cache write.
    pub async fn write_through<S: AsRef<str> + Sync>(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        ttl: Duration,
        tags: &[S],
    ) -> CacheEntry<()> {
        if artifact.resource_type() != key.resource_type() {
            return Err(CacheError::MalformedKey(format!(
                "cannot store a `{}` artifact under `{key}`",
                artifact.resource_type()
            )));
        }

        self.put_durable(key, artifact).await;
        self.store_in_cache(key, artifact, ttl, tags).await;
        Ok(())
    }

    /// Reads and decodes `key` from the cache.
    async fn lookup(&self, key: &CacheKey) -> Option<Artifact> {
        let data = match self.store.get(key).await {
            Ok(data) => data?,
            Err(error) => {
                tracing::warn!(%key, %error, "Cache store unavailable, bypassing cache");
                metric!(counter("caches.store.unavailable") += 1, "op" => "get");
                return None;
            }
        };

        match Artifact::from_slice(&data) {
            Ok(artifact) => Some(artifact),
            Err(error) => {
                tracing::error!(%key, %error, "Failed to decode cached artifact, dropping it");
                if let Err(error) = self.store.delete(std::slice::from_ref(key)).await {
                    tracing::warn!(%key, %error, "Failed to drop undecodable cache entry");
                }
                None
            }
        }
    }

    async fn store_in_cache<S: AsRef<str>>(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        ttl: Duration,
        tags: &[S],
    ) {
        let data = match artifact.to_bytes() {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(%key, %error, "Failed to serialize artifact");
                return;
            }
        };

        metric!(histogram("caches.entry.size") = data.len() as u64, "resource" => key.resource_type().as_ref());
        match self.store.set_with_ttl(key, data, ttl).await {
            Ok(()) => self.tags.tag(key, tags),
            Err(error) => {
                tracing::warn!(%key, %error, "Cache store unavailable, not caching artifact");
                metric!(counter("caches.store.unavailable") += 1, "op" => "set");
            }
        }
    }

    async fn put_durable(&self, key: &CacheKey, artifact: &Artifact) {
        let Some(durable) = &self.durable else {
            return;
        };
        if let Err(error) = durable.put(key, artifact).await {
            tracing::error!(%key, error = %format!("{error:#}"), "Failed to write artifact to durable store");
            metric!(counter("caches.durable.write_failed") += 1, "resource" => key.resource_type().as_ref());
        }
    }

    fn record(&self, key: &CacheKey, hit: bool, latency: Duration) {
        if hit {
            self.recorder.record_hit(key.resource_type(), latency);
        } else {
            self.recorder.record_miss(key.resource_type(), latency);
        }
    }
}
