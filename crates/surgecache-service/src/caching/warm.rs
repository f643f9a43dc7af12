use std::future::Future;

use futures::{StreamExt, stream};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{CacheEntry, ResourceType};
use crate::types::Artifact;

/// A single artifact to pre-populate the cache with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WarmItem {
    pub resource_type: ResourceType,
    /// The identifiers of the cache key, see [`ResourceType::arity`].
    pub ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub payload: Artifact,
}

/// The outcome of a [`warm`] batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Items that were written.
    pub written: usize,
    /// Items whose write failed.
    pub failed: usize,
    /// Items never attempted because the batch was cancelled.
    pub skipped: usize,
}

/// Writes all `items` through `write`, with at most `concurrency` writes in flight.
///
/// Every write is independent of all the others, a failing write is counted and the batch goes
/// on. Cancelling `token` stops the batch, writes that are in flight at that point are abandoned.
pub async fn warm<F, Fut>(
    items: Vec<WarmItem>,
    concurrency: usize,
    token: &CancellationToken,
    write: F,
) -> WarmReport
where
    F: Fn(WarmItem) -> Fut,
    Fut: Future<Output = CacheEntry<()>>,
{
    let total = items.len();
    let mut report = WarmReport::default();

    let results = stream::iter(items)
        .map(write)
        .buffer_unordered(concurrency.max(1))
        .take_until(token.cancelled());
    let mut results = std::pin::pin!(results);

    while let Some(result) = results.next().await {
        match result {
            Ok(()) => report.written += 1,
            Err(error) => {
                tracing::warn!(%error, "Failed to warm cache entry");
                metric!(counter("caches.warm.failed") += 1, "error" => error.metrics_tag());
                report.failed += 1;
            }
        }
    }

    report.skipped = total - report.written - report.failed;
    metric!(counter("caches.warm.written") += report.written as i64);
    if report.skipped > 0 {
        tracing::info!(skipped = report.skipped, "Cache warming was cancelled");
    }
    report
}
