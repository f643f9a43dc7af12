use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sketches_ddsketch::DDSketch;

use super::{MemoryUsage, ResourceType};

/// A point-in-time view of the cache metrics window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, `0` for an empty window.
    pub hit_rate: f64,
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p50_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_latency: Duration,
    /// Bytes currently used by the cache store.
    pub memory_used: u64,
    /// Used memory in percent of the configured maximum.
    pub memory_percent: f64,
}

impl MetricsSnapshot {
    /// Adds the memory usage of the cache store to this snapshot.
    pub fn with_memory(mut self, usage: MemoryUsage) -> Self {
        self.memory_used = usage.used;
        self.memory_percent = usage.percent();
        self
    }
}

/// Records cache hits, misses and lookup latencies.
///
/// The counters accumulate in a window that is only reset by an explicit
/// [`rollover`](Self::rollover). Every recording is additionally reported to statsd.
#[derive(Default)]
pub struct MetricsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    latencies: Mutex<DDSketch>,
}

impl fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish_non_exhaustive()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, resource_type: ResourceType, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        metric!(counter("caches.access") += 1, "resource" => resource_type.as_ref(), "hit" => "true");
        metric!(timer("caches.access.duration") = latency, "resource" => resource_type.as_ref());
    }

    pub fn record_miss(&self, resource_type: ResourceType, latency: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        metric!(counter("caches.access") += 1, "resource" => resource_type.as_ref(), "hit" => "false");
        metric!(timer("caches.access.duration") = latency, "resource" => resource_type.as_ref());
    }

    fn add_latency(&self, latency: Duration) {
        self.latencies.lock().add(latency.as_secs_f64());
    }

    /// Returns the metrics of the current window.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let latencies = self.latencies.lock();
        summarize(hits, misses, &latencies)
    }

    /// Closes the current window, returning its metrics, and starts a new empty one.
    pub fn rollover(&self) -> MetricsSnapshot {
        let mut latencies = self.latencies.lock();
        let hits = self.hits.swap(0, Ordering::Relaxed);
        let misses = self.misses.swap(0, Ordering::Relaxed);
        let latencies = std::mem::take(&mut *latencies);
        summarize(hits, misses, &latencies)
    }
}

fn summarize(hits: u64, misses: u64, latencies: &DDSketch) -> MetricsSnapshot {
    let total = hits + misses;
    let hit_rate = if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    };

    let quantile = |q| {
        let secs = latencies.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs.max(0.0))
    };
    let count = latencies.count();
    let avg_latency = match latencies.sum() {
        Some(sum) if count > 0 => Duration::from_secs_f64((sum / count as f64).max(0.0)),
        _ => Duration::ZERO,
    };

    MetricsSnapshot {
        hits,
        misses,
        hit_rate,
        avg_latency,
        p50_latency: quantile(0.5),
        p95_latency: quantile(0.95),
        p99_latency: quantile(0.99),
        ..Default::default()
    }
}
