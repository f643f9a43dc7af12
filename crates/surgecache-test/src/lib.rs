//! Helpers for testing the cache service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, for example with `let durable_dir = test::tempdir()`.
//!
//!  - Tests depending on expiry should run with paused time, using
//!    `#[tokio::test(start_paused = true)]` and [`tokio::time::advance`]. The cache store follows
//!    the tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use surgecache_service::caching::{
    CacheEntry, CacheError, CacheKey, CacheStore, KeyPrefix, MemoryUsage,
};
use surgecache_service::config::CacheSettings;
use surgecache_service::durable::DurableStore;
use surgecache_service::types::{
    Artifact, CompanyAnalysis, MarketReport, ReportKind, Sentiment, StockMetadata, SurgeTrigger,
    TriggerSession,
};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `surgecache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("surgecache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Cache settings suitable for tests: a small memory limit and short intervals.
pub fn settings() -> CacheSettings {
    CacheSettings {
        max_memory_bytes: 1024 * 1024,
        memory_check_interval: Duration::from_secs(1),
        tag_sweep_interval: Duration::from_secs(1),
        metrics_rollover_interval: Duration::from_secs(1),
        single_flight_buckets: 4,
        warm_concurrency: 2,
        ..Default::default()
    }
}

fn generated_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 6, 8, 30, 0).unwrap()
}

fn date(date: &str) -> NaiveDate {
    date.parse().unwrap()
}

/// A company analysis fixture.
pub fn analysis(ticker: &str, day: &str) -> Artifact {
    Artifact::Analysis(CompanyAnalysis {
        ticker: ticker.to_owned(),
        company_name: format!("Company {ticker}"),
        date: date(day),
        summary: format!("Analysis of {ticker} on {day}"),
        key_points: vec!["Volume doubled against the 20 day average".into()],
        sentiment: Sentiment::Positive,
        model: "analyst-v2".into(),
        generated_at: generated_at(),
    })
}

/// A stock metadata fixture.
pub fn stock_metadata(ticker: &str, sector: &str) -> Artifact {
    Artifact::StockMetadata(StockMetadata {
        ticker: ticker.to_owned(),
        name: format!("Company {ticker}"),
        market: "KOSPI".into(),
        sector: Some(sector.to_owned()),
    })
}

/// A trigger session fixture with a single surging stock.
pub fn trigger_session(day: &str, session: &str) -> Artifact {
    Artifact::TriggerSession(TriggerSession {
        session_date: date(day),
        session: session.to_owned(),
        triggers: vec![SurgeTrigger {
            ticker: "005930".into(),
            name: "Samsung Electronics".into(),
            change_percent: 11.2,
            volume: 31_000_000,
            reason: None,
        }],
        generated_at: generated_at(),
    })
}

/// A market report fixture.
pub fn market_report(market: &str, day: &str, kind: ReportKind) -> Artifact {
    Artifact::MarketReport(MarketReport {
        market: market.to_owned(),
        date: date(day),
        kind,
        headline: format!("{market} {} report", kind.as_ref()),
        body: String::new(),
        generated_at: generated_at(),
    })
}

/// A generator counting its invocations.
#[derive(Debug, Clone, Default)]
pub struct CountingGenerator {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingGenerator {
    /// Creates a generator taking `delay` for every generation.
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: Default::default(),
            delay,
        }
    }

    /// How often the generator was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Generates `artifact`, after the configured delay.
    pub async fn generate(&self, artifact: Artifact) -> anyhow::Result<Artifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(artifact)
    }

    /// Fails with `message`, after the configured delay.
    pub async fn fail(&self, message: &str) -> anyhow::Result<Artifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        anyhow::bail!("{message}")
    }
}

/// A [`DurableStore`] in memory, counting reads and writes.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    artifacts: Mutex<HashMap<String, Artifact>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `artifact` without going through the service.
    pub fn insert(&self, key: &CacheKey, artifact: Artifact) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(key.to_string(), artifact);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.artifacts.lock().unwrap().contains_key(key.as_ref())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, key: &CacheKey) -> anyhow::Result<Option<Artifact>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.artifacts.lock().unwrap().get(key.as_ref()).cloned())
    }

    async fn put(&self, key: &CacheKey, artifact: &Artifact) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(key, artifact.clone());
        Ok(())
    }
}

/// A [`CacheStore`] which can never be reached.
#[derive(Debug, Default)]
pub struct UnavailableStore;

fn unavailable<T>() -> CacheEntry<T> {
    Err(CacheError::StoreUnavailable("connection refused".into()))
}

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(&self, _key: &CacheKey) -> CacheEntry<Option<Bytes>> {
        unavailable()
    }

    async fn set_with_ttl(&self, _key: &CacheKey, _value: Bytes, _ttl: Duration) -> CacheEntry {
        unavailable()
    }

    async fn delete(&self, _keys: &[CacheKey]) -> CacheEntry<usize> {
        unavailable()
    }

    async fn ttl_remaining(&self, _key: &CacheKey) -> CacheEntry<Option<Duration>> {
        unavailable()
    }

    async fn extend_ttl(&self, _key: &CacheKey, _ttl: Duration) -> CacheEntry<bool> {
        unavailable()
    }

    async fn memory_usage(&self) -> CacheEntry<MemoryUsage> {
        unavailable()
    }

    async fn scan(&self, _prefix: &KeyPrefix) -> CacheEntry<Vec<CacheKey>> {
        unavailable()
    }

    async fn scan_namespace(&self, _namespace: &str) -> CacheEntry<Vec<CacheKey>> {
        unavailable()
    }
}
