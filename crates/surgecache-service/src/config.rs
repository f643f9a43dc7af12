use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{MemoryGuardConfig, TtlPolicy};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for surgecache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "surgecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of the cache itself.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// The first segment of every cache key.
    pub namespace: String,

    /// The hard memory limit of the cache store, in bytes.
    pub max_memory_bytes: u64,

    /// Memory usage, in percent of `max_memory_bytes`, above which the memory guard kicks in.
    pub eviction_assist_threshold_percent: f64,

    /// Whether the memory guard actively evicts entries above the threshold.
    pub eviction_assist_enabled: bool,

    /// The maximum number of entries evicted by the memory guard per check.
    pub eviction_assist_batch_size: usize,

    /// How often the memory guard samples memory usage.
    #[serde(with = "humantime_serde")]
    pub memory_check_interval: Duration,

    /// How often dangling references are swept from the tag index.
    #[serde(with = "humantime_serde")]
    pub tag_sweep_interval: Duration,

    /// How often the metrics window is closed and reported.
    #[serde(with = "humantime_serde")]
    pub metrics_rollover_interval: Duration,

    /// Time-to-live overrides in seconds, by resource type name.
    pub ttl_policy: BTreeMap<String, u64>,

    /// The schema version appended to all cache keys on startup.
    pub cache_version: u32,

    /// The maximum number of concurrent writes when warming the cache.
    pub warm_concurrency: usize,

    /// The absolute price change in percent that counts as a price shock.
    pub price_shock_threshold_percent: f64,

    /// The number of independently locked buckets for in-flight computations and tags.
    pub single_flight_buckets: usize,

    /// The maximum number of keys per bulk delete.
    pub invalidation_chunk_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: "cache".into(),
            max_memory_bytes: 1 << 30,
            eviction_assist_threshold_percent: 80.0,
            eviction_assist_enabled: true,
            eviction_assist_batch_size: 256,
            memory_check_interval: Duration::from_secs(30),
            tag_sweep_interval: Duration::from_secs(300),
            metrics_rollover_interval: Duration::from_secs(60),
            ttl_policy: BTreeMap::new(),
            cache_version: 1,
            warm_concurrency: 8,
            price_shock_threshold_percent: 10.0,
            single_flight_buckets: 64,
            invalidation_chunk_size: 100,
        }
    }
}

impl CacheSettings {
    /// Builds the TTL policy from the configured overrides.
    pub fn ttl_policy(&self) -> Result<TtlPolicy> {
        TtlPolicy::from_overrides(&self.ttl_policy).context("invalid `cache.ttl_policy`")
    }

    pub fn memory_guard(&self) -> MemoryGuardConfig {
        MemoryGuardConfig {
            threshold_percent: self.eviction_assist_threshold_percent,
            assist_enabled: self.eviction_assist_enabled,
            batch_size: self.eviction_assist_batch_size,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The directory of the filesystem durable store.
    ///
    /// Without it, artifacts are only ever cached and never written through.
    pub durable_dir: Option<PathBuf>,

    /// Settings of the cache.
    pub cache: CacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            durable_dir: None,
            cache: CacheSettings::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Checks the settings that can not be verified while parsing.
    pub fn validate(&self) -> Result<()> {
        self.cache.ttl_policy()?;

        let threshold = self.cache.eviction_assist_threshold_percent;
        if !(0.0..=100.0).contains(&threshold) {
            anyhow::bail!("`cache.eviction_assist_threshold_percent` must be within 0-100");
        }
        if self.cache.max_memory_bytes == 0 {
            anyhow::bail!("`cache.max_memory_bytes` must not be 0");
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(':') {
            anyhow::bail!("`cache.namespace` must be a non-empty string without `:`");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
