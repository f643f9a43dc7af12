//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use surgecache_service::caching::ResourceType;
use surgecache_service::config::Config;
use surgecache_service::metrics;

use crate::logging;
use crate::run;

/// Surgecache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache service and its periodic jobs until interrupted.
    Run {
        /// Warm the cache from a JSON file of items before serving.
        #[arg(long, value_name = "FILE")]
        warm: Option<PathBuf>,
    },

    /// Validate the configuration, including the TTL policy.
    Validate,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "surgecache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let warm = match cli.command {
        Command::Validate => return validate(&config),
        Command::Run { warm } => warm,
    };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is only created by `run`.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    run::run(config, warm).context("failed to run the cache")
}

/// Prints the effective TTL policy.
fn validate(config: &Config) -> Result<()> {
    let policy = config.cache.ttl_policy()?;
    println!("configuration is valid");
    println!("namespace: {}", config.cache.namespace);
    println!("cache version: {}", config.cache.cache_version);
    for resource_type in ResourceType::ALL {
        let ttl = policy.ttl_for(resource_type);
        println!("  {resource_type}: {}s", ttl.as_secs());
    }
    Ok(())
}
