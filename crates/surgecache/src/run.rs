//! Runs the cache service until the process is interrupted.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use surgecache_service::caching::WarmItem;
use surgecache_service::config::Config;
use surgecache_service::service::CacheService;
use tokio_util::sync::CancellationToken;

/// How long the periodic jobs get to wind down after being cancelled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts the cache with its background jobs and blocks until `Ctrl-C`.
pub fn run(config: Config, warm: Option<PathBuf>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("surgecache")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let service = CacheService::create(&config).context("failed to create the cache")?;
        let token = CancellationToken::new();
        let jobs = service.spawn_background(&token);

        tracing::info!(
            namespace = %service.settings().namespace,
            version = service.version(),
            "cache started"
        );

        if let Some(path) = warm {
            let items = load_warm_items(&path).await?;
            let report = service.warm(items, &token).await;
            tracing::info!(
                written = report.written,
                failed = report.failed,
                skipped = report.skipped,
                "cache warmed"
            );
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for the shutdown signal")?;
        tracing::info!("shutting down");

        token.cancel();
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, join_jobs(jobs)).await;
        if joined.is_err() {
            tracing::warn!("background jobs did not stop in time");
        }

        let snapshot = service.shutdown().await;
        tracing::info!(
            hits = snapshot.hits,
            misses = snapshot.misses,
            hit_rate = snapshot.hit_rate,
            "cache stopped"
        );
        Ok(())
    })
}

async fn join_jobs(jobs: Vec<tokio::task::JoinHandle<()>>) {
    for job in jobs {
        if let Err(error) = job.await {
            tracing::error!(error = &error as &dyn std::error::Error, "background job failed");
        }
    }
}

/// Reads a JSON array of [`WarmItem`]s.
async fn load_warm_items(path: &Path) -> Result<Vec<WarmItem>> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read warm file `{}`", path.display()))?;
    serde_json::from_slice(&contents).context("failed to parse warm items")
}
