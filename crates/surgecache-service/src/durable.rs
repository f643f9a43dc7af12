//! The durable store, the source of truth behind the cache.
//!
//! The cache layer only needs `get` and `put` by [`CacheKey`]. Anything else about the durable
//! store, like its schema or retention, is outside of its concern.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::caching::CacheKey;
use crate::types::Artifact;

/// The persistent store that artifacts are written through to.
#[async_trait]
pub trait DurableStore: fmt::Debug + Send + Sync + 'static {
    /// Loads the artifact for `key`, `None` if it was never stored.
    async fn get(&self, key: &CacheKey) -> Result<Option<Artifact>>;

    /// Stores `artifact` under `key`, replacing any previous artifact.
    async fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<()>;
}

/// A [`DurableStore`] keeping one JSON file per key in a directory.
///
/// Files are laid out according to [`CacheKey::cache_path`], and written atomically by persisting
/// a temporary file.
#[derive(Debug, Clone)]
pub struct FilesystemDurableStore {
    root: PathBuf,
}

impl FilesystemDurableStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tmp"))
            .with_context(|| format!("failed to create durable store at {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.cache_path())
    }
}

#[async_trait]
impl DurableStore for FilesystemDurableStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Artifact>> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let artifact = Artifact::from_slice(&data)
            .with_context(|| format!("corrupt artifact for `{key}` at {}", path.display()))?;
        Ok(Some(artifact))
    }

    async fn put(&self, key: &CacheKey, artifact: &Artifact) -> Result<()> {
        let data = serde_json::to_vec(artifact).context("failed to serialize artifact")?;
        let tmp_dir = self.root.join("tmp");
        let path = self.path_for(key);

        tokio::task::spawn_blocking(move || {
            let mut temp_file = tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&tmp_dir)?;
            temp_file.write_all(&data)?;
            persist_tempfile(temp_file, &path)
        })
        .await
        .context("durable write panicked")?
        .with_context(|| format!("failed to write artifact for `{key}`"))
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist artifact"))?;

    // A concurrent writer of the same key might race us here, retry once.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create durable directory: {:?}", e),
            );
            if retries >= MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                if retries >= MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}
