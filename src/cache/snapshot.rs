//! Cache snapshots for the local backend.
//!
//! The LRU is written to disk as a bincode document, first to `<path>.tmp`
//! and then renamed over `<path>`, so a crash mid-write never leaves a
//! truncated snapshot behind. A missing or unreadable snapshot means a
//! cold start, never a failed startup.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::entry::StoredEntry;
use crate::cache::local::LocalCache;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub key: String,
    pub entry: StoredEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    records: Vec<SnapshotRecord>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("snapshot is corrupt: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("unsupported snapshot version {0}")]
    Version(u32),

    #[error("snapshot task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write records atomically.
pub fn write(path: &Path, records: Vec<SnapshotRecord>) -> Result<usize, SnapshotError> {
    let count = records.len();
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        records,
    };
    let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(count)
}

/// Read records; `Ok(None)` when no snapshot exists.
pub fn read(path: &Path) -> Result<Option<Vec<SnapshotRecord>>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (file, _): (SnapshotFile, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    if file.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(file.version));
    }
    Ok(Some(file.records))
}

/// Export the cache and write it from a blocking thread.
pub async fn save(cache: &LocalCache, path: &Path) -> Result<usize, SnapshotError> {
    let records = cache.export();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write(&path, records)).await?
}

/// Restore a snapshot into the cache. Failures are logged and the cache
/// starts cold.
pub async fn load(cache: &LocalCache, path: &Path) -> usize {
    let owned = path.to_path_buf();
    let result = match tokio::task::spawn_blocking(move || read(&owned)).await {
        Ok(result) => result,
        Err(e) => Err(SnapshotError::Join(e)),
    };
    match result {
        Ok(Some(records)) => {
            let total = records.len();
            let restored = cache.restore(records);
            tracing::info!(path = ?path, restored, skipped = total - restored, "Cache snapshot loaded");
            restored
        }
        Ok(None) => {
            tracing::info!(path = ?path, "No cache snapshot found, starting cold");
            0
        }
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Ignoring unreadable cache snapshot, starting cold");
            0
        }
    }
}

/// Background snapshotting: load once, then save on every tick and on shutdown.
pub struct SnapshotTask {
    cache: Arc<LocalCache>,
    path: PathBuf,
    interval: Duration,
}

impl SnapshotTask {
    pub fn new(cache: Arc<LocalCache>, path: PathBuf, interval: Duration) -> Self {
        Self {
            cache,
            path,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        load(&self.cache, &self.path).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.persist().await,
                _ = shutdown.recv() => {
                    self.persist().await;
                    break;
                }
            }
        }
    }

    async fn persist(&self) {
        match save(&self.cache, &self.path).await {
            Ok(count) => tracing::debug!(path = ?self.path, entries = count, "Cache snapshot written"),
            Err(e) => tracing::warn!(path = ?self.path, error = %e, "Cache snapshot failed"),
        }
    }
}
