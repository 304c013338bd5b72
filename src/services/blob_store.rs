//! Content-addressed blob layout on disk.
//!
//! A blob lives at `root/{h[0..2]}/{h[2..4]}/{h}` for content hash `h`. The
//! mapping is a pure function of the hash, so every record with the same
//! hash resolves to the same path regardless of who uploaded it. Blobs are
//! immutable once promoted.

use dashmap::DashMap;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::fs::FileSystem;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    /// Per-hash locks serializing attach and purge of the same blob.
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the per-hash lock; the map entry is dropped with the last holder.
pub struct BlobLock {
    hash: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for BlobLock {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.hash, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical path for a content hash.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        let shard_a = hash.get(0..2).unwrap_or("00");
        let shard_b = hash.get(2..4).unwrap_or("00");
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(hash);
        path
    }

    pub async fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path).await
    }

    /// Wait for exclusive access to `hash`.
    pub async fn lock(&self, hash: &str) -> BlobLock {
        let lock = self
            .locks
            .entry(hash.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        BlobLock {
            hash: hash.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Move `temp` into the blob slot for `hash`.
    ///
    /// Returns the blob path and whether it was newly created. When a blob
    /// already sits at the slot it is kept as is and `temp` is discarded.
    /// The caller must hold the lock for `hash`.
    pub async fn promote(&self, temp: &Path, hash: &str) -> io::Result<(PathBuf, bool)> {
        let path = self.path_for(hash);
        if self.fs.exists(&path).await {
            self.fs.delete(temp).await?;
            debug!(content_hash = %hash, "blob already present, discarded upload");
            return Ok((path, false));
        }
        self.fs.rename(temp, &path).await?;
        Ok((path, true))
    }

    /// Delete a blob and prune its now-empty shard directories.
    /// The caller must hold the lock for the blob's hash.
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        self.fs.delete(path).await?;
        if let Some(parent) = path.parent() {
            self.fs.prune_empty_dirs(parent, &self.root).await;
        }
        Ok(())
    }
}
