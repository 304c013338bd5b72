//! Filesystem capability used by every component that touches disk.
//!
//! The core only talks to [`FileSystem`]; [`LocalFs`] is the `tokio::fs`
//! implementation used in production and in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;

/// A fallible stream of byte chunks.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// A boxed reader over a stored file.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Write the stream to `path`, creating parent directories.
    ///
    /// Returns the number of bytes written. On any error the partially
    /// written file is removed before the error is returned.
    async fn write_stream(&self, path: &Path, stream: ByteStream<'_>) -> io::Result<u64>;

    async fn read(&self, path: &Path) -> io::Result<BoxReader>;

    async fn exists(&self, path: &Path) -> bool;

    /// Remove a file. Missing files are not an error.
    async fn delete(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory tree. Missing directories are not an error.
    async fn delete_dir(&self, path: &Path) -> io::Result<()>;

    /// Move `from` to `to`, creating the destination's parent directories.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn size(&self, path: &Path) -> io::Result<u64>;

    /// Entries directly under `path`. A missing directory lists as empty.
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Remove empty directories from `start` upwards, stopping at `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path);
}

/// [`FileSystem`] on the local disk.
#[derive(Clone, Debug, Default)]
pub struct LocalFs;

#[async_trait]
impl FileSystem for LocalFs {
    async fn write_stream(&self, path: &Path, mut stream: ByteStream<'_>) -> io::Result<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(path).await?;

        let mut written: u64 = 0;
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(path).await;
                    return Err(err);
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(path).await;
                return Err(err);
            }
            written += chunk.len() as u64;
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(path).await;
            return Err(err);
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(path).await;
            return Err(err);
        }

        Ok(written)
    }

    async fn read(&self, path: &Path) -> io::Result<BoxReader> {
        let file = File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_dir(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, to).await
    }

    async fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    async fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// A single-item stream over an in-memory buffer.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream<'static> {
    futures::stream::once(futures::future::ready(Ok(data.into()))).boxed()
}

/// Cap `stream` at `limit` bytes.
///
/// Once more than `limit` bytes have passed the stream yields an
/// `InvalidData` error. The returned counter tracks how many bytes were seen,
/// so callers can tell an oversized body apart from a transport failure.
pub fn limit_stream<'a>(stream: ByteStream<'a>, limit: u64) -> (ByteStream<'a>, Arc<AtomicU64>) {
    let seen = Arc::new(AtomicU64::new(0));
    let counter = seen.clone();
    let limited = stream
        .map(move |item| {
            let chunk = item?;
            let len = chunk.len() as u64;
            let total = counter.fetch_add(len, Ordering::Relaxed) + len;
            if total > limit {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("stream exceeds {limit} bytes"),
                ));
            }
            Ok(chunk)
        })
        .boxed();
    (limited, seen)
}

/// A [`LocalFs`] that parks the first armed call to one operation until
/// the test releases it.
#[cfg(test)]
pub(crate) mod stall {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Op {
        Write,
        Read,
        Size,
    }

    pub(crate) struct StallingFs {
        op: Op,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl StallingFs {
        pub(crate) fn new(op: Op) -> Arc<Self> {
            Arc::new(Self {
                op,
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        pub(crate) fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        /// Resolves once the armed call is parked.
        pub(crate) async fn stalled(&self) {
            self.entered.notified().await;
        }

        pub(crate) fn release(&self) {
            self.release.notify_one();
        }

        async fn gate(&self, op: Op) {
            if op == self.op && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[async_trait]
    impl FileSystem for StallingFs {
        async fn write_stream(&self, path: &Path, stream: ByteStream<'_>) -> io::Result<u64> {
            self.gate(Op::Write).await;
            LocalFs.write_stream(path, stream).await
        }

        async fn read(&self, path: &Path) -> io::Result<BoxReader> {
            self.gate(Op::Read).await;
            LocalFs.read(path).await
        }

        async fn exists(&self, path: &Path) -> bool {
            LocalFs.exists(path).await
        }

        async fn delete(&self, path: &Path) -> io::Result<()> {
            LocalFs.delete(path).await
        }

        async fn delete_dir(&self, path: &Path) -> io::Result<()> {
            LocalFs.delete_dir(path).await
        }

        async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            LocalFs.rename(from, to).await
        }

        async fn size(&self, path: &Path) -> io::Result<u64> {
            self.gate(Op::Size).await;
            LocalFs.size(path).await
        }

        async fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            LocalFs.list_dir(path).await
        }

        async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
            LocalFs.prune_empty_dirs(start, stop).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        let path = dir.path().join("a/b/c.bin");

        let written = fs.write_stream(&path, bytes_stream("hello")).await.unwrap();
        assert_eq!(written, 5);
        assert!(fs.exists(&path).await);
        assert_eq!(fs.size(&path).await.unwrap(), 5);

        let mut out = String::new();
        fs.read(&path).await.unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_failed_stream_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        let path = dir.path().join("partial.bin");

        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();

        let err = fs.write_stream(&path, stream).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert!(!fs.exists(&path).await);
    }

    #[tokio::test]
    async fn test_limit_stream_rejects_oversized_body() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        let path = dir.path().join("capped.bin");

        let (stream, seen) = limit_stream(bytes_stream("0123456789"), 4);
        let err = fs.write_stream(&path, stream).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(seen.load(Ordering::Relaxed), 10);
        assert!(!fs.exists(&path).await);

        let (stream, seen) = limit_stream(bytes_stream("0123"), 4);
        assert_eq!(fs.write_stream(&path, stream).await.unwrap(), 4);
        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        assert!(fs.list_dir(&dir.path().join("absent")).await.unwrap().is_empty());

        fs.write_stream(&dir.path().join("x/1"), bytes_stream("1")).await.unwrap();
        assert_eq!(fs.list_dir(&dir.path().join("x")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        let missing = dir.path().join("nope");
        fs.delete(&missing).await.unwrap();
        fs.delete_dir(&missing).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_stops_at_root() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs;
        let leaf = dir.path().join("ab/cd");
        tokio::fs::create_dir_all(&leaf).await.unwrap();

        fs.prune_empty_dirs(&leaf, dir.path()).await;
        assert!(!fs.exists(&dir.path().join("ab")).await);
        assert!(fs.exists(dir.path()).await);
    }
}
