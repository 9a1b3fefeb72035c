//! Attachment file cache
//!
//! A bounded on-disk blob store keyed by message id. Writes stream through
//! a limiter chain (visitor bandwidth, per-file limit, remaining visitor
//! quota) plus the cache's own total-size budget; a failed write leaves no
//! partial file behind.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::ratelimit::{FixedLimiter, Limiter};

/// Attachment cache errors
#[derive(Debug, Error)]
pub enum FileCacheError {
    /// A limiter in the chain rejected the write
    #[error("attachment limit reached")]
    LimitReached,

    /// No blob for the given id
    #[error("attachment not found")]
    NotFound,

    /// Underlying filesystem error
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bounded on-disk attachment store
pub struct FileCache {
    dir: PathBuf,
    total_size_limit: u64,
    total_size: AtomicU64,
}

impl FileCache {
    /// Open the cache directory, creating it if needed, and account for
    /// blobs already present.
    pub fn new(dir: impl Into<PathBuf>, total_size_limit: u64) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut total_size = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total_size += entry.metadata()?.len();
            }
        }
        Ok(Self {
            dir,
            total_size_limit,
            total_size: AtomicU64::new(total_size),
        })
    }

    /// Bytes currently stored
    pub fn size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Path of the blob for a message id
    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Stream a blob into the cache.
    ///
    /// `head` is the already-peeked part of the body, `rest` the remaining
    /// chunks. Every chunk must pass the whole limiter chain and the
    /// cache's total-size budget; on rejection the partial file is removed
    /// and `LimitReached` is returned.
    pub async fn write<S, E>(
        &self,
        id: &str,
        head: &[u8],
        mut rest: S,
        limiters: &[&dyn Limiter],
    ) -> Result<i64, FileCacheError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let remaining_total =
            FixedLimiter::new(self.total_size_limit.saturating_sub(self.size()));
        let path = self.path(id);
        let mut file = File::create(&path).await?;
        let mut written = 0u64;

        let mut result =
            put_chunk(&remaining_total, limiters, &mut file, &mut written, head).await;
        if result.is_ok() {
            while let Some(chunk) = rest.next().await {
                match chunk {
                    Ok(chunk) => {
                        result =
                            put_chunk(&remaining_total, limiters, &mut file, &mut written, &chunk)
                                .await;
                        if result.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        result = Err(FileCacheError::Io(io::Error::other(e.to_string())));
                        break;
                    }
                }
            }
        }

        if let Err(e) = result {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        file.flush().await?;
        self.total_size.fetch_add(written, Ordering::Relaxed);
        Ok(written as i64)
    }

    /// Open a blob for reading; returns the file and its size
    pub async fn open(&self, id: &str) -> Result<(File, u64), FileCacheError> {
        let path = self.path(id);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                FileCacheError::NotFound
            } else {
                FileCacheError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Size of a blob without opening it
    pub async fn stat(&self, id: &str) -> Result<u64, FileCacheError> {
        match tokio::fs::metadata(self.path(id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FileCacheError::NotFound),
            Err(e) => Err(FileCacheError::Io(e)),
        }
    }

    /// Remove blobs; missing files are ignored
    pub async fn remove(&self, ids: &[String]) {
        for id in ids {
            let path = self.path(id);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        self.total_size.fetch_sub(meta.len(), Ordering::Relaxed);
                        tracing::debug!(id = %id, "removed expired attachment");
                    }
                }
                Err(_) => continue,
            }
        }
    }
}

async fn put_chunk(
    remaining_total: &FixedLimiter,
    limiters: &[&dyn Limiter],
    file: &mut File,
    written: &mut u64,
    chunk: &[u8],
) -> Result<(), FileCacheError> {
    let n = chunk.len() as u64;
    let allowed = remaining_total.allow(n) && limiters.iter().all(|l| l.allow(n));
    if !allowed {
        return Err(FileCacheError::LimitReached);
    }
    file.write_all(chunk).await?;
    *written += n;
    Ok(())
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("dir", &self.dir)
            .field("total_size_limit", &self.total_size_limit)
            .field("total_size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TokenBucket;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::time::Duration;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect::<Vec<_>>(),
        )
    }

    fn cache(limit: u64) -> (tempfile::TempDir, FileCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path(), limit).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (_dir, cache) = cache(1024);
        let written = cache
            .write("abcDEF123456", b"head-", chunks(&[b"middle-", b"tail"]), &[])
            .await
            .unwrap();
        assert_eq!(written, 16);
        assert_eq!(cache.size(), 16);
        let (_, size) = cache.open("abcDEF123456").await.unwrap();
        assert_eq!(size, 16);
        let content = tokio::fs::read(cache.path("abcDEF123456")).await.unwrap();
        assert_eq!(content, b"head-middle-tail");
    }

    #[tokio::test]
    async fn test_per_file_limit_leaves_no_file() {
        let (_dir, cache) = cache(1024);
        let file_limit = FixedLimiter::new(10);
        let err = cache
            .write("abcDEF123456", b"0123456789", chunks(&[b"overflow"]), &[&file_limit])
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::LimitReached));
        assert!(matches!(
            cache.open("abcDEF123456").await.unwrap_err(),
            FileCacheError::NotFound
        ));
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_bandwidth_limit_rejects() {
        let (_dir, cache) = cache(1024);
        let bandwidth = TokenBucket::with_refill(8, 8, Duration::from_secs(86400));
        let err = cache
            .write("abcDEF123456", b"0123456789", chunks(&[]), &[&bandwidth])
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::LimitReached));
    }

    #[tokio::test]
    async fn test_total_cache_budget() {
        let (_dir, cache) = cache(20);
        cache
            .write("aaaaaaaaaaaa", b"0123456789", chunks(&[]), &[])
            .await
            .unwrap();
        let err = cache
            .write("bbbbbbbbbbbb", b"0123456789x", chunks(&[]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::LimitReached));
        // First file is untouched
        assert!(cache.open("aaaaaaaaaaaa").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_adjusts_size() {
        let (_dir, cache) = cache(1024);
        cache
            .write("aaaaaaaaaaaa", b"0123456789", chunks(&[]), &[])
            .await
            .unwrap();
        assert_eq!(cache.size(), 10);
        cache.remove(&["aaaaaaaaaaaa".to_string(), "missing000000".to_string()]).await;
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_startup_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing00001"), b"12345").unwrap();
        let cache = FileCache::new(dir.path(), 1024).unwrap();
        assert_eq!(cache.size(), 5);
    }
}
