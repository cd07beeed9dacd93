//! The object backend abstraction (spec.md §4.2).
//!
//! Grounded in shape on `gitnext-storage::StorageBackend`: an
//! `async_trait` over path-addressed primitive operations, kept
//! deliberately small (teacher's storage crate has no such seam — its
//! `ShardedStore` is an in-process map, not a pluggable backend — so this
//! is borrowed from the git-next example instead, per DESIGN.md).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use neurostore_core::error::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A soft rate limit expressed as ops/s with a burst allowance (spec.md
/// §4.2).
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Sustained operations per second.
    pub ops_per_sec: u32,
    /// Burst allowance above the sustained rate.
    pub burst: u32,
}

/// Batch I/O tuning a backend advertises to the storage engine (spec.md
/// §4.2, §4.6: "adapter-aware batch config").
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Maximum number of keys per batch call.
    pub max_batch_size: usize,
    /// Delay inserted between consecutive batches.
    pub inter_batch_delay: Duration,
    /// Maximum concurrent batch calls in flight.
    pub max_concurrency: usize,
    /// Whether concurrent/parallel writes are safe against this backend.
    pub parallel_writes_safe: bool,
    /// Soft rate limit, if the backend enforces one.
    pub rate_limit: Option<RateLimit>,
    /// True if this backend talks to a remote/cloud service (used to pick
    /// HNSW persistence mode defaults, spec.md §4.9).
    pub is_cloud: bool,
}

impl BatchConfig {
    /// Defaults appropriate for an in-process/local backend: large
    /// batches, no delay, high concurrency, parallel writes safe.
    pub fn local() -> Self {
        Self {
            max_batch_size: 1000,
            inter_batch_delay: Duration::ZERO,
            max_concurrency: 32,
            parallel_writes_safe: true,
            rate_limit: None,
            is_cloud: false,
        }
    }

    /// Conservative defaults for a remote/cloud-style backend.
    pub fn cloud() -> Self {
        Self {
            max_batch_size: 100,
            inter_batch_delay: Duration::from_millis(10),
            max_concurrency: 8,
            parallel_writes_safe: false,
            rate_limit: Some(RateLimit {
                ops_per_sec: 200,
                burst: 50,
            }),
            is_cloud: true,
        }
    }
}

/// Primitive operations over a path-addressed object store (spec.md
/// §4.2). Implementations MUST be deterministic for a given `(path,
/// bytes)` and MUST reject writes when read-only (spec.md §6).
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Write `bytes` at `path`, creating or overwriting it.
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read the bytes at `path`, or [`Error::NotFound`] if absent.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete `path`. A no-op (not an error) if it does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// List all paths under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Batch-read multiple paths; missing paths are simply absent from the
    /// returned map (mirrors spec.md §4.13 `batch_get` partial-map
    /// semantics).
    async fn batch_read(&self, paths: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::with_capacity(paths.len());
        for p in paths {
            if let Ok(bytes) = self.read(p).await {
                out.insert(p.clone(), bytes);
            }
        }
        Ok(out)
    }

    /// Whether this backend is local (filesystem/memory) or talks to a
    /// remote/cloud service.
    fn is_cloud(&self) -> bool {
        self.batch_config().is_cloud
    }

    /// Batch I/O tuning this backend advertises (spec.md §4.2).
    fn batch_config(&self) -> BatchConfig;

    /// Whether writes are currently accepted (false for `as_of` read-only
    /// snapshots, spec.md §4.11).
    fn is_read_only(&self) -> bool {
        false
    }
}

/// In-memory backend. Classifies as local.
#[derive(Default)]
pub struct MemoryBackend {
    data: Arc<DashMap<String, Vec<u8>>>,
    read_only: bool,
}

impl MemoryBackend {
    /// A fresh, empty, writable backend.
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            read_only: false,
        }
    }

    /// A read-only view sharing the same underlying map (used by
    /// `as_of`, spec.md §4.11).
    pub fn read_only_view(&self) -> Self {
        Self {
            data: self.data.clone(),
            read_only: true,
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlySnapshot);
        }
        self.data.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.data
            .get(path)
            .map(|v| v.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlySnapshot);
        }
        self.data.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    fn batch_config(&self) -> BatchConfig {
        BatchConfig::local()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Local filesystem backend rooted at a directory. Classifies as local.
pub struct LocalFsBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalFsBackend {
    /// Root the backend at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            read_only: false,
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlySnapshot);
        }
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&full).await?;
        file.write_all(&bytes).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|_| Error::NotFound(path.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlySnapshot);
        }
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let dir = self.resolve(prefix);
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn batch_config(&self) -> BatchConfig {
        BatchConfig::local()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_round_trips() {
        let b = MemoryBackend::new();
        b.write("a/b.json", b"hi".to_vec()).await.unwrap();
        assert_eq!(b.read("a/b.json").await.unwrap(), b"hi".to_vec());
        assert!(b.read("missing").await.is_err());
    }

    #[tokio::test]
    async fn memory_backend_list_prefix() {
        let b = MemoryBackend::new();
        b.write("x/1", vec![1]).await.unwrap();
        b.write("x/2", vec![2]).await.unwrap();
        b.write("y/1", vec![3]).await.unwrap();
        let mut listed = b.list("x/").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["x/1".to_string(), "x/2".to_string()]);
    }

    #[tokio::test]
    async fn read_only_view_rejects_writes() {
        let b = MemoryBackend::new();
        b.write("k", vec![1]).await.unwrap();
        let ro = b.read_only_view();
        assert_eq!(ro.read("k").await.unwrap(), vec![1]);
        assert!(matches!(
            ro.write("k", vec![2]).await,
            Err(Error::ReadOnlySnapshot)
        ));
    }

    #[tokio::test]
    async fn local_fs_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let b = LocalFsBackend::new(dir.path()).unwrap();
        b.write("a/b/c.json", b"payload".to_vec()).await.unwrap();
        assert_eq!(b.read("a/b/c.json").await.unwrap(), b"payload".to_vec());
        b.delete("a/b/c.json").await.unwrap();
        assert!(b.read("a/b/c.json").await.is_err());
        // deleting again is a no-op
        b.delete("a/b/c.json").await.unwrap();
    }
}
