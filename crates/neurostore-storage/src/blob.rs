//! Content-addressed immutable blob storage (spec.md §4.1).

use std::sync::Arc;

use neurostore_core::error::Result;
use neurostore_core::hash::{ObjectHash, NULL_HASH};

use crate::backend::ObjectBackend;

/// Blobs larger than this are zstd-compressed on write (SPEC_FULL.md §4.1).
const COMPRESS_THRESHOLD: usize = 4096;

/// Magic byte prefixed to compressed blobs so `read` can transparently
/// decompress.
const ZSTD_MAGIC: u8 = 0xA1;
const RAW_MAGIC: u8 = 0xA0;

/// Content-addressed, immutable byte storage over an [`ObjectBackend`].
/// Deduplicates by hash: writing the same bytes twice is idempotent and
/// never double-stores (spec.md §4.1).
pub struct BlobStore {
    backend: Arc<dyn ObjectBackend>,
}

impl BlobStore {
    /// Build a blob store over `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    fn path_for(hash: &ObjectHash) -> String {
        format!("_cow/blobs/{}/{}", hash.prefix(), hash.to_hex())
    }

    /// Write `bytes`, returning the content hash. `NULL_HASH` bytes (empty
    /// slice) are never sent to the backend.
    pub async fn write(&self, bytes: &[u8]) -> Result<ObjectHash> {
        let hash = ObjectHash::of(bytes);
        if hash == NULL_HASH || bytes.is_empty() {
            return Ok(NULL_HASH);
        }
        let path = Self::path_for(&hash);
        // Idempotent: if it already exists, don't rewrite (avoids
        // re-triggering compression work and keeps writes truly
        // deduplicated per spec.md §4.1).
        if self.backend.read(&path).await.is_ok() {
            return Ok(hash);
        }
        let encoded = if bytes.len() >= COMPRESS_THRESHOLD {
            let mut out = vec![ZSTD_MAGIC];
            out.extend(zstd::encode_all(bytes, 3).map_err(|e| {
                neurostore_core::error::Error::StorageError(format!("zstd encode: {e}"))
            })?);
            out
        } else {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(RAW_MAGIC);
            out.extend_from_slice(bytes);
            out
        };
        self.backend.write(&path, encoded).await?;
        Ok(hash)
    }

    /// Read the bytes for `hash`. `NULL_HASH` always reads as empty.
    pub async fn read(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        if *hash == NULL_HASH {
            return Ok(Vec::new());
        }
        let path = Self::path_for(hash);
        let raw = self.backend.read(&path).await?;
        let (magic, body) = raw.split_first().ok_or_else(|| {
            neurostore_core::error::Error::Fatal(format!("empty blob object at {path}"))
        })?;
        match *magic {
            RAW_MAGIC => Ok(body.to_vec()),
            ZSTD_MAGIC => zstd::decode_all(body).map_err(|e| {
                neurostore_core::error::Error::StorageError(format!("zstd decode: {e}"))
            }),
            other => Err(neurostore_core::error::Error::Fatal(format!(
                "unknown blob encoding magic {other:#x} at {path}"
            ))),
        }
    }

    /// True if `hash` is already stored.
    pub async fn contains(&self, hash: &ObjectHash) -> bool {
        if *hash == NULL_HASH {
            return true;
        }
        self.backend.read(&Self::path_for(hash)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn write_is_idempotent_and_round_trips() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new()));
        let h1 = store.write(b"hello world").await.unwrap();
        let h2 = store.write(b"hello world").await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.read(&h1).await.unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn null_hash_never_touches_backend() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new()));
        let h = store.write(b"").await.unwrap();
        assert_eq!(h, NULL_HASH);
        assert_eq!(store.read(&NULL_HASH).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn large_blob_round_trips_through_compression() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new()));
        let bytes = vec![42u8; COMPRESS_THRESHOLD * 4];
        let h = store.write(&bytes).await.unwrap();
        assert_eq!(store.read(&h).await.unwrap(), bytes);
    }
}
