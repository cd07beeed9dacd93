//! Commit objects (spec.md §4.11).
//!
//! Grounded on `gitnext-core`'s commit-hashing approach: hash the
//! canonical JSON bytes of the commit's fields with BLAKE3. `serde_json`
//! serializes `serde_json::Value` maps as a `BTreeMap` by default (the
//! `preserve_order` feature, which would switch to insertion order, is
//! not enabled anywhere in this workspace — see DESIGN.md), so converting
//! through `serde_json::to_value` before hashing is sufficient to get
//! deterministic, sorted-key bytes without any bespoke canonicalization.

use std::sync::Arc;

use neurostore_core::error::{Error, Result};
use neurostore_core::hash::ObjectHash;
use neurostore_core::FORMAT_VERSION;
use neurostore_storage::backend::ObjectBackend;
use serde::{Deserialize, Serialize};

/// A single point in a branch's history (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Format version this record was written with.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Hash of the [`crate::commit::tree::Tree`] this commit captures.
    /// [`neurostore_core::hash::NULL_HASH`] if this commit did not
    /// capture entity/relationship state (spec.md §4.11:
    /// "`captureState` false ⇒ commit with `NULL_HASH` tree").
    pub tree: ObjectHash,
    /// Parent commit, or `None` for the first commit on a branch.
    pub parent: Option<ObjectHash>,
    /// Free-form author string.
    pub author: String,
    /// Commit message.
    pub message: String,
    /// Commit time, Unix epoch milliseconds.
    pub timestamp: i64,
    /// Number of entities captured in `tree` (0 if not captured).
    pub entity_count: u64,
    /// Number of relationships captured in `tree` (0 if not captured).
    pub relationship_count: u64,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub meta: serde_json::Value,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Commit {
    /// Canonical bytes hashed to produce this commit's [`ObjectHash`].
    /// Identical fields always hash identically, regardless of how the
    /// struct was constructed.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Content hash of this commit.
    pub fn hash(&self) -> Result<ObjectHash> {
        Ok(ObjectHash::of(&self.canonical_bytes()?))
    }
}

/// Builds a [`Commit`] and writes it to a [`CommitStore`] (spec.md §4.11:
/// "`CommitBuilder`: tree-hash, parent-hash (optional), author, message,
/// timestamp, entity/relationship counts, custom meta").
pub struct CommitBuilder {
    tree: ObjectHash,
    parent: Option<ObjectHash>,
    author: String,
    message: String,
    timestamp: i64,
    entity_count: u64,
    relationship_count: u64,
    meta: serde_json::Value,
}

impl CommitBuilder {
    /// Start building a commit with its required fields.
    pub fn new(tree: ObjectHash, author: impl Into<String>, timestamp: i64) -> Self {
        Self {
            tree,
            parent: None,
            author: author.into(),
            message: String::new(),
            timestamp,
            entity_count: 0,
            relationship_count: 0,
            meta: serde_json::Value::Null,
        }
    }

    /// Set the parent commit.
    pub fn parent(mut self, parent: ObjectHash) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the commit message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the captured entity/relationship counts.
    pub fn counts(mut self, entity_count: u64, relationship_count: u64) -> Self {
        self.entity_count = entity_count;
        self.relationship_count = relationship_count;
        self
    }

    /// Set caller-supplied metadata.
    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    /// Finish building: assemble the [`Commit`], write it to `store`, and
    /// return its hash.
    pub async fn build(self, store: &CommitStore) -> Result<ObjectHash> {
        let commit = Commit {
            format_version: FORMAT_VERSION,
            tree: self.tree,
            parent: self.parent,
            author: self.author,
            message: self.message,
            timestamp: self.timestamp,
            entity_count: self.entity_count,
            relationship_count: self.relationship_count,
            meta: self.meta,
        };
        store.write(&commit).await
    }
}

fn commit_path(hash: &ObjectHash) -> String {
    format!("_cow/commits/{}.json", hash.to_hex())
}

/// Content-addressed storage for [`Commit`] objects.
pub struct CommitStore {
    backend: Arc<dyn ObjectBackend>,
}

impl CommitStore {
    /// Build a commit store over `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Write `commit`, returning its content hash. Idempotent: writing the
    /// same commit twice returns the same hash without duplicating state.
    pub async fn write(&self, commit: &Commit) -> Result<ObjectHash> {
        let hash = commit.hash()?;
        let bytes = serde_json::to_vec(commit)?;
        self.backend.write(&commit_path(&hash), bytes).await?;
        Ok(hash)
    }

    /// Read the commit at `hash`. Rejects a format version newer than
    /// this build understands rather than guessing at compatibility.
    pub async fn read(&self, hash: &ObjectHash) -> Result<Commit> {
        let bytes = self.backend.read(&commit_path(hash)).await?;
        let commit: Commit = serde_json::from_slice(&bytes)?;
        if commit.format_version > FORMAT_VERSION {
            return Err(Error::Fatal(format!(
                "commit {hash} has format_version {} newer than this build's {FORMAT_VERSION}",
                commit.format_version
            )));
        }
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_core::hash::NULL_HASH;
    use neurostore_storage::backend::MemoryBackend;

    #[tokio::test]
    async fn build_and_read_round_trips() {
        let store = CommitStore::new(Arc::new(MemoryBackend::new()));
        let hash = CommitBuilder::new(NULL_HASH, "tester", 1000)
            .message("initial commit")
            .counts(0, 0)
            .build(&store)
            .await
            .unwrap();
        let commit = store.read(&hash).await.unwrap();
        assert_eq!(commit.author, "tester");
        assert_eq!(commit.message, "initial commit");
        assert!(commit.parent.is_none());
    }

    #[tokio::test]
    async fn identical_commits_hash_identically() {
        let store = CommitStore::new(Arc::new(MemoryBackend::new()));
        let h1 = CommitBuilder::new(NULL_HASH, "tester", 1000)
            .message("m")
            .build(&store)
            .await
            .unwrap();
        let h2 = CommitBuilder::new(NULL_HASH, "tester", 1000)
            .message("m")
            .build(&store)
            .await
            .unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn reading_a_future_format_version_fails_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CommitStore::new(backend.clone());
        let mut commit = Commit {
            format_version: FORMAT_VERSION,
            tree: NULL_HASH,
            parent: None,
            author: "t".into(),
            message: "m".into(),
            timestamp: 1,
            entity_count: 0,
            relationship_count: 0,
            meta: serde_json::Value::Null,
        };
        commit.format_version = FORMAT_VERSION + 1;
        let hash = commit.hash().unwrap();
        let bytes = serde_json::to_vec(&commit).unwrap();
        backend.write(&commit_path(&hash), bytes).await.unwrap();
        let err = store.read(&hash).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
