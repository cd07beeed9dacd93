//! Branch state machine and instant fork (spec.md §4.11).
//!
//! Grounded on `gitnext-storage`'s ref-update-then-verify fork sequence,
//! generalized from "copy a commit pointer" to the three steps spec.md
//! §4.11 spells out: ensure an initial commit exists, copy the ref, then
//! verify the copy landed before handing the caller a sibling engine.

use std::sync::Arc;

use neurostore_core::error::{Error, Result};
use neurostore_core::hash::ObjectHash;
use neurostore_core::BranchName;
use neurostore_storage::blob::BlobStore;

use super::commit::{CommitBuilder, CommitStore};
use super::log::CommitLog;
use super::refs::RefManager;
use super::tree::{read_tree, Tree, TreeEntry};

/// Where a branch sits in its lifecycle (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// No commits yet; the branch has no ref.
    Unborn,
    /// Writable, sitting at `0`.
    Active(ObjectHash),
    /// Read-only, pinned to a historical commit (produced by `as_of`).
    Frozen(ObjectHash),
}

/// Bundles the ref/blob/commit machinery behind the operations spec.md
/// §4.11 names: `fork`, `commit`, `history`, and branch-state lookup.
/// Owns no entity/relationship state itself — that lives in the storage
/// engine and indexes this sits alongside (wired together in `api.rs`).
pub struct CommitLayer {
    refs: Arc<RefManager>,
    blobs: Arc<BlobStore>,
    commits: Arc<CommitStore>,
    log: CommitLog,
}

impl CommitLayer {
    /// Build a commit layer sharing `refs`/`blobs`/`commits` with the rest
    /// of the engine (all content-addressed, so sharing is always safe).
    pub fn new(refs: Arc<RefManager>, blobs: Arc<BlobStore>, commits: Arc<CommitStore>) -> Self {
        let log = CommitLog::new(commits.clone());
        Self {
            refs,
            blobs,
            commits,
            log,
        }
    }

    /// Current state of `branch`.
    pub async fn branch_state(&self, branch: &BranchName) -> Result<BranchState> {
        match self.refs.get_ref(branch).await? {
            Some(record) => Ok(BranchState::Active(record.commit)),
            None => Ok(BranchState::Unborn),
        }
    }

    /// Write a commit with an empty tree and the given parent, used both
    /// to give an unborn branch its first commit and for `commit` calls
    /// that don't capture state (spec.md §4.11: "captureState false ⇒
    /// commit with NULL_HASH tree").
    async fn commit_with_tree(
        &self,
        parent: Option<ObjectHash>,
        tree: ObjectHash,
        author: &str,
        message: &str,
        timestamp: i64,
        entity_count: u64,
        relationship_count: u64,
        meta: serde_json::Value,
    ) -> Result<ObjectHash> {
        let mut builder = CommitBuilder::new(tree, author, timestamp)
            .message(message)
            .counts(entity_count, relationship_count)
            .meta(meta);
        if let Some(parent) = parent {
            builder = builder.parent(parent);
        }
        builder.build(&self.commits).await
    }

    /// Record a commit on `branch`, advancing its ref. `tree` is
    /// `NULL_HASH` for a state-less commit.
    pub async fn commit(
        &self,
        branch: &BranchName,
        tree: ObjectHash,
        author: &str,
        message: &str,
        timestamp: i64,
        entity_count: u64,
        relationship_count: u64,
        meta: serde_json::Value,
    ) -> Result<ObjectHash> {
        let parent = match self.refs.get_ref(branch).await? {
            Some(record) => Some(record.commit),
            None => None,
        };
        let hash = self
            .commit_with_tree(
                parent,
                tree,
                author,
                message,
                timestamp,
                entity_count,
                relationship_count,
                meta,
            )
            .await?;
        self.refs
            .set_ref(branch, hash, timestamp, serde_json::Value::Null)
            .await?;
        Ok(hash)
    }

    /// Fork `source` into `dest` (spec.md §4.11 `fork`): ensure `source`
    /// has an initial commit, copy its ref, then verify the copy is
    /// actually visible before returning. Fails loudly — never leaves a
    /// half-created branch silently unborn.
    pub async fn fork(&self, source: &BranchName, dest: &BranchName, timestamp: i64) -> Result<ObjectHash> {
        if self.refs.get_ref(source).await?.is_none() {
            self.commit(
                source,
                neurostore_core::hash::NULL_HASH,
                "system",
                "initial commit",
                timestamp,
                0,
                0,
                serde_json::Value::Null,
            )
            .await?;
        }
        self.refs.copy_ref(source, dest).await?;
        let record = self
            .refs
            .get_ref(dest)
            .await?
            .ok_or_else(|| Error::ForkFailed(format!("ref for {dest} did not materialize")))?;
        Ok(record.commit)
    }

    /// Full ancestor history of `branch`'s current tip, newest first.
    pub async fn history(&self, branch: &BranchName) -> Result<Vec<super::commit::Commit>> {
        match self.refs.get_ref(branch).await? {
            Some(record) => self.log.history(record.commit).await,
            None => Ok(Vec::new()),
        }
    }

    /// Load the tree at `commit` as a read-only [`HistoricalView`] (spec.md
    /// §4.11 `as_of`).
    pub async fn historical_view(&self, commit: ObjectHash) -> Result<HistoricalView> {
        let commit_obj = self.commits.read(&commit).await?;
        let tree = read_tree(&self.blobs, &commit_obj.tree).await?;
        Ok(HistoricalView {
            blobs: self.blobs.clone(),
            tree,
        })
    }

    /// Access the shared ref manager (needed by `api.rs` for `checkout`).
    pub fn refs(&self) -> &Arc<RefManager> {
        &self.refs
    }

    /// Access the shared blob store (needed by `api.rs` to capture state
    /// at commit time).
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }
}

/// A read-only view over a commit's captured tree (spec.md §4.11 `as_of`:
/// "storage is a historical adapter reading from the tree, lazily and
/// with a bounded cache"). The bounded cache itself lives in the caller
/// (`api.rs`), since eviction policy is an engine-wide, not commit-layer,
/// concern; this type only knows how to resolve a key to its blob.
pub struct HistoricalView {
    blobs: Arc<BlobStore>,
    tree: Tree,
}

impl HistoricalView {
    /// Every key recorded in this commit's tree.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tree.keys().map(|k| k.as_str())
    }

    /// Look up the tree entry for `key`.
    pub fn entry(&self, key: &str) -> Option<&TreeEntry> {
        self.tree.get(key)
    }

    /// Load the bytes for `key`, if present.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.tree.get(key) else {
            return Ok(None);
        };
        Ok(Some(self.blobs.read(&entry.hash).await?))
    }

    /// Number of entries (entities + relations) captured in this view.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if this commit captured no state.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_storage::backend::MemoryBackend;

    fn branch(name: &str) -> BranchName {
        BranchName::new(name).unwrap()
    }

    fn layer() -> CommitLayer {
        let backend = Arc::new(MemoryBackend::new());
        CommitLayer::new(
            Arc::new(RefManager::new(backend.clone())),
            Arc::new(BlobStore::new(backend.clone())),
            Arc::new(CommitStore::new(backend)),
        )
    }

    #[tokio::test]
    async fn unborn_branch_reports_unborn_state() {
        let layer = layer();
        let state = layer.branch_state(&branch("main")).await.unwrap();
        assert_eq!(state, BranchState::Unborn);
    }

    #[tokio::test]
    async fn fork_creates_initial_commit_on_unborn_source() {
        let layer = layer();
        layer.fork(&branch("main"), &branch("exp"), 1000).await.unwrap();
        let main_state = layer.branch_state(&branch("main")).await.unwrap();
        let exp_state = layer.branch_state(&branch("exp")).await.unwrap();
        assert_eq!(main_state, exp_state);
        assert!(matches!(main_state, BranchState::Active(_)));
    }

    #[tokio::test]
    async fn fork_then_commit_on_child_does_not_move_parent() {
        let layer = layer();
        layer.fork(&branch("main"), &branch("exp"), 1000).await.unwrap();
        let before = layer.branch_state(&branch("main")).await.unwrap();

        layer
            .commit(
                &branch("exp"),
                neurostore_core::hash::NULL_HASH,
                "t",
                "child edit",
                2000,
                0,
                0,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let after = layer.branch_state(&branch("main")).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn history_lists_commits_newest_first() {
        let layer = layer();
        layer
            .commit(
                &branch("main"),
                neurostore_core::hash::NULL_HASH,
                "t",
                "first",
                1,
                0,
                0,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        layer
            .commit(
                &branch("main"),
                neurostore_core::hash::NULL_HASH,
                "t",
                "second",
                2,
                0,
                0,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        let history = layer.history(&branch("main")).await.unwrap();
        let messages: Vec<&str> = history.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "first"]);
    }
}
