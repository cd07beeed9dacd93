//! Branch ref storage (spec.md §4.11).
//!
//! Grounded on `gitnext-storage::StorageBackend`'s `read_ref`/`update_ref`/
//! `delete_ref`/`list_refs` quartet, adapted from that trait's own
//! backend-agnostic path scheme onto this crate's [`ObjectBackend`]. A ref
//! is a small JSON record rather than a bare hash so `set_ref` can carry
//! caller metadata (spec.md §4.11: "`set_ref(branch, commit_hash, meta)`").

use std::sync::Arc;

use neurostore_core::error::{Error, Result};
use neurostore_core::hash::ObjectHash;
use neurostore_core::BranchName;
use neurostore_storage::backend::ObjectBackend;
use serde::{Deserialize, Serialize};

fn ref_path(branch: &BranchName) -> String {
    format!("_cow/refs/{}.json", branch.as_str())
}

/// The record stored at a branch ref: which commit it points at, plus
/// caller-supplied metadata (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefRecord {
    /// The commit this branch currently points at.
    pub commit: ObjectHash,
    /// Last time this ref was updated, Unix epoch milliseconds.
    pub updated_at: i64,
    /// Caller-supplied metadata (e.g. who created the branch, and why).
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// CRUD over branch refs (spec.md §4.11).
pub struct RefManager {
    backend: Arc<dyn ObjectBackend>,
}

impl RefManager {
    /// Build a ref manager over `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Read the ref record for `branch`, or `None` if the branch is
    /// unborn (spec.md §4.11's `Unborn` branch state).
    pub async fn get_ref(&self, branch: &BranchName) -> Result<Option<RefRecord>> {
        match self.backend.read(&ref_path(branch)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Point `branch` at `commit`, recording `meta` and the current time.
    pub async fn set_ref(
        &self,
        branch: &BranchName,
        commit: ObjectHash,
        updated_at: i64,
        meta: serde_json::Value,
    ) -> Result<()> {
        let record = RefRecord {
            commit,
            updated_at,
            meta,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.backend.write(&ref_path(branch), bytes).await
    }

    /// Copy `src`'s ref record to `dst` (spec.md §4.11: "the primitive
    /// behind instant fork"). Fails if `src` is unborn or `dst` already
    /// exists — `fork` must never silently clobber an existing branch.
    pub async fn copy_ref(&self, src: &BranchName, dst: &BranchName) -> Result<()> {
        let Some(record) = self.get_ref(src).await? else {
            return Err(Error::ForkFailed(format!("source branch {src} is unborn")));
        };
        if self.get_ref(dst).await?.is_some() {
            return Err(Error::ForkFailed(format!(
                "destination branch {dst} already exists"
            )));
        }
        let bytes = serde_json::to_vec(&record)?;
        self.backend.write(&ref_path(dst), bytes).await
    }

    /// Delete `branch`'s ref. A no-op if it was already unborn.
    pub async fn delete_ref(&self, branch: &BranchName) -> Result<()> {
        self.backend.delete(&ref_path(branch)).await
    }

    /// List every branch with a ref, in lexicographic order.
    pub async fn list_refs(&self) -> Result<Vec<BranchName>> {
        let prefix = "_cow/refs/";
        let paths = self.backend.list(prefix).await?;
        let mut names = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(rest) = path.strip_prefix(prefix).and_then(|s| s.strip_suffix(".json")) {
                if let Ok(name) = BranchName::new(rest) {
                    names.push(name);
                }
            }
        }
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_storage::backend::MemoryBackend;

    fn branch(name: &str) -> BranchName {
        BranchName::new(name).unwrap()
    }

    #[tokio::test]
    async fn unborn_branch_has_no_ref() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        assert!(refs.get_ref(&branch("main")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        let hash = ObjectHash::of(b"commit-1");
        refs.set_ref(&branch("main"), hash, 1000, serde_json::json!({"by": "t"}))
            .await
            .unwrap();
        let record = refs.get_ref(&branch("main")).await.unwrap().unwrap();
        assert_eq!(record.commit, hash);
        assert_eq!(record.updated_at, 1000);
    }

    #[tokio::test]
    async fn copy_ref_fails_on_unborn_source() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        let err = refs.copy_ref(&branch("main"), &branch("exp")).await.unwrap_err();
        assert!(matches!(err, Error::ForkFailed(_)));
    }

    #[tokio::test]
    async fn copy_ref_fails_if_destination_exists() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        let hash = ObjectHash::of(b"commit-1");
        refs.set_ref(&branch("main"), hash, 1, serde_json::Value::Null)
            .await
            .unwrap();
        refs.set_ref(&branch("exp"), hash, 1, serde_json::Value::Null)
            .await
            .unwrap();
        let err = refs.copy_ref(&branch("main"), &branch("exp")).await.unwrap_err();
        assert!(matches!(err, Error::ForkFailed(_)));
    }

    #[tokio::test]
    async fn copy_ref_then_list_shows_both_branches() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        let hash = ObjectHash::of(b"commit-1");
        refs.set_ref(&branch("main"), hash, 1, serde_json::Value::Null)
            .await
            .unwrap();
        refs.copy_ref(&branch("main"), &branch("exp")).await.unwrap();
        let mut names: Vec<String> = refs
            .list_refs()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.as_str().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["exp".to_string(), "main".to_string()]);
    }

    #[tokio::test]
    async fn delete_ref_is_idempotent() {
        let refs = RefManager::new(Arc::new(MemoryBackend::new()));
        refs.delete_ref(&branch("main")).await.unwrap();
        refs.set_ref(&branch("main"), ObjectHash::of(b"x"), 1, serde_json::Value::Null)
            .await
            .unwrap();
        refs.delete_ref(&branch("main")).await.unwrap();
        assert!(refs.get_ref(&branch("main")).await.unwrap().is_none());
    }
}
