//! Commit history traversal (spec.md §4.11).
//!
//! Grounded on `gitnext-storage`'s parent-chain walk for `git log`, and
//! on Design Notes §9's "coroutine-like APIs become streams... restartable
//! only by re-opening" for the streaming variant: [`CommitHistoryStream`]
//! is a plain `next()`-style struct rather than a real `futures::Stream`
//! impl, kept simple since nothing else in this crate needs combinator
//! support over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neurostore_core::error::Result;
use neurostore_core::hash::ObjectHash;

use super::commit::{Commit, CommitStore};

/// Walks a commit's ancestor chain (spec.md §4.11: "iterate history").
pub struct CommitLog {
    store: Arc<CommitStore>,
}

impl CommitLog {
    /// Build a commit log over `store`.
    pub fn new(store: Arc<CommitStore>) -> Self {
        Self { store }
    }

    /// Collect the full history from `tip` back to the root commit,
    /// newest first. Eager; prefer [`Self::stream`] for long histories
    /// where the caller may want to stop early.
    pub async fn history(&self, tip: ObjectHash) -> Result<Vec<Commit>> {
        let mut out = Vec::new();
        let mut next = Some(tip);
        while let Some(hash) = next {
            if hash.is_null() {
                break;
            }
            let commit = self.store.read(&hash).await?;
            next = commit.parent;
            out.push(commit);
        }
        Ok(out)
    }

    /// Open a streaming, cancellable walk from `tip` (spec.md §4.11,
    /// Design Notes §9).
    pub fn stream(&self, tip: ObjectHash) -> CommitHistoryStream {
        CommitHistoryStream {
            store: self.store.clone(),
            next: if tip.is_null() { None } else { Some(tip) },
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A cancellable, one-shot walk over a commit's ancestor chain. Calling
/// `next()` after `cancel()` always returns `None`; the stream cannot be
/// rewound — callers who need to restart re-open via [`CommitLog::stream`]
/// (Design Notes §9).
pub struct CommitHistoryStream {
    store: Arc<CommitStore>,
    next: Option<ObjectHash>,
    cancelled: Arc<AtomicBool>,
}

impl CommitHistoryStream {
    /// Fetch the next commit in the walk, or `None` if history is
    /// exhausted or the stream was cancelled.
    pub async fn next(&mut self) -> Option<Result<Commit>> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        let hash = self.next.take()?;
        match self.store.read(&hash).await {
            Ok(commit) => {
                self.next = commit.parent.filter(|p| !p.is_null());
                Some(Ok(commit))
            }
            Err(e) => {
                self.cancelled.store(true, Ordering::Release);
                Some(Err(e))
            }
        }
    }

    /// Stop the walk. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::commit::CommitBuilder;
    use neurostore_core::hash::NULL_HASH;
    use neurostore_storage::backend::MemoryBackend;

    async fn three_commit_chain() -> (Arc<CommitStore>, ObjectHash) {
        let store = Arc::new(CommitStore::new(Arc::new(MemoryBackend::new())));
        let c1 = CommitBuilder::new(NULL_HASH, "t", 1)
            .message("first")
            .build(&store)
            .await
            .unwrap();
        let c2 = CommitBuilder::new(NULL_HASH, "t", 2)
            .parent(c1)
            .message("second")
            .build(&store)
            .await
            .unwrap();
        let c3 = CommitBuilder::new(NULL_HASH, "t", 3)
            .parent(c2)
            .message("third")
            .build(&store)
            .await
            .unwrap();
        (store, c3)
    }

    #[tokio::test]
    async fn history_walks_full_chain_newest_first() {
        let (store, tip) = three_commit_chain().await;
        let log = CommitLog::new(store);
        let history = log.history(tip).await.unwrap();
        let messages: Vec<&str> = history.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn stream_yields_same_order_as_history() {
        let (store, tip) = three_commit_chain().await;
        let log = CommitLog::new(store);
        let mut stream = log.stream(tip);
        let mut messages = Vec::new();
        while let Some(commit) = stream.next().await {
            messages.push(commit.unwrap().message);
        }
        assert_eq!(messages, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn cancelled_stream_yields_nothing_further() {
        let (store, tip) = three_commit_chain().await;
        let log = CommitLog::new(store);
        let mut stream = log.stream(tip);
        stream.next().await;
        stream.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn history_of_null_tip_is_empty() {
        let store = Arc::new(CommitStore::new(Arc::new(MemoryBackend::new())));
        let log = CommitLog::new(store);
        assert!(log.history(NULL_HASH).await.unwrap().is_empty());
    }
}
