//! The git-like COW commit layer (spec.md §4.11).
//!
//! `refs` stores branch pointers; `tree` and `commit` are the two
//! content-addressed object kinds a branch's history is built from;
//! `log` walks that history; `branch` ties the three together into
//! [`branch::CommitLayer`], the type `api.rs` drives directly.

pub mod branch;
pub mod commit;
pub mod log;
pub mod refs;
pub mod tree;

pub use branch::{BranchState, CommitLayer, HistoricalView};
pub use commit::{Commit, CommitBuilder, CommitStore};
pub use log::{CommitHistoryStream, CommitLog};
pub use refs::{RefManager, RefRecord};
pub use tree::{Tree, TreeEntry, TreeEntryKind};
