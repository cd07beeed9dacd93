//! Transaction manager, git-like COW commit layer, query coordinator, and
//! the [`api::Database`] facade that wires them to the storage engine and
//! the three in-memory indexes (spec.md §4.10-§4.13).
//!
//! Lower crates in this workspace (`neurostore-core`, `neurostore-storage`,
//! `neurostore-index`, `neurostore-hnsw`) each own one piece of the
//! engine's state. This crate owns no state of its own beyond what
//! [`api::Database`] assembles at construction time; it is the layer that
//! makes those pieces behave like one consistent database.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod commit;
pub mod coordinator;
pub mod transaction;

pub use api::{AddInput, Database, SimilarTarget, Snapshot, UpdateInput};
pub use commit::{BranchState, Commit, CommitLayer, HistoricalView};
pub use coordinator::{Coordinator, FindPage, FindQuery, FusionConfig, FusionStrategy, FusionWeights, GraphConstraint, OrderBy};
pub use transaction::{Operation, Transaction};
