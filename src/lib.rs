//! # neurostore
//!
//! An embedded neural database: a single-process library that stores
//! entities ("nouns") and relationships ("verbs"), each carrying a dense
//! vector embedding plus user metadata, and answers queries that combine
//! approximate nearest-neighbor search, secondary-index lookup over
//! metadata, and graph traversal over the verb graph.
//!
//! # Quick start
//!
//! ```no_run
//! use neurostore::{AddInput, Database, EngineConfig};
//!
//! # async fn run() -> neurostore::Result<()> {
//! let db = Database::open(EngineConfig::default()).await?;
//!
//! let alpha = db.add("PERSON", AddInput { vector: vec![1.0, 0.0, 0.0], ..Default::default() }).await?;
//! let beta = db.add("PERSON", AddInput { vector: vec![0.0, 1.0, 0.0], ..Default::default() }).await?;
//! db.relate(alpha.id, "KNOWS", beta.id, 1.0, Default::default()).await?;
//!
//! let hit = db.get("PERSON", alpha.id).await?;
//! assert!(hit.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! [`Database`] is the sole entry point; all reads and writes go through
//! it. It composes five crates, each owning one subsystem (spec.md §2):
//!
//! | Crate | Owns |
//! |---|---|
//! | `neurostore-core` | domain types, errors, config, limits |
//! | `neurostore-storage` | blob store, object backend, caching, write buffering, the sharded storage engine |
//! | `neurostore-index` | metadata inverted index, graph adjacency index |
//! | `neurostore-hnsw` | the HNSW vector index (typed dispatch, COW, deferred persistence) |
//! | `neurostore-engine` | transaction manager, COW commit layer, query coordinator, `Database` |
//!
//! Only the surface re-exported here is stable; the crates above are
//! implementation details and may change shape between minor versions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use neurostore_core::config::StorageBackendConfig;
pub use neurostore_core::error::{Error, Result};
pub use neurostore_core::hash::{ObjectHash, NULL_HASH};
pub use neurostore_core::value::{MetadataMap, MetadataValue};
pub use neurostore_core::{
    BranchName, CancellationToken, DistanceMetric, EngineConfig, IndexConfig, Limits, Noun,
    NounId, PersistenceMode, TypeRegistry, TypeTag, Verb, VerbId, FORMAT_VERSION,
};

pub use neurostore_index::graph::Direction;
pub use neurostore_index::metadata::{FieldFilter, Filter, Predicate, SortDirection};

pub use neurostore_engine::api::{AddInput, Database, Snapshot, SimilarTarget, UpdateInput};
pub use neurostore_engine::commit::{BranchState, Commit, HistoricalView};
pub use neurostore_engine::coordinator::{
    FindPage, FindQuery, FusionConfig, FusionStrategy, FusionWeights, GraphConstraint, OrderBy,
    Source,
};
