//! HNSW approximate nearest-neighbor index for neurostore (spec.md §4.9)
//!
//! - [`node`]: graph node and scored-candidate types
//! - [`index`]: a single collection's HNSW graph (insert/delete/search)
//! - [`typed`]: one sub-index per noun type, dispatched by [`TypeSelector`]
//! - [`cow`]: copy-on-write overlay used by `fork`
//! - [`persistence`]: dirty-tracking for immediate/deferred flush policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cow;
pub mod index;
pub mod node;
pub mod persistence;
pub mod typed;

pub use cow::CowHnswGraph;
pub use index::{HnswConfig, HnswGraph};
pub use node::{HnswNode, ScoredId};
pub use persistence::{derive_default_mode, DirtyTracker};
pub use typed::{TypeSelector, TypedHnswIndex};
