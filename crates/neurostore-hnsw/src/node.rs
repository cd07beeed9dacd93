//! Graph node and scored-candidate types (spec.md §4.9).
//!
//! Grounded on `crates/engine/src/primitives/vector/hnsw.rs`'s
//! `HnswNode`/`ScoredId`: `BTreeSet` neighbor lists per layer for
//! deterministic iteration, and a tie-break ordering on ties.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use neurostore_core::NounId;

/// A node in the HNSW graph.
///
/// Unlike the teacher's `HnswNode`, which is graph-only and reads
/// embeddings from a separate `VectorHeap`, this node also owns its
/// vector: spec.md §6 persists the noun-vector object as
/// `{id, vector, connections, level}` in one record, so keeping them
/// together here avoids a second lookup structure with no counterpart
/// in the persisted format.
#[derive(Debug, Clone)]
pub struct HnswNode {
    /// The node's embedding.
    pub vector: Vec<f32>,
    /// Neighbors per layer: `neighbors[layer]` is the set of neighbor ids.
    pub neighbors: Vec<BTreeSet<NounId>>,
    /// Highest layer this node participates in.
    pub max_layer: usize,
    /// Logical insertion timestamp (ms since epoch).
    pub created_at: u64,
}

impl HnswNode {
    /// Construct a fresh node with empty neighbor sets at every layer up
    /// to and including `max_layer`.
    pub fn new(vector: Vec<f32>, max_layer: usize, created_at: u64) -> Self {
        let neighbors = (0..=max_layer).map(|_| BTreeSet::new()).collect();
        Self {
            vector,
            neighbors,
            max_layer,
            created_at,
        }
    }
}

/// A candidate id scored by distance to some query, ordered so that a
/// `BinaryHeap<ScoredId>` pops the *nearest* candidate first (lower
/// distance) and `BinaryHeap<Reverse<ScoredId>>` pops the *worst*
/// result first (for O(1) eviction from a bounded result set).
///
/// Ties are broken by lower id winning, matching the teacher's
/// deterministic tie-break.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    /// Distance to the query (lower is closer).
    pub distance: f32,
    /// Candidate node id.
    pub id: NounId,
}

impl Eq for ScoredId {}

impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller distance is "Greater" so a max-heap surfaces the
        // nearest candidate first.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}
