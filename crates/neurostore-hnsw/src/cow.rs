//! Copy-on-write overlay over a single [`HnswGraph`] (spec.md §4.9,
//! Design Notes §9 "Copy-on-write of the HNSW").
//!
//! No teacher or pack example implements arena COW (DESIGN.md); this is
//! designed directly from the spec's invariant: "the parent keeps
//! ownership of its arena; the fork keeps a reference plus a write
//! overlay per-node map that is consulted before the parent". Since
//! this graph has no separate insert-then-mutate step (a node's edges
//! only ever change as a side effect of some other node's `insert`, or
//! are chained through `delete`), the practical overlay granularity is
//! "does this id exist in the local graph" rather than "has this node's
//! specific field been copied" — any write to an id materializes the
//! whole node locally, simplifying the per-field copy-on-first-touch
//! scheme the spec sketches without changing its externally observable
//! behavior: the parent is never mutated by a child.
//!
//! The parent reference is itself a `CowHnswGraph`, not a plain
//! [`HnswGraph`], so forking a fork (branching off a branch) chains
//! correctly: each generation only ever sees the ids it, or an
//! ancestor, actually wrote, walking up the chain lazily on read.

use std::collections::HashSet;
use std::sync::Arc;

use neurostore_core::error::Result;
use neurostore_core::{DistanceMetric, NounId};
use parking_lot::RwLock;

use crate::index::{HnswConfig, HnswGraph};

/// A graph that may share a read-only parent and only ever writes to
/// its own local overlay.
pub struct CowHnswGraph {
    parent: Option<Arc<RwLock<CowHnswGraph>>>,
    local: HnswGraph,
    /// Ids tombstoned locally that still exist in the (unmodified) parent.
    tombstones: HashSet<NounId>,
}

impl CowHnswGraph {
    /// Build a graph with no parent: behaves exactly like a plain
    /// [`HnswGraph`].
    pub fn new(config: HnswConfig, metric: DistanceMetric, seed: Option<u64>) -> Self {
        Self {
            parent: None,
            local: HnswGraph::new(config, metric, seed),
            tombstones: HashSet::new(),
        }
    }

    /// Mark this graph as a COW child of `parent`. Called once, right
    /// after `fork()` creates the sibling engine (spec.md §4.11).
    pub fn enable_cow(&mut self, parent: Arc<RwLock<CowHnswGraph>>) {
        self.parent = Some(parent);
    }

    /// True if this graph has a parent it defers reads to.
    pub fn is_cow(&self) -> bool {
        self.parent.is_some()
    }

    /// Insert into the local overlay. A new write for an id that exists
    /// only in the parent shadows the parent's copy from then on.
    pub fn insert(&mut self, id: NounId, vector: Vec<f32>, created_at: u64) -> Result<()> {
        self.tombstones.remove(&id);
        self.local.insert(id, vector, created_at)
    }

    /// Delete `id`. If it only exists in the parent, records a local
    /// tombstone rather than touching the parent's arena.
    pub fn delete(&mut self, id: NounId) -> bool {
        let had_local = self.local.delete(id);
        if had_local {
            return true;
        }
        if let Some(parent) = &self.parent {
            if parent.read().contains(id) {
                self.tombstones.insert(id);
                return true;
            }
        }
        false
    }

    /// The vector stored for `id`, checked locally then in the parent
    /// (unless locally tombstoned). Returns an owned copy since the
    /// parent's borrow cannot outlive the lock guard taken here.
    pub fn get_vector(&self, id: NounId) -> Option<Vec<f32>> {
        if let Some(v) = self.local.get_vector(id) {
            return Some(v.to_vec());
        }
        if self.tombstones.contains(&id) {
            return None;
        }
        self.parent.as_ref().and_then(|p| p.read().get_vector(id))
    }

    /// The full node state for `id` (vector, per-layer connections,
    /// level), checked locally then in the parent, same resolution order
    /// as [`Self::get_vector`]. An owned clone for the same lock-guard
    /// lifetime reason. Used to persist `connections`/`level` alongside
    /// the vector (spec.md §6) rather than just the embedding.
    pub fn get_node(&self, id: NounId) -> Option<crate::node::HnswNode> {
        if let Some(node) = self.local.get_node(id) {
            return Some(node.clone());
        }
        if self.tombstones.contains(&id) {
            return None;
        }
        self.parent.as_ref().and_then(|p| p.read().get_node(id))
    }

    /// True if `id` is visible through this graph (local, and not
    /// locally tombstoned if only present in the parent).
    pub fn contains(&self, id: NounId) -> bool {
        if self.local.contains(id) {
            return true;
        }
        if self.tombstones.contains(&id) {
            return false;
        }
        self.parent
            .as_ref()
            .map(|p| p.read().contains(id))
            .unwrap_or(false)
    }

    /// Search the local overlay and, if present, the parent, merging by
    /// distance and excluding ids shadowed locally (inserted or
    /// tombstoned).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NounId, f32)>> {
        let mut results = self.local.search(query, k)?;
        if let Some(parent) = &self.parent {
            let parent_results = parent.read().search(query, k + self.tombstones.len())?;
            for (id, distance) in parent_results {
                if self.local.contains(id) || self.tombstones.contains(&id) {
                    continue;
                }
                results.push((id, distance));
            }
        }
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Live node count: local nodes plus parent nodes not shadowed or
    /// tombstoned.
    pub fn len(&self) -> usize {
        let local_len = self.local.len();
        let parent_extra = self
            .parent
            .as_ref()
            .map(|p| {
                p.read()
                    .iter()
                    .filter(|(id, _)| !self.local.contains(**id) && !self.tombstones.contains(id))
                    .count()
            })
            .unwrap_or(0);
        local_len + parent_extra
    }

    /// True if no nodes are visible through this graph.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_graph(id: NounId) -> Arc<RwLock<CowHnswGraph>> {
        let mut g = CowHnswGraph::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(1));
        g.insert(id, vec![1.0, 0.0], 1).unwrap();
        Arc::new(RwLock::new(g))
    }

    #[test]
    fn fork_sees_parent_nodes_until_write() {
        let parent_id = NounId::new();
        let parent = parent_graph(parent_id);

        let mut child = CowHnswGraph::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(1));
        child.enable_cow(parent.clone());
        assert!(child.contains(parent_id));

        let results = child.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0, parent_id);
    }

    #[test]
    fn write_in_child_does_not_affect_parent() {
        let parent = parent_graph(NounId::new());
        let before = parent.read().len();

        let mut child = CowHnswGraph::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(1));
        child.enable_cow(parent.clone());
        child.insert(NounId::new(), vec![5.0, 5.0], 2).unwrap();

        assert_eq!(parent.read().len(), before);
        assert_eq!(child.len(), before + 1);
    }

    #[test]
    fn delete_in_child_tombstones_without_touching_parent() {
        let parent_id = NounId::new();
        let parent = parent_graph(parent_id);

        let mut child = CowHnswGraph::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(1));
        child.enable_cow(parent.clone());
        assert!(child.delete(parent_id));

        assert!(!child.contains(parent_id));
        assert!(parent.read().contains(parent_id));
    }
}
