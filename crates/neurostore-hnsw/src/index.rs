//! Core single-collection HNSW graph (spec.md §4.9).
//!
//! Directly grounded on
//! `crates/engine/src/primitives/vector/hnsw.rs`'s `HnswGraph`: greedy
//! descent from the entry point down to layer 1, beam search
//! (`search_layer`) at the target layer, and the paper's Algorithm 1
//! insertion procedure with neighbor pruning. Two deliberate departures
//! from the teacher, both spec-driven:
//!
//! - distance (lower is better) replaces similarity (higher is better)
//!   throughout, since `neurostore_core::distance` exposes distances;
//!   the candidate/result heap orderings in [`crate::node::ScoredId`]
//!   are flipped accordingly but the algorithm shape is identical.
//! - `delete` performs the graph surgery spec.md §4.9 asks for (strip
//!   the node from its neighbors' adjacency sets at every layer) rather
//!   than the teacher's soft-delete-and-filter; this is the teacher's
//!   own `remove_node` (used there for updates), promoted here to be
//!   the only delete path because the spec does not ask for tombstoned
//!   search filtering on top of it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use neurostore_core::distance::resolve as resolve_metric;
use neurostore_core::error::Result;
use neurostore_core::{DistanceMetric, Limits, NounId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::node::{HnswNode, ScoredId};

/// HNSW graph tuning (spec.md §4.9, bounds in spec.md §6).
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Max connections per node per non-entry layer.
    pub m: usize,
    /// Build-time beam width.
    pub ef_construction: usize,
    /// Query-time beam width.
    pub ef_search: usize,
    /// Level multiplier `1 / ln(m)`.
    pub ml: f64,
}

impl HnswConfig {
    /// Build a config from `core::config::IndexConfig`, validating bounds.
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Result<Self> {
        Limits::check_m(m)?;
        Limits::check_ef(ef_construction, "ef_construction")?;
        Limits::check_ef(ef_search, "ef_search")?;
        Ok(Self {
            m,
            ef_construction,
            ef_search,
            ml: 1.0 / (m as f64).ln(),
        })
    }

    fn max_connections_layer0(&self) -> usize {
        self.m * 2
    }

    fn max_connections(&self) -> usize {
        self.m
    }
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::new(16, 200, 50).expect("default HNSW config is within bounds")
    }
}

/// A single HNSW graph over one collection of vectors.
///
/// Addressed by [`NounId`] directly rather than an arena index with a
/// side table (Design Notes §9's "cyclic structures" recommendation):
/// `BTreeMap<NounId, HnswNode>` already gives the teacher's determinism
/// property (sorted iteration) without a second id-to-index mapping,
/// since neurostore's ids are content-stable UUIDs rather than
/// reused slot indices.
pub struct HnswGraph {
    config: HnswConfig,
    metric: DistanceMetric,
    nodes: BTreeMap<NounId, HnswNode>,
    entry_point: Option<NounId>,
    max_level: usize,
    dimension: Option<usize>,
    rng: StdRng,
}

impl HnswGraph {
    /// Build an empty graph. `seed` fixes level assignment for
    /// reproducible tests; pass `None` to seed from entropy.
    pub fn new(config: HnswConfig, metric: DistanceMetric, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            metric,
            nodes: BTreeMap::new(),
            entry_point: None,
            max_level: 0,
            dimension: None,
            rng,
        }
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fixed vector dimensionality, once established by the first insert.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// True if `id` is present.
    pub fn contains(&self, id: NounId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Borrow a node's vector, if present.
    pub fn get_vector(&self, id: NounId) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    /// Re-export the full node for persistence (spec.md §6 noun-vector
    /// object: `{id, vector, connections, level}`).
    pub fn get_node(&self, id: NounId) -> Option<&HnswNode> {
        self.nodes.get(&id)
    }

    /// Iterate all live `(id, node)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&NounId, &HnswNode)> {
        self.nodes.iter()
    }

    fn assign_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        (-uniform.ln() * self.config.ml) as usize
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        resolve_metric(self.metric).distance(a, b)
    }

    /// Insert `vector` under `id`. Rejects a dimension that disagrees
    /// with the dimension already established by an earlier insert.
    pub fn insert(&mut self, id: NounId, vector: Vec<f32>, created_at: u64) -> Result<()> {
        match self.dimension {
            Some(d) => Limits::check_dimension_match(d, vector.len())?,
            None => {
                Limits::check_dimension(vector.len())?;
                self.dimension = Some(vector.len());
            }
        }

        // Re-inserting an existing id (e.g. an `update`) removes the old
        // node and its edges first so the graph never holds two
        // generations of the same id.
        if self.nodes.contains_key(&id) {
            self.delete(id);
        }

        let level = self.assign_level();
        let node = HnswNode::new(vector.clone(), level, created_at);
        self.nodes.insert(id, node);

        let Some(entry_id) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return Ok(());
        };

        let mut current_entry = entry_id;
        if self.max_level > level {
            current_entry =
                self.greedy_search_to_layer(&vector, entry_id, self.max_level, level + 1);
        }

        let start_layer = level.min(self.max_level);
        for layer in (0..=start_layer).rev() {
            let candidates =
                self.search_layer(&vector, current_entry, self.config.ef_construction, layer);
            let selected = self.select_neighbors(&candidates, self.config.m);

            if let Some(new_node) = self.nodes.get_mut(&id) {
                if layer < new_node.neighbors.len() {
                    for &neighbor_id in &selected {
                        new_node.neighbors[layer].insert(neighbor_id);
                    }
                }
            }

            let max_conn = if layer == 0 {
                self.config.max_connections_layer0()
            } else {
                self.config.max_connections()
            };

            for &neighbor_id in &selected {
                let needs_prune = if let Some(neighbor_node) = self.nodes.get_mut(&neighbor_id) {
                    if layer < neighbor_node.neighbors.len() {
                        neighbor_node.neighbors[layer].insert(id);
                        neighbor_node.neighbors[layer].len() > max_conn
                    } else {
                        false
                    }
                } else {
                    false
                };
                if needs_prune {
                    self.prune_neighbors_for(neighbor_id, layer, max_conn);
                }
            }

            if let Some(closest) = candidates.first() {
                current_entry = closest.id;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(id);
            self.max_level = level;
        }
        Ok(())
    }

    /// Remove `id` and strip it from every neighbor's adjacency sets at
    /// each layer (spec.md §4.9). Returns `true` if the id was present.
    pub fn delete(&mut self, id: NounId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for (layer, neighbors) in node.neighbors.iter().enumerate() {
            for &neighbor_id in neighbors {
                if let Some(n) = self.nodes.get_mut(&neighbor_id) {
                    if layer < n.neighbors.len() {
                        n.neighbors[layer].remove(&id);
                    }
                }
            }
        }
        if self.entry_point == Some(id) {
            self.entry_point = self.nodes.keys().next().copied();
            self.max_level = self
                .nodes
                .values()
                .map(|n| n.max_layer)
                .max()
                .unwrap_or(0);
        }
        true
    }

    /// k-nearest neighbors of `query` by distance, ascending.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NounId, f32)>> {
        if let Some(d) = self.dimension {
            Limits::check_dimension_match(d, query.len())?;
        }
        if k == 0 || self.nodes.is_empty() {
            return Ok(Vec::new());
        }
        let Some(entry_id) = self.entry_point else {
            return Ok(Vec::new());
        };

        let mut current_entry = entry_id;
        if self.max_level > 0 {
            current_entry = self.greedy_search_to_layer(query, entry_id, self.max_level, 1);
        }

        let ef = self.config.ef_search.max(k);
        let candidates = self.search_layer(query, current_entry, ef, 0);
        Ok(candidates
            .into_iter()
            .take(k)
            .map(|s| (s.id, s.distance))
            .collect())
    }

    fn greedy_search_to_layer(
        &self,
        query: &[f32],
        entry_id: NounId,
        from_layer: usize,
        to_layer: usize,
    ) -> NounId {
        let mut current = entry_id;
        for layer in (to_layer..=from_layer).rev() {
            let mut improved = true;
            while improved {
                improved = false;
                let Some(current_node) = self.nodes.get(&current) else {
                    break;
                };
                let current_distance = self.distance(query, &current_node.vector);
                let mut best_distance = current_distance;
                let mut best_id = current;

                if layer < current_node.neighbors.len() {
                    for &neighbor_id in &current_node.neighbors[layer] {
                        if let Some(neighbor_node) = self.nodes.get(&neighbor_id) {
                            let d = self.distance(query, &neighbor_node.vector);
                            if d < best_distance || (d == best_distance && neighbor_id < best_id) {
                                best_distance = d;
                                best_id = neighbor_id;
                            }
                        }
                    }
                }

                if best_id != current {
                    current = best_id;
                    improved = true;
                }
            }
        }
        current
    }

    /// Beam search at a single layer (paper Algorithm 2). Returns up to
    /// `ef` closest nodes sorted by `(distance asc, id asc)`.
    fn search_layer(&self, query: &[f32], entry_id: NounId, ef: usize, layer: usize) -> Vec<ScoredId> {
        let Some(entry_node) = self.nodes.get(&entry_id) else {
            return Vec::new();
        };
        let entry_distance = self.distance(query, &entry_node.vector);

        let mut visited = BTreeSet::new();
        visited.insert(entry_id);

        let mut candidates = BinaryHeap::new();
        candidates.push(ScoredId {
            distance: entry_distance,
            id: entry_id,
        });

        let mut results: BinaryHeap<Reverse<ScoredId>> = BinaryHeap::new();
        results.push(Reverse(ScoredId {
            distance: entry_distance,
            id: entry_id,
        }));

        while let Some(nearest) = candidates.pop() {
            let worst_result = results.peek().map(|r| r.0.distance).unwrap_or(f32::INFINITY);
            if nearest.distance > worst_result && results.len() >= ef {
                break;
            }

            if let Some(node) = self.nodes.get(&nearest.id) {
                if layer < node.neighbors.len() {
                    for &neighbor_id in &node.neighbors[layer] {
                        if visited.contains(&neighbor_id) {
                            continue;
                        }
                        visited.insert(neighbor_id);

                        if let Some(neighbor_node) = self.nodes.get(&neighbor_id) {
                            let d = self.distance(query, &neighbor_node.vector);
                            let worst_result =
                                results.peek().map(|r| r.0.distance).unwrap_or(f32::INFINITY);

                            if results.len() < ef || d < worst_result {
                                candidates.push(ScoredId {
                                    distance: d,
                                    id: neighbor_id,
                                });
                                results.push(Reverse(ScoredId {
                                    distance: d,
                                    id: neighbor_id,
                                }));
                                if results.len() > ef {
                                    results.pop();
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut result_vec: Vec<ScoredId> = results.into_iter().map(|r| r.0).collect();
        result_vec.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        result_vec
    }

    fn select_neighbors(&self, candidates: &[ScoredId], max_connections: usize) -> Vec<NounId> {
        candidates.iter().take(max_connections).map(|s| s.id).collect()
    }

    fn prune_neighbors_for(&mut self, id: NounId, layer: usize, max_connections: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let vector = node.vector.clone();
        let neighbors: Vec<NounId> = if layer < node.neighbors.len() {
            node.neighbors[layer].iter().copied().collect()
        } else {
            return;
        };

        let mut scored: Vec<ScoredId> = neighbors
            .iter()
            .filter_map(|&nid| {
                self.nodes
                    .get(&nid)
                    .map(|n| ScoredId {
                        distance: self.distance(&vector, &n.vector),
                        id: nid,
                    })
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let keep: BTreeSet<NounId> = scored.iter().take(max_connections).map(|s| s.id).collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            if layer < node.neighbors.len() {
                node.neighbors[layer] = keep;
            }
        }
    }

    /// Rebuild from scratch given an iterator of `(id, vector, created_at)`
    /// triples, in the order provided (spec.md §4.9 "rebuild() streams
    /// nouns from storage and inserts them").
    pub fn rebuild<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (NounId, Vec<f32>, u64)>,
    {
        self.nodes.clear();
        self.entry_point = None;
        self.max_level = 0;
        self.dimension = None;
        for (id, vector, created_at) in entries {
            self.insert(id, vector, created_at)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HnswGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswGraph")
            .field("nodes", &self.nodes.len())
            .field("entry_point", &self.entry_point)
            .field("max_level", &self.max_level)
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_core::error::Error;

    fn graph() -> HnswGraph {
        HnswGraph::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(7))
    }

    #[test]
    fn insert_then_search_finds_exact_neighbor() {
        let mut g = graph();
        let x = NounId::new();
        let y = NounId::new();
        g.insert(x, vec![1.0, 0.0, 0.0], 1).unwrap();
        g.insert(y, vec![0.0, 1.0, 0.0], 2).unwrap();
        let results = g.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0, x);
    }

    #[test]
    fn delete_removes_node_and_edges() {
        let mut g = graph();
        let a = NounId::new();
        let b = NounId::new();
        let c = NounId::new();
        g.insert(a, vec![0.0, 0.0], 1).unwrap();
        g.insert(b, vec![1.0, 0.0], 2).unwrap();
        g.insert(c, vec![0.0, 1.0], 3).unwrap();
        assert!(g.delete(b));
        assert!(!g.contains(b));
        for (_, node) in g.iter() {
            for layer in &node.neighbors {
                assert!(!layer.contains(&b));
            }
        }
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut g = graph();
        g.insert(NounId::new(), vec![1.0, 2.0], 1).unwrap();
        let err = g.insert(NounId::new(), vec![1.0], 2).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn search_on_empty_graph_is_empty() {
        let g = graph();
        assert!(g.search(&[1.0, 2.0], 5).unwrap().is_empty());
    }

    #[test]
    fn rebuild_reproduces_same_membership() {
        let mut g = graph();
        let entries: Vec<_> = (0..20)
            .map(|i| (NounId::new(), vec![i as f32, 0.0], i as u64))
            .collect();
        g.rebuild(entries.clone()).unwrap();
        assert_eq!(g.len(), 20);
        for (id, _, _) in &entries {
            assert!(g.contains(*id));
        }
    }
}
