//! Type-partitioned HNSW dispatch (spec.md §4.9).
//!
//! New relative to the teacher: `engine/src/primitives/vector/hnsw.rs`
//! is a single flat per-collection graph behind `VectorIndexBackend`
//! (`backend.rs`)'s trait-object seam. This spec asks for one
//! independent graph per noun type instead, so this module composes N
//! [`crate::cow::CowHnswGraph`] instances behind a dispatcher, following
//! the teacher's `IndexBackendFactory` idea of picking a concrete
//! backend at construction rather than branching on type at every call.
//! Every shard is a [`CowHnswGraph`] rather than a plain [`HnswGraph`]
//! so [`Self::fork`] can give `fork()` (spec.md §4.11: "its HNSW
//! enables COW") a sub-index per type without a second dispatcher type:
//! an un-forked dispatcher's shards simply carry no parent, which is
//! exactly [`HnswGraph`]'s behavior.

use std::sync::Arc;

use dashmap::DashMap;
use neurostore_core::error::Result;
use neurostore_core::{DistanceMetric, NounId, TypeTag};
use parking_lot::RwLock;

use crate::cow::CowHnswGraph;
use crate::index::HnswConfig;

/// Which sub-indexes a search should touch.
#[derive(Debug, Clone)]
pub enum TypeSelector {
    /// Search only the named type's sub-index.
    One(TypeTag),
    /// Search exactly these types and merge by distance.
    Many(Vec<TypeTag>),
    /// Search every sub-index that currently exists and merge by distance.
    Any,
}

/// One [`HnswGraph`] per noun type, dispatched by [`TypeTag`].
///
/// Each sub-index is independently lockable so a write to one type does
/// not block reads/writes against another (spec.md §5: "concurrent
/// mutations to distinct entities must not corrupt shared structures").
pub struct TypedHnswIndex {
    config: HnswConfig,
    metric: DistanceMetric,
    seed: Option<u64>,
    shards: DashMap<TypeTag, Arc<RwLock<CowHnswGraph>>>,
}

impl TypedHnswIndex {
    /// Build an empty dispatcher. `seed` is forwarded to every shard for
    /// reproducible level assignment in tests.
    pub fn new(config: HnswConfig, metric: DistanceMetric, seed: Option<u64>) -> Self {
        Self {
            config,
            metric,
            seed,
            shards: DashMap::new(),
        }
    }

    fn shard_for(&self, type_tag: &TypeTag) -> Arc<RwLock<CowHnswGraph>> {
        self.shards
            .entry(type_tag.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(CowHnswGraph::new(
                    self.config.clone(),
                    self.metric,
                    self.seed,
                )))
            })
            .clone()
    }

    /// Access (without creating) the sub-index for `type_tag`.
    pub fn shard(&self, type_tag: &TypeTag) -> Option<Arc<RwLock<CowHnswGraph>>> {
        self.shards.get(type_tag).map(|e| e.clone())
    }

    /// Build a child dispatcher that shares every current shard
    /// by reference, copy-on-write (spec.md §4.11: "its HNSW enables
    /// COW"). The parent is left untouched; the first write to any id
    /// in the child materializes that node locally.
    pub fn fork(&self) -> Self {
        let child = Self::new(self.config.clone(), self.metric, self.seed);
        for entry in self.shards.iter() {
            let mut shard = CowHnswGraph::new(self.config.clone(), self.metric, self.seed);
            shard.enable_cow(entry.value().clone());
            child.shards.insert(entry.key().clone(), Arc::new(RwLock::new(shard)));
        }
        child
    }

    /// Insert `vector` under `id` into `type_tag`'s sub-index, creating
    /// the sub-index if this is its first member.
    pub fn add(
        &self,
        type_tag: &TypeTag,
        id: NounId,
        vector: Vec<f32>,
        created_at: u64,
    ) -> Result<()> {
        let shard = self.shard_for(type_tag);
        shard.write().insert(id, vector, created_at)
    }

    /// Remove `id` from `type_tag`'s sub-index. A no-op if the type has
    /// no sub-index yet.
    pub fn remove(&self, type_tag: &TypeTag, id: NounId) -> bool {
        match self.shards.get(type_tag) {
            Some(shard) => shard.write().delete(id),
            None => false,
        }
    }

    /// Full node state (vector, connections, level) for `id` in
    /// `type_tag`'s sub-index, or `None` if the type or the node don't
    /// exist. Used to persist a noun's vector object in full (spec.md
    /// §6) instead of just its embedding.
    pub fn node_snapshot(&self, type_tag: &TypeTag, id: NounId) -> Option<crate::node::HnswNode> {
        self.shards.get(type_tag).and_then(|shard| shard.read().get_node(id))
    }

    /// Route a search per [`TypeSelector`], merging multi-type results
    /// by ascending distance with id as the tie-break.
    pub fn search(&self, selector: &TypeSelector, query: &[f32], k: usize) -> Result<Vec<(NounId, f32)>> {
        match selector {
            TypeSelector::One(t) => match self.shards.get(t) {
                Some(shard) => shard.read().search(query, k),
                None => Ok(Vec::new()),
            },
            TypeSelector::Many(types) => {
                let mut merged = Vec::new();
                for t in types {
                    if let Some(shard) = self.shards.get(t) {
                        merged.extend(shard.read().search(query, k)?);
                    }
                }
                Ok(merge_and_truncate(merged, k))
            }
            TypeSelector::Any => {
                let mut merged = Vec::new();
                for shard in self.shards.iter() {
                    merged.extend(shard.value().read().search(query, k)?);
                }
                Ok(merge_and_truncate(merged, k))
            }
        }
    }

    /// Total live nodes across every sub-index.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.value().read().len()).sum()
    }

    /// True if no sub-index holds any node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `type_tag` currently has a sub-index at all (even if
    /// empty).
    pub fn has_shard(&self, type_tag: &TypeTag) -> bool {
        self.shards.contains_key(type_tag)
    }

    /// Every type currently holding a sub-index.
    pub fn types(&self) -> Vec<TypeTag> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }
}

fn merge_and_truncate(mut results: Vec<(NounId, f32)>, k: usize) -> Vec<(NounId, f32)> {
    results.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results.dedup_by_key(|r| r.0);
    results.truncate(k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> TypedHnswIndex {
        TypedHnswIndex::new(HnswConfig::default(), DistanceMetric::Euclidean, Some(3))
    }

    #[test]
    fn add_routes_to_per_type_shard() {
        let idx = index();
        let person = TypeTag::unchecked("PERSON");
        let place = TypeTag::unchecked("PLACE");
        let a = NounId::new();
        let b = NounId::new();
        idx.add(&person, a, vec![1.0, 0.0], 1).unwrap();
        idx.add(&place, b, vec![0.0, 1.0], 2).unwrap();
        assert_eq!(idx.len(), 2);

        let only_person = idx
            .search(&TypeSelector::One(person.clone()), &[1.0, 0.0], 5)
            .unwrap();
        assert_eq!(only_person, vec![(a, 0.0)]);
    }

    #[test]
    fn any_selector_merges_across_types() {
        let idx = index();
        let person = TypeTag::unchecked("PERSON");
        let place = TypeTag::unchecked("PLACE");
        let a = NounId::new();
        let b = NounId::new();
        idx.add(&person, a, vec![1.0, 0.0], 1).unwrap();
        idx.add(&place, b, vec![2.0, 0.0], 2).unwrap();

        let results = idx.search(&TypeSelector::Any, &[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
    }

    #[test]
    fn remove_on_unknown_type_is_noop() {
        let idx = index();
        assert!(!idx.remove(&TypeTag::unchecked("THING"), NounId::new()));
    }
}
