//! Graph adjacency index (spec.md §4.8).
//!
//! Grounded in shape on the source/target adjacency-map pattern common to
//! graph-store examples in the pack, and on `metadata.rs`'s own
//! ordinal-table idiom (an id <-> `u32` mapping backing `RoaringBitmap`
//! postings) so both indexes pay the same, already-proven cost to turn
//! entity ids into bitmap-friendly integers.

use dashmap::DashMap;
use neurostore_core::error::Result;
use neurostore_core::{NounId, TypeTag, VerbId};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

/// Which direction(s) of adjacency to read (spec.md §4.8:
/// `get_neighbors(id, {out|in|both})`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges where `id` is the source.
    Out,
    /// Edges where `id` is the target.
    In,
    /// Union of both directions.
    Both,
}

struct VerbRecord {
    source: NounId,
    target: NounId,
    verb_type: TypeTag,
}

/// Directed adjacency over noun ids, plus a verb-id set keyed by source
/// and by target, symmetric per spec.md §4.8's invariant: `out[s]`
/// contains `t` iff some verb `(s -> t)` exists, and removing a verb
/// updates both directions and the verb-id set atomically.
pub struct GraphIndex {
    id_to_ordinal: DashMap<NounId, u32>,
    ordinals: RwLock<Vec<Option<NounId>>>,
    free_ordinals: Mutex<Vec<u32>>,
    next_ordinal: Mutex<u32>,

    out: DashMap<u32, RoaringBitmap>,
    incoming: DashMap<u32, RoaringBitmap>,

    verbs_by_source: DashMap<u32, Vec<VerbId>>,
    verbs_by_target: DashMap<u32, Vec<VerbId>>,
    verb_records: DashMap<VerbId, VerbRecord>,

    verb_type_counts: DashMap<TypeTag, u64>,
}

impl Default for GraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphIndex {
    /// Build an empty graph index.
    pub fn new() -> Self {
        Self {
            id_to_ordinal: DashMap::new(),
            ordinals: RwLock::new(Vec::new()),
            free_ordinals: Mutex::new(Vec::new()),
            next_ordinal: Mutex::new(0),
            out: DashMap::new(),
            incoming: DashMap::new(),
            verbs_by_source: DashMap::new(),
            verbs_by_target: DashMap::new(),
            verb_records: DashMap::new(),
            verb_type_counts: DashMap::new(),
        }
    }

    fn ordinal_for(&self, id: NounId) -> u32 {
        if let Some(ord) = self.id_to_ordinal.get(&id) {
            return *ord;
        }
        let ord = if let Some(reused) = self.free_ordinals.lock().pop() {
            reused
        } else {
            let mut next = self.next_ordinal.lock();
            let ord = *next;
            *next += 1;
            ord
        };
        let mut ordinals = self.ordinals.write();
        if ordinals.len() <= ord as usize {
            ordinals.resize(ord as usize + 1, None);
        }
        ordinals[ord as usize] = Some(id);
        self.id_to_ordinal.insert(id, ord);
        ord
    }

    fn existing_ordinal(&self, id: NounId) -> Option<u32> {
        self.id_to_ordinal.get(&id).map(|o| *o)
    }

    fn ordinal_to_id(&self, ord: u32) -> Option<NounId> {
        self.ordinals.read().get(ord as usize).copied().flatten()
    }

    /// Record a verb `(source -> target)` of `verb_type` with id
    /// `verb_id`. Idempotent: re-adding the same verb id is a no-op.
    pub fn add_verb(
        &self,
        verb_id: VerbId,
        source: NounId,
        target: NounId,
        verb_type: TypeTag,
    ) -> Result<()> {
        if self.verb_records.contains_key(&verb_id) {
            return Ok(());
        }
        let s_ord = self.ordinal_for(source);
        let t_ord = self.ordinal_for(target);

        self.out.entry(s_ord).or_default().insert(t_ord);
        self.incoming.entry(t_ord).or_default().insert(s_ord);
        self.verbs_by_source.entry(s_ord).or_default().push(verb_id);
        self.verbs_by_target.entry(t_ord).or_default().push(verb_id);
        *self.verb_type_counts.entry(verb_type.clone()).or_insert(0) += 1;
        self.verb_records.insert(
            verb_id,
            VerbRecord {
                source,
                target,
                verb_type,
            },
        );
        Ok(())
    }

    /// True if a verb `(source -> target)` already exists, regardless of
    /// type (spec.md §4.12: `relate` consults this before inserting a
    /// duplicate).
    pub fn has_edge(&self, source: NounId, target: NounId) -> bool {
        let (Some(s_ord), Some(t_ord)) = (
            self.existing_ordinal(source),
            self.existing_ordinal(target),
        ) else {
            return false;
        };
        self.out
            .get(&s_ord)
            .map(|b| b.contains(t_ord))
            .unwrap_or(false)
    }

    /// Remove `verb_id`, updating both adjacency directions and the
    /// verb-id set atomically. A no-op if `verb_id` was never recorded.
    pub fn remove_verb(&self, verb_id: VerbId) -> Result<()> {
        let Some((_, record)) = self.verb_records.remove(&verb_id) else {
            return Ok(());
        };
        let Some(s_ord) = self.existing_ordinal(record.source) else {
            return Ok(());
        };
        let Some(t_ord) = self.existing_ordinal(record.target) else {
            return Ok(());
        };

        if let Some(mut verbs) = self.verbs_by_source.get_mut(&s_ord) {
            verbs.retain(|v| *v != verb_id);
        }
        if let Some(mut verbs) = self.verbs_by_target.get_mut(&t_ord) {
            verbs.retain(|v| *v != verb_id);
        }

        // Only drop the out/in bitmap bit if no *other* verb still
        // connects this exact (source, target) pair.
        let still_connected = self
            .verbs_by_source
            .get(&s_ord)
            .map(|vs| {
                vs.iter()
                    .any(|v| self.verb_records.get(v).map(|r| r.target) == Some(record.target))
            })
            .unwrap_or(false);
        if !still_connected {
            if let Some(mut bitmap) = self.out.get_mut(&s_ord) {
                bitmap.remove(t_ord);
            }
            if let Some(mut bitmap) = self.incoming.get_mut(&t_ord) {
                bitmap.remove(s_ord);
            }
        }

        if let Some(mut count) = self.verb_type_counts.get_mut(&record.verb_type) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    /// Drop all adjacency for `id` (both directions) and every verb
    /// touching it, e.g. because the noun itself was deleted. Returns
    /// the removed verb ids.
    pub fn remove_noun(&self, id: NounId) -> Vec<VerbId> {
        let Some(ord) = self.existing_ordinal(id) else {
            return Vec::new();
        };
        let mut touched: Vec<VerbId> = Vec::new();
        if let Some((_, vs)) = self.verbs_by_source.remove(&ord) {
            touched.extend(vs);
        }
        if let Some((_, vs)) = self.verbs_by_target.remove(&ord) {
            touched.extend(vs);
        }
        touched.sort();
        touched.dedup();
        for verb_id in &touched {
            if let Some((_, record)) = self.verb_records.remove(verb_id) {
                if let Some(mut count) = self.verb_type_counts.get_mut(&record.verb_type) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        self.out.remove(&ord);
        self.incoming.remove(&ord);
        for mut entry in self.out.iter_mut() {
            entry.value_mut().remove(ord);
        }
        for mut entry in self.incoming.iter_mut() {
            entry.value_mut().remove(ord);
        }
        self.id_to_ordinal.remove(&id);
        self.ordinals.write()[ord as usize] = None;
        self.free_ordinals.lock().push(ord);
        touched
    }

    /// Neighbor ids of `id` in `direction`.
    pub fn get_neighbors(&self, id: NounId, direction: Direction) -> Vec<NounId> {
        let Some(ord) = self.existing_ordinal(id) else {
            return Vec::new();
        };
        let bitmap = match direction {
            Direction::Out => self.out.get(&ord).map(|b| b.clone()).unwrap_or_default(),
            Direction::In => self.incoming.get(&ord).map(|b| b.clone()).unwrap_or_default(),
            Direction::Both => {
                let mut merged = self.out.get(&ord).map(|b| b.clone()).unwrap_or_default();
                if let Some(in_bitmap) = self.incoming.get(&ord) {
                    merged |= in_bitmap.value();
                }
                merged
            }
        };
        bitmap.iter().filter_map(|o| self.ordinal_to_id(o)).collect()
    }

    /// Verb ids where `id` is the source.
    pub fn get_verb_ids_by_source(&self, id: NounId) -> Vec<VerbId> {
        let Some(ord) = self.existing_ordinal(id) else {
            return Vec::new();
        };
        self.verbs_by_source
            .get(&ord)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Verb ids where `id` is the target.
    pub fn get_verb_ids_by_target(&self, id: NounId) -> Vec<VerbId> {
        let Some(ord) = self.existing_ordinal(id) else {
            return Vec::new();
        };
        self.verbs_by_target
            .get(&ord)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Every verb id currently touching `id`, either direction, deduped.
    pub fn get_verb_ids_touching(&self, id: NounId) -> Vec<VerbId> {
        let mut ids = self.get_verb_ids_by_source(id);
        ids.extend(self.get_verb_ids_by_target(id));
        ids.sort();
        ids.dedup();
        ids
    }

    /// `(source, target, verb_type)` for `verb_id`, if it is still
    /// recorded. The caller (spec.md §4.8: "materializes verbs using the
    /// storage batch API") batch-loads the full `Verb` record from
    /// storage using these ids; this index only tracks identity and
    /// endpoints, not the verb's vector/metadata payload.
    pub fn verb_identity(&self, verb_id: VerbId) -> Option<(NounId, NounId, TypeTag)> {
        self.verb_records
            .get(&verb_id)
            .map(|r| (r.source, r.target, r.verb_type.clone()))
    }

    /// Total recorded verbs.
    pub fn total_verbs(&self) -> u64 {
        self.verb_records.len() as u64
    }

    /// Verbs of `verb_type` currently recorded.
    pub fn count_by_type(&self, verb_type: &TypeTag) -> u64 {
        self.verb_type_counts.get(verb_type).map(|v| *v).unwrap_or(0)
    }

    /// Drop every entry, returning the index to empty (rebuilt by the
    /// engine streaming verbs from storage, mirroring
    /// [`crate::metadata::MetadataIndex::clear`]).
    pub fn clear(&self) {
        self.id_to_ordinal.clear();
        self.ordinals.write().clear();
        self.free_ordinals.lock().clear();
        *self.next_ordinal.lock() = 0;
        self.out.clear();
        self.incoming.clear();
        self.verbs_by_source.clear();
        self.verbs_by_target.clear();
        self.verb_records.clear();
        self.verb_type_counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid() -> NounId {
        NounId::new()
    }

    #[test]
    fn add_and_get_neighbors() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        g.add_verb(VerbId::new(), a, b, TypeTag::unchecked("LIKES")).unwrap();
        assert_eq!(g.get_neighbors(a, Direction::Out), vec![b]);
        assert_eq!(g.get_neighbors(b, Direction::In), vec![a]);
        assert!(g.get_neighbors(b, Direction::Out).is_empty());
    }

    #[test]
    fn both_direction_is_union() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        let c = nid();
        g.add_verb(VerbId::new(), a, b, TypeTag::unchecked("LIKES")).unwrap();
        g.add_verb(VerbId::new(), c, a, TypeTag::unchecked("LIKES")).unwrap();
        let mut both = g.get_neighbors(a, Direction::Both);
        both.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(both, expected);
    }

    #[test]
    fn has_edge_detects_duplicates() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        assert!(!g.has_edge(a, b));
        g.add_verb(VerbId::new(), a, b, TypeTag::unchecked("LIKES")).unwrap();
        assert!(g.has_edge(a, b));
        assert!(!g.has_edge(b, a));
    }

    #[test]
    fn remove_verb_updates_both_directions() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        let verb_id = VerbId::new();
        g.add_verb(verb_id, a, b, TypeTag::unchecked("LIKES")).unwrap();
        assert_eq!(g.count_by_type(&TypeTag::unchecked("LIKES")), 1);
        g.remove_verb(verb_id).unwrap();
        assert!(g.get_neighbors(a, Direction::Out).is_empty());
        assert!(g.get_neighbors(b, Direction::In).is_empty());
        assert_eq!(g.count_by_type(&TypeTag::unchecked("LIKES")), 0);
        assert!(g.verb_identity(verb_id).is_none());
    }

    #[test]
    fn parallel_edges_of_different_types_survive_partial_removal() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        let v1 = VerbId::new();
        let v2 = VerbId::new();
        g.add_verb(v1, a, b, TypeTag::unchecked("LIKES")).unwrap();
        g.add_verb(v2, a, b, TypeTag::unchecked("FOLLOWS")).unwrap();
        g.remove_verb(v1).unwrap();
        assert!(g.has_edge(a, b), "FOLLOWS edge should keep the bit set");
        assert_eq!(g.get_verb_ids_by_source(a), vec![v2]);
    }

    #[test]
    fn remove_noun_drops_touching_verbs() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        let c = nid();
        g.add_verb(VerbId::new(), a, b, TypeTag::unchecked("LIKES")).unwrap();
        g.add_verb(VerbId::new(), c, a, TypeTag::unchecked("LIKES")).unwrap();
        let removed = g.remove_noun(a);
        assert_eq!(removed.len(), 2);
        assert!(g.get_neighbors(b, Direction::In).is_empty());
        assert!(g.get_neighbors(c, Direction::Out).is_empty());
    }

    #[test]
    fn ordinal_slots_are_reused_after_removal() {
        let g = GraphIndex::new();
        let a = nid();
        let b = nid();
        g.add_verb(VerbId::new(), a, b, TypeTag::unchecked("LIKES")).unwrap();
        g.remove_noun(a);
        g.remove_noun(b);
        let c = nid();
        let d = nid();
        g.add_verb(VerbId::new(), c, d, TypeTag::unchecked("LIKES")).unwrap();
        assert_eq!(g.get_neighbors(c, Direction::Out), vec![d]);
    }
}
