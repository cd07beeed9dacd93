//! Metadata inverted index (spec.md §4.7).
//!
//! Grounded on `crates/storage/src/index.rs`'s `TypeIndex`/secondary
//! index pattern, generalized with `roaring::RoaringBitmap` posting
//! lists (attested in `examples/other_examples/manifests/*/Cargo.toml`)
//! so combined filters intersect/union in roughly O(1) per bitmap
//! rather than per-id set operations.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

use dashmap::DashMap;
use neurostore_core::error::Result;
use neurostore_core::value::{MetadataMap, MetadataValue};
use neurostore_core::NounId;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

/// A single field predicate (spec.md §4.7: "exact match, set match (IN),
/// range, existence, negation").
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Field equals exactly this value.
    Eq(MetadataValue),
    /// Field equals any of these values.
    In(Vec<MetadataValue>),
    /// Field value falls within `[min, max]` (bounds optional, inclusive
    /// flags per bound).
    Range {
        /// Lower bound, if any.
        min: Option<MetadataValue>,
        /// Whether `min` itself is included.
        min_inclusive: bool,
        /// Upper bound, if any.
        max: Option<MetadataValue>,
        /// Whether `max` itself is included.
        max_inclusive: bool,
    },
    /// Field is present (regardless of value, including `Null`).
    Exists,
}

/// A predicate scoped to a field name.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    /// The metadata field this predicate applies to.
    pub field: String,
    /// The predicate itself.
    pub predicate: Predicate,
}

/// A filter expression over metadata fields (spec.md §4.7:
/// "conjunction/disjunction").
#[derive(Debug, Clone)]
pub enum Filter {
    /// True for ids matching every sub-filter.
    And(Vec<Filter>),
    /// True for ids matching any sub-filter.
    Or(Vec<Filter>),
    /// True for ids NOT matching the inner filter.
    Not(Box<Filter>),
    /// A single field predicate.
    Field(FieldFilter),
}

/// Sort direction for [`MetadataIndex::get_sorted_ids_for_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending; nulls/missing sort last.
    Asc,
    /// Descending; nulls/missing sort first.
    Desc,
}

fn value_key(v: &MetadataValue) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

fn decode_key(key: &str) -> Option<MetadataValue> {
    serde_json::from_str(key).ok()
}

/// Inverted index from `field -> value -> bitmap<entity ordinal>`, plus
/// the id <-> ordinal tables, per-type membership bitmaps, and
/// per-type-per-field affinity counters (spec.md §4.7).
pub struct MetadataIndex {
    postings: DashMap<String, DashMap<String, RoaringBitmap>>,
    entity_meta: DashMap<NounId, MetadataMap>,
    id_to_ordinal: DashMap<NounId, u32>,
    ordinals: RwLock<Vec<Option<NounId>>>,
    free_ordinals: Mutex<Vec<u32>>,
    type_bitmaps: RwLock<Vec<RoaringBitmap>>,
    field_affinity: DashMap<(usize, String), u64>,
    total: AtomicU64,
    next_ordinal: AtomicU32,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataIndex {
    /// Build an empty index.
    pub fn new() -> Self {
        Self {
            postings: DashMap::new(),
            entity_meta: DashMap::new(),
            id_to_ordinal: DashMap::new(),
            ordinals: RwLock::new(Vec::new()),
            free_ordinals: Mutex::new(Vec::new()),
            type_bitmaps: RwLock::new(Vec::new()),
            field_affinity: DashMap::new(),
            total: AtomicU64::new(0),
            next_ordinal: AtomicU32::new(0),
        }
    }

    /// Total indexed entities.
    pub fn total(&self) -> u64 {
        self.total.load(AtomicOrdering::Relaxed)
    }

    /// Entities currently indexed as belonging to `type_ordinal`.
    pub fn count_by_type(&self, type_ordinal: usize) -> u64 {
        self.type_bitmaps
            .read()
            .get(type_ordinal)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Distinct values observed for `field` (a cardinality hint used to
    /// order conjunction evaluation cheapest-first).
    pub fn cardinality(&self, field: &str) -> usize {
        self.postings.get(field).map(|m| m.len()).unwrap_or(0)
    }

    /// How many indexed entities of `type_ordinal` carry `field` at all.
    pub fn affinity(&self, type_ordinal: usize, field: &str) -> u64 {
        self.field_affinity
            .get(&(type_ordinal, field.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }

    fn alloc_ordinal(&self, id: NounId) -> u32 {
        let ord = if let Some(reused) = self.free_ordinals.lock().pop() {
            reused
        } else {
            self.next_ordinal.fetch_add(1, AtomicOrdering::Relaxed)
        };
        let mut ordinals = self.ordinals.write();
        if ordinals.len() <= ord as usize {
            ordinals.resize(ord as usize + 1, None);
        }
        ordinals[ord as usize] = Some(id);
        self.id_to_ordinal.insert(id, ord);
        ord
    }

    /// Index `id` (of `type_ordinal`) with metadata `meta`.
    pub fn add_to_index(&self, id: NounId, type_ordinal: usize, meta: &MetadataMap) -> Result<()> {
        let ord = self.alloc_ordinal(id);

        {
            let mut types = self.type_bitmaps.write();
            if types.len() <= type_ordinal {
                types.resize_with(type_ordinal + 1, RoaringBitmap::new);
            }
            types[type_ordinal].insert(ord);
        }

        for (field, value) in meta {
            let field_postings = self.postings.entry(field.clone()).or_default();
            field_postings.entry(value_key(value)).or_default().insert(ord);
            *self
                .field_affinity
                .entry((type_ordinal, field.clone()))
                .or_insert(0) += 1;
        }

        self.entity_meta.insert(id, meta.clone());
        self.total.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Remove `id` (of `type_ordinal`, with its last-known metadata
    /// `prev_meta`) from the index. A no-op if `id` was never indexed.
    pub fn remove_from_index(
        &self,
        id: NounId,
        type_ordinal: usize,
        prev_meta: &MetadataMap,
    ) -> Result<()> {
        let Some((_, ord)) = self.id_to_ordinal.remove(&id) else {
            return Ok(());
        };

        {
            let mut types = self.type_bitmaps.write();
            if let Some(bitmap) = types.get_mut(type_ordinal) {
                bitmap.remove(ord);
            }
        }

        for (field, value) in prev_meta {
            if let Some(field_postings) = self.postings.get(field) {
                let key = value_key(value);
                let mut drop_key = false;
                if let Some(mut bitmap) = field_postings.get_mut(&key) {
                    bitmap.remove(ord);
                    drop_key = bitmap.is_empty();
                }
                if drop_key {
                    field_postings.remove(&key);
                }
            }
            if let Some(mut count) = self.field_affinity.get_mut(&(type_ordinal, field.clone())) {
                *count = count.saturating_sub(1);
            }
        }

        self.ordinals.write()[ord as usize] = None;
        self.free_ordinals.lock().push(ord);
        self.entity_meta.remove(&id);
        self.total.fetch_sub(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Drop every entry, returning the index to empty (the engine then
    /// repopulates it by streaming nouns from storage: spec.md §4.7's
    /// "rebuild() scans storage, populates from scratch").
    pub fn clear(&self) {
        self.postings.clear();
        self.entity_meta.clear();
        self.id_to_ordinal.clear();
        self.ordinals.write().clear();
        self.free_ordinals.lock().clear();
        self.type_bitmaps.write().clear();
        self.field_affinity.clear();
        self.total.store(0, AtomicOrdering::Relaxed);
        self.next_ordinal.store(0, AtomicOrdering::Relaxed);
    }

    /// The raw metadata last indexed for `id`, if any.
    pub fn get_field_value_for_entity(&self, id: NounId, field: &str) -> Option<MetadataValue> {
        self.entity_meta.get(&id).and_then(|m| m.get(field).cloned())
    }

    fn ordinal_to_id(&self, ord: u32) -> Option<NounId> {
        self.ordinals.read().get(ord as usize).copied().flatten()
    }

    fn universe(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        for (ord, slot) in self.ordinals.read().iter().enumerate() {
            if slot.is_some() {
                all.insert(ord as u32);
            }
        }
        all
    }

    fn eval_predicate(&self, field: &str, predicate: &Predicate) -> RoaringBitmap {
        let Some(field_postings) = self.postings.get(field) else {
            return RoaringBitmap::new();
        };
        match predicate {
            Predicate::Eq(v) => field_postings
                .get(&value_key(v))
                .map(|b| b.value().clone())
                .unwrap_or_default(),
            Predicate::In(values) => {
                let mut out = RoaringBitmap::new();
                for v in values {
                    if let Some(b) = field_postings.get(&value_key(v)) {
                        out |= b.value();
                    }
                }
                out
            }
            Predicate::Exists => {
                let mut out = RoaringBitmap::new();
                for entry in field_postings.iter() {
                    out |= entry.value();
                }
                out
            }
            Predicate::Range {
                min,
                min_inclusive,
                max,
                max_inclusive,
            } => {
                let mut out = RoaringBitmap::new();
                for entry in field_postings.iter() {
                    let Some(v) = decode_key(entry.key()) else {
                        continue;
                    };
                    if satisfies_range(&v, min, *min_inclusive, max, *max_inclusive) {
                        out |= entry.value();
                    }
                }
                out
            }
        }
    }

    fn eval(&self, filter: &Filter) -> RoaringBitmap {
        match filter {
            Filter::Field(f) => self.eval_predicate(&f.field, &f.predicate),
            Filter::Not(inner) => {
                let mut universe = self.universe();
                universe -= self.eval(inner);
                universe
            }
            Filter::Or(filters) => {
                let mut out = RoaringBitmap::new();
                for f in filters {
                    out |= self.eval(f);
                }
                out
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    return self.universe();
                }
                // Evaluate every branch up front, then intersect smallest
                // first (spec.md §4.7: "optimized by processing
                // lowest-cardinality field first").
                let mut evaluated: Vec<RoaringBitmap> = filters.iter().map(|f| self.eval(f)).collect();
                evaluated.sort_by_key(|b| b.len());
                let mut iter = evaluated.into_iter();
                let mut acc = iter.next().unwrap_or_default();
                for b in iter {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= &b;
                }
                acc
            }
        }
    }

    /// Resolve `filter` to the matching entity ids.
    pub fn get_ids_for_filter(&self, filter: &Filter) -> Result<Vec<NounId>> {
        let bitmap = self.eval(filter);
        Ok(bitmap
            .iter()
            .filter_map(|ord| self.ordinal_to_id(ord))
            .collect())
    }

    /// Resolve `filter`, then sort by `field` (nulls/missing last for
    /// `Asc`, first for `Desc`, per spec.md §4.12's sort convention).
    pub fn get_sorted_ids_for_filter(
        &self,
        filter: &Filter,
        field: &str,
        dir: SortDirection,
    ) -> Result<Vec<NounId>> {
        let ids = self.get_ids_for_filter(filter)?;
        let mut keyed: Vec<(NounId, Option<MetadataValue>)> = ids
            .into_iter()
            .map(|id| {
                let v = self.get_field_value_for_entity(id, field);
                (id, v)
            })
            .collect();
        keyed.sort_by(|(a_id, a), (b_id, b)| {
            cmp_nullable(a, b, dir).then_with(|| a_id.cmp(b_id))
        });
        Ok(keyed.into_iter().map(|(id, _)| id).collect())
    }
}

fn satisfies_range(
    v: &MetadataValue,
    min: &Option<MetadataValue>,
    min_inclusive: bool,
    max: &Option<MetadataValue>,
    max_inclusive: bool,
) -> bool {
    use std::cmp::Ordering::*;
    let ge_min = match min {
        None => true,
        Some(m) => match v.partial_compare(m) {
            Some(Greater) => true,
            Some(Equal) => min_inclusive,
            _ => false,
        },
    };
    let le_max = match max {
        None => true,
        Some(m) => match v.partial_compare(m) {
            Some(Less) => true,
            Some(Equal) => max_inclusive,
            _ => false,
        },
    };
    ge_min && le_max
}

fn cmp_nullable(
    a: &Option<MetadataValue>,
    b: &Option<MetadataValue>,
    dir: SortDirection,
) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    match (a, b) {
        (Some(x), Some(y)) => {
            let ord = x.partial_compare(y).unwrap_or(Equal);
            match dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => match dir {
            SortDirection::Asc => Less,
            SortDirection::Desc => Greater,
        },
        (None, Some(_)) => match dir {
            SortDirection::Asc => Greater,
            SortDirection::Desc => Less,
        },
        (None, None) => Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, MetadataValue)]) -> MetadataMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn eq_filter_finds_exact_matches() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let b = NounId::new();
        idx.add_to_index(a, 0, &meta(&[("city", MetadataValue::Str("NYC".into()))]))
            .unwrap();
        idx.add_to_index(b, 0, &meta(&[("city", MetadataValue::Str("LA".into()))]))
            .unwrap();

        let filter = Filter::Field(FieldFilter {
            field: "city".into(),
            predicate: Predicate::Eq(MetadataValue::Str("NYC".into())),
        });
        assert_eq!(idx.get_ids_for_filter(&filter).unwrap(), vec![a]);
    }

    #[test]
    fn and_filter_intersects() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let b = NounId::new();
        idx.add_to_index(
            a,
            0,
            &meta(&[
                ("city", MetadataValue::Str("NYC".into())),
                ("active", MetadataValue::Bool(true)),
            ]),
        )
        .unwrap();
        idx.add_to_index(
            b,
            0,
            &meta(&[
                ("city", MetadataValue::Str("NYC".into())),
                ("active", MetadataValue::Bool(false)),
            ]),
        )
        .unwrap();

        let filter = Filter::And(vec![
            Filter::Field(FieldFilter {
                field: "city".into(),
                predicate: Predicate::Eq(MetadataValue::Str("NYC".into())),
            }),
            Filter::Field(FieldFilter {
                field: "active".into(),
                predicate: Predicate::Eq(MetadataValue::Bool(true)),
            }),
        ]);
        assert_eq!(idx.get_ids_for_filter(&filter).unwrap(), vec![a]);
    }

    #[test]
    fn not_filter_complements_universe() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let b = NounId::new();
        idx.add_to_index(a, 0, &meta(&[("active", MetadataValue::Bool(true))]))
            .unwrap();
        idx.add_to_index(b, 0, &meta(&[("active", MetadataValue::Bool(false))]))
            .unwrap();

        let filter = Filter::Not(Box::new(Filter::Field(FieldFilter {
            field: "active".into(),
            predicate: Predicate::Eq(MetadataValue::Bool(true)),
        })));
        assert_eq!(idx.get_ids_for_filter(&filter).unwrap(), vec![b]);
    }

    #[test]
    fn range_filter_matches_numeric_bounds() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let b = NounId::new();
        let c = NounId::new();
        idx.add_to_index(a, 0, &meta(&[("age", MetadataValue::Int(10))])).unwrap();
        idx.add_to_index(b, 0, &meta(&[("age", MetadataValue::Int(20))])).unwrap();
        idx.add_to_index(c, 0, &meta(&[("age", MetadataValue::Int(30))])).unwrap();

        let filter = Filter::Field(FieldFilter {
            field: "age".into(),
            predicate: Predicate::Range {
                min: Some(MetadataValue::Int(10)),
                min_inclusive: false,
                max: Some(MetadataValue::Int(30)),
                max_inclusive: true,
            },
        });
        let mut ids = idx.get_ids_for_filter(&filter).unwrap();
        ids.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn remove_from_index_drops_postings_and_counts() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let m = meta(&[("city", MetadataValue::Str("NYC".into()))]);
        idx.add_to_index(a, 0, &m).unwrap();
        assert_eq!(idx.total(), 1);
        idx.remove_from_index(a, 0, &m).unwrap();
        assert_eq!(idx.total(), 0);
        assert_eq!(idx.cardinality("city"), 0);
        assert_eq!(idx.count_by_type(0), 0);
    }

    #[test]
    fn ordinal_slots_are_reused_after_removal() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let m = meta(&[("x", MetadataValue::Int(1))]);
        idx.add_to_index(a, 0, &m).unwrap();
        idx.remove_from_index(a, 0, &m).unwrap();
        let b = NounId::new();
        idx.add_to_index(b, 0, &m).unwrap();
        assert_eq!(idx.total(), 1);
        assert_eq!(idx.get_ids_for_filter(&Filter::Field(FieldFilter {
            field: "x".into(),
            predicate: Predicate::Eq(MetadataValue::Int(1)),
        })).unwrap(), vec![b]);
    }

    #[test]
    fn sorted_filter_places_nulls_last_ascending() {
        let idx = MetadataIndex::new();
        let a = NounId::new();
        let b = NounId::new();
        let c = NounId::new();
        idx.add_to_index(a, 0, &meta(&[("score", MetadataValue::Int(5)), ("tag", MetadataValue::Str("x".into()))])).unwrap();
        idx.add_to_index(b, 0, &meta(&[("score", MetadataValue::Int(1)), ("tag", MetadataValue::Str("x".into()))])).unwrap();
        idx.add_to_index(c, 0, &meta(&[("tag", MetadataValue::Str("x".into()))])).unwrap();

        let filter = Filter::Field(FieldFilter {
            field: "tag".into(),
            predicate: Predicate::Eq(MetadataValue::Str("x".into())),
        });
        let sorted = idx.get_sorted_ids_for_filter(&filter, "score", SortDirection::Asc).unwrap();
        assert_eq!(sorted, vec![b, a, c]);
    }
}
