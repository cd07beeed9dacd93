//! Query coordinator: turns a `find` request into a plan over the three
//! indexes and the storage engine, then scores, fuses, sorts, paginates
//! and loads the result (spec.md §4.12).
//!
//! Grounded on `strata-executor`'s plan-selection-then-fan-out shape,
//! generalized from its single-index dispatch to neurostore's four plans
//! (metadata-only, empty, mixed, graph) and three-source score fusion.
//! Sub-searches that can run independently (vector search, metadata
//! filter evaluation) are issued concurrently via `tokio::join!`.

use std::cmp::Ordering;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use neurostore_core::error::{Error, Result};
use neurostore_core::value::MetadataValue;
use neurostore_core::{NounId, TypeTag};
use neurostore_hnsw::{TypeSelector, TypedHnswIndex};
use neurostore_index::graph::Direction;
use neurostore_index::metadata::{Filter, SortDirection};
use neurostore_index::{GraphIndex, MetadataIndex};
use neurostore_storage::engine::Pagination;
use neurostore_storage::StorageEngine;

/// A graph constraint on a `find` call: restrict results to neighbors of
/// `anchor` in `direction`, optionally narrowed to a single verb type.
#[derive(Debug, Clone)]
pub struct GraphConstraint {
    /// The entity whose neighborhood bounds the result set.
    pub anchor: NounId,
    /// Which adjacency direction to traverse.
    pub direction: Direction,
    /// Restrict to edges of this verb type, when set.
    pub verb_type: Option<TypeTag>,
}

/// Override the default score-descending order with a metadata field.
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// Metadata field to sort on.
    pub field: String,
    /// Sort direction (controls null placement, spec.md §4.7).
    pub direction: SortDirection,
}

/// The three score sources a `find` result can be fused from (spec.md
/// §4.12 fusion weights are named exactly these three).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// HNSW vector/proximity search.
    Vector,
    /// Metadata filter match.
    Metadata,
    /// Graph neighborhood match.
    Graph,
}

/// How multiple score sources for the same entity are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    /// Take the highest contributing score.
    Max,
    /// Mean of contributing scores.
    Average,
    /// Convex combination of contributing scores using [`FusionWeights`].
    Weighted,
}

/// Per-source weights used by [`FusionStrategy::Weighted`]. Normalized
/// across whichever sources actually contributed to a given entity, so
/// weights need not sum to 1 and absent sources don't dilute the score.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    /// Weight for [`Source::Vector`].
    pub vector: f32,
    /// Weight for [`Source::Metadata`].
    pub metadata: f32,
    /// Weight for [`Source::Graph`].
    pub graph: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            metadata: 0.2,
            graph: 0.1,
        }
    }
}

impl FusionWeights {
    fn weight(&self, source: Source) -> f32 {
        match source {
            Source::Vector => self.vector,
            Source::Metadata => self.metadata,
            Source::Graph => self.graph,
        }
    }
}

/// Fusion configuration for a `find` call.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Combination strategy.
    pub strategy: FusionStrategy,
    /// Per-source weights, used only by [`FusionStrategy::Weighted`].
    pub weights: FusionWeights,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Weighted,
            weights: FusionWeights::default(),
        }
    }
}

/// A `find` request (spec.md §4.12: "filter expression, optional query
/// (text or vector), optional proximity target, optional graph
/// constraint, limit/offset, optional orderBy, optional fusion config").
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    /// Metadata filter expression.
    pub filter: Option<Filter>,
    /// Raw query vector for similarity search.
    pub query_vector: Option<Vec<f32>>,
    /// Restrict vector search to this noun type's shard; `None` searches
    /// every shard ([`TypeSelector::Any`]).
    pub query_type: Option<TypeTag>,
    /// Search near an existing entity's stored vector instead of (or in
    /// addition to) `query_vector`.
    pub proximity: Option<NounId>,
    /// Restrict results to a graph neighborhood.
    pub graph: Option<GraphConstraint>,
    /// Maximum results to return.
    pub limit: usize,
    /// Results to skip before the first returned item.
    pub offset: usize,
    /// Sort override; default order is score descending.
    pub order_by: Option<OrderBy>,
    /// Fusion strategy for multi-source scores.
    pub fusion: FusionConfig,
}

/// One scored hit before final entity loading.
#[derive(Debug, Clone)]
struct ScoredId {
    id: NounId,
    score: Option<f32>,
}

/// A page of `find` results (spec.md §4.12: "pagination applied after
/// final sort, before final entity load").
#[derive(Debug, Clone)]
pub struct FindPage {
    /// Loaded entities for this page, in result order.
    pub items: Vec<neurostore_core::Noun>,
    /// True if more results exist past this page.
    pub has_more: bool,
    /// Total matching ids before pagination.
    pub total: usize,
}

/// Distance-to-similarity transform (spec.md §4.12): `s = 1 / (1 + d)`,
/// clamped to `[0, 1]`.
fn similarity(distance: f32) -> f32 {
    (1.0 / (1.0 + distance)).clamp(0.0, 1.0)
}

fn fuse(scores: &[(Source, f32)], config: &FusionConfig) -> f32 {
    match config.strategy {
        FusionStrategy::Max => scores.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max),
        FusionStrategy::Average => {
            let sum: f32 = scores.iter().map(|(_, s)| *s).sum();
            sum / scores.len().max(1) as f32
        }
        FusionStrategy::Weighted => {
            let weight_sum: f32 = scores.iter().map(|(src, _)| config.weights.weight(*src)).sum();
            if weight_sum <= 0.0 {
                return scores.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
            }
            scores
                .iter()
                .map(|(src, s)| config.weights.weight(*src) * s)
                .sum::<f32>()
                / weight_sum
        }
    }
}

/// The query coordinator: holds shared handles to the indexes and
/// storage a `find` call reads from. Never owns or mutates state itself.
pub struct Coordinator {
    storage: Arc<StorageEngine>,
    metadata: Arc<MetadataIndex>,
    graph: Arc<GraphIndex>,
    hnsw: Arc<TypedHnswIndex>,
    known_types: Vec<TypeTag>,
}

/// Upper bound on a single full-collection scan (spec.md §4.12 "Empty"
/// plan), sized generously since it only trims an already-loaded id list.
const SCAN_WINDOW: usize = 1_000_000;

impl Coordinator {
    /// Build a coordinator over shared index/storage handles, scoped to
    /// the noun types currently registered.
    pub fn new(
        storage: Arc<StorageEngine>,
        metadata: Arc<MetadataIndex>,
        graph: Arc<GraphIndex>,
        hnsw: Arc<TypedHnswIndex>,
        known_types: Vec<TypeTag>,
    ) -> Self {
        Self {
            storage,
            metadata,
            graph,
            hnsw,
            known_types,
        }
    }

    /// Execute `query`, selecting a plan per spec.md §4.12 and returning
    /// one page of results.
    pub async fn find(&self, query: &FindQuery) -> Result<FindPage> {
        let has_vector = query.query_vector.is_some() || query.proximity.is_some();
        let has_graph = query.graph.is_some();
        let has_filter = query.filter.is_some();

        if !has_vector && !has_graph && !has_filter {
            return self.empty_plan(query).await;
        }

        if has_filter && !has_vector && !has_graph {
            return self.metadata_only_plan(query).await;
        }

        let have_base = has_vector || has_filter;
        let mut contributions: FxHashMap<NounId, Vec<(Source, f32)>> = FxHashMap::default();

        if has_vector {
            let (vector_hits, metadata_ids) = tokio::join!(
                self.vector_hits(query),
                self.maybe_metadata_ids(query, has_filter)
            );
            for (id, score) in vector_hits? {
                contributions.entry(id).or_default().push((Source::Vector, score));
            }
            if let Some(ids) = metadata_ids? {
                let allowed: std::collections::HashSet<NounId> = ids.into_iter().collect();
                contributions.retain(|id, _| allowed.contains(id));
                for scores in contributions.values_mut() {
                    scores.push((Source::Metadata, 1.0));
                }
            }
        } else if has_filter {
            let ids = self.metadata.get_ids_for_filter(query.filter.as_ref().unwrap())?;
            for id in ids {
                contributions.entry(id).or_default().push((Source::Metadata, 1.0));
            }
        }

        if let Some(constraint) = &query.graph {
            let neighbors = self.typed_neighbors(constraint);
            if have_base {
                let neighbor_set: std::collections::HashSet<NounId> = neighbors.into_iter().collect();
                contributions.retain(|id, _| neighbor_set.contains(id));
                for scores in contributions.values_mut() {
                    scores.push((Source::Graph, 1.0));
                }
            } else {
                for id in neighbors {
                    contributions.entry(id).or_default().push((Source::Graph, 1.0));
                }
            }
        }

        let scored: Vec<ScoredId> = contributions
            .into_iter()
            .map(|(id, scores)| ScoredId {
                id,
                score: Some(fuse(&scores, &query.fusion)),
            })
            .collect();

        self.finalize(scored, query).await
    }

    async fn maybe_metadata_ids(&self, query: &FindQuery, has_filter: bool) -> Result<Option<Vec<NounId>>> {
        if !has_filter {
            return Ok(None);
        }
        Ok(Some(self.metadata.get_ids_for_filter(query.filter.as_ref().unwrap())?))
    }

    /// Plan 1 (spec.md §4.12): a filter with no vector, proximity, or
    /// graph constraint resolves directly from the metadata index.
    async fn metadata_only_plan(&self, query: &FindQuery) -> Result<FindPage> {
        let filter = query.filter.as_ref().unwrap();
        let mut ids = match &query.order_by {
            Some(order) => self
                .metadata
                .get_sorted_ids_for_filter(filter, &order.field, order.direction)?,
            None => self.metadata.get_ids_for_filter(filter)?,
        };
        if query.order_by.is_none() {
            ids.sort();
        }
        self.paginate_and_load(ids, query).await
    }

    /// Plan 2 (spec.md §4.12): nothing specified at all — a paginated
    /// scan across every known noun type, ordered by id.
    async fn empty_plan(&self, query: &FindQuery) -> Result<FindPage> {
        let mut ids = Vec::new();
        for type_ in &self.known_types {
            let page = self
                .storage
                .get_nouns(
                    type_,
                    Pagination {
                        limit: SCAN_WINDOW,
                        offset: 0,
                    },
                )
                .await?;
            ids.extend(page.items.into_iter().map(|noun| noun.id));
        }
        if query.order_by.is_none() {
            ids.sort();
            return self.paginate_and_load(ids, query).await;
        }
        // order_by on an unfiltered scan needs each candidate's field value;
        // finalize() handles that via the scored path with no score at all.
        let scored = ids.into_iter().map(|id| ScoredId { id, score: None }).collect();
        self.finalize(scored, query).await
    }

    /// Resolve neighbors of a graph constraint, optionally narrowed by
    /// verb type — [`GraphIndex::get_neighbors`] has no type parameter,
    /// so a typed constraint walks the verb-id sets directly instead.
    fn typed_neighbors(&self, constraint: &GraphConstraint) -> Vec<NounId> {
        let Some(verb_type) = &constraint.verb_type else {
            return self.graph.get_neighbors(constraint.anchor, constraint.direction);
        };
        let mut ids = Vec::new();
        if matches!(constraint.direction, Direction::Out | Direction::Both) {
            for verb_id in self.graph.get_verb_ids_by_source(constraint.anchor) {
                if let Some((_, target, vt)) = self.graph.verb_identity(verb_id) {
                    if &vt == verb_type {
                        ids.push(target);
                    }
                }
            }
        }
        if matches!(constraint.direction, Direction::In | Direction::Both) {
            for verb_id in self.graph.get_verb_ids_by_target(constraint.anchor) {
                if let Some((source, _, vt)) = self.graph.verb_identity(verb_id) {
                    if &vt == verb_type {
                        ids.push(source);
                    }
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Union of `query_vector` and `proximity` search results, scored via
    /// [`similarity`] and deduped keeping the higher score per id. Run as
    /// two independent HNSW searches joined concurrently.
    async fn vector_hits(&self, query: &FindQuery) -> Result<Vec<(NounId, f32)>> {
        let selector = match &query.query_type {
            Some(type_tag) => TypeSelector::One(type_tag.clone()),
            None => TypeSelector::Any,
        };
        let k = (query.offset + query.limit).max(1);

        let direct = async {
            match &query.query_vector {
                Some(vector) => self.hnsw.search(&selector, vector, k),
                None => Ok(Vec::new()),
            }
        };
        let near = async {
            match query.proximity {
                Some(anchor) => {
                    let anchor_vector = self.resolve_vector(anchor, &selector)?;
                    let hits = self.hnsw.search(&selector, &anchor_vector, k)?;
                    Ok(hits.into_iter().filter(|(id, _)| *id != anchor).collect())
                }
                None => Ok(Vec::new()),
            }
        };
        let (direct, near): (Result<Vec<_>>, Result<Vec<_>>) = tokio::join!(direct, near);

        let mut merged: FxHashMap<NounId, f32> = FxHashMap::default();
        for (id, distance) in direct?.into_iter().chain(near?) {
            let score = similarity(distance);
            merged
                .entry(id)
                .and_modify(|existing| *existing = existing.max(score))
                .or_insert(score);
        }
        Ok(merged.into_iter().collect())
    }

    /// Find the stored vector for `anchor`, searching the selected shard
    /// (or every shard, for [`TypeSelector::Any`]/[`TypeSelector::Many`]).
    fn resolve_vector(&self, anchor: NounId, selector: &TypeSelector) -> Result<Vec<f32>> {
        let candidate_types: Vec<TypeTag> = match selector {
            TypeSelector::One(t) => vec![t.clone()],
            TypeSelector::Many(types) => types.clone(),
            TypeSelector::Any => self.hnsw.types(),
        };
        for type_tag in &candidate_types {
            if let Some(shard) = self.hnsw.shard(type_tag) {
                if let Some(vector) = shard.read().get_vector(anchor) {
                    return Ok(vector);
                }
            }
        }
        Err(Error::VectorRequired)
    }

    /// Sort scored hits (by fused score, or by `order_by` when given),
    /// then paginate and load entities.
    async fn finalize(&self, mut scored: Vec<ScoredId>, query: &FindQuery) -> Result<FindPage> {
        if let Some(order) = &query.order_by {
            scored.sort_by(|a, b| self.cmp_by_field(a.id, b.id, &order.field, order.direction));
        } else {
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        let ids = scored.into_iter().map(|s| s.id).collect();
        self.paginate_and_load(ids, query).await
    }

    /// Ordering used by `order_by`: null-last for ascending, null-first
    /// for descending, matching [`MetadataIndex`]'s own sort semantics
    /// (spec.md §4.7) since that ordering isn't exposed as a public
    /// comparator there.
    fn cmp_by_field(&self, a: NounId, b: NounId, field: &str, direction: SortDirection) -> Ordering {
        let a_value = self.metadata.get_field_value_for_entity(a, field);
        let b_value = self.metadata.get_field_value_for_entity(b, field);
        let ordering = match (&a_value, &b_value) {
            (Some(x), Some(y)) => {
                let cmp = x.partial_compare(y).unwrap_or(Ordering::Equal);
                match direction {
                    SortDirection::Asc => cmp,
                    SortDirection::Desc => cmp.reverse(),
                }
            }
            (Some(_), None) => match direction {
                SortDirection::Asc => Ordering::Less,
                SortDirection::Desc => Ordering::Greater,
            },
            (None, Some(_)) => match direction {
                SortDirection::Asc => Ordering::Greater,
                SortDirection::Desc => Ordering::Less,
            },
            (None, None) => Ordering::Equal,
        };
        ordering.then_with(|| a.cmp(&b))
    }

    async fn paginate_and_load(&self, ids: Vec<NounId>, query: &FindQuery) -> Result<FindPage> {
        let total = ids.len();
        let page_ids: Vec<NounId> = ids
            .into_iter()
            .skip(query.offset)
            .take(query.limit.max(1))
            .collect();
        let has_more = query.offset + page_ids.len() < total;
        let mut items = Vec::with_capacity(page_ids.len());
        for id in page_ids {
            if let Some(noun) = self.storage.get_noun(&self.known_types, id).await? {
                items.push(noun);
            }
        }
        Ok(FindPage {
            items,
            has_more,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_core::distance::DistanceMetric;
    use neurostore_core::{BranchName, Noun, TypeTag};
    use neurostore_hnsw::HnswConfig;
    use neurostore_storage::backend::MemoryBackend;
    use std::collections::BTreeMap;

    fn type_tag(s: &str) -> TypeTag {
        TypeTag::unchecked(s)
    }

    async fn fixture() -> (Coordinator, Vec<Noun>) {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Arc::new(StorageEngine::new(backend, BranchName::main()));
        let metadata = Arc::new(MetadataIndex::new());
        let graph = Arc::new(GraphIndex::new());
        let hnsw = Arc::new(TypedHnswIndex::new(
            HnswConfig::default(),
            DistanceMetric::Euclidean,
            Some(42),
        ));

        let person = type_tag("PERSON");
        let mut nouns = Vec::new();
        for (i, (x, y)) in [(0.0, 0.0), (1.0, 0.0), (5.0, 5.0)].into_iter().enumerate() {
            let mut noun = Noun::new(neurostore_core::NounId::new(), vec![x, y], person.clone(), 1000 + i as i64);
            let mut meta = BTreeMap::new();
            meta.insert("rank".to_string(), MetadataValue::Int(i as i64));
            noun.metadata = meta;
            storage.save_noun(&noun).await.unwrap();
            hnsw.add(&person, noun.id, noun.vector.clone(), 1000 + i as u64).unwrap();
            metadata.add_to_index(noun.id, 0, &noun.metadata).unwrap();
            nouns.push(noun);
        }

        let coordinator = Coordinator::new(storage, metadata, graph, hnsw, vec![person]);
        (coordinator, nouns)
    }

    #[tokio::test]
    async fn empty_plan_scans_everything_ordered_by_id() {
        let (coordinator, nouns) = fixture().await;
        let query = FindQuery {
            limit: 10,
            ..Default::default()
        };
        let page = coordinator.find(&query).await.unwrap();
        assert_eq!(page.total, nouns.len());
        assert_eq!(page.items.len(), nouns.len());
    }

    #[tokio::test]
    async fn metadata_only_plan_honors_filter() {
        let (coordinator, nouns) = fixture().await;
        let filter = Filter::Field(neurostore_index::FieldFilter {
            field: "rank".to_string(),
            predicate: neurostore_index::Predicate::Eq(MetadataValue::Int(1)),
        });
        let query = FindQuery {
            filter: Some(filter),
            limit: 10,
            ..Default::default()
        };
        let page = coordinator.find(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, nouns[1].id);
    }

    #[tokio::test]
    async fn mixed_plan_scores_by_vector_distance() {
        let (coordinator, nouns) = fixture().await;
        let query = FindQuery {
            query_vector: Some(vec![0.0, 0.0]),
            limit: 10,
            ..Default::default()
        };
        let page = coordinator.find(&query).await.unwrap();
        assert_eq!(page.items[0].id, nouns[0].id);
    }

    #[tokio::test]
    async fn mixed_plan_intersects_vector_hits_with_filter() {
        let (coordinator, nouns) = fixture().await;
        let filter = Filter::Field(neurostore_index::FieldFilter {
            field: "rank".to_string(),
            predicate: neurostore_index::Predicate::Eq(MetadataValue::Int(2)),
        });
        let query = FindQuery {
            query_vector: Some(vec![0.0, 0.0]),
            filter: Some(filter),
            limit: 10,
            ..Default::default()
        };
        let page = coordinator.find(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, nouns[2].id);
    }

    #[tokio::test]
    async fn pagination_applies_after_sort() {
        let (coordinator, _nouns) = fixture().await;
        let query = FindQuery {
            limit: 1,
            offset: 1,
            ..Default::default()
        };
        let page = coordinator.find(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.has_more);
        assert_eq!(page.total, 3);
    }
}
