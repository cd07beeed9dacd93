//! The `Database` core API facade (spec.md §4.13): the single entry
//! point this workspace exposes. It owns no algorithm of its own —
//! every operation here composes the storage engine, the three
//! in-memory indexes, the HNSW dispatcher, the transaction manager and
//! the commit layer that the other modules implement.
//!
//! Grounded on `crates/engine/src/database/mod.rs` and the teacher's
//! root `src/lib.rs` (`Strata` facade, `StrataConfig`, open/close
//! lifecycle): same "one struct, `Arc`'d inner state, async open/close"
//! shape, rescoped here to `add`/`get`/`update`/`delete`/`relate`/
//! `unrelate`/`find`/`similar`/`fork`/`checkout`/`commit`/`as_of` plus
//! the batch and lifecycle wrappers (spec.md §4.13, §4.11).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use neurostore_core::config::StorageBackendConfig;
use neurostore_core::error::{Error, Result};
use neurostore_core::hash::ObjectHash;
use neurostore_core::value::MetadataMap;
use neurostore_core::{
    BranchName, CancellationToken, DistanceMetric, EngineConfig, Limits, Noun, NounId,
    PersistenceMode, TypeRegistry, TypeTag, Verb, VerbId,
};
use neurostore_hnsw::persistence::DirtyTracker;
use neurostore_hnsw::{HnswConfig, TypeSelector, TypedHnswIndex};
use neurostore_index::graph::Direction;
use neurostore_index::{GraphIndex, MetadataIndex};
use neurostore_storage::backend::{LocalFsBackend, MemoryBackend, ObjectBackend};
use neurostore_storage::backpressure::Backpressure;
use neurostore_storage::blob::BlobStore;
use neurostore_storage::engine::{NounVectorRecord, Pagination, StorageEngine};
use neurostore_storage::write_buffer::WriteBuffer;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::commit::{BranchState, Commit, CommitLayer, CommitStore, HistoricalView, RefManager};
use crate::commit::tree;
use crate::coordinator::{Coordinator, FindPage, FindQuery};
use crate::transaction::{
    AddToGraphIndexOp, AddToHnswOp, AddToMetadataIndexOp, DeleteNounOp, DeleteVerbOp,
    RemoveFromGraphIndexOp, RemoveFromHnswOp, RemoveFromMetadataIndexOp, SaveNounOp, SaveVerbOp,
    Transaction,
};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_backend(storage: &StorageBackendConfig) -> Result<Arc<dyn ObjectBackend>> {
    match storage {
        StorageBackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageBackendConfig::LocalFs { path } => Ok(Arc::new(LocalFsBackend::new(path.clone())?)),
    }
}

/// Which vector a `similar` call should search near.
#[derive(Debug, Clone)]
pub enum SimilarTarget {
    /// Search near an already-stored entity's embedding.
    Id(NounId),
    /// Search near a caller-supplied raw vector.
    Vector(Vec<f32>),
}

/// Fields accepted by [`Database::add`].
#[derive(Debug, Clone, Default)]
pub struct AddInput {
    /// Caller-supplied id. A fresh one is generated if absent.
    pub id: Option<NounId>,
    /// Dense embedding. Must match the collection's fixed dimension once
    /// one has been established by an earlier insert.
    pub vector: Vec<f32>,
    /// Optional confidence in `[0, 1]`.
    pub confidence: Option<f32>,
    /// Optional weight in `[0, 1]`.
    pub weight: Option<f32>,
    /// Optional tenant tag.
    pub service: Option<String>,
    /// Optional raw payload that was embedded to produce `vector`.
    pub data: Option<String>,
    /// Optional provenance tag.
    pub created_by: Option<String>,
    /// User-defined metadata fields.
    pub metadata: MetadataMap,
}

/// Patch fields accepted by [`Database::update`]. `None` leaves the
/// existing value untouched; metadata is merged key-by-key rather than
/// replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct UpdateInput {
    /// Replacement embedding, if the caller re-embedded the entity.
    pub vector: Option<Vec<f32>>,
    /// Metadata fields to set or overwrite; existing fields not named
    /// here are preserved.
    pub metadata: Option<MetadataMap>,
    /// Replacement confidence.
    pub confidence: Option<f32>,
    /// Replacement weight.
    pub weight: Option<f32>,
    /// Replacement tenant tag.
    pub service: Option<String>,
    /// Replacement raw payload.
    pub data: Option<String>,
}

/// One noun type's share of engine state. A fresh bundle is built for
/// every `fork`/`checkout` target; the storage engine is branch-scoped
/// by construction, and the indexes always start matching the branch
/// they're rebuilt from (spec.md §4.11).
struct BranchBundle {
    branch: BranchName,
    storage: Arc<StorageEngine>,
    metadata: Arc<MetadataIndex>,
    graph: Arc<GraphIndex>,
    hnsw: Arc<TypedHnswIndex>,
}

/// Write-buffer sizing when `config.batch_writes` opts a cloud-style
/// backend into batching (spec.md §4.4): flush after 64 staged vectors
/// or 200ms, whichever comes first.
const WRITE_BUFFER_MAX_SIZE: usize = 64;
const WRITE_BUFFER_MAX_AGE: std::time::Duration = std::time::Duration::from_millis(200);

fn fresh_bundle(
    branch: BranchName,
    backend: Arc<dyn ObjectBackend>,
    hnsw_config: HnswConfig,
    distance: DistanceMetric,
    backpressure: Arc<Backpressure>,
    write_buffer: Option<Arc<WriteBuffer<(TypeTag, NounVectorRecord)>>>,
) -> BranchBundle {
    let mut storage = StorageEngine::new(backend, branch.clone()).with_backpressure(backpressure);
    if let Some(buffer) = write_buffer {
        storage = storage.with_write_buffer(buffer);
    }
    BranchBundle {
        storage: Arc::new(storage),
        metadata: Arc::new(MetadataIndex::new()),
        graph: Arc::new(GraphIndex::new()),
        hnsw: Arc::new(TypedHnswIndex::new(hnsw_config, distance, None)),
        branch,
    }
}

/// Coordinates the one rebuild-from-storage pass a branch needs before
/// it can answer metadata/graph queries correctly (spec.md §5: "lazy
/// rebuild mutex" — concurrent callers share a single in-flight
/// rebuild rather than each kicking off their own scan).
struct RebuildGuard {
    done: AtomicBool,
    lock: AsyncMutex<()>,
}

impl RebuildGuard {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            lock: AsyncMutex::new(()),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.done.store(false, Ordering::Release);
    }
}

struct Inner {
    backend: Arc<dyn ObjectBackend>,
    noun_types: TypeRegistry,
    verb_types: TypeRegistry,
    bundle: RwLock<Arc<BranchBundle>>,
    commit_layer: Arc<CommitLayer>,
    blobs: Arc<BlobStore>,
    dimension: RwLock<Option<usize>>,
    rebuild: RebuildGuard,
    backpressure: Arc<Backpressure>,
    write_buffer: Option<Arc<WriteBuffer<(TypeTag, NounVectorRecord)>>>,
    dirty: DirtyTracker,
    distance: DistanceMetric,
    hnsw_config: HnswConfig,
    max_query_limit: usize,
    disable_auto_rebuild: bool,
}

impl Inner {
    fn bundle(&self) -> Arc<BranchBundle> {
        self.bundle.read().clone()
    }

    /// All known noun types, cloned out of the registry once per call.
    /// Kept as a plain method rather than a cached field: the registry
    /// itself never changes after `open`, so cloning a handful of
    /// `Arc<str>`-backed tags is cheap relative to a storage round trip.
    fn all_noun_types(&self) -> Vec<TypeTag> {
        self.noun_types.iter().cloned().collect()
    }

    async fn ensure_rebuilt(&self) -> Result<()> {
        self.ensure_rebuilt_cancellable(None).await
    }

    /// [`Self::ensure_rebuilt`], checking `cancel` between storage pages
    /// (spec.md §5: rebuild is a long-running operation that must accept
    /// a cancellation signal). On cancellation the "completed" flag is
    /// left clear, matching §4.9's "on failure the flag is cleared so
    /// the next query retries" — a cancelled rebuild is not a successful
    /// one.
    async fn ensure_rebuilt_cancellable(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        if self.rebuild.is_done() {
            return Ok(());
        }
        let _guard = self.rebuild.lock.lock().await;
        if self.rebuild.is_done() {
            return Ok(());
        }
        self.rebuild_indexes(cancel).await?;
        self.rebuild.mark_done();
        Ok(())
    }

    /// Repopulate the metadata and graph indexes from storage, and top
    /// up the HNSW dispatcher with any id storage knows about that the
    /// dispatcher doesn't yet (a fresh branch has neither; a forked
    /// branch's HNSW already carries every parent id by COW, so this
    /// only ever inserts what's actually missing — re-inserting an
    /// already-present id would needlessly reassign its HNSW level).
    async fn rebuild_indexes(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let bundle = self.bundle();
        bundle.metadata.clear();
        bundle.graph.clear();

        for type_tag in self.all_noun_types() {
            let ordinal = self.noun_types.ordinal(&type_tag)?;
            let mut offset = 0;
            loop {
                if let Some(token) = cancel {
                    token.check()?;
                }
                let page = bundle
                    .storage
                    .get_nouns(&type_tag, Pagination { limit: 500, offset })
                    .await?;
                let got = page.items.len();
                for noun in page.items {
                    bundle.metadata.add_to_index(noun.id, ordinal, &noun.metadata)?;
                    let already_present = bundle
                        .hnsw
                        .shard(&type_tag)
                        .map(|shard| shard.read().contains(noun.id))
                        .unwrap_or(false);
                    if !already_present && !noun.vector.is_empty() {
                        bundle.hnsw.add(
                            &type_tag,
                            noun.id,
                            noun.vector,
                            noun.created_at.max(0) as u64,
                        )?;
                    }
                }
                if !page.has_more {
                    break;
                }
                offset += got;
            }
        }

        for verb in bundle.storage.all_verbs().await? {
            bundle
                .graph
                .add_verb(verb.id, verb.source_id, verb.target_id, verb.verb_type)?;
        }
        Ok(())
    }

    /// Resolve `vector`'s dimension against the collection-wide fixed
    /// dimension, fixing it on the very first non-empty insert (spec.md
    /// §6: "dimension is `None` until the first insert fixes it").
    fn check_and_fix_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Ok(());
        }
        let mut dim = self.dimension.write();
        match *dim {
            Some(expected) => Limits::check_dimension_match(expected, vector.len()),
            None => {
                Limits::check_dimension(vector.len())?;
                *dim = Some(vector.len());
                Ok(())
            }
        }
    }

    /// Persist the HNSW node's current full state (vector, per-level
    /// connections, level) for `id`, honoring the configured
    /// persistence mode (spec.md §4.9). A no-op if the node has no
    /// snapshot, e.g. a vector-less noun that never entered the index.
    async fn persist_vector_state(
        &self,
        bundle: &BranchBundle,
        type_tag: &TypeTag,
        id: NounId,
    ) -> Result<()> {
        if !self.dirty.mark_dirty(type_tag.clone(), id) {
            return Ok(());
        }
        self.flush_one(bundle, type_tag, id).await
    }

    async fn flush_one(&self, bundle: &BranchBundle, type_tag: &TypeTag, id: NounId) -> Result<()> {
        let Some(node) = bundle.hnsw.node_snapshot(type_tag, id) else {
            return Ok(());
        };
        let mut connections = std::collections::BTreeMap::new();
        for (layer, neighbors) in node.neighbors.into_iter().enumerate() {
            connections.insert(layer as u32, neighbors);
        }
        let record = NounVectorRecord {
            format_version: neurostore_core::FORMAT_VERSION,
            id,
            vector: node.vector,
            connections,
            level: node.max_layer as u32,
        };
        bundle.storage.save_noun_vector(type_tag, &record).await
    }

    /// Flush every dirty HNSW node to storage (spec.md §4.9 `flush`).
    async fn flush_dirty(&self) -> Result<()> {
        let bundle = self.bundle();
        for (type_tag, id) in self.dirty.take_dirty() {
            self.flush_one(&bundle, &type_tag, id).await?;
        }
        Ok(())
    }
}

/// The embedded neural database: vector search, metadata/graph
/// secondary indexes and a git-like branch/commit layer behind one
/// facade (spec.md §4.13).
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open (or create) a database from `config`. Validates eagerly,
    /// builds the configured backend, and — unless
    /// `disable_auto_rebuild` is set — rebuilds the metadata/graph
    /// indexes from storage before returning.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let backend = build_backend(&config.storage)?;
        let noun_types = TypeRegistry::new(config.noun_types.clone())?;
        let verb_types = TypeRegistry::new(config.verb_types.clone())?;
        let hnsw_config = HnswConfig::new(config.index.m, config.index.ef_construction, config.index.ef_search)?;
        let distance = config.distance;
        let branch = BranchName::new(config.branch.clone())?;
        let backpressure = Arc::new(Backpressure::new(config.max_concurrent_operations));
        // Only cloud-style backends benefit from batching (spec.md §4.4);
        // a local/memory backend writes through even with batch_writes set.
        let write_buffer = (config.batch_writes && backend.is_cloud())
            .then(|| Arc::new(WriteBuffer::new(WRITE_BUFFER_MAX_SIZE, WRITE_BUFFER_MAX_AGE)));

        let bundle = Arc::new(fresh_bundle(
            branch,
            backend.clone(),
            hnsw_config.clone(),
            distance,
            backpressure.clone(),
            write_buffer.clone(),
        ));
        bundle.storage.load_counts().await?;
        neurostore_storage::shutdown::register(&bundle.storage);

        let refs = Arc::new(RefManager::new(backend.clone()));
        let blobs = Arc::new(BlobStore::new(backend.clone()));
        let commits = Arc::new(CommitStore::new(backend.clone()));
        let commit_layer = Arc::new(CommitLayer::new(refs, blobs.clone(), commits));

        let persistence_mode = config
            .persistence
            .unwrap_or_else(|| neurostore_hnsw::persistence::derive_default_mode(backend.is_cloud()));

        let inner = Arc::new(Inner {
            backend,
            noun_types,
            verb_types,
            bundle: RwLock::new(bundle),
            commit_layer,
            blobs,
            dimension: RwLock::new(config.dimension),
            rebuild: RebuildGuard::new(),
            backpressure,
            write_buffer,
            dirty: DirtyTracker::new(persistence_mode),
            distance,
            hnsw_config,
            max_query_limit: config.max_query_limit,
            disable_auto_rebuild: config.disable_auto_rebuild,
        });

        let db = Self { inner };
        if !db.inner.disable_auto_rebuild {
            db.inner.ensure_rebuilt().await?;
        }
        Ok(db)
    }

    /// Force the lazy index rebuild now instead of waiting for the
    /// first query to trigger it (spec.md §5).
    pub async fn init(&self) -> Result<()> {
        self.inner.ensure_rebuilt().await
    }

    /// [`Self::init`], checking `cancel` between storage pages of the
    /// rebuild scan (spec.md §5 "Cancellation").
    pub async fn init_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.ensure_rebuilt_cancellable(Some(cancel)).await
    }

    /// True once the metadata/graph indexes have been rebuilt from
    /// storage for the current branch.
    pub fn is_ready(&self) -> bool {
        self.inner.rebuild.is_done()
    }

    fn noun_type(&self, name: &str) -> Result<TypeTag> {
        self.inner.noun_types.lookup(name)
    }

    fn verb_type(&self, name: &str) -> Result<TypeTag> {
        self.inner.verb_types.lookup(name)
    }

    async fn find_any_noun(&self, bundle: &BranchBundle, id: NounId) -> Result<Option<Noun>> {
        bundle.storage.get_noun(&self.inner.all_noun_types(), id).await
    }

    // -- CRUD -------------------------------------------------------------

    /// Insert a new noun of `type_name`, indexing it into HNSW and the
    /// metadata index as one transaction (spec.md §4.13 `add`).
    pub async fn add(&self, type_name: &str, input: AddInput) -> Result<Noun> {
        self.inner.ensure_rebuilt().await?;
        let type_tag = self.noun_type(type_name)?;
        self.inner.check_and_fix_dimension(&input.vector)?;
        if let Some(confidence) = input.confidence {
            Limits::check_unit_interval(confidence, "confidence")?;
        }
        if let Some(weight) = input.weight {
            Limits::check_unit_interval(weight, "weight")?;
        }

        let bundle = self.inner.bundle();
        let id = input.id.unwrap_or_default();
        let now = now_ms();
        let mut noun = Noun::new(id, input.vector, type_tag.clone(), now);
        noun.confidence = input.confidence;
        noun.weight = input.weight;
        noun.service = input.service;
        noun.data = input.data;
        noun.created_by = input.created_by;
        noun.metadata = input.metadata;

        let ordinal = self.inner.noun_types.ordinal(&type_tag)?;
        let mut tx = Transaction::new();
        tx.push(Box::new(SaveNounOp::new(bundle.storage.clone(), noun.clone())));
        if !noun.vector.is_empty() {
            tx.push(Box::new(AddToHnswOp::new(
                bundle.hnsw.clone(),
                type_tag.clone(),
                id,
                noun.vector.clone(),
                now.max(0) as u64,
            )));
        }
        tx.push(Box::new(AddToMetadataIndexOp::new(
            bundle.metadata.clone(),
            id,
            ordinal,
            noun.metadata.clone(),
        )));
        tx.execute().await?;

        if !noun.vector.is_empty() {
            self.inner.persist_vector_state(&bundle, &type_tag, id).await?;
        }
        Ok(noun)
    }

    /// Fetch a single noun by id, or `None` if it doesn't exist under
    /// `type_name`.
    pub async fn get(&self, type_name: &str, id: NounId) -> Result<Option<Noun>> {
        self.inner.ensure_rebuilt().await?;
        let type_tag = self.noun_type(type_name)?;
        let bundle = self.inner.bundle();
        bundle.storage.get_noun_typed(&type_tag, id).await
    }

    /// Apply `patch` to an existing noun, re-indexing whatever it
    /// touched (spec.md §4.13 `update`): metadata is always
    /// re-indexed (cheap, and patches may touch arbitrary fields);
    /// HNSW is only re-indexed when the vector actually changed.
    pub async fn update(&self, type_name: &str, id: NounId, patch: UpdateInput) -> Result<Noun> {
        self.inner.ensure_rebuilt().await?;
        let type_tag = self.noun_type(type_name)?;
        let bundle = self.inner.bundle();
        let mut noun = bundle
            .storage
            .get_noun_typed(&type_tag, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("noun {id} not found in {type_name}")))?;
        let ordinal = self.inner.noun_types.ordinal(&type_tag)?;
        let prev_metadata = noun.metadata.clone();

        let vector_changed = if let Some(vector) = patch.vector {
            self.inner.check_and_fix_dimension(&vector)?;
            noun.vector = vector;
            true
        } else {
            false
        };
        if let Some(metadata) = patch.metadata {
            for (field, value) in metadata {
                noun.metadata.insert(field, value);
            }
        }
        if let Some(confidence) = patch.confidence {
            Limits::check_unit_interval(confidence, "confidence")?;
            noun.confidence = Some(confidence);
        }
        if let Some(weight) = patch.weight {
            Limits::check_unit_interval(weight, "weight")?;
            noun.weight = Some(weight);
        }
        if let Some(service) = patch.service {
            noun.service = Some(service);
        }
        if let Some(data) = patch.data {
            noun.data = Some(data);
        }
        noun.updated_at = now_ms();

        let mut tx = Transaction::new();
        tx.push(Box::new(SaveNounOp::new(bundle.storage.clone(), noun.clone())));
        tx.push(Box::new(RemoveFromMetadataIndexOp::new(
            bundle.metadata.clone(),
            id,
            ordinal,
            prev_metadata,
        )));
        tx.push(Box::new(AddToMetadataIndexOp::new(
            bundle.metadata.clone(),
            id,
            ordinal,
            noun.metadata.clone(),
        )));
        if vector_changed {
            tx.push(Box::new(RemoveFromHnswOp::new(
                bundle.hnsw.clone(),
                type_tag.clone(),
                id,
                noun.updated_at.max(0) as u64,
            )));
            tx.push(Box::new(AddToHnswOp::new(
                bundle.hnsw.clone(),
                type_tag.clone(),
                id,
                noun.vector.clone(),
                noun.updated_at.max(0) as u64,
            )));
        }
        tx.execute().await?;

        if vector_changed {
            self.inner.persist_vector_state(&bundle, &type_tag, id).await?;
        }
        Ok(noun)
    }

    /// Delete a noun and every verb touching it, all as one
    /// transaction (spec.md §4.13 `delete`). Returns `false` if it
    /// didn't exist.
    pub async fn delete(&self, type_name: &str, id: NounId) -> Result<bool> {
        self.inner.ensure_rebuilt().await?;
        let type_tag = self.noun_type(type_name)?;
        let bundle = self.inner.bundle();
        let Some(noun) = bundle.storage.get_noun_typed(&type_tag, id).await? else {
            return Ok(false);
        };
        let ordinal = self.inner.noun_types.ordinal(&type_tag)?;
        let touched_verbs = bundle.graph.get_verb_ids_touching(id);

        let mut tx = Transaction::new();
        tx.push(Box::new(DeleteNounOp::new(bundle.storage.clone(), type_tag.clone(), id)));
        tx.push(Box::new(RemoveFromHnswOp::new(
            bundle.hnsw.clone(),
            type_tag.clone(),
            id,
            now_ms().max(0) as u64,
        )));
        tx.push(Box::new(RemoveFromMetadataIndexOp::new(
            bundle.metadata.clone(),
            id,
            ordinal,
            noun.metadata,
        )));
        for verb_id in touched_verbs {
            tx.push(Box::new(RemoveFromGraphIndexOp::new(bundle.graph.clone(), verb_id)));
            tx.push(Box::new(DeleteVerbOp::new(bundle.storage.clone(), verb_id)));
        }
        tx.execute().await?;
        Ok(true)
    }

    // -- batch wrappers ----------------------------------------------------

    /// Add several nouns of the same type. Each insert is its own
    /// transaction; a failure partway through leaves earlier inserts
    /// committed and returns the error for the failing item (spec.md
    /// §4.13's batch operations are not a single all-or-nothing unit
    /// across items, only within each item's own transaction).
    pub async fn batch_add(&self, type_name: &str, inputs: Vec<AddInput>) -> Result<Vec<Noun>> {
        self.batch_add_cancellable(type_name, inputs, None).await
    }

    /// [`Self::batch_add`], checking `cancel` between items (spec.md §5
    /// "Cancellation"). Cooperative: an item already in flight completes;
    /// no further item is started once cancelled, and the error returned
    /// is [`Error::Cancelled`] rather than the partial results, so a
    /// cancelled batch never reads as a success to the caller.
    pub async fn batch_add_cancellable(
        &self,
        type_name: &str,
        inputs: Vec<AddInput>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Noun>> {
        let mut out = Vec::with_capacity(inputs.len());
        for input in inputs {
            if let Some(token) = cancel {
                token.check()?;
            }
            out.push(self.add(type_name, input).await?);
        }
        Ok(out)
    }

    /// Fetch several nouns of the same type by id, preserving order and
    /// reporting absent ids as `None`.
    pub async fn batch_get(&self, type_name: &str, ids: &[NounId]) -> Result<Vec<Option<Noun>>> {
        self.inner.ensure_rebuilt().await?;
        let type_tag = self.noun_type(type_name)?;
        let bundle = self.inner.bundle();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(bundle.storage.get_noun_typed(&type_tag, *id).await?);
        }
        Ok(out)
    }

    /// Delete several nouns of the same type, returning how many
    /// actually existed.
    pub async fn batch_delete(&self, type_name: &str, ids: &[NounId]) -> Result<usize> {
        self.batch_delete_cancellable(type_name, ids, None).await
    }

    /// [`Self::batch_delete`], checking `cancel` between items.
    pub async fn batch_delete_cancellable(
        &self,
        type_name: &str,
        ids: &[NounId],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let mut count = 0;
        for id in ids {
            if let Some(token) = cancel {
                token.check()?;
            }
            if self.delete(type_name, *id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    // -- relations ----------------------------------------------------------

    /// Create a relation `(source) -verb_type-> (target)` (spec.md
    /// §4.12 `relate`). Both endpoints must already exist. A relation
    /// of the same `(source, target, verb_type)` that already exists is
    /// returned rather than duplicated.
    pub async fn relate(
        &self,
        source: NounId,
        verb_type_name: &str,
        target: NounId,
        weight: f32,
        metadata: MetadataMap,
    ) -> Result<VerbId> {
        self.inner.ensure_rebuilt().await?;
        Limits::check_unit_interval(weight, "weight")?;
        let verb_type = self.verb_type(verb_type_name)?;
        let bundle = self.inner.bundle();

        if self.find_any_noun(&bundle, source).await?.is_none() {
            return Err(Error::EndpointMissing(format!("source noun {source} does not exist")));
        }
        if self.find_any_noun(&bundle, target).await?.is_none() {
            return Err(Error::EndpointMissing(format!("target noun {target} does not exist")));
        }

        if bundle.graph.has_edge(source, target) {
            for verb_id in bundle.graph.get_verb_ids_by_source(source) {
                if let Some((_, candidate_target, candidate_type)) = bundle.graph.verb_identity(verb_id) {
                    if candidate_target == target && candidate_type == verb_type {
                        return Ok(verb_id);
                    }
                }
            }
        }

        let id = VerbId::new();
        let now = now_ms();
        let mut verb = Verb::new(id, source, target, verb_type.clone(), weight, Vec::new(), now);
        verb.metadata = metadata;

        let mut tx = Transaction::new();
        tx.push(Box::new(SaveVerbOp::new(bundle.storage.clone(), verb)));
        tx.push(Box::new(AddToGraphIndexOp::new(bundle.graph.clone(), id, source, target, verb_type)));
        tx.execute().await?;
        Ok(id)
    }

    /// Delete a relation by id (spec.md §4.12 `unrelate`). Returns
    /// `false` if it didn't exist.
    pub async fn unrelate(&self, verb_id: VerbId) -> Result<bool> {
        self.inner.ensure_rebuilt().await?;
        let bundle = self.inner.bundle();
        if bundle.storage.get_verb(verb_id).await?.is_none() {
            return Ok(false);
        }
        let mut tx = Transaction::new();
        tx.push(Box::new(RemoveFromGraphIndexOp::new(bundle.graph.clone(), verb_id)));
        tx.push(Box::new(DeleteVerbOp::new(bundle.storage.clone(), verb_id)));
        tx.execute().await?;
        Ok(true)
    }

    /// Neighbor ids of `id` in `direction` (spec.md §4.8).
    pub async fn neighbors(&self, id: NounId, direction: Direction) -> Result<Vec<NounId>> {
        self.inner.ensure_rebuilt().await?;
        let bundle = self.inner.bundle();
        Ok(bundle.graph.get_neighbors(id, direction))
    }

    // -- query ---------------------------------------------------------------

    /// Execute a combined filter/vector/graph query (spec.md §4.12
    /// `find`), clamping `limit` to the configured `max_query_limit`.
    pub async fn find(&self, mut query: FindQuery) -> Result<FindPage> {
        self.inner.ensure_rebuilt().await?;
        if query.limit == 0 || query.limit > self.inner.max_query_limit {
            query.limit = self.inner.max_query_limit;
        }
        let bundle = self.inner.bundle();
        let coordinator = Coordinator::new(
            bundle.storage.clone(),
            bundle.metadata.clone(),
            bundle.graph.clone(),
            bundle.hnsw.clone(),
            self.inner.all_noun_types(),
        );
        coordinator.find(&query).await
    }

    /// Pure vector similarity search near `to` (spec.md §4.13
    /// `similar`), optionally restricted to one noun type.
    pub async fn similar(
        &self,
        to: SimilarTarget,
        type_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(Noun, f32)>> {
        self.inner.ensure_rebuilt().await?;
        let bundle = self.inner.bundle();
        let vector = match to {
            SimilarTarget::Vector(v) => v,
            SimilarTarget::Id(id) => {
                let noun = self
                    .find_any_noun(&bundle, id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("noun {id} not found")))?;
                if noun.vector.is_empty() {
                    return Err(Error::VectorRequired);
                }
                noun.vector
            }
        };
        let selector = match type_name {
            Some(name) => TypeSelector::One(self.noun_type(name)?),
            None => TypeSelector::Any,
        };
        let limit = limit.min(self.inner.max_query_limit).max(1);
        let hits = bundle.hnsw.search(&selector, &vector, limit)?;

        let all_types = self.inner.all_noun_types();
        let mut out = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            if let Some(noun) = bundle.storage.get_noun(&all_types, id).await? {
                out.push((noun, (1.0 / (1.0 + distance)).clamp(0.0, 1.0)));
            }
        }
        Ok(out)
    }

    // -- branches / commits ---------------------------------------------------

    /// Fork the current branch into a new, independent `Database`
    /// handle sharing the same backend (spec.md §4.11 `fork`): the ref
    /// copy is instant, but unlike the ref the branch's noun/verb
    /// objects are not shared by the backend, so `fork` materializes
    /// them into the new branch's prefix before returning — only the
    /// HNSW dispatcher shares parent state by reference (COW) until its
    /// first write.
    pub async fn fork(&self, dest: BranchName) -> Result<Self> {
        let bundle = self.inner.bundle();
        let now = now_ms();
        self.inner.commit_layer.fork(&bundle.branch, &dest, now).await?;
        bundle.storage.copy_branch_objects(&dest).await?;

        let mut dest_storage_inner =
            StorageEngine::new(self.inner.backend.clone(), dest.clone()).with_backpressure(self.inner.backpressure.clone());
        if let Some(buffer) = &self.inner.write_buffer {
            dest_storage_inner = dest_storage_inner.with_write_buffer(buffer.clone());
        }
        let dest_storage = Arc::new(dest_storage_inner);
        dest_storage.load_counts().await?;
        neurostore_storage::shutdown::register(&dest_storage);
        let dest_bundle = Arc::new(BranchBundle {
            branch: dest.clone(),
            storage: dest_storage,
            metadata: Arc::new(MetadataIndex::new()),
            graph: Arc::new(GraphIndex::new()),
            hnsw: Arc::new(bundle.hnsw.fork()),
        });

        let inner = Arc::new(Inner {
            backend: self.inner.backend.clone(),
            noun_types: self.inner.noun_types.clone(),
            verb_types: self.inner.verb_types.clone(),
            bundle: RwLock::new(dest_bundle),
            commit_layer: self.inner.commit_layer.clone(),
            blobs: self.inner.blobs.clone(),
            dimension: RwLock::new(*self.inner.dimension.read()),
            rebuild: RebuildGuard::new(),
            backpressure: self.inner.backpressure.clone(),
            write_buffer: self.inner.write_buffer.clone(),
            dirty: DirtyTracker::new(self.inner.dirty.mode()),
            distance: self.inner.distance,
            hnsw_config: self.inner.hnsw_config.clone(),
            max_query_limit: self.inner.max_query_limit,
            disable_auto_rebuild: self.inner.disable_auto_rebuild,
        });
        let forked = Self { inner };
        if !forked.inner.disable_auto_rebuild {
            forked.inner.ensure_rebuilt().await?;
        }
        Ok(forked)
    }

    /// Switch this handle to `branch` in place (spec.md §4.11
    /// `checkout`). The branch must already have at least one commit.
    pub async fn checkout(&self, branch: BranchName) -> Result<()> {
        if self.inner.commit_layer.branch_state(&branch).await? == BranchState::Unborn {
            return Err(Error::ValidationError(format!("branch {branch} does not exist")));
        }
        let new_bundle = Arc::new(fresh_bundle(
            branch,
            self.inner.backend.clone(),
            self.inner.hnsw_config.clone(),
            self.inner.distance,
            self.inner.backpressure.clone(),
            self.inner.write_buffer.clone(),
        ));
        new_bundle.storage.load_counts().await?;
        neurostore_storage::shutdown::register(&new_bundle.storage);
        *self.inner.bundle.write() = new_bundle;
        self.inner.rebuild.reset();
        self.inner.ensure_rebuilt().await?;
        Ok(())
    }

    /// Record a commit on the current branch (spec.md §4.11 `commit`).
    /// When `capture_state` is true, every live noun and verb on the
    /// branch is blobbed and assembled into a tree; otherwise the
    /// commit carries `NULL_HASH` and only marks a point in history.
    pub async fn commit(&self, author: &str, message: &str, capture_state: bool) -> Result<ObjectHash> {
        let bundle = self.inner.bundle();
        self.flush().await?;
        let now = now_ms();

        let tree_hash = if capture_state {
            let mut nouns = Vec::new();
            for type_tag in self.inner.all_noun_types() {
                let mut offset = 0;
                loop {
                    let page = bundle
                        .storage
                        .get_nouns(&type_tag, Pagination { limit: 500, offset })
                        .await?;
                    let got = page.items.len();
                    nouns.extend(page.items);
                    if !page.has_more {
                        break;
                    }
                    offset += got;
                }
            }
            let verbs = bundle.storage.all_verbs().await?;
            let tree = tree::build_tree(&self.inner.blobs, &nouns, &verbs).await?;
            tree::write_tree(&self.inner.blobs, &tree).await?
        } else {
            neurostore_core::hash::NULL_HASH
        };

        let counts = bundle.storage.counts();
        self.inner
            .commit_layer
            .commit(
                &bundle.branch,
                tree_hash,
                author,
                message,
                now,
                counts.total_noun_count,
                counts.total_verb_count,
                serde_json::Value::Null,
            )
            .await
    }

    /// Full commit history of the current branch, newest first.
    pub async fn history(&self) -> Result<Vec<Commit>> {
        let bundle = self.inner.bundle();
        self.inner.commit_layer.history(&bundle.branch).await
    }

    /// Open a read-only [`Snapshot`] of the tree captured at `commit`
    /// (spec.md §4.11 `as_of`).
    pub async fn as_of(&self, commit: ObjectHash) -> Result<Snapshot> {
        let view = self.inner.commit_layer.historical_view(commit).await?;
        Ok(Snapshot {
            view,
            noun_types: self.inner.noun_types.clone(),
            hnsw_config: self.inner.hnsw_config.clone(),
            distance: self.inner.distance,
        })
    }

    // -- lifecycle -----------------------------------------------------------

    /// Flush any HNSW nodes deferred under [`PersistenceMode::Deferred`]
    /// and write back pending counts (spec.md §4.9, §4.13 `flush`).
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush_dirty().await?;
        let bundle = self.inner.bundle();
        bundle.storage.flush_write_buffer().await?;
        if bundle.storage.counts_dirty() {
            bundle.storage.flush_counts().await?;
        }
        Ok(())
    }

    /// Flush and release this handle (spec.md §4.13 `close`). `Database`
    /// holds no OS-level resources beyond what `flush` already settles,
    /// so closing is just a final flush by another name.
    pub async fn close(&self) -> Result<()> {
        self.flush().await
    }

    /// Soft cap on how many in-flight backend operations this database
    /// currently admits (spec.md §5 backpressure/admission control).
    pub fn capacity(&self) -> usize {
        self.inner.backpressure.current_capacity()
    }
}

/// A read-only view over the entity/relationship tree captured at one
/// commit (spec.md §4.11 `as_of`). Mutating methods always fail with
/// [`Error::ReadOnlySnapshot`]; this is a frozen branch, not a writable
/// fork.
pub struct Snapshot {
    view: HistoricalView,
    noun_types: TypeRegistry,
    hnsw_config: HnswConfig,
    distance: DistanceMetric,
}

impl Snapshot {
    /// Every key (`entities/<id>` / `relations/<source>-<target>-<type>`)
    /// present in this snapshot's tree.
    pub fn keys(&self) -> Vec<String> {
        self.view.keys().map(str::to_string).collect()
    }

    /// Number of tree entries captured.
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// True if the commit captured no state (a state-less commit, or an
    /// empty branch).
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Load a single noun as it existed at this commit.
    pub async fn get(&self, id: NounId) -> Result<Option<Noun>> {
        match self.view.load(&tree::entity_key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load several nouns as they existed at this commit.
    pub async fn batch_get(&self, ids: &[NounId]) -> Result<Vec<Option<Noun>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get(*id).await?);
        }
        Ok(out)
    }

    async fn all_nouns(&self) -> Result<Vec<Noun>> {
        let keys: Vec<String> = self.view.keys().map(str::to_string).collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(rest) = key.strip_prefix("entities/") {
                let _ = rest;
                if let Some(bytes) = self.view.load(&key).await? {
                    out.push(serde_json::from_slice(&bytes)?);
                }
            }
        }
        Ok(out)
    }

    /// Vector similarity search within this snapshot, via a throwaway
    /// HNSW index built over the snapshot's captured entities (spec.md
    /// §4.11: "storage is a historical adapter reading from the tree").
    pub async fn similar(
        &self,
        to: SimilarTarget,
        type_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(Noun, f32)>> {
        let vector = match to {
            SimilarTarget::Vector(v) => v,
            SimilarTarget::Id(id) => {
                let noun = self
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("noun {id} not found")))?;
                if noun.vector.is_empty() {
                    return Err(Error::VectorRequired);
                }
                noun.vector
            }
        };

        let index = TypedHnswIndex::new(self.hnsw_config.clone(), self.distance, None);
        for noun in self.all_nouns().await? {
            if let Some(name) = type_name {
                if noun.type_.as_str() != name {
                    continue;
                }
            }
            index.add(&noun.type_, noun.id, noun.vector.clone(), noun.created_at.max(0) as u64)?;
        }
        let selector = match type_name {
            Some(name) => TypeSelector::One(self.noun_types.lookup(name)?),
            None => TypeSelector::Any,
        };
        let hits = index.search(&selector, &vector, limit.max(1))?;

        let mut out = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            if let Some(noun) = self.get(id).await? {
                out.push((noun, (1.0 / (1.0 + distance)).clamp(0.0, 1.0)));
            }
        }
        Ok(out)
    }

    /// Always fails: a snapshot is read-only (spec.md §4.11).
    pub fn add(&self, _type_name: &str, _input: AddInput) -> Result<Noun> {
        Err(Error::ReadOnlySnapshot)
    }

    /// Always fails: a snapshot is read-only (spec.md §4.11).
    pub fn update(&self, _type_name: &str, _id: NounId, _patch: UpdateInput) -> Result<Noun> {
        Err(Error::ReadOnlySnapshot)
    }

    /// Always fails: a snapshot is read-only (spec.md §4.11).
    pub fn delete(&self, _type_name: &str, _id: NounId) -> Result<bool> {
        Err(Error::ReadOnlySnapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_core::config::EngineConfig;

    fn meta(pairs: &[(&str, &str)]) -> MetadataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), neurostore_core::MetadataValue::Str(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let noun = db
            .add(
                "PERSON",
                AddInput {
                    vector: vec![1.0, 0.0, 0.0],
                    metadata: meta(&[("name", "ada")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fetched = db.get("PERSON", noun.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, noun.id);
        assert_eq!(fetched.vector, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn update_changes_vector_and_metadata() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let noun = db
            .add(
                "PERSON",
                AddInput {
                    vector: vec![1.0, 0.0],
                    metadata: meta(&[("name", "ada")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let updated = db
            .update(
                "PERSON",
                noun.id,
                UpdateInput {
                    vector: Some(vec![0.0, 1.0]),
                    metadata: Some(meta(&[("city", "london")])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.vector, vec![0.0, 1.0]);
        assert!(updated.metadata.contains_key("name"));
        assert!(updated.metadata.contains_key("city"));
    }

    #[tokio::test]
    async fn delete_removes_touching_verbs() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let a = db
            .add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() })
            .await
            .unwrap();
        let b = db
            .add("PERSON", AddInput { vector: vec![0.0, 1.0], ..Default::default() })
            .await
            .unwrap();
        let verb_id = db.relate(a.id, "KNOWS", b.id, 0.5, MetadataMap::new()).await.unwrap();

        assert!(db.delete("PERSON", a.id).await.unwrap());
        assert!(db.unrelate(verb_id).await.unwrap() == false);
    }

    #[tokio::test]
    async fn relate_is_idempotent_for_duplicate_edges() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let a = db
            .add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() })
            .await
            .unwrap();
        let b = db
            .add("PERSON", AddInput { vector: vec![0.0, 1.0], ..Default::default() })
            .await
            .unwrap();
        let first = db.relate(a.id, "KNOWS", b.id, 0.5, MetadataMap::new()).await.unwrap();
        let second = db.relate(a.id, "KNOWS", b.id, 0.9, MetadataMap::new()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn relate_rejects_missing_endpoint() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let a = db
            .add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() })
            .await
            .unwrap();
        let err = db
            .relate(a.id, "KNOWS", NounId::new(), 0.5, MetadataMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointMissing(_)));
    }

    #[tokio::test]
    async fn fork_sees_parent_state_then_diverges() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let noun = db
            .add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() })
            .await
            .unwrap();
        db.commit("tester", "seed", true).await.unwrap();

        let forked = db.fork(BranchName::new("experiment").unwrap()).await.unwrap();
        assert!(forked.get("PERSON", noun.id).await.unwrap().is_some());

        forked
            .add("PERSON", AddInput { vector: vec![0.0, 1.0], ..Default::default() })
            .await
            .unwrap();
        let main_page = db
            .find(FindQuery {
                filter: None,
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(main_page.items.len(), 1);
    }

    #[tokio::test]
    async fn similar_with_euclidean_metric_matches_spec_scenario_3() {
        let db = Database::open(EngineConfig {
            distance: DistanceMetric::Euclidean,
            ..Default::default()
        })
        .await
        .unwrap();
        let x = db
            .add("THING", AddInput { vector: vec![1.0, 0.0], ..Default::default() })
            .await
            .unwrap();
        db.add("THING", AddInput { vector: vec![0.0, 1.0], ..Default::default() })
            .await
            .unwrap();

        let hits = db
            .similar(SimilarTarget::Id(x.id), None, 1)
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        let (_, score) = &hits[0];
        // Euclidean distance between orthogonal unit vectors is sqrt(2),
        // so similarity = 1 / (1 + sqrt(2)).
        let expected = 1.0 / (1.0 + std::f32::consts::SQRT_2);
        assert!((score - expected).abs() < 1e-4, "unexpected score {score}");
    }

    #[tokio::test]
    async fn as_of_is_read_only() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        db.add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() }).await.unwrap();
        let commit = db.commit("tester", "seed", true).await.unwrap();
        let snapshot = db.as_of(commit).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(matches!(snapshot.add("PERSON", AddInput::default()), Err(Error::ReadOnlySnapshot)));
    }

    #[tokio::test]
    async fn batch_add_cancellable_stops_after_cancellation() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let inputs = vec![
            AddInput { vector: vec![1.0, 0.0], ..Default::default() },
            AddInput { vector: vec![0.0, 1.0], ..Default::default() },
        ];
        let err = db
            .batch_add_cancellable("PERSON", inputs, Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let page = db.find(FindQuery { filter: None, limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.items.len(), 0);
    }

    #[tokio::test]
    async fn batch_add_cancellable_runs_to_completion_without_a_token() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let inputs = vec![
            AddInput { vector: vec![1.0, 0.0], ..Default::default() },
            AddInput { vector: vec![0.0, 1.0], ..Default::default() },
        ];
        let added = db.batch_add_cancellable("PERSON", inputs, None).await.unwrap();
        assert_eq!(added.len(), 2);
    }

    #[tokio::test]
    async fn batch_delete_cancellable_honors_token() {
        let db = Database::open(EngineConfig::default()).await.unwrap();
        let a = db.add("PERSON", AddInput { vector: vec![1.0, 0.0], ..Default::default() }).await.unwrap();
        let b = db.add("PERSON", AddInput { vector: vec![0.0, 1.0], ..Default::default() }).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = db
            .batch_delete_cancellable("PERSON", &[a.id, b.id], Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // neither delete ran once the token was already cancelled
        assert!(db.get("PERSON", a.id).await.unwrap().is_some());
        assert!(db.get("PERSON", b.id).await.unwrap().is_some());
    }
}
