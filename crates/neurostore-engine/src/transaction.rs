//! Ordered-operation transaction manager with compensating rollback
//! (spec.md §4.10).
//!
//! Grounded on `crates/concurrency/src/transaction.rs` for the
//! `apply`/`rollback` trait shape, but not its optimistic-concurrency
//! conflict detection — spec.md §4.10 asks for a saga-style operation
//! list run single-threaded per branch, which is the simpler fit (see
//! DESIGN.md's Open Question resolution). Concrete [`Operation`] impls
//! wrap the storage engine and the three in-memory indexes so
//! `add`/`update`/`delete`/`relate`/`unrelate` can compose them into one
//! all-or-nothing unit.

use std::sync::Arc;

use async_trait::async_trait;
use neurostore_core::error::{Error, Result};
use neurostore_core::value::MetadataMap;
use neurostore_core::{Noun, NounId, TypeTag, Verb, VerbId};
use neurostore_hnsw::TypedHnswIndex;
use neurostore_index::{GraphIndex, MetadataIndex};
use neurostore_storage::StorageEngine;
use parking_lot::Mutex;

/// A single compensable action. `apply` performs the forward effect;
/// `rollback` undoes it using state captured during `apply`. Both may be
/// called at most once per transaction (rollback only if `apply`
/// succeeded).
#[async_trait]
pub trait Operation: Send + Sync {
    /// Perform the forward effect.
    async fn apply(&self) -> Result<()>;
    /// Undo the effect of a prior successful `apply`.
    async fn rollback(&self) -> Result<()>;
    /// Short name for logging (spec.md §4.10's ordered operation list).
    fn name(&self) -> &'static str;
}

/// An ordered list of operations executed in order; on any failure,
/// previously-applied operations are rolled back in reverse order so the
/// net effect is all-or-nothing (spec.md §4.10).
#[derive(Default)]
pub struct Transaction {
    ops: Vec<Box<dyn Operation>>,
}

impl Transaction {
    /// An empty transaction.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Append an operation to the end of the ordered list.
    pub fn push(&mut self, op: Box<dyn Operation>) {
        self.ops.push(op);
    }

    /// True if no operations have been queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run every operation in order. On the first failure, roll back every
    /// already-applied operation in reverse order and surface the
    /// original error. If a rollback itself fails, that failure is logged
    /// and the transaction instead surfaces [`Error::Fatal`] — spec.md
    /// §7: "rollback failures are logged and downgraded to `Fatal`" (the
    /// original error is no longer locally recoverable at that point,
    /// since the compensating action didn't run).
    pub async fn execute(self) -> Result<()> {
        let mut applied: Vec<Box<dyn Operation>> = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            match op.apply().await {
                Ok(()) => applied.push(op),
                Err(original_err) => {
                    for done in applied.into_iter().rev() {
                        if let Err(rollback_err) = done.rollback().await {
                            tracing::error!(
                                op = done.name(),
                                original = %original_err,
                                rollback = %rollback_err,
                                "rollback failed after transaction aborted"
                            );
                            return Err(Error::Fatal(format!(
                                "rollback of {} failed ({rollback_err}) while unwinding {original_err}",
                                done.name()
                            )));
                        }
                    }
                    return Err(original_err);
                }
            }
        }
        Ok(())
    }
}

// -- noun operations ------------------------------------------------------

/// Save (insert or overwrite) a [`Noun`]'s storage record. Rollback
/// restores whatever was there before, or deletes the record if this was
/// a fresh insert.
pub struct SaveNounOp {
    engine: Arc<StorageEngine>,
    noun: Noun,
    previous: Mutex<Option<Option<Noun>>>,
}

impl SaveNounOp {
    /// Construct the operation. `noun` is the full post-write value.
    pub fn new(engine: Arc<StorageEngine>, noun: Noun) -> Self {
        Self {
            engine,
            noun,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for SaveNounOp {
    async fn apply(&self) -> Result<()> {
        let prior = self.engine.get_noun_typed(&self.noun.type_, self.noun.id).await?;
        *self.previous.lock() = Some(prior);
        self.engine.save_noun(&self.noun).await
    }

    async fn rollback(&self) -> Result<()> {
        match self.previous.lock().clone().flatten() {
            Some(prior) => self.engine.save_noun(&prior).await,
            None => self.engine.delete_noun(&self.noun.type_, self.noun.id).await,
        }
    }

    fn name(&self) -> &'static str {
        "save_noun"
    }
}

/// Delete a noun's storage record. Rollback restores it if it existed.
pub struct DeleteNounOp {
    engine: Arc<StorageEngine>,
    type_: TypeTag,
    id: NounId,
    previous: Mutex<Option<Option<Noun>>>,
}

impl DeleteNounOp {
    /// Construct the operation.
    pub fn new(engine: Arc<StorageEngine>, type_: TypeTag, id: NounId) -> Self {
        Self {
            engine,
            type_,
            id,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for DeleteNounOp {
    async fn apply(&self) -> Result<()> {
        let prior = self.engine.get_noun_typed(&self.type_, self.id).await?;
        *self.previous.lock() = Some(prior);
        self.engine.delete_noun(&self.type_, self.id).await
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(Some(prior)) = self.previous.lock().clone() {
            self.engine.save_noun(&prior).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "delete_noun"
    }
}

// -- HNSW (typed) operations ------------------------------------------------

/// Insert a vector into the type-partitioned HNSW index. Rollback removes
/// it again.
pub struct AddToHnswOp {
    index: Arc<TypedHnswIndex>,
    type_: TypeTag,
    id: NounId,
    vector: Vec<f32>,
    created_at: u64,
}

impl AddToHnswOp {
    /// Construct the operation.
    pub fn new(index: Arc<TypedHnswIndex>, type_: TypeTag, id: NounId, vector: Vec<f32>, created_at: u64) -> Self {
        Self {
            index,
            type_,
            id,
            vector,
            created_at,
        }
    }
}

#[async_trait]
impl Operation for AddToHnswOp {
    async fn apply(&self) -> Result<()> {
        self.index.add(&self.type_, self.id, self.vector.clone(), self.created_at)
    }

    async fn rollback(&self) -> Result<()> {
        self.index.remove(&self.type_, self.id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "add_to_hnsw"
    }
}

/// Remove a vector from the type-partitioned HNSW index. Rollback
/// re-inserts it (a fresh node at a new random level — spec.md §4.9 does
/// not require restoring identical graph edges on rollback, only that the
/// vector becomes searchable again).
pub struct RemoveFromHnswOp {
    index: Arc<TypedHnswIndex>,
    type_: TypeTag,
    id: NounId,
    previous_vector: Mutex<Option<Vec<f32>>>,
    created_at: u64,
}

impl RemoveFromHnswOp {
    /// Construct the operation.
    pub fn new(index: Arc<TypedHnswIndex>, type_: TypeTag, id: NounId, created_at: u64) -> Self {
        Self {
            index,
            type_,
            id,
            previous_vector: Mutex::new(None),
            created_at,
        }
    }
}

#[async_trait]
impl Operation for RemoveFromHnswOp {
    async fn apply(&self) -> Result<()> {
        let vector = self
            .index
            .shard(&self.type_)
            .and_then(|shard| shard.read().get_vector(self.id));
        *self.previous_vector.lock() = vector;
        self.index.remove(&self.type_, self.id);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(vector) = self.previous_vector.lock().clone() {
            self.index.add(&self.type_, self.id, vector, self.created_at)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remove_from_hnsw"
    }
}

// -- metadata index operations ----------------------------------------------

/// Index a noun's metadata. Rollback removes it again.
pub struct AddToMetadataIndexOp {
    index: Arc<MetadataIndex>,
    id: NounId,
    type_ordinal: usize,
    meta: MetadataMap,
}

impl AddToMetadataIndexOp {
    /// Construct the operation.
    pub fn new(index: Arc<MetadataIndex>, id: NounId, type_ordinal: usize, meta: MetadataMap) -> Self {
        Self {
            index,
            id,
            type_ordinal,
            meta,
        }
    }
}

#[async_trait]
impl Operation for AddToMetadataIndexOp {
    async fn apply(&self) -> Result<()> {
        self.index.add_to_index(self.id, self.type_ordinal, &self.meta)
    }

    async fn rollback(&self) -> Result<()> {
        self.index.remove_from_index(self.id, self.type_ordinal, &self.meta)
    }

    fn name(&self) -> &'static str {
        "add_to_metadata_index"
    }
}

/// Remove a noun's metadata from the index. Rollback re-adds it.
pub struct RemoveFromMetadataIndexOp {
    index: Arc<MetadataIndex>,
    id: NounId,
    type_ordinal: usize,
    prev_meta: MetadataMap,
}

impl RemoveFromMetadataIndexOp {
    /// Construct the operation. `prev_meta` is the metadata as it was
    /// indexed, required to remove the correct posting-list entries.
    pub fn new(index: Arc<MetadataIndex>, id: NounId, type_ordinal: usize, prev_meta: MetadataMap) -> Self {
        Self {
            index,
            id,
            type_ordinal,
            prev_meta,
        }
    }
}

#[async_trait]
impl Operation for RemoveFromMetadataIndexOp {
    async fn apply(&self) -> Result<()> {
        self.index.remove_from_index(self.id, self.type_ordinal, &self.prev_meta)
    }

    async fn rollback(&self) -> Result<()> {
        self.index.add_to_index(self.id, self.type_ordinal, &self.prev_meta)
    }

    fn name(&self) -> &'static str {
        "remove_from_metadata_index"
    }
}

// -- verb operations ---------------------------------------------------------

/// Save (insert or overwrite) a [`Verb`]'s storage record.
pub struct SaveVerbOp {
    engine: Arc<StorageEngine>,
    verb: Verb,
    previous: Mutex<Option<Option<Verb>>>,
}

impl SaveVerbOp {
    /// Construct the operation.
    pub fn new(engine: Arc<StorageEngine>, verb: Verb) -> Self {
        Self {
            engine,
            verb,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for SaveVerbOp {
    async fn apply(&self) -> Result<()> {
        let prior = self.engine.get_verb(self.verb.id).await?;
        *self.previous.lock() = Some(prior);
        self.engine.save_verb(&self.verb).await
    }

    async fn rollback(&self) -> Result<()> {
        match self.previous.lock().clone().flatten() {
            Some(prior) => self.engine.save_verb(&prior).await,
            None => self.engine.delete_verb(self.verb.id).await,
        }
    }

    fn name(&self) -> &'static str {
        "save_verb"
    }
}

/// Delete a verb's storage record. Rollback restores it if it existed.
pub struct DeleteVerbOp {
    engine: Arc<StorageEngine>,
    id: VerbId,
    previous: Mutex<Option<Option<Verb>>>,
}

impl DeleteVerbOp {
    /// Construct the operation.
    pub fn new(engine: Arc<StorageEngine>, id: VerbId) -> Self {
        Self {
            engine,
            id,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for DeleteVerbOp {
    async fn apply(&self) -> Result<()> {
        let prior = self.engine.get_verb(self.id).await?;
        *self.previous.lock() = Some(prior);
        self.engine.delete_verb(self.id).await
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(Some(prior)) = self.previous.lock().clone() {
            self.engine.save_verb(&prior).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "delete_verb"
    }
}

// -- graph adjacency index operations ----------------------------------------

/// Record a verb in the graph adjacency index. Rollback removes it.
pub struct AddToGraphIndexOp {
    index: Arc<GraphIndex>,
    verb_id: VerbId,
    source: NounId,
    target: NounId,
    verb_type: TypeTag,
}

impl AddToGraphIndexOp {
    /// Construct the operation.
    pub fn new(index: Arc<GraphIndex>, verb_id: VerbId, source: NounId, target: NounId, verb_type: TypeTag) -> Self {
        Self {
            index,
            verb_id,
            source,
            target,
            verb_type,
        }
    }
}

#[async_trait]
impl Operation for AddToGraphIndexOp {
    async fn apply(&self) -> Result<()> {
        self.index.add_verb(self.verb_id, self.source, self.target, self.verb_type.clone())
    }

    async fn rollback(&self) -> Result<()> {
        self.index.remove_verb(self.verb_id)
    }

    fn name(&self) -> &'static str {
        "add_to_graph_index"
    }
}

/// Remove a verb from the graph adjacency index. Rollback re-adds it
/// using the identity captured during `apply`.
pub struct RemoveFromGraphIndexOp {
    index: Arc<GraphIndex>,
    verb_id: VerbId,
    previous: Mutex<Option<(NounId, NounId, TypeTag)>>,
}

impl RemoveFromGraphIndexOp {
    /// Construct the operation.
    pub fn new(index: Arc<GraphIndex>, verb_id: VerbId) -> Self {
        Self {
            index,
            verb_id,
            previous: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Operation for RemoveFromGraphIndexOp {
    async fn apply(&self) -> Result<()> {
        *self.previous.lock() = self.index.verb_identity(self.verb_id);
        self.index.remove_verb(self.verb_id)
    }

    async fn rollback(&self) -> Result<()> {
        if let Some((source, target, verb_type)) = self.previous.lock().clone() {
            self.index.add_verb(self.verb_id, source, target, verb_type)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remove_from_graph_index"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_core::{BranchName, DistanceMetric};
    use neurostore_hnsw::HnswConfig;
    use neurostore_storage::MemoryBackend;

    fn type_tag() -> TypeTag {
        TypeTag::unchecked("PERSON")
    }

    #[tokio::test]
    async fn all_ops_succeed_commits_everything() {
        let engine = Arc::new(StorageEngine::new(Arc::new(MemoryBackend::new()), BranchName::main()));
        let noun = Noun::new(NounId::new(), vec![1.0, 0.0], type_tag(), 0);

        let mut tx = Transaction::new();
        tx.push(Box::new(SaveNounOp::new(engine.clone(), noun.clone())));
        tx.execute().await.unwrap();

        assert!(engine.get_noun_typed(&type_tag(), noun.id).await.unwrap().is_some());
    }

    /// A failure partway through rolls back every already-applied op, so
    /// the net effect is as if nothing happened (spec.md §4.10).
    struct AlwaysFails;

    #[async_trait]
    impl Operation for AlwaysFails {
        async fn apply(&self) -> Result<()> {
            Err(Error::ValidationError("boom".into()))
        }
        async fn rollback(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "always_fails"
        }
    }

    #[tokio::test]
    async fn failure_rolls_back_prior_operations() {
        let engine = Arc::new(StorageEngine::new(Arc::new(MemoryBackend::new()), BranchName::main()));
        let noun = Noun::new(NounId::new(), vec![1.0, 0.0], type_tag(), 0);

        let mut tx = Transaction::new();
        tx.push(Box::new(SaveNounOp::new(engine.clone(), noun.clone())));
        tx.push(Box::new(AlwaysFails));
        let result = tx.execute().await;

        assert!(result.is_err());
        assert!(engine.get_noun_typed(&type_tag(), noun.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hnsw_add_then_rollback_leaves_node_absent() {
        let hnsw = Arc::new(TypedHnswIndex::new(HnswConfig::default(), DistanceMetric::Cosine, Some(1)));
        let id = NounId::new();

        let mut tx = Transaction::new();
        tx.push(Box::new(AddToHnswOp::new(hnsw.clone(), type_tag(), id, vec![1.0, 0.0], 0)));
        tx.push(Box::new(AlwaysFails));
        assert!(tx.execute().await.is_err());

        assert!(hnsw.shard(&type_tag()).map(|s| !s.read().contains(id)).unwrap_or(true));
    }
}
