//! Tree objects: the content-addressed snapshot of a branch's entities
//! and relationships at a single commit (spec.md §4.11).
//!
//! Grounded on `gitnext-core`'s canonical-bytes hashing idiom, generalized
//! here from a file tree to the flat `entities/<id>` / `relations/<src>-
//! <tgt>-<verb>` key scheme spec.md §4.11 specifies directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use neurostore_core::error::Result;
use neurostore_core::hash::{ObjectHash, NULL_HASH};
use neurostore_core::{Noun, NounId, TypeTag, Verb, VerbId};
use neurostore_storage::blob::BlobStore;
use serde::{Deserialize, Serialize};

/// What a [`TreeEntry`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeEntryKind {
    /// A serialized [`Noun`].
    Entity,
    /// A serialized [`Verb`].
    Relation,
}

/// One entry in a [`Tree`]: the content hash and size of a blobbed
/// entity/relation, plus which kind it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Content hash of the serialized entity/relation.
    pub hash: ObjectHash,
    /// Size in bytes of the serialized form.
    pub size: u64,
    /// Entity or relation.
    pub kind: TreeEntryKind,
}

/// A commit's tree: a sorted map from stable key (`entities/<id>` or
/// `relations/<src>-<tgt>-<verb>`) to [`TreeEntry`]. `BTreeMap` keeps keys
/// sorted so the serialized bytes — and therefore the tree's hash — are
/// deterministic regardless of insertion order.
pub type Tree = BTreeMap<String, TreeEntry>;

/// Key under which `noun.id` is recorded in a [`Tree`] (spec.md §4.11).
pub fn entity_key(id: NounId) -> String {
    format!("entities/{id}")
}

/// Key under which a `(source, target, verb_type)` relation is recorded
/// (spec.md §4.11).
pub fn relation_key(source: NounId, target: NounId, verb_type: &TypeTag) -> String {
    format!("relations/{source}-{target}-{verb_type}")
}

/// Parse a `relations/<src>-<tgt>-<verb>` key back into its endpoints.
/// Returns `None` for malformed keys (defensive; every key this module
/// writes round-trips).
pub fn parse_relation_key(key: &str) -> Option<(NounId, NounId, String)> {
    let rest = key.strip_prefix("relations/")?;
    let mut parts = rest.splitn(3, '-');
    let source = parts.next()?;
    let target = parts.next()?;
    let verb_type = parts.next()?;
    Some((
        NounId(uuid::Uuid::parse_str(source).ok()?),
        NounId(uuid::Uuid::parse_str(target).ok()?),
        verb_type.to_string(),
    ))
}

/// Blob-store a [`Noun`], returning its [`TreeEntry`]. Content-addressed:
/// committing the same noun bytes twice never double-stores.
pub async fn blob_entity(blob_store: &BlobStore, noun: &Noun) -> Result<TreeEntry> {
    let bytes = serde_json::to_vec(noun)?;
    let hash = blob_store.write(&bytes).await?;
    Ok(TreeEntry {
        hash,
        size: bytes.len() as u64,
        kind: TreeEntryKind::Entity,
    })
}

/// Blob-store a [`Verb`], returning its [`TreeEntry`].
pub async fn blob_relation(blob_store: &BlobStore, verb: &Verb) -> Result<TreeEntry> {
    let bytes = serde_json::to_vec(verb)?;
    let hash = blob_store.write(&bytes).await?;
    Ok(TreeEntry {
        hash,
        size: bytes.len() as u64,
        kind: TreeEntryKind::Relation,
    })
}

/// Write `tree` as a single blob, returning its hash. An empty tree hashes
/// to [`NULL_HASH`] without touching the backend (spec.md §4.11: "commit
/// with `NULL_HASH` tree").
pub async fn write_tree(blob_store: &BlobStore, tree: &Tree) -> Result<ObjectHash> {
    if tree.is_empty() {
        return Ok(NULL_HASH);
    }
    let bytes = serde_json::to_vec(tree)?;
    blob_store.write(&bytes).await
}

/// Load a tree by hash. `NULL_HASH` always reads as an empty tree.
pub async fn read_tree(blob_store: &BlobStore, hash: &ObjectHash) -> Result<Tree> {
    if hash.is_null() {
        return Ok(Tree::new());
    }
    let bytes = blob_store.read(hash).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read back the [`Noun`] stored at `entry`.
pub async fn load_entity(blob_store: &BlobStore, entry: &TreeEntry) -> Result<Noun> {
    let bytes = blob_store.read(&entry.hash).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read back the [`Verb`] stored at `entry`.
pub async fn load_relation(blob_store: &BlobStore, entry: &TreeEntry) -> Result<Verb> {
    let bytes = blob_store.read(&entry.hash).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Assemble a tree from the full live entity/relation set, blobbing each
/// one by content (spec.md §4.11: "serialize each to a blob (dedupped by
/// content), assemble a tree keyed by stable identifiers").
pub async fn build_tree(
    blob_store: &Arc<BlobStore>,
    nouns: &[Noun],
    verbs: &[Verb],
) -> Result<Tree> {
    let mut tree = Tree::new();
    for noun in nouns {
        let entry = blob_entity(blob_store, noun).await?;
        tree.insert(entity_key(noun.id), entry);
    }
    for verb in verbs {
        let entry = blob_relation(blob_store, verb).await?;
        tree.insert(relation_key(verb.source_id, verb.target_id, &verb.verb_type), entry);
    }
    Ok(tree)
}

/// Every `VerbId` is not recoverable from a relation key alone (the key
/// carries `(source, target, verb_type)`, not the verb's own id) — this
/// helper exists only so callers who need a stable per-relation id for a
/// historical view can mint one deterministically from the key itself,
/// rather than trusting a freshly-generated `VerbId::new()` that would
/// differ across `as_of` calls for the same commit.
pub fn relation_id_from_key(key: &str) -> VerbId {
    VerbId(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurostore_storage::backend::MemoryBackend;

    #[tokio::test]
    async fn empty_tree_hashes_to_null() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new()));
        let hash = write_tree(&store, &Tree::new()).await.unwrap();
        assert!(hash.is_null());
    }

    #[tokio::test]
    async fn build_tree_round_trips_entities_and_relations() {
        let store = Arc::new(BlobStore::new(Arc::new(MemoryBackend::new())));
        let noun = Noun::new(NounId::new(), vec![1.0, 0.0], TypeTag::unchecked("PERSON"), 1);
        let verb = Verb::new(
            VerbId::new(),
            noun.id,
            NounId::new(),
            TypeTag::unchecked("KNOWS"),
            1.0,
            vec![],
            1,
        );
        let tree = build_tree(&store, &[noun.clone()], &[verb.clone()]).await.unwrap();
        assert_eq!(tree.len(), 2);

        let hash = write_tree(&store, &tree).await.unwrap();
        let loaded = read_tree(&store, &hash).await.unwrap();
        let entry = loaded.get(&entity_key(noun.id)).unwrap();
        let reloaded_noun = load_entity(&store, entry).await.unwrap();
        assert_eq!(reloaded_noun.id, noun.id);
    }

    #[test]
    fn relation_key_round_trips() {
        let s = NounId::new();
        let t = NounId::new();
        let key = relation_key(s, t, &TypeTag::unchecked("KNOWS"));
        let (s2, t2, verb) = parse_relation_key(&key).unwrap();
        assert_eq!((s, t, verb.as_str()), (s2, t2, "KNOWS"));
    }
}
