//! The `Verb` (relation) data model (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::value::MetadataMap;
use crate::{NounId, TypeTag, VerbId, FORMAT_VERSION};

/// A directed, typed edge between two [`crate::Noun`]s.
///
/// Invariant (spec.md §3): the tuple `(source, target, verb_type)` is
/// unique per branch — duplicates are rejected/deduplicated by the graph
/// adjacency index and query coordinator, not by this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verb {
    /// Format version this record was written with.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Stable identifier.
    pub id: VerbId,
    /// Source noun id.
    pub source_id: NounId,
    /// Target noun id.
    pub target_id: NounId,
    /// Closed verb-type.
    pub verb_type: TypeTag,
    /// Weight, typically in `[0, 1]` but not enforced at this layer.
    pub weight: f32,
    /// Embedding. May be derived from `source`/`target` vectors by the
    /// caller (spec.md §3: "implementation may derive it").
    pub vector: Vec<f32>,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: i64,
    /// User-defined metadata fields.
    pub metadata: MetadataMap,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Verb {
    /// Construct a new verb with the current format version.
    pub fn new(
        id: VerbId,
        source_id: NounId,
        target_id: NounId,
        verb_type: TypeTag,
        weight: f32,
        vector: Vec<f32>,
        now_ms: i64,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            id,
            source_id,
            target_id,
            verb_type,
            weight,
            vector,
            created_at: now_ms,
            metadata: MetadataMap::new(),
        }
    }

    /// The `(source, target, verb_type)` identity used for dedup lookups
    /// (spec.md §4.12: "relate MUST consult the graph adjacency index").
    pub fn identity(&self) -> (NounId, NounId, TypeTag) {
        (self.source_id, self.target_id, self.verb_type.clone())
    }
}
