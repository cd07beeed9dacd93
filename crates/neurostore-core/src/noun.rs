//! The `Noun` (entity) data model (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::value::MetadataMap;
use crate::{NounId, TypeTag, FORMAT_VERSION};

/// A vector-bearing entity with type, metadata, and provenance.
///
/// Invariants (spec.md §3): `vector.len() == dimension` for the owning
/// collection; `type_` is present and registered; `(id, branch)` is
/// unique, enforced by the storage engine rather than this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noun {
    /// Format version this record was written with.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Stable identifier.
    pub id: NounId,
    /// Dense embedding. Length is fixed per collection on first insert.
    pub vector: Vec<f32>,
    /// Closed noun-type.
    pub type_: TypeTag,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: i64,
    /// Last update time, Unix epoch milliseconds.
    pub updated_at: i64,
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

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Noun {
    /// Construct a new noun with the current format version and explicit
    /// timestamps. `id` is expected to already be resolved (fresh or
    /// caller-supplied).
    pub fn new(id: NounId, vector: Vec<f32>, type_: TypeTag, now_ms: i64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            id,
            vector,
            type_,
            created_at: now_ms,
            updated_at: now_ms,
            confidence: None,
            weight: None,
            service: None,
            data: None,
            created_by: None,
            metadata: MetadataMap::new(),
        }
    }
}
