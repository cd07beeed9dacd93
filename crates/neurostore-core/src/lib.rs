//! Core types for neurostore
//!
//! This crate defines the foundational types shared by every other
//! `neurostore-*` crate:
//! - [`NounId`] / [`VerbId`]: stable entity/relation identifiers
//! - [`TypeTag`]: the closed-but-configurable enumeration backing noun/verb
//!   types
//! - [`MetadataValue`]: the typed sum used for user metadata fields
//! - [`Noun`] / [`Verb`]: the two data-model structs (spec.md §3)
//! - [`Error`] / [`Result`]: the one error hierarchy used everywhere
//! - [`ObjectHash`]: content-addressed hash used by the blob store and the
//!   COW commit layer
//! - [`EngineConfig`]: recognized configuration options (spec.md §6)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod distance;
pub mod error;
pub mod hash;
pub mod limits;
pub mod noun;
pub mod type_tag;
pub mod value;
pub mod verb;

pub use cancel::CancellationToken;
pub use config::{EngineConfig, IndexConfig, PersistenceMode};
pub use distance::{cosine_distance, dot_distance, euclidean_distance, DistanceFn, DistanceMetric};
pub use error::{Error, Result};
pub use hash::{ObjectHash, NULL_HASH};
pub use limits::Limits;
pub use noun::Noun;
pub use type_tag::{TypeRegistry, TypeTag};
pub use value::MetadataValue;
pub use verb::Verb;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current on-disk / on-wire format version.
///
/// Every persisted object (noun vector/metadata, verb vector/metadata,
/// counts, commits) carries this value. Readers that encounter a higher
/// version than they understand fail with [`Error::Fatal`] rather than
/// guessing at forward compatibility.
pub const FORMAT_VERSION: u32 = 1;

/// Stable identifier for a [`Noun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NounId(pub Uuid);

impl NounId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NounId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NounId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NounId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Stable identifier for a [`Verb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerbId(pub Uuid);

impl VerbId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VerbId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VerbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for VerbId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Name of a branch. Defaults to `"main"` per spec.md §6.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchName(String);

impl BranchName {
    /// Construct a branch name, validating it is non-empty and contains no
    /// path separators (branch names become path segments, spec.md §4.6).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(Error::ValidationError(format!(
                "invalid branch name: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// The default branch name, `"main"`.
    pub fn main() -> Self {
        Self("main".to_string())
    }

    /// Borrow the branch name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
