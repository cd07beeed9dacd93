//! Error types for neurostore
//!
//! One error enum is used across the whole workspace, the same way the
//! teacher's `StrataError` is re-exported from every crate. Variants map
//! directly onto the error kinds enumerated in spec.md §7.

use thiserror::Error;

/// Result type alias used throughout neurostore.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for neurostore (spec.md §7).
#[derive(Debug, Error)]
pub enum Error {
    /// Id or path not found. Most call sites treat this as a non-error
    /// `None`/no-op (see `get`/`delete` in spec.md §4.13) — this variant
    /// exists for layers (blob store, object backend) that must
    /// distinguish "absent" from "empty".
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad input: dimension mismatch, unknown noun/verb type, out-of-range
    /// config value, malformed filter.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A transient backend failure, retryable inside the storage engine up
    /// to its configured budget.
    #[error("storage error: {0}")]
    StorageError(String),

    /// The backend signalled a rate limit (HTTP 429/503, quota, slow-down).
    #[error("throttled: {0}")]
    Throttled(String),

    /// The caller cancelled a long-running operation.
    #[error("cancelled")]
    Cancelled,

    /// A write was attempted against an `as_of` read-only snapshot.
    #[error("read-only snapshot")]
    ReadOnlySnapshot,

    /// An invariant was violated with no local recovery (corrupt commit
    /// hash, bitmap inconsistency, unknown format version).
    #[error("fatal: {0}")]
    Fatal(String),

    /// A noun or verb endpoint referenced by a relation does not exist.
    #[error("endpoint missing: {0}")]
    EndpointMissing(String),

    /// `similar()` was called with an entity that carries no vector and no
    /// vector was supplied.
    #[error("vector required")]
    VectorRequired,

    /// The configured storage backend does not support copy-on-write fork.
    #[error("storage is not COW-capable")]
    StorageNotCowCapable,

    /// `fork()` failed after validation (e.g. destination branch exists).
    #[error("fork failed: {0}")]
    ForkFailed(String),

    /// I/O error from the underlying filesystem/network.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Storage/throttle errors are retryable by the storage engine's retry
    /// wrapper (spec.md §7 policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageError(_) | Error::Throttled(_))
    }

    /// `DuplicateRelation` is modeled as a non-error (the existing id is
    /// returned, see spec.md §4.12); this helper exists for callers that
    /// want to distinguish a "no-op found existing" outcome from a real
    /// failure when propagating from lower layers that do raise it as an
    /// error internally before the API layer suppresses it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
