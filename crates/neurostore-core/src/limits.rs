//! Size and configuration bounds (spec.md §6).

use crate::error::{Error, Result};

/// Bounds enforced at `init` / construction time. Invalid values fail the
/// caller rather than being silently clamped (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct Limits;

impl Limits {
    /// Minimum allowed HNSW `m` (max connections per node per level).
    pub const M_MIN: usize = 1;
    /// Maximum allowed HNSW `m`.
    pub const M_MAX: usize = 128;
    /// Minimum allowed `ef_construction` / `ef_search`.
    pub const EF_MIN: usize = 1;
    /// Maximum allowed `ef_construction` / `ef_search`.
    pub const EF_MAX: usize = 1000;
    /// Maximum vector dimensionality accepted.
    pub const MAX_DIMENSION: usize = 8192;
    /// Maximum branch name length in bytes.
    pub const MAX_BRANCH_NAME_LEN: usize = 255;
    /// Number of shards entities are partitioned into (spec.md §4.6).
    pub const SHARD_COUNT: u32 = 256;

    /// Validate `m` is within `[M_MIN, M_MAX]`.
    pub fn check_m(m: usize) -> Result<()> {
        if (Self::M_MIN..=Self::M_MAX).contains(&m) {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "m={m} out of range [{}, {}]",
                Self::M_MIN,
                Self::M_MAX
            )))
        }
    }

    /// Validate an `ef_construction`/`ef_search` value.
    pub fn check_ef(ef: usize, field: &str) -> Result<()> {
        if (Self::EF_MIN..=Self::EF_MAX).contains(&ef) {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "{field}={ef} out of range [{}, {}]",
                Self::EF_MIN,
                Self::EF_MAX
            )))
        }
    }

    /// Validate a vector dimensionality.
    pub fn check_dimension(d: usize) -> Result<()> {
        if d > 0 && d <= Self::MAX_DIMENSION {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "dimension {d} out of range (0, {}]",
                Self::MAX_DIMENSION
            )))
        }
    }

    /// Validate that `actual` matches the fixed dimensionality `expected`.
    pub fn check_dimension_match(expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "dimension mismatch: expected {expected}, got {actual}"
            )))
        }
    }

    /// Validate a `confidence`/`weight` value is within `[0, 1]`.
    pub fn check_unit_interval(value: f32, field: &str) -> Result<()> {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "{field}={value} out of range [0, 1]"
            )))
        }
    }
}
