//! Typed metadata values (Design Notes §9: "Dynamic/typed entities").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single user-defined metadata field value.
///
/// Numeric filters require typed comparison; string equality uses byte
/// equality (Design Notes §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    /// Absence of a value, distinct from the field being unset.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered array of values.
    Array(Vec<MetadataValue>),
    /// Nested object, ordered by key for deterministic serialization.
    Object(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    /// Total order for range-filter comparisons. Returns `None` when the
    /// two values are not comparable (different variants other than the
    /// Int/Float cross-comparison).
    pub fn partial_compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        use MetadataValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Str(a), Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// True if this value is [`MetadataValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// A map of user-defined metadata fields, ordered for deterministic
/// serialization (BTreeMap keeps keys sorted).
pub type MetadataMap = BTreeMap<String, MetadataValue>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn cross_numeric_comparison() {
        assert_eq!(
            MetadataValue::Int(2).partial_compare(&MetadataValue::Float(2.0)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn incomparable_variants_return_none() {
        assert_eq!(
            MetadataValue::Str("x".into()).partial_compare(&MetadataValue::Int(1)),
            None
        );
    }
}
