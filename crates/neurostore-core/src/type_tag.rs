//! Closed-but-configurable enumeration backing noun types and verb types.
//!
//! Grounded on `crates/core/src/contract/primitive_type.rs`: a small
//! validated newtype rather than a hardcoded Rust `enum`, so new domains
//! don't require recompiling the crate — but the enumeration is still
//! "closed" in the sense spec.md §3 requires: a [`TypeRegistry`] is built
//! once at [`crate::EngineConfig`] load time and every subsequent
//! reference to a `TypeTag` is validated against it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A validated noun-type or verb-type name.
///
/// `TypeTag` values are only ever constructed via [`TypeRegistry::intern`]
/// or [`TypeRegistry::lookup`], which enforce the closed-enumeration
/// invariant (spec.md §3: "type present").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag(pub(crate) Arc<str>);

impl TypeTag {
    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct a `TypeTag` without registry validation. Used internally
    /// for bootstrap/default registries and tests; prefer
    /// [`TypeRegistry::lookup`] elsewhere so unknown types are rejected.
    pub fn unchecked(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed set of noun-types or verb-types, each mapped to a stable
/// ordinal used by per-type count arrays (spec.md §4.7: "fixed-width
/// integer array keyed by the noun-type enum ordinal").
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    by_name: HashMap<Arc<str>, u32>,
    by_ordinal: Vec<TypeTag>,
}

impl TypeRegistry {
    /// Build a registry from an ordered list of type names. Order
    /// determines ordinal assignment, so configuration changes that only
    /// append new types preserve existing ordinals.
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_ordinal = Vec::new();
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(Error::ValidationError("empty type name".into()));
            }
            let tag = TypeTag::unchecked(name.clone());
            let arc: Arc<str> = Arc::from(name.as_str());
            if by_name.insert(arc, by_ordinal.len() as u32).is_some() {
                return Err(Error::ValidationError(format!(
                    "duplicate type name: {name}"
                )));
            }
            by_ordinal.push(tag);
        }
        if by_ordinal.is_empty() {
            return Err(Error::ValidationError(
                "type registry must contain at least one type".into(),
            ));
        }
        Ok(Self {
            by_name,
            by_ordinal,
        })
    }

    /// Validate `name` against the closed set and return its `TypeTag`.
    pub fn lookup(&self, name: &str) -> Result<TypeTag> {
        self.by_name
            .get(name)
            .map(|&ord| self.by_ordinal[ord as usize].clone())
            .ok_or_else(|| Error::ValidationError(format!("unknown type: {name}")))
    }

    /// Stable ordinal for a known tag, used as an index into per-type
    /// count arrays.
    pub fn ordinal(&self, tag: &TypeTag) -> Result<usize> {
        self.by_name
            .get(&tag.0)
            .map(|&ord| ord as usize)
            .ok_or_else(|| Error::ValidationError(format!("unknown type: {tag}")))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_ordinal.len()
    }

    /// True if the registry has no types (never true for a registry built
    /// via [`Self::new`], which rejects empty lists).
    pub fn is_empty(&self) -> bool {
        self.by_ordinal.is_empty()
    }

    /// Iterate all registered tags in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeTag> {
        self.by_ordinal.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_rejected() {
        let reg = TypeRegistry::new(["PERSON", "PLACE"]).unwrap();
        assert!(reg.lookup("PERSON").is_ok());
        assert!(reg.lookup("WIDGET").is_err());
    }

    #[test]
    fn ordinals_are_stable_in_declaration_order() {
        let reg = TypeRegistry::new(["PERSON", "PLACE", "THING"]).unwrap();
        let person = reg.lookup("PERSON").unwrap();
        let thing = reg.lookup("THING").unwrap();
        assert_eq!(reg.ordinal(&person).unwrap(), 0);
        assert_eq!(reg.ordinal(&thing).unwrap(), 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        assert!(TypeRegistry::new(["PERSON", "PERSON"]).is_err());
    }
}
