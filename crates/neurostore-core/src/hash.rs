//! Content-addressed hashing for the blob store and COW commit layer.
//!
//! Grounded on `gitnext-core::ObjectId` (BLAKE3-256, hex display).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte BLAKE3 digest, the content address for blobs, trees, and
/// commits (spec.md §3, §4.1, §4.11).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash([u8; 32]);

/// The distinguished "empty" hash. Never written to the backend (spec.md
/// §4.1).
pub const NULL_HASH: ObjectHash = ObjectHash([0u8; 32]);

impl ObjectHash {
    /// Hash `bytes` with BLAKE3.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-hex rendering, used as the on-disk path component
    /// (`_cow/blobs/<hash-prefix>/<hash>`).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lower-hex digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// First byte rendered as two hex chars, used for the blob store's
    /// `<hash-prefix>` directory fan-out.
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// True if this is the distinguished empty hash.
    pub fn is_null(&self) -> bool {
        *self == NULL_HASH
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = ObjectHash::of(b"hello");
        let b = ObjectHash::of(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, ObjectHash::of(b"world"));
    }

    #[test]
    fn hex_round_trips() {
        let h = ObjectHash::of(b"round-trip");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ObjectHash::from_hex(&hex), Some(h));
    }

    #[test]
    fn null_hash_is_all_zero_and_distinct() {
        assert!(NULL_HASH.is_null());
        assert!(!ObjectHash::of(b"x").is_null());
    }
}
