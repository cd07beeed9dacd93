//! Dirty-tracking and flush-policy primitives for HNSW persistence
//! (spec.md §4.9).
//!
//! Grounded on `crates/engine/src/primitives/vector/wal.rs`'s
//! dirty-tracking idiom, adapted from WAL-entry granularity to
//! whole-node dirty tracking: a node is either clean (matches what was
//! last written) or dirty (needs a `save_noun_vector` call before the
//! next read of the persisted copy can be trusted). This crate only
//! decides *when* a flush is due; `neurostore-engine` owns the
//! `StorageEngine` handle that actually performs the write.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use neurostore_core::{NounId, PersistenceMode, TypeTag};
use parking_lot::Mutex;

/// Derive the default persistence mode from whether the storage backend
/// is cloud-classified (spec.md §4.9: "cloud -> deferred, local ->
/// immediate").
pub fn derive_default_mode(is_cloud: bool) -> PersistenceMode {
    if is_cloud {
        PersistenceMode::Deferred
    } else {
        PersistenceMode::Immediate
    }
}

/// Dirty nodes are flushed once this many have accumulated, even before
/// the age threshold elapses.
const DEFAULT_FLUSH_SIZE_THRESHOLD: usize = 256;

/// Dirty nodes older than this are flushed regardless of count.
const DEFAULT_FLUSH_AGE_THRESHOLD: Duration = Duration::from_secs(5);

/// Tracks which `(type, id)` pairs have been mutated since the last
/// flush, for [`PersistenceMode::Deferred`] operation.
pub struct DirtyTracker {
    mode: PersistenceMode,
    size_threshold: usize,
    age_threshold: Duration,
    dirty: Mutex<HashSet<(TypeTag, NounId)>>,
    oldest_dirty_at: Mutex<Option<Instant>>,
}

impl DirtyTracker {
    /// Build a tracker for `mode` with default flush thresholds.
    pub fn new(mode: PersistenceMode) -> Self {
        Self {
            mode,
            size_threshold: DEFAULT_FLUSH_SIZE_THRESHOLD,
            age_threshold: DEFAULT_FLUSH_AGE_THRESHOLD,
            dirty: Mutex::new(HashSet::new()),
            oldest_dirty_at: Mutex::new(None),
        }
    }

    /// The persistence mode this tracker was built for.
    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    /// Record that `(type_tag, id)` changed. Returns `true` if the
    /// caller should flush immediately: always true for
    /// [`PersistenceMode::Immediate`], or when a deferred threshold has
    /// just been crossed.
    pub fn mark_dirty(&self, type_tag: TypeTag, id: NounId) -> bool {
        if self.mode == PersistenceMode::Immediate {
            return true;
        }
        let mut dirty = self.dirty.lock();
        dirty.insert((type_tag, id));
        let mut oldest = self.oldest_dirty_at.lock();
        if oldest.is_none() {
            *oldest = Some(Instant::now());
        }
        dirty.len() >= self.size_threshold
    }

    /// True if a deferred flush is due by age, independent of size.
    pub fn should_flush_by_age(&self) -> bool {
        if self.mode == PersistenceMode::Immediate {
            return false;
        }
        self.oldest_dirty_at
            .lock()
            .map(|t| t.elapsed() >= self.age_threshold)
            .unwrap_or(false)
    }

    /// True if any node is currently dirty.
    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Drain and return every currently dirty `(type, id)` pair,
    /// resetting the age clock.
    pub fn take_dirty(&self) -> Vec<(TypeTag, NounId)> {
        let mut dirty = self.dirty.lock();
        *self.oldest_dirty_at.lock() = None;
        dirty.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_mode_always_flushes() {
        let t = DirtyTracker::new(PersistenceMode::Immediate);
        assert!(t.mark_dirty(TypeTag::unchecked("PERSON"), NounId::new()));
        assert!(!t.has_dirty());
    }

    #[test]
    fn deferred_mode_accumulates_until_threshold() {
        let t = DirtyTracker::new(PersistenceMode::Deferred);
        for _ in 0..DEFAULT_FLUSH_SIZE_THRESHOLD - 1 {
            assert!(!t.mark_dirty(TypeTag::unchecked("PERSON"), NounId::new()));
        }
        assert!(t.mark_dirty(TypeTag::unchecked("PERSON"), NounId::new()));
    }

    #[test]
    fn take_dirty_drains_and_resets() {
        let t = DirtyTracker::new(PersistenceMode::Deferred);
        t.mark_dirty(TypeTag::unchecked("PERSON"), NounId::new());
        assert!(t.has_dirty());
        let drained = t.take_dirty();
        assert_eq!(drained.len(), 1);
        assert!(!t.has_dirty());
    }

    #[test]
    fn derive_mode_matches_backend_kind() {
        assert_eq!(derive_default_mode(true), PersistenceMode::Deferred);
        assert_eq!(derive_default_mode(false), PersistenceMode::Immediate);
    }
}
