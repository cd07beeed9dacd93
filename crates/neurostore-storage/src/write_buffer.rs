//! Write buffering for cloud-style backends (spec.md §4.4).
//!
//! Modeled on the teacher's `engine::background` scheduler's size/age/
//! explicit flush triggers, keyed by id rather than priority.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

struct Pending<V> {
    value: V,
    buffered_at: Instant,
}

/// Buffers `(id, value)` writes and flushes on size, age, or explicit
/// request. A later write to the same id within the window replaces the
/// earlier one — last-writer-wins within the batch (spec.md §4.4).
pub struct WriteBuffer<V> {
    pending: Mutex<HashMap<Uuid, Pending<V>>>,
    max_size: usize,
    max_age: Duration,
}

impl<V: Clone> WriteBuffer<V> {
    /// Construct a buffer that flushes at `max_size` entries or `max_age`
    /// elapsed since the oldest buffered entry.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_size,
            max_age,
        }
    }

    /// Buffer a write. Returns `true` if the buffer has crossed its
    /// size threshold and the caller should flush.
    pub fn stage(&self, id: Uuid, value: V) -> bool {
        let mut pending = self.pending.lock();
        pending.insert(
            id,
            Pending {
                value,
                buffered_at: Instant::now(),
            },
        );
        pending.len() >= self.max_size
    }

    /// True if the oldest buffered entry has aged past `max_age`.
    pub fn should_flush_by_age(&self) -> bool {
        let pending = self.pending.lock();
        pending
            .values()
            .map(|p| p.buffered_at.elapsed())
            .max()
            .map(|age| age >= self.max_age)
            .unwrap_or(false)
    }

    /// Drain and return all buffered writes, clearing the buffer. Used by
    /// both threshold-triggered and explicit flushes.
    pub fn drain(&self) -> Vec<(Uuid, V)> {
        let mut pending = self.pending.lock();
        pending.drain().map(|(id, p)| (id, p.value)).collect()
    }

    /// Peek a still-buffered value without draining it (reads immediately
    /// after a buffered write must see it, spec.md §4.3).
    pub fn peek(&self, id: Uuid) -> Option<V> {
        self.pending.lock().get(&id).map(|p| p.value.clone())
    }

    /// Drop a pending entry without flushing it (a delete that arrives
    /// while the write is still buffered should win, not be overwritten
    /// by a later flush of the stale staged value).
    pub fn discard(&self, id: Uuid) {
        self.pending.lock().remove(&id);
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
