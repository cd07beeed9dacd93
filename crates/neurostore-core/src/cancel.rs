//! Cooperative cancellation for long-running operations (spec.md §5:
//! "batch, rebuild, streaming history, `as_of` query... cancellation is
//! cooperative — in-flight work completes but no new sub-work is
//! scheduled").
//!
//! Grounded in shape on Design Notes §9's "coroutine-like APIs... become
//! streams yielding items with a cancellation token" — [`CancellationToken`]
//! is the shared flag threaded into those APIs. A plain `Arc<AtomicBool>`
//! is enough: nothing here needs `tokio_util::sync::CancellationToken`'s
//! hierarchical child-token machinery, since neurostore's cancellation
//! scopes are always one call deep (a single batch, a single rebuild, a
//! single stream), not nested pipelines of tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A shared, cloneable flag a caller can use to cooperatively cancel a
/// long-running operation. Checked at iteration boundaries (once per
/// batch item, once per rebuild page, once per history step) — never
/// preempts mid-item work, per spec.md §5.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Build a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Convenience check: returns `Err(Error::Cancelled)` if cancelled,
    /// else `Ok(())`. Call this between units of work in a loop.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
        assert!(t.check().is_ok());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let t = CancellationToken::new();
        let clone = t.clone();
        clone.cancel();
        assert!(t.is_cancelled());
        assert!(matches!(t.check(), Err(Error::Cancelled)));
    }
}
