//! Admission control over object-backend calls (spec.md §4.5).
//!
//! Grounded on the teacher's `background::BackpressureError` naming and
//! its `database`-level retry/backoff shape, rebuilt here as a permit
//! pool over `tokio::sync::Semaphore` that shrinks on throttling signals
//! and recovers on sustained success, per spec.md §4.5 and §5.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use neurostore_core::error::{Error, Result};
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

/// Minimum permit pool size backpressure will shrink to, even under
/// sustained throttling.
const MIN_PERMITS: u32 = 1;

/// Consecutive successes required before the pool grows back by one.
const RECOVERY_STREAK: i64 = 20;

/// A held permit. Dropping it without calling [`Backpressure::release`]
/// is treated as a successful release (permits return to the
/// semaphore via `SemaphorePermit`'s own `Drop`), matching "weight for
/// batches equals batch size divided by preferred concurrency" from
/// spec.md §5: batched work acquires multiple permits at once.
pub struct Permit<'a> {
    _inner: SemaphorePermit<'a>,
}

/// Admission control bounding concurrent in-flight backend requests.
/// Shrinks the permit pool with exponential decay on a throttling
/// signal (HTTP 429/503, quota, slow-down) and recovers on a sustained
/// run of successes (spec.md §4.5).
pub struct Backpressure {
    semaphore: Semaphore,
    max_permits: u32,
    current_permits: AtomicU32,
    success_streak: AtomicI64,
}

impl Backpressure {
    /// Construct a pool with a soft maximum of `max_permits` concurrent
    /// in-flight requests.
    pub fn new(max_permits: usize) -> Self {
        let max_permits = max_permits.max(MIN_PERMITS as usize) as u32;
        Self {
            semaphore: Semaphore::new(max_permits as usize),
            max_permits,
            current_permits: AtomicU32::new(max_permits),
            success_streak: AtomicI64::new(0),
        }
    }

    /// Acquire `weight` permits, suspending until available. `id` is
    /// accepted for symmetry with [`Self::release`] and future
    /// per-caller accounting; it is not currently used for scheduling.
    pub async fn request_permission(&self, _id: Uuid, weight: usize) -> Result<Permit<'_>> {
        let weight = weight.max(1) as u32;
        let permit = self
            .semaphore
            .acquire_many(weight)
            .await
            .map_err(|_| Error::StorageError("backpressure semaphore closed".into()))?;
        Ok(Permit { _inner: permit })
    }

    /// Release a permit, reporting whether the underlying call
    /// succeeded. `ok = false` signals a throttling event: the pool
    /// shrinks (exponential decay) and the success streak resets.
    /// `ok = true` accumulates toward the recovery streak, growing the
    /// pool back by one permit every [`RECOVERY_STREAK`] consecutive
    /// successes (spec.md §4.5).
    pub fn release(&self, _id: Uuid, ok: bool) {
        if ok {
            let streak = self.success_streak.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= RECOVERY_STREAK {
                self.success_streak.store(0, Ordering::SeqCst);
                self.grow_by(1);
            }
        } else {
            self.success_streak.store(0, Ordering::SeqCst);
            self.shrink_by_half();
        }
    }

    fn shrink_by_half(&self) {
        let current = self.current_permits.load(Ordering::SeqCst);
        let target = (current / 2).max(MIN_PERMITS);
        let delta = current.saturating_sub(target);
        if delta > 0 {
            self.semaphore.forget_permits(delta as usize);
            self.current_permits.store(target, Ordering::SeqCst);
        }
    }

    fn grow_by(&self, amount: u32) {
        let current = self.current_permits.load(Ordering::SeqCst);
        let target = (current + amount).min(self.max_permits);
        let delta = target.saturating_sub(current);
        if delta > 0 {
            self.semaphore.add_permits(delta as usize);
            self.current_permits.store(target, Ordering::SeqCst);
        }
    }

    /// Current soft cap on in-flight requests, after any shrink/grow.
    pub fn current_capacity(&self) -> u32 {
        self.current_permits.load(Ordering::SeqCst)
    }

    /// Configured soft maximum (the ceiling [`Self::grow_by`] never
    /// exceeds).
    pub fn max_capacity(&self) -> u32 {
        self.max_permits
    }
}

/// Retry budget for transient [`Error::StorageError`]/[`Error::Throttled`]
/// failures (spec.md §7: "5 attempts, capped exponential backoff,
/// jittered").
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Delay ceiling regardless of attempt count.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Capped exponential backoff with jitter for `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter_frac = jitter_fraction(attempt);
        capped.mul_f64(0.5 + 0.5 * jitter_frac)
    }
}

/// Deterministic pseudo-jitter in `[0, 1)`, avoiding a dependency on
/// `rand` in a hot retry path and keeping backoff delay tests
/// reproducible.
fn jitter_fraction(attempt: u32) -> f64 {
    let x = (attempt as u64).wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(0xabcdef);
    let x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    let x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    let x = x ^ (x >> 31);
    (x as f64) / (u64::MAX as f64)
}

/// Retry `op` under `config`, retrying only on [`Error::is_retryable`]
/// failures. Logical errors (validation, not-found, ...) propagate
/// immediately (spec.md §7: "Logical errors propagate to the caller").
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                tokio::time::sleep(config.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared, process-wide backpressure handle, used by storage engine
/// callers that clone cheaply instead of threading a `&Backpressure`
/// reference through every call.
pub type SharedBackpressure = Arc<Backpressure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_round_trips() {
        let bp = Backpressure::new(4);
        let id = Uuid::new_v4();
        let permit = bp.request_permission(id, 1).await.unwrap();
        bp.release(id, true);
        drop(permit);
    }

    #[test]
    fn shrink_halves_and_floors_at_min() {
        let bp = Backpressure::new(8);
        bp.release(Uuid::new_v4(), false);
        assert_eq!(bp.current_capacity(), 4);
        bp.release(Uuid::new_v4(), false);
        assert_eq!(bp.current_capacity(), 2);
        bp.release(Uuid::new_v4(), false);
        assert_eq!(bp.current_capacity(), 1);
        bp.release(Uuid::new_v4(), false);
        assert_eq!(bp.current_capacity(), 1);
    }

    #[test]
    fn sustained_success_grows_pool_back() {
        let bp = Backpressure::new(8);
        bp.release(Uuid::new_v4(), false);
        assert_eq!(bp.current_capacity(), 4);
        for _ in 0..RECOVERY_STREAK {
            bp.release(Uuid::new_v4(), true);
        }
        assert_eq!(bp.current_capacity(), 5);
    }

    #[test]
    fn grow_never_exceeds_configured_max() {
        let bp = Backpressure::new(2);
        for _ in 0..(RECOVERY_STREAK * 10) {
            bp.release(Uuid::new_v4(), true);
        }
        assert_eq!(bp.current_capacity(), bp.max_capacity());
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_retryable_error() {
        let config = RetryConfig::default();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ValidationError("bad input".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_budget_on_retryable_error() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::StorageError("transient".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
