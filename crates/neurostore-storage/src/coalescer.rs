//! Request coalescing for concurrent reads of the same id (spec.md §4.4).
//!
//! Grounded on the teacher's `tokio` dependency for shared in-flight
//! futures: the first caller for a given id drives the fetch to
//! completion and broadcasts the result; later callers for the same id
//! await the same future instead of issuing a redundant backend call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use neurostore_core::error::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Wire type for the broadcast channel: `Error` is not `Clone` (it wraps
/// `std::io::Error`), so in-flight results travel as `Result<V, String>`
/// and are re-wrapped into `Error::StorageError` for coalesced waiters.
type Broadcast<V> = std::result::Result<V, String>;

/// Deduplicates concurrent fetches keyed by id. Values must be cheaply
/// cloneable (they travel over a broadcast channel to every waiter).
pub struct ReadCoalescer<V: Clone + Send + 'static> {
    in_flight: Mutex<HashMap<Uuid, broadcast::Sender<Broadcast<V>>>>,
}

impl<V: Clone + Send + 'static> Default for ReadCoalescer<V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + 'static> ReadCoalescer<V> {
    /// Construct an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch `id`, coalescing concurrent callers onto a single in-flight
    /// `fetch` call. The first caller for `id` runs `fetch`; subsequent
    /// callers that arrive before it completes await the same result.
    pub async fn get_or_fetch<F, Fut>(&self, id: Uuid, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut receiver = {
            let mut in_flight = self.in_flight.lock();
            if let Some(tx) = in_flight.get(&id) {
                Some(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                in_flight.insert(id, tx);
                None
            }
        };

        if let Some(rx) = receiver.take() {
            return Self::await_broadcast(rx).await;
        }

        let result = fetch().await;
        let tx = {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(&id)
        };
        if let Some(tx) = tx {
            // No receivers is fine: nobody was waiting.
            let wire: Broadcast<V> = result.as_ref().map(|v| v.clone()).map_err(|e| e.to_string());
            let _ = tx.send(wire);
        }
        result
    }

    async fn await_broadcast(mut rx: broadcast::Receiver<Broadcast<V>>) -> Result<V> {
        match rx.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(Error::StorageError(msg)),
            Err(_) => Err(Error::StorageError(
                "coalesced fetch sender dropped before completion".into(),
            )),
        }
    }

    /// Number of fetches currently in flight. Exposed for tests.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_fetches_for_same_id_run_once() {
        let coalescer: Arc<ReadCoalescer<i32>> = Arc::new(ReadCoalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .get_or_fetch(id, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_ids_fetch_independently() {
        let coalescer: ReadCoalescer<i32> = ReadCoalescer::new();
        let a = coalescer.get_or_fetch(Uuid::new_v4(), || async { Ok(1) }).await;
        let b = coalescer.get_or_fetch(Uuid::new_v4(), || async { Ok(2) }).await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn sequential_fetches_are_not_coalesced_away() {
        let coalescer: ReadCoalescer<i32> = ReadCoalescer::new();
        let id = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            coalescer
                .get_or_fetch(id, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coalescer.in_flight_count(), 0);
    }
}
