//! Single-flight query deduplication
//!
//! Concurrent reads that share a fingerprint are coalesced: the first caller
//! runs the fetch, later callers subscribe to its outcome. The registry lock
//! is held only to register, subscribe and publish, never across the fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{RecallError, Result};

type Flights<T> = Mutex<HashMap<String, broadcast::Sender<Result<T>>>>;

fn lock<T>(flights: &Flights<T>) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Result<T>>>> {
    flights.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coalesces concurrent fetches per fingerprint
pub struct QueryDeduplicator<T> {
    in_flight: Flights<T>,
}

impl<T: Clone + Send + 'static> QueryDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fetch` unless a fetch for `fingerprint` is already running, in
    /// which case wait for and share its result.
    ///
    /// Every caller of one flight observes the same value or the same error.
    /// If the leading caller is cancelled, waiters get
    /// `RecallError::QueryAbandoned`.
    pub async fn get_or_fetch<F, Fut>(&self, fingerprint: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waiter = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(fingerprint) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    in_flight.insert(fingerprint.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            debug!(fingerprint, "Joining in-flight query");
            return match receiver.recv().await {
                Ok(result) => result,
                Err(_) => Err(RecallError::QueryAbandoned(fingerprint.to_string())),
            };
        }

        let flight = Flight {
            registry: &self.in_flight,
            fingerprint,
            completed: false,
        };
        let result = fetch().await;
        flight.complete(&result);
        result
    }

    /// Number of fingerprints with a fetch currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl<T: Clone + Send + 'static> Default for QueryDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry entry owned by the leading caller.
///
/// Dropped without completing, it unregisters the flight so waiters are
/// released instead of hanging.
struct Flight<'a, T> {
    registry: &'a Flights<T>,
    fingerprint: &'a str,
    completed: bool,
}

impl<T: Clone> Flight<'_, T> {
    fn complete(mut self, result: &Result<T>) {
        if let Some(sender) = lock(self.registry).remove(self.fingerprint) {
            // No receivers is fine: nobody joined this flight
            let _ = sender.send(result.clone());
        }
        self.completed = true;
    }
}

impl<T> Drop for Flight<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            lock(self.registry).remove(self.fingerprint);
            warn!(fingerprint = self.fingerprint, "Query abandoned by its leader");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let dedup = QueryDeduplicator::<Vec<u32>>::new();
        let calls = AtomicUsize::new(0);

        let results = join_all((0..10).map(|_| {
            dedup.get_or_fetch("fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![1, 2, 3])
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 10);
        for result in results {
            assert_eq!(result.unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_shared() {
        let dedup = QueryDeduplicator::<u32>::new();
        let calls = AtomicUsize::new(0);

        let results = join_all((0..5).map(|_| {
            dedup.get_or_fetch("fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(RecallError::Storage("down".to_string()))
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Err(RecallError::Storage("down".to_string())));
        }
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_fetch_independently() {
        let dedup = QueryDeduplicator::<usize>::new();
        let calls = AtomicUsize::new(0);

        let results = join_all((0..4).map(|i| {
            let fingerprint = format!("fp-{}", i % 2);
            let calls = &calls;
            let dedup = &dedup;
            async move {
                dedup
                    .get_or_fetch(&fingerprint, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(i % 2)
                    })
                    .await
            }
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            results.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![0, 1, 0, 1]
        );
    }

    #[tokio::test]
    async fn test_sequential_calls_refetch() {
        let dedup = QueryDeduplicator::<u32>::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = dedup
                .get_or_fetch("fp", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_waiters() {
        let dedup = Arc::new(QueryDeduplicator::<u32>::new());

        let leader = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .get_or_fetch("fp", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dedup.in_flight(), 1);

        let waiter = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move { dedup.get_or_fetch("fp", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RecallError::QueryAbandoned(_))));
        assert_eq!(dedup.in_flight(), 0);
    }
}
