//! In-process de-duplication of concurrent identical calls.
//!
//! The first caller for a key becomes the leader and runs the work inline;
//! callers arriving while it runs wait for and share its result. The key is
//! evicted as soon as the leader finishes, so the next call starts fresh. If
//! the leader is cancelled before finishing, its waiters elect a new leader.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

struct Flight<V, E> {
    generation: u64,
    outcome: watch::Receiver<Option<Result<V, E>>>,
}

/// Per-process call coalescer keyed by string.
pub struct CallCoalescer<V, E> {
    flights: Mutex<HashMap<String, Flight<V, E>>>,
    generations: AtomicU64,
}

impl<V, E> std::fmt::Debug for CallCoalescer<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoalescer")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

impl<V, E> Default for CallCoalescer<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's flight when it finishes or is dropped.
struct Eviction<'a, V, E> {
    flights: &'a Mutex<HashMap<String, Flight<V, E>>>,
    key: &'a str,
    generation: u64,
}

impl<V, E> Drop for Eviction<'_, V, E> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights
            .get(self.key)
            .is_some_and(|flight| flight.generation == self.generation)
        {
            flights.remove(self.key);
        }
    }
}

impl<V, E> CallCoalescer<V, E> {
    /// Creates an empty coalescer.
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

impl<V, E> CallCoalescer<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Runs `work` for `key`, or joins the call already running for it.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (publisher, generation) = loop {
            let mut waiting = {
                let mut flights = self.flights.lock();
                match flights.get(key) {
                    Some(flight) => flight.outcome.clone(),
                    None => {
                        let (publisher, outcome) = watch::channel(None);
                        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                        flights.insert(
                            key.to_string(),
                            Flight {
                                generation,
                                outcome,
                            },
                        );
                        break (publisher, generation);
                    }
                }
            };

            let shared = waiting
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone());
            if let Some(result) = shared {
                return result;
            }
            // The leader was dropped before publishing; compete to lead again.
        };

        let eviction = Eviction {
            flights: &self.flights,
            key,
            generation,
        };
        let result = work().await;
        drop(eviction);
        publisher.send_replace(Some(result.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let coalescer = Arc::new(CallCoalescer::<u64, String>::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let executions = Arc::clone(&executions);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    coalescer
                        .run("shop:1", || async {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn key_is_evicted_after_completion() {
        let coalescer = CallCoalescer::<u64, String>::new();
        let first = coalescer.run("k", || async { Ok(1) }).await;
        let second = coalescer.run("k", || async { Ok(2) }).await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(2));
    }

    #[tokio::test]
    async fn errors_are_shared_with_waiters() {
        let coalescer = Arc::new(CallCoalescer::<u64, String>::new());
        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err("store down".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = coalescer
            .run("k", || async { Ok::<u64, String>(99) })
            .await;

        assert_eq!(follower, Err("store down".to_string()));
        assert_eq!(leader.await.unwrap(), Err("store down".to_string()));
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over_to_waiter() {
        let coalescer = Arc::new(CallCoalescer::<u64, String>::new());
        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.run("k", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        assert_eq!(follower.await.unwrap(), Ok(2));
        assert_eq!(coalescer.in_flight(), 0);
    }
}
