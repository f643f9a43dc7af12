use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use rustc_hash::FxBuildHasher;

use super::{CacheEntry, CacheError, CacheKey};
use crate::utils::defer::defer;
use crate::utils::shard_amount;

type ComputationChannel<T> = Shared<oneshot::Receiver<CacheEntry<T>>>;
type ComputationMap<T> = Arc<DashMap<CacheKey, ComputationChannel<T>, FxBuildHasher>>;

/// The role a caller takes for a key.
enum Role<T> {
    /// Runs the computation and delivers the result.
    Leader(oneshot::Sender<CacheEntry<T>>),
    /// Awaits the result of the leader.
    Waiter(ComputationChannel<T>),
}

/// Deduplicates concurrent computations for the same [`CacheKey`].
///
/// The first caller for a key becomes the *leader* and runs its computation inline. Every caller
/// arriving while that computation is in flight becomes a *waiter* and receives a clone of the
/// exact same result, be it a success or a failure. Results are not retained once delivered,
/// so a computation that failed is retried by the next caller.
///
/// When the leader is cancelled (its future is dropped) or panics, the in-flight registration is
/// removed and all waiters receive [`CacheError::GenerationFailed`].
pub struct SingleFlight<T> {
    current_computations: ComputationMap<T>,
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.current_computations.len())
            .finish_non_exhaustive()
    }
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Creates a new orchestrator, with registrations spread over `buckets` locks.
    pub fn new(buckets: usize) -> Self {
        Self {
            current_computations: Arc::new(DashMap::with_hasher_and_shard_amount(
                FxBuildHasher,
                shard_amount(buckets),
            )),
        }
    }

    /// The number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.current_computations.len()
    }

    /// Runs `computation` for `key`, unless one is already in flight, in which case that
    /// computation's result is awaited instead.
    pub async fn run_exclusive<F>(&self, key: &CacheKey, computation: F) -> CacheEntry<T>
    where
        F: Future<Output = CacheEntry<T>>,
    {
        // The entry keeps its shard locked, which makes this a single compare-and-register step.
        let role = match self.current_computations.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Waiter(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (sender, receiver) = oneshot::channel();
                entry.insert(receiver.shared());
                Role::Leader(sender)
            }
        };

        let sender = match role {
            Role::Waiter(channel) => {
                metric!(counter("caches.single_flight.coalesced") += 1);
                return channel.await.unwrap_or_else(|_cancelled| {
                    Err(CacheError::GenerationFailed(format!(
                        "the computation of `{key}` was abandoned"
                    )))
                });
            }
            Role::Leader(sender) => sender,
        };

        metric!(counter("caches.single_flight.leader") += 1);
        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = {
            let key = key.clone();
            defer(move || {
                current_computations.remove(&key);
            })
        };

        let result = computation.await;
        // Drop the token first to evict from the map. This ensures that callers either
        // get a channel that will receive data, or they create a new channel.
        drop(remove_computation_token);
        sender.send(result.clone()).ok();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::caching::ResourceType;

    fn key() -> CacheKey {
        CacheKey::builder("cache", ResourceType::Analysis)
            .ids(["005930", "2025-11-06"])
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_deduplicates_concurrent_calls() {
        let flight = SingleFlight::<u32>::new(4);
        let calls = AtomicUsize::new(0);
        let key = key();

        let results = join_all((0..10).map(|_| {
            flight.run_exclusive(&key, async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(42)
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| result == &Ok(42)));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_not_retained() {
        let flight = SingleFlight::<u32>::new(4);
        let key = key();

        let results = join_all((0..3).map(|_| {
            flight.run_exclusive(&key, async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(CacheError::GenerationFailed("llm timed out".into()))
            })
        }))
        .await;
        for result in results {
            assert_eq!(
                result,
                Err(CacheError::GenerationFailed("llm timed out".into()))
            );
        }

        // the next caller computes again
        assert_eq!(flight.run_exclusive(&key, async { Ok(7) }).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_cancellation_fails_waiters() {
        let flight = SingleFlight::<u32>::new(4);
        let key = key();

        let leader = {
            let flight = flight.clone();
            let key = key.clone();
            tokio::spawn(async move {
                flight
                    .run_exclusive(&key, async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flight.in_flight(), 1);

        let waiter = {
            let flight = flight.clone();
            let key = key.clone();
            tokio::spawn(async move { flight.run_exclusive(&key, async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CacheError::GenerationFailed(_))));
        assert_eq!(flight.in_flight(), 0);
    }
}
