//! Collapses concurrent computations that share a key into a single in-flight future.
//!
//! The first caller for a key drives the computation. Callers arriving while it is
//! still running await the same shared result instead of starting their own.
//! The key is released as soon as the computation finishes (successfully or not),
//! or when every waiter has dropped it, so the next call starts fresh.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

pub struct ChokePoint<K, V, E>
where
    K: Eq + Hash,
{
    in_flight: Arc<DashMap<K, InFlight<V, E>>>,
    generation: AtomicU64,
}

struct InFlight<V, E> {
    generation: u64,
    // Weak so that the table itself never keeps an abandoned computation alive
    future: WeakShared<BoxFuture<'static, Result<V, E>>>,
}

/// Drops the key from the table once the computation it guards is gone,
/// whether it ran to completion or was abandoned.
struct Release<K, V, E>
where
    K: Eq + Hash,
{
    in_flight: Arc<DashMap<K, InFlight<V, E>>>,
    key: Option<K>,
    generation: u64,
}

impl<K, V, E> Drop for Release<K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let generation = self.generation;
            self.in_flight
                .remove_if(&key, |_, entry| entry.generation == generation);
        }
    }
}

impl<K, V, E> ChokePoint<K, V, E>
where
    K: Clone + Eq + Send + Sync + Hash + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `compute` unless a computation for `key` is already in flight, in which
    /// case `compute` is dropped unpolled and the in-flight result is awaited instead.
    pub async fn run<Fut>(&self, key: K, compute: Fut) -> Result<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().future.upgrade() {
                Some(flight) => flight,
                None => {
                    let (entry, flight) = self.launch(key, compute);
                    occupied.insert(entry);
                    flight
                }
            },
            Entry::Vacant(vacant) => {
                let (entry, flight) = self.launch(key, compute);
                vacant.insert(entry);
                flight
            }
        };

        flight.await
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|entry| entry.future.upgrade().is_some())
    }

    fn launch<Fut>(&self, key: K, compute: Fut) -> (InFlight<V, E>, Flight<V, E>)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let release = Release {
            in_flight: Arc::clone(&self.in_flight),
            key: Some(key),
            generation,
        };

        let flight = async move {
            let _release = release;
            compute.await
        }
        .boxed()
        .shared();

        // `downgrade` only returns None once the future has completed, and this
        // one has not been polled yet.
        let weak = flight
            .downgrade()
            .unwrap_or_else(|| unreachable!("fresh shared future cannot be complete"));

        (
            InFlight {
                generation,
                future: weak,
            },
            flight,
        )
    }
}

impl<K, V, E> Default for ChokePoint<K, V, E>
where
    K: Clone + Eq + Send + Sync + Hash + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
