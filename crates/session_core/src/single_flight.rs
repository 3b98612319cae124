use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::{sync::oneshot, task::AbortHandle};

type FlightFuture<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Flight<T: Clone, E: Clone> {
    id: u64,
    future: FlightFuture<T, E>,
    abort: Option<AbortHandle>,
}

type FlightMap<K, T, E> = Arc<Mutex<HashMap<K, Flight<T, E>>>>;

/// Coalesces concurrent operations per key.
///
/// The first caller for a key spawns the operation; later callers await the
/// same shared result. The spawned task owns a guard that removes its map
/// entry when the task finishes, fails, panics or is aborted, so a key can
/// never stay pending after its task is gone.
pub struct SingleFlight<K, T: Clone, E: Clone> {
    flights: FlightMap<K, T, E>,
    next_id: AtomicU64,
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `operation` unless a flight for `key` is already in progress, in
    /// which case `operation` is dropped unpolled and the existing result is
    /// awaited. `cancelled` is produced for waiters of an aborted flight.
    pub async fn run<Fut, C>(&self, key: K, operation: Fut, cancelled: C) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce() -> E + Send + 'static,
    {
        let started = {
            let mut flights = lock(&self.flights);
            match flights.get(&key) {
                Some(flight) => Err(flight.future.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel::<Result<T, E>>();
                    let future = async move { rx.await.unwrap_or_else(|_| Err(cancelled())) }
                        .boxed()
                        .shared();
                    flights.insert(
                        key.clone(),
                        Flight {
                            id,
                            future: future.clone(),
                            abort: None,
                        },
                    );
                    Ok((id, future, tx))
                }
            }
        };
        let (id, future, tx) = match started {
            Ok(parts) => parts,
            Err(existing) => return existing.await,
        };

        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = operation.await;
            let _ = tx.send(result);
        });

        if let Some(flight) = lock(&self.flights).get_mut(&key) {
            if flight.id == id {
                flight.abort = Some(handle.abort_handle());
            }
        }

        future.await
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.flights).contains_key(key)
    }

    /// Aborts the in-flight operation for `key`, if any, and waits until its
    /// task has stopped. Waiters receive the flight's cancellation error.
    pub async fn cancel(&self, key: &K) -> bool {
        let flight = lock(&self.flights).remove(key);
        let Some(flight) = flight else {
            return false;
        };
        if let Some(abort) = flight.abort {
            abort.abort();
        }
        let _ = flight.future.await;
        true
    }

    pub fn pending_keys(&self) -> Vec<K> {
        lock(&self.flights).keys().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.flights).len()
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct FlightGuard<K: Eq + Hash, T: Clone, E: Clone> {
    flights: FlightMap<K, T, E>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T: Clone, E: Clone> Drop for FlightGuard<K, T, E> {
    fn drop(&mut self) {
        let mut flights = lock(&self.flights);
        if flights.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            flights.remove(&self.key);
        }
    }
}

fn lock<K, T: Clone, E: Clone>(
    flights: &Mutex<HashMap<K, Flight<T, E>>>,
) -> MutexGuard<'_, HashMap<K, Flight<T, E>>> {
    flights.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/single_flight_tests.rs"]
mod tests;
