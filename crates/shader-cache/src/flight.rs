//! Concurrent map whose entries are computed at most once at a time.
//!
//! Every entry moves through `Absent -> InProgress -> Ready`, or back to `Absent`
//! when its computation fails. The first requester of an absent key computes it,
//! later requesters block on that computation and receive its outcome. Keys are
//! spread over independently locked shards, and no lock is held while computing.

use core::hash::{BuildHasher, Hash};
use std::{
    collections::{hash_map::RandomState, HashMap},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Number of independently locked shards.
const SHARDS: usize = 16;

/// State of a key present in a shard.
enum Slot<V> {
    /// Someone is computing the value.
    InProgress(Arc<Flight<V>>),
    /// The value is known.
    Ready(V),
}

/// Outcome of a computation, observed by its waiters.
#[derive(Clone)]
enum Outcome<V> {
    /// Still computing.
    Pending,
    /// Computed successfully.
    Ready(V),
    /// The computation failed, nothing was stored.
    Failed(Error),
    /// The computing thread unwound before finishing, waiters should try again.
    Abandoned,
}

/// A computation in progress together with its waiters.
struct Flight<V> {
    /// Outcome so far.
    outcome: Mutex<Outcome<V>>,
    /// Notified once the outcome stops being pending.
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    /// Creates a pending flight.
    fn new() -> Self {
        Self {
            outcome: Mutex::new(Outcome::Pending),
            done: Condvar::new(),
        }
    }

    /// Blocks until the flight lands.
    fn wait(&self) -> Outcome<V> {
        let mut outcome = self.outcome.lock();
        while matches!(*outcome, Outcome::Pending) {
            self.done.wait(&mut outcome);
        }
        outcome.clone()
    }

    /// Publishes the outcome and wakes every waiter.
    fn land(&self, outcome: Outcome<V>) {
        *self.outcome.lock() = outcome;
        self.done.notify_all();
    }
}

/// Clears the slot of a computation whose thread unwinds before landing it.
struct LandingGuard<'map, K: Hash + Eq, V: Clone> {
    /// Map owning the slot.
    map: &'map FlightMap<K, V>,
    /// Key of the slot.
    key: &'map K,
    /// Flight occupying the slot.
    flight: &'map Flight<V>,
    /// Whether the computation is still running.
    armed: bool,
}

impl<K: Hash + Eq, V: Clone> Drop for LandingGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("in-flight computation was abandoned, waiters will retry");
            self.map.shard(self.key).lock().remove(self.key);
            self.flight.land(Outcome::Abandoned);
        }
    }
}

/// Concurrent map computing each absent value at most once at a time.
pub(crate) struct FlightMap<K, V> {
    /// Independently locked parts of the map.
    shards: Box<[Mutex<HashMap<K, Slot<V>>>]>,
    /// Picks the shard of a key.
    hasher: RandomState,
}

impl<K: Hash + Eq, V: Clone> Default for FlightMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V: Clone> FlightMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Returns the shard responsible for the key.
    #[expect(
        clippy::indexing_slicing,
        reason = "index is reduced modulo the shard count"
    )]
    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Slot<V>>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Returns the value of the key, if it has been computed.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.shard(key).lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            Some(Slot::InProgress(_)) | None => None,
        }
    }

    /// Returns the value of the key, computing it with `factory` if absent.
    ///
    /// If another thread is already computing the key, blocks until it finishes and
    /// returns its outcome instead of calling `factory`. A failed computation stores
    /// nothing, so the next call computes again.
    pub fn get_or_try_insert_with<F>(&self, key: &K, factory: F) -> Result<V, Error>
    where
        K: Clone,
        F: FnOnce() -> Result<V, Error>,
    {
        let flight = loop {
            let in_progress = {
                let mut shard = self.shard(key).lock();
                match shard.get(key) {
                    Some(Slot::Ready(value)) => return Ok(value.clone()),
                    Some(Slot::InProgress(flight)) => Arc::clone(flight),
                    None => {
                        let flight = Arc::new(Flight::new());
                        shard.insert(key.clone(), Slot::InProgress(Arc::clone(&flight)));
                        break flight;
                    }
                }
            };
            match in_progress.wait() {
                Outcome::Ready(value) => return Ok(value),
                Outcome::Failed(err) => return Err(err),
                Outcome::Abandoned | Outcome::Pending => {}
            }
        };

        let mut guard = LandingGuard {
            map: self,
            key,
            flight: &flight,
            armed: true,
        };
        let result = factory();
        guard.armed = false;

        {
            let mut shard = self.shard(key).lock();
            match &result {
                Ok(value) => {
                    shard.insert(key.clone(), Slot::Ready(value.clone()));
                }
                Err(_) => {
                    shard.remove(key);
                }
            }
        }
        flight.land(match &result {
            Ok(value) => Outcome::Ready(value.clone()),
            Err(err) => Outcome::Failed(err.clone()),
        });
        result
    }

    /// Removes the computed value of the key if it satisfies the predicate.
    /// Computations in progress are left alone.
    pub fn remove_if<P>(&self, key: &K, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let mut shard = self.shard(key).lock();
        let matched = match shard.get(key) {
            Some(Slot::Ready(value)) => predicate(value),
            Some(Slot::InProgress(_)) | None => false,
        };
        if matched {
            if let Some(Slot::Ready(value)) = shard.remove(key) {
                return Some(value);
            }
        }
        None
    }

    /// Removes and returns every computed entry matching the predicate.
    pub fn drain_where<P>(&self, mut predicate: P) -> Vec<(K, V)>
    where
        K: Clone,
        P: FnMut(&K, &V) -> bool,
    {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let matching: Vec<K> = shard
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(value) if predicate(key, value) => Some(key.clone()),
                    Slot::Ready(_) | Slot::InProgress(_) => None,
                })
                .collect();
            for key in matching {
                if let Some(Slot::Ready(value)) = shard.remove(&key) {
                    drained.push((key, value));
                }
            }
        }
        drained
    }

    /// Snapshot of every computed entry.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .filter_map(|(key, slot)| match slot {
                        Slot::Ready(value) => Some((key.clone(), value.clone())),
                        Slot::InProgress(_) => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of computed entries.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|slot| matches!(slot, Slot::Ready(_)))
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;

    fn failure() -> Error {
        Error::UnknownOptions { digest: 7 }
    }

    #[test_log::test]
    fn computes_once_and_caches() {
        let map = FlightMap::<u64, u64>::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = map
                .get_or_try_insert_with(&1, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(10)
                })
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.len(), 1);
    }

    #[test_log::test]
    fn failures_are_not_cached() {
        let map = FlightMap::<u64, u64>::new();
        assert!(map.get_or_try_insert_with(&1, || Err(failure())).is_err());
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 0);
        assert_eq!(map.get_or_try_insert_with(&1, || Ok(5)).unwrap(), 5);
    }

    #[test_log::test]
    fn concurrent_requests_collapse() {
        let map = FlightMap::<u64, u64>::new();
        let calls = AtomicUsize::new(0);
        let threads = 8;
        let barrier = Barrier::new(threads);
        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    let value = map
                        .get_or_try_insert_with(&42, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(1)
                        })
                        .unwrap();
                    assert_eq!(value, 1);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn waiters_share_the_failure() {
        let map = FlightMap::<u64, u64>::new();
        let calls = AtomicUsize::new(0);
        let threads = 4;
        let barrier = Barrier::new(threads);
        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    let result = map.get_or_try_insert_with(&3, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Err(failure())
                    });
                    assert!(result.is_err());
                });
            }
        });
        // A requester arriving after the failure landed computes again,
        // so only the first wave is guaranteed to collapse.
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(map.len(), 0);
    }

    #[test_log::test]
    fn abandoned_computation_is_retried() {
        let map = FlightMap::<u64, u64>::new();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.get_or_try_insert_with(&9, || panic!("backend crashed"))
        }));
        assert!(unwound.is_err());
        assert_eq!(map.get_or_try_insert_with(&9, || Ok(3)).unwrap(), 3);
    }

    #[test_log::test]
    fn drain_where_removes_matching_entries() {
        let map = FlightMap::<u64, u64>::new();
        for key in 0..10 {
            map.get_or_try_insert_with(&key, || Ok(key * 2)).unwrap();
        }
        let mut drained = map.drain_where(|key, _| key % 2 == 0);
        drained.sort_unstable();
        assert_eq!(drained, [(0, 0), (2, 4), (4, 8), (6, 12), (8, 16)]);
        assert_eq!(map.len(), 5);
        assert_eq!(map.remove_if(&1, |value| *value == 3), None);
        assert_eq!(map.remove_if(&1, |value| *value == 2), Some(2));
        assert_eq!(map.remove_if(&1, |_| true), None);
    }
}
