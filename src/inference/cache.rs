//! Prediction cache and request coalescing.
//!
//! The cache is sharded per definition so a promotion only clears its own shard.
//! `SingleFlight` makes concurrent requests for the same key share one computation.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::common::ids::{DefinitionId, Fingerprint};

use super::domain::CachedInference;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => unreachable!(),
};

struct Slot {
    inference: CachedInference,
    expires: Instant,
}

pub struct PredictionCache {
    shards: DashMap<DefinitionId, Mutex<LruCache<Fingerprint, Slot>>>,
    ttl: Duration,
    capacity: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PredictionCache {
    /// `capacity` is per definition. A zero TTL disables caching.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            shards: DashMap::new(),
            ttl,
            capacity: NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh cached inference, counting the lookup as a hit or miss.
    pub fn get(&self, definition: DefinitionId, key: Fingerprint) -> Option<CachedInference> {
        let found = self.shards.get(&definition).and_then(|shard| {
            let mut lru = shard.lock();
            let now = Instant::now();
            let fresh = lru
                .get(&key)
                .filter(|slot| slot.expires > now)
                .map(|slot| slot.inference);
            if fresh.is_none() {
                lru.pop(&key);
            }
            fresh
        });
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store an inference, evicting the least recently used entry when full.
    pub fn put(&self, definition: DefinitionId, key: Fingerprint, inference: CachedInference) {
        if self.ttl.is_zero() {
            return;
        }
        let slot = Slot {
            inference,
            expires: Instant::now() + self.ttl,
        };
        self.shards
            .entry(definition)
            .or_insert_with(|| Mutex::new(LruCache::new(self.capacity)))
            .lock()
            .put(key, slot);
    }

    /// Drop every entry of one definition.
    pub fn invalidate(&self, definition: DefinitionId) {
        if let Some((_, shard)) = self.shards.remove(&definition) {
            debug!(definition = %definition, entries = shard.lock().len(), "prediction cache invalidated");
        }
    }

    pub fn len(&self, definition: DefinitionId) -> usize {
        self.shards
            .get(&definition)
            .map(|shard| shard.lock().len())
            .unwrap_or(0)
    }

    /// Hits over lookups, 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

enum FlightState<V> {
    Pending,
    Done(V),
    Abandoned,
}

struct Flight<V> {
    state: Mutex<FlightState<V>>,
    ready: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Pending),
            ready: Condvar::new(),
        }
    }

    fn settle(&self, state: FlightState<V>) {
        *self.state.lock() = state;
        self.ready.notify_all();
    }

    /// `None` if the leader went away without a result.
    fn wait(&self) -> Option<V> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                FlightState::Pending => self.ready.wait(&mut state),
                FlightState::Done(v) => return Some(v.clone()),
                FlightState::Abandoned => return None,
            }
        }
    }
}

/// Leader-side handle. Releases waiters even if the computation unwinds.
struct LeaderGuard<'a, K: Eq + Hash, V: Clone> {
    flights: &'a DashMap<K, Arc<Flight<V>>>,
    key: K,
    flight: Arc<Flight<V>>,
    settled: bool,
}

impl<K: Eq + Hash, V: Clone> LeaderGuard<'_, K, V> {
    fn complete(mut self, value: V) {
        self.flight.settle(FlightState::Done(value));
        self.settled = true;
    }
}

impl<K: Eq + Hash, V: Clone> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.settled {
            self.flight.settle(FlightState::Abandoned);
        }
        self.flights.remove(&self.key);
    }
}

/// How a caller obtained its value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Served {
    /// This caller ran the computation.
    Computed,
    /// The value came from `lookup` or from another caller's computation.
    Shared,
}

pub struct SingleFlight<K, V> {
    flights: DashMap<K, Arc<Flight<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }

    /// Run `compute` for `key` unless an identical call is in flight, in which case
    /// wait for and share its result.
    ///
    /// `lookup` is consulted once the caller holds the key, so a result published by
    /// a leader that just finished is seen instead of being computed again. Leaders
    /// must publish to wherever `lookup` reads before returning from `compute`.
    pub fn run(
        &self,
        key: K,
        lookup: impl Fn() -> Option<V>,
        compute: impl FnOnce() -> V,
    ) -> (V, Served) {
        loop {
            let flight = match self.flights.entry(key) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(e) => {
                    if let Some(v) = lookup() {
                        return (v, Served::Shared);
                    }
                    let flight = Arc::new(Flight::new());
                    e.insert(flight.clone());
                    let guard = LeaderGuard {
                        flights: &self.flights,
                        key,
                        flight,
                        settled: false,
                    };
                    let value = compute();
                    guard.complete(value.clone());
                    return (value, Served::Computed);
                }
            };
            if let Some(v) = flight.wait() {
                return (v, Served::Shared);
            }
            // Leader unwound; try to lead ourselves.
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
