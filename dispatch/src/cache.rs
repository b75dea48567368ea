// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatch cache: fingerprint-keyed memoization of complete
//! responses, bounded by approximate memory cost, with single-flight
//! coalescing.
//!
//! Because `at_revision` is part of every fingerprint, entries for old
//! revisions are never wrong, only useless; they age out through LRU
//! eviction (and the optional TTL) rather than explicit invalidation.
//!
//! Single-flight: the first caller to miss on a key becomes the leader
//! and computes the result; concurrent callers for the same key wait on
//! the leader's flight and share its result. A leader that fails drops
//! its flight without publishing, and the waiters fall back to computing
//! for themselves. Flights are keyed by fingerprint *and* remaining
//! depth: depth strictly decreases down a dispatch tree, so a recursive
//! schema revisiting its own fingerprint deeper in the tree can never
//! wait on its own ancestor (it recurses instead, and the depth budget
//! terminates it).

use crate::fingerprint::Fingerprint;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use warden_types::DispatchCheckResponse;
use warden_types::DispatchExpandResponse;
use warden_types::DispatchLookupResourcesResponse;
use warden_types::DispatchLookupSubjectsResponse;
use warden_types::DispatchReachableResourcesResponse;

/// A complete memoized response. Streaming methods cache the materialized
/// chunk sequence; they are only admitted once the stream has completed,
/// and only when it began from the initial cursor.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum CachedResponse {
    Check(DispatchCheckResponse),
    Expand(DispatchExpandResponse),
    ReachableResources(Vec<DispatchReachableResourcesResponse>),
    LookupResources(Vec<DispatchLookupResourcesResponse>),
    LookupSubjects(Vec<DispatchLookupSubjectsResponse>),
}

impl CachedResponse {
    /// Approximate memory cost: the serialized size of the value.
    fn cost(&self) -> u64 {
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes.len() as u64,
            // Unserializable values cannot occur for these types; charge
            // something nonzero if they somehow do.
            Err(_) => 1024,
        }
    }
}

struct Entry {
    value: CachedResponse,
    cost: u64,
    inserted: Instant,
    seq: u64,
}

type FlightKey = (Fingerprint, u32);

struct State {
    entries: HashMap<Fingerprint, Entry>,
    /// LRU order: sequence number -> key, oldest first.
    order: BTreeMap<u64, Fingerprint>,
    next_seq: u64,
    total_cost: u64,
    inflight: HashMap<FlightKey, watch::Receiver<Option<CachedResponse>>>,
}

/// Cost-bounded memoization map shared by one engine instance.
pub struct DispatchCache {
    state: Arc<Mutex<State>>,
    max_cost_bytes: u64,
    ttl: Option<Duration>,
}

/// The outcome of a cache lookup.
pub enum CacheLookup {
    /// A complete response was present.
    Hit(CachedResponse),
    /// Another caller is computing this key; wait for it.
    Wait(FlightWaiter),
    /// This caller is the leader for the key.
    Miss(FlightGuard),
}

/// Held by a caller waiting on another caller's in-flight computation.
pub struct FlightWaiter {
    rx: watch::Receiver<Option<CachedResponse>>,
}

impl FlightWaiter {
    /// Waits for the leader. `None` means the leader failed or was
    /// canceled without publishing; the waiter should compute for itself.
    pub async fn wait(mut self) -> Option<CachedResponse> {
        loop {
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// The leader's handle for one in-flight key. Completing it publishes the
/// value to the cache and to every waiter; dropping it without completing
/// releases the waiters empty-handed.
pub struct FlightGuard {
    state: Arc<Mutex<State>>,
    flight_key: FlightKey,
    tx: watch::Sender<Option<CachedResponse>>,
    max_cost_bytes: u64,
}

impl FlightGuard {
    pub fn complete(self, value: CachedResponse) {
        {
            let mut state = self.state.lock().unwrap();
            insert_locked(
                &mut state,
                self.flight_key.0,
                value.clone(),
                self.max_cost_bytes,
            );
            state.inflight.remove(&self.flight_key);
        }
        let _ = self.tx.send(Some(value));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // If complete() ran, the key is already gone; this handles the
        // failure path.
        self.state.lock().unwrap().inflight.remove(&self.flight_key);
    }
}

impl DispatchCache {
    pub fn new(max_cost_bytes: u64, ttl: Option<Duration>) -> DispatchCache {
        DispatchCache {
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                total_cost: 0,
                inflight: HashMap::new(),
            })),
            max_cost_bytes,
            ttl,
        }
    }

    /// Looks up `key`, joining or starting a flight on a miss.
    /// `depth_remaining` scopes the flight (never the stored entry), so
    /// recursion through the same fingerprint deeper in a dispatch tree
    /// leads its own flight instead of deadlocking on its ancestor's.
    pub fn lookup(
        &self,
        key: Fingerprint,
        depth_remaining: u32,
    ) -> CacheLookup {
        let flight_key = (key, depth_remaining);
        let mut state = self.state.lock().unwrap();

        let expired = match state.entries.get(&key) {
            Some(entry) => match self.ttl {
                Some(ttl) => entry.inserted.elapsed() > ttl,
                None => false,
            },
            None => false,
        };
        if expired {
            remove_locked(&mut state, &key);
        }

        if let Some(entry) = state.entries.get(&key) {
            let value = entry.value.clone();
            let old_seq = entry.seq;
            let new_seq = state.next_seq;
            state.next_seq += 1;
            state.order.remove(&old_seq);
            state.order.insert(new_seq, key);
            state
                .entries
                .get_mut(&key)
                .expect("entry observed under the same lock")
                .seq = new_seq;
            return CacheLookup::Hit(value);
        }

        if let Some(rx) = state.inflight.get(&flight_key) {
            return CacheLookup::Wait(FlightWaiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        state.inflight.insert(flight_key, rx);
        CacheLookup::Miss(FlightGuard {
            state: Arc::clone(&self.state),
            flight_key,
            tx,
            max_cost_bytes: self.max_cost_bytes,
        })
    }

    /// Inserts a value outside any flight (used by the streaming paths,
    /// which materialize on completion rather than coalescing).
    pub fn insert(&self, key: Fingerprint, value: CachedResponse) {
        let mut state = self.state.lock().unwrap();
        insert_locked(&mut state, key, value, self.max_cost_bytes);
    }

    #[cfg(test)]
    fn total_cost(&self) -> u64 {
        self.state.lock().unwrap().total_cost
    }

    #[cfg(test)]
    fn contains(&self, key: &Fingerprint) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }
}

fn insert_locked(
    state: &mut State,
    key: Fingerprint,
    value: CachedResponse,
    max_cost_bytes: u64,
) {
    if max_cost_bytes == 0 {
        return;
    }
    let cost = value.cost();
    if cost > max_cost_bytes {
        return;
    }
    remove_locked(state, &key);
    let seq = state.next_seq;
    state.next_seq += 1;
    state.total_cost += cost;
    state.entries.insert(key, Entry {
        value,
        cost,
        inserted: Instant::now(),
        seq,
    });
    state.order.insert(seq, key);
    while state.total_cost > max_cost_bytes {
        let oldest =
            *state.order.keys().next().expect("cost > 0 implies entries");
        let victim = state.order[&oldest];
        remove_locked(state, &victim);
    }
}

fn remove_locked(state: &mut State, key: &Fingerprint) {
    if let Some(entry) = state.entries.remove(key) {
        state.order.remove(&entry.seq);
        state.total_cost -= entry.cost;
    }
}
