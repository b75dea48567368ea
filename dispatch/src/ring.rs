// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Consistent-hash ring over the peer membership view.
//!
//! Membership is delivered from outside (static config, or the runtime
//! membership endpoint); this module only turns a peer set into a stable
//! key-to-peer mapping. Each peer contributes a configurable number of
//! virtual nodes, so that a membership delta moves only the keys adjacent
//! to the departed or arrived peer. Ring updates are copy-on-write: a
//! rebuild publishes a fresh `Arc<Ring>` through a watch channel, readers
//! keep whatever ring they already resolved against, and a misroute costs
//! a cache miss rather than a wrong answer.

use crate::fingerprint::Fingerprint;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// One cluster member.
#[derive(
    Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct Peer {
    /// Stable identity; also what `lookup` compares against the local id.
    pub id: String,
    /// Base URL of the peer's dispatch API.
    pub endpoint: String,
}

/// An immutable ring built from one membership snapshot.
#[derive(Debug)]
pub struct Ring {
    peers: Vec<Peer>,
    /// Hash point -> index into `peers`.
    points: BTreeMap<u64, usize>,
}

impl Ring {
    pub fn new(mut peers: Vec<Peer>, virtual_nodes_per_peer: usize) -> Ring {
        // Deterministic construction regardless of delivery order.
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers.dedup_by(|a, b| a.id == b.id);

        let mut points = BTreeMap::new();
        for (index, peer) in peers.iter().enumerate() {
            for vnode in 0..virtual_nodes_per_peer.max(1) {
                let point = hash_point(&peer.id, vnode);
                // Collisions across peers are vanishingly rare; first
                // (lowest peer id) wins deterministically.
                points.entry(point).or_insert(index);
            }
        }
        Ring { peers, points }
    }

    pub fn empty() -> Ring {
        Ring { peers: Vec::new(), points: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// The peer owning `key`, if the ring has any members: the first
    /// virtual node at or clockwise of the key's hash point.
    pub fn lookup(&self, key: &Fingerprint) -> Option<&Peer> {
        if self.points.is_empty() {
            return None;
        }
        let point = key_point(key);
        let index = self
            .points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, index)| *index)
            .expect("nonempty points");
        Some(&self.peers[index])
    }
}

fn hash_point(peer_id: &str, vnode: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(peer_id.as_bytes());
    hasher.update((vnode as u64).to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

fn key_point(key: &Fingerprint) -> u64 {
    u64::from_le_bytes(
        key.as_bytes()[..8].try_into().expect("fingerprint is 32 bytes"),
    )
}

/// The writable side of the membership view. Held by whatever delivers
/// membership (the server's peers endpoint, or tests).
pub struct MembershipView {
    virtual_nodes_per_peer: usize,
    tx: watch::Sender<Arc<Ring>>,
}

/// The read side handed to the engine.
#[derive(Clone)]
pub struct RingHandle {
    rx: watch::Receiver<Arc<Ring>>,
}

impl MembershipView {
    /// Creates a view with an initial peer set (possibly empty, meaning
    /// "resolve everything locally").
    pub fn new(
        peers: Vec<Peer>,
        virtual_nodes_per_peer: usize,
    ) -> (MembershipView, RingHandle) {
        let ring = Arc::new(Ring::new(peers, virtual_nodes_per_peer));
        let (tx, rx) = watch::channel(ring);
        (MembershipView { virtual_nodes_per_peer, tx }, RingHandle { rx })
    }

    /// Replaces the peer set. In-flight work keeps the ring it already
    /// resolved; subsequent lookups see the rebuild.
    pub fn update(&self, peers: Vec<Peer>) {
        let ring = Arc::new(Ring::new(peers, self.virtual_nodes_per_peer));
        // Send only fails with no receivers; the engine holds one for its
        // lifetime, and a view outliving the engine has nobody to notify.
        let _ = self.tx.send(ring);
    }

    pub fn current(&self) -> Arc<Ring> {
        self.tx.borrow().clone()
    }
}

impl RingHandle {
    pub fn current(&self) -> Arc<Ring> {
        self.rx.borrow().clone()
    }
}
