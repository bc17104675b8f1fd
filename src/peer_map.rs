//! # Peer Map (Routing Table)
//!
//! The peer map holds every peer this node knows about, organized into 160
//! buckets indexed by XOR-distance bit length from the local identifier:
//! `bucket = 160 - bit_length(self ^ peer)`. Bucket 0 covers the far half
//! of the identifier space; bucket 159 the nearest neighbors.
//!
//! Each bucket keeps two bags, both capped at `bag_size`:
//!
//! - **verified**: peers that answered a request on a direct (or relayed)
//!   channel. A verified entry is never evicted by another verified entry.
//! - **overflow**: peers merely heard about. FIFO-evicted when full, and
//!   promoted to verified on first successful contact.
//!
//! Consumers subscribe through [`PeerMapListener`]; the replication
//! controller uses the insert/remove stream to track responsibility
//! changes.
//!
//! A peer reported offline three consecutive times is dropped. Transient
//! failures only bump the strike counter.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::id::{distance_then_id, Number160, ID_BITS};

/// Consecutive failure reports after which a peer is removed.
const OFFLINE_STRIKES: u32 = 3;

/// Outcome of [`PeerMap::add`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddOutcome {
    /// The peer entered a bag it was not in before.
    Inserted,
    /// An existing entry for the peer was refreshed or promoted.
    Replaced,
    /// The target bag is full of verified entries; the peer was not added.
    Rejected,
}

/// Why a peer left the map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RemoveReason {
    /// The peer stopped answering.
    NotReachable,
    /// The peer announced a clean shutdown (QUIT).
    Shutdown,
    /// A protocol violation or local error forced the removal.
    Exception,
}

/// Observer for peer map mutations. Callbacks run inline under the map
/// borrow and must not call back into the map.
pub trait PeerMapListener: Send + Sync {
    fn peer_inserted(&self, address: &PeerAddress, verified: bool);
    fn peer_removed(&self, address: &PeerAddress, reason: RemoveReason);
    fn peer_updated(&self, address: &PeerAddress) {
        let _ = address;
    }
}

/// A peer entry with liveness bookkeeping.
#[derive(Clone, Debug)]
pub struct PeerStatistic {
    pub address: PeerAddress,
    pub last_seen_millis: u64,
    pub offline_strikes: u32,
}

impl PeerStatistic {
    fn new(address: PeerAddress) -> Self {
        Self {
            address,
            last_seen_millis: now_millis(),
            offline_strikes: 0,
        }
    }

    fn touch(&mut self, address: PeerAddress) {
        self.address = address;
        self.last_seen_millis = now_millis();
        self.offline_strikes = 0;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
struct Bucket {
    verified: Vec<PeerStatistic>,
    overflow: Vec<PeerStatistic>,
}

/// The routing table. Not internally synchronized; the owning peer wraps
/// it in a reader-writer lock.
pub struct PeerMap {
    self_id: Number160,
    bag_size: usize,
    buckets: Vec<Bucket>,
    listeners: Vec<Arc<dyn PeerMapListener>>,
}

impl PeerMap {
    pub fn new(self_id: Number160, bag_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        buckets.resize_with(ID_BITS, Bucket::default);
        Self {
            self_id,
            bag_size,
            buckets,
            listeners: Vec::new(),
        }
    }

    pub fn self_id(&self) -> Number160 {
        self.self_id
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PeerMapListener>) {
        self.listeners.push(listener);
    }

    /// Bucket index for `peer`, or `None` for the self id and the zero id,
    /// which are never inserted.
    pub fn bucket_index(&self, peer: &Number160) -> Option<usize> {
        if *peer == self.self_id || peer.is_zero() {
            return None;
        }
        Some(ID_BITS - self.self_id.xor(peer).bit_length())
    }

    /// Insert or refresh a peer.
    pub fn add(&mut self, address: PeerAddress, verified: bool) -> AddOutcome {
        let Some(idx) = self.bucket_index(&address.peer_id) else {
            return AddOutcome::Rejected;
        };
        let bag_size = self.bag_size;
        let bucket = &mut self.buckets[idx];

        // Already verified: refresh in place.
        if let Some(entry) = bucket
            .verified
            .iter_mut()
            .find(|e| e.address.peer_id == address.peer_id)
        {
            entry.touch(address.clone());
            self.notify_updated(&address);
            return AddOutcome::Replaced;
        }

        if verified {
            // A verified entry replaces its own overflow entry.
            let promoted = if let Some(pos) = bucket
                .overflow
                .iter()
                .position(|e| e.address.peer_id == address.peer_id)
            {
                bucket.overflow.remove(pos);
                true
            } else {
                false
            };

            if bucket.verified.len() >= bag_size {
                trace!(peer = %address.peer_id, bucket = idx, "verified bag full, rejecting");
                return AddOutcome::Rejected;
            }
            bucket.verified.push(PeerStatistic::new(address.clone()));
            debug!(peer = %address.peer_id, bucket = idx, "peer verified");
            self.notify_inserted(&address, true);
            if promoted {
                AddOutcome::Replaced
            } else {
                AddOutcome::Inserted
            }
        } else {
            if let Some(entry) = bucket
                .overflow
                .iter_mut()
                .find(|e| e.address.peer_id == address.peer_id)
            {
                entry.touch(address.clone());
                self.notify_updated(&address);
                return AddOutcome::Replaced;
            }
            if bucket.overflow.len() >= bag_size {
                // FIFO eviction of the oldest hearsay entry.
                bucket.overflow.remove(0);
            }
            bucket.overflow.push(PeerStatistic::new(address.clone()));
            self.notify_inserted(&address, false);
            AddOutcome::Inserted
        }
    }

    /// Remove a peer from both bags.
    pub fn remove(&mut self, peer_id: &Number160, reason: RemoveReason) -> bool {
        let Some(idx) = self.bucket_index(peer_id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let mut removed = None;
        if let Some(pos) = bucket
            .verified
            .iter()
            .position(|e| e.address.peer_id == *peer_id)
        {
            removed = Some(bucket.verified.remove(pos).address);
        }
        if let Some(pos) = bucket
            .overflow
            .iter()
            .position(|e| e.address.peer_id == *peer_id)
        {
            let entry = bucket.overflow.remove(pos).address;
            removed.get_or_insert(entry);
        }
        match removed {
            Some(address) => {
                debug!(peer = %peer_id, ?reason, "peer removed");
                self.notify_removed(&address, reason);
                true
            }
            None => false,
        }
    }

    /// Record a failed contact. The peer is removed after
    /// [`OFFLINE_STRIKES`] consecutive failures; returns `true` when that
    /// happened.
    pub fn report_failure(&mut self, peer_id: &Number160) -> bool {
        let Some(idx) = self.bucket_index(peer_id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let strikes = bucket
            .verified
            .iter_mut()
            .chain(bucket.overflow.iter_mut())
            .find(|e| e.address.peer_id == *peer_id)
            .map(|e| {
                e.offline_strikes += 1;
                e.offline_strikes
            });
        match strikes {
            Some(strikes) if strikes >= OFFLINE_STRIKES => {
                self.remove(peer_id, RemoveReason::NotReachable)
            }
            _ => false,
        }
    }

    /// Look up a peer's current address in either bag.
    pub fn find(&self, peer_id: &Number160) -> Option<PeerAddress> {
        let idx = self.bucket_index(peer_id)?;
        let bucket = &self.buckets[idx];
        bucket
            .verified
            .iter()
            .chain(bucket.overflow.iter())
            .find(|e| e.address.peer_id == *peer_id)
            .map(|e| e.address.clone())
    }

    pub fn contains_verified(&self, peer_id: &Number160) -> bool {
        self.bucket_index(peer_id)
            .map(|idx| {
                self.buckets[idx]
                    .verified
                    .iter()
                    .any(|e| e.address.peer_id == *peer_id)
            })
            .unwrap_or(false)
    }

    /// Up to `k` verified peers sorted by ascending XOR distance to
    /// `target`, ties broken by numeric peer id.
    pub fn closest_peers(&self, target: &Number160, k: usize) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .buckets
            .iter()
            .flat_map(|b| b.verified.iter())
            .map(|e| e.address.clone())
            .collect();
        peers.sort_by(|a, b| distance_then_id(target, &a.peer_id, &b.peer_id));
        peers.truncate(k);
        peers
    }

    /// Snapshot of all verified peers.
    pub fn all(&self) -> Vec<PeerAddress> {
        self.buckets
            .iter()
            .flat_map(|b| b.verified.iter())
            .map(|e| e.address.clone())
            .collect()
    }

    /// Snapshot of all overflow (unverified) peers.
    pub fn all_overflow(&self) -> Vec<PeerAddress> {
        self.buckets
            .iter()
            .flat_map(|b| b.overflow.iter())
            .map(|e| e.address.clone())
            .collect()
    }

    pub fn verified_count(&self) -> usize {
        self.buckets.iter().map(|b| b.verified.len()).sum()
    }

    /// Whether `peer` is among the `r` closest verified peers to
    /// `location`, counting this node itself as a candidate.
    pub fn is_responsible(&self, peer: &Number160, location: &Number160, r: usize) -> bool {
        let mut candidates: Vec<Number160> = self
            .buckets
            .iter()
            .flat_map(|b| b.verified.iter())
            .map(|e| e.address.peer_id)
            .collect();
        candidates.push(self.self_id);
        candidates.sort_by(|a, b| distance_then_id(location, a, b));
        candidates.iter().take(r).any(|id| id == peer)
    }

    fn notify_inserted(&self, address: &PeerAddress, verified: bool) {
        for listener in &self.listeners {
            listener.peer_inserted(address, verified);
        }
    }

    fn notify_removed(&self, address: &PeerAddress, reason: RemoveReason) {
        for listener in &self.listeners {
            listener.peer_removed(address, reason);
        }
    }

    fn notify_updated(&self, address: &PeerAddress) {
        for listener in &self.listeners {
            listener.peer_updated(address);
        }
    }
}
