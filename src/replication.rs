//! # Indirect Replication
//!
//! Keeps every stored item on the R peers closest to its location key.
//! Two mechanisms cooperate:
//!
//! - **Responsibility tracking** reacts to neighbor-set changes. When a
//!   new peer turns out closer to a location this node owns, the entries
//!   are handed over (`other_responsible`); when churn makes this node one
//!   of the R closest, it re-seeds the neighborhood (`me_responsible`).
//! - A **periodic sweep** re-publishes every owned location to the current
//!   closest R-1 peers, healing whatever the event path missed. The sweep
//!   also refreshes the replication factor through a caller-provided
//!   source, so R can track network size.
//!
//! Handover on join is jittered: when many peers appear at once, each
//! delayed transfer fires after a uniform delay in `0..delay`, and by
//! default re-checks at fire time whether the target is still responsible
//! before sending (`recheck_on_delayed_fire`; disabling it sends
//! unconditionally at fire time).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::address::PeerAddress;
use crate::data::Data;
use crate::id::{distance_then_id, Number160, Number640};
use crate::messages::{StoreRequest, StoreResponse};
use crate::peer_map::{PeerMap, PeerMapListener, RemoveReason};
use crate::rpc::Messenger;
use crate::storage::StorageLayer;

/// Replication events distilled from peer map changes.
#[derive(Debug)]
enum ReplicationEvent {
    PeerInserted(PeerAddress),
    PeerRemoved(Number160),
    LocalPut(Number160),
    Tick,
}

/// Transfers a location's entries to one target peer. Split out as a seam
/// so the handover policy is testable without a network.
#[async_trait]
pub trait ReplicationSender: Send + Sync {
    async fn send_to(&self, other: &PeerAddress, location: Number160, entries: Vec<(Number640, Data)>);
}

/// Default sender: one direct STORE put per target.
pub struct DirectReplicationSender {
    messenger: Arc<Messenger>,
}

impl DirectReplicationSender {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl ReplicationSender for DirectReplicationSender {
    async fn send_to(
        &self,
        other: &PeerAddress,
        location: Number160,
        entries: Vec<(Number640, Data)>,
    ) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        let outcome = self
            .messenger
            .store(
                other,
                StoreRequest::Put {
                    entries,
                    public_key: None,
                    put_if_absent: false,
                    claim_domain: false,
                },
            )
            .await;
        match outcome {
            Ok(StoreResponse::Status(_)) => {
                trace!(peer = %other.peer_id, %location, count, "replica transferred");
            }
            Ok(_) | Err(_) => {
                debug!(peer = %other.peer_id, %location, "replica transfer failed");
            }
        }
    }
}

#[derive(Clone)]
pub struct ReplicationConfig {
    /// Replicas per location key.
    pub replication_factor: usize,
    /// Period of the refresh sweep.
    pub interval: Duration,
    /// Upper bound of the join-handover jitter.
    pub delay: Duration,
    /// Re-check responsibility when a delayed handover fires.
    pub recheck_on_delayed_fire: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 6,
            interval: Duration::from_millis(60_000),
            delay: Duration::from_millis(30_000),
            recheck_on_delayed_fire: true,
        }
    }
}

/// Source for refreshing R on every sweep, e.g. from a network size
/// estimate.
pub type ReplicationFactorSource = Arc<dyn Fn() -> usize + Send + Sync>;

pub struct ReplicationController {
    self_id: Number160,
    peer_map: Arc<RwLock<PeerMap>>,
    storage: Arc<StorageLayer>,
    sender: Arc<dyn ReplicationSender>,
    config: RwLock<ReplicationConfig>,
    factor_source: Option<ReplicationFactorSource>,
    events: mpsc::Sender<ReplicationEvent>,
}

/// Peer map listener half: forwards mutations into the controller's event
/// queue (callbacks run under the map lock, so no work happens inline).
struct MapBridge {
    events: mpsc::Sender<ReplicationEvent>,
}

impl PeerMapListener for MapBridge {
    fn peer_inserted(&self, address: &PeerAddress, verified: bool) {
        if verified {
            let _ = self
                .events
                .try_send(ReplicationEvent::PeerInserted(address.clone()));
        }
    }

    fn peer_removed(&self, address: &PeerAddress, _reason: RemoveReason) {
        let _ = self
            .events
            .try_send(ReplicationEvent::PeerRemoved(address.peer_id));
    }
}

impl ReplicationController {
    /// Build the controller and subscribe it to the peer map. The caller
    /// spawns the returned worker future.
    pub fn new(
        peer_map: Arc<RwLock<PeerMap>>,
        storage: Arc<StorageLayer>,
        sender: Arc<dyn ReplicationSender>,
        config: ReplicationConfig,
        factor_source: Option<ReplicationFactorSource>,
    ) -> (Arc<Self>, impl std::future::Future<Output = ()>) {
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let self_id = peer_map.read().expect("peer map poisoned").self_id();
        let controller = Arc::new(Self {
            self_id,
            peer_map: peer_map.clone(),
            storage,
            sender,
            config: RwLock::new(config),
            factor_source,
            events: events_tx.clone(),
        });
        peer_map
            .write()
            .expect("peer map poisoned")
            .add_listener(Arc::new(MapBridge { events: events_tx }));

        let worker = {
            let controller = controller.clone();
            async move {
                while let Some(event) = events_rx.recv().await {
                    controller.handle_event(event).await;
                }
            }
        };
        (controller, worker)
    }

    /// Periodic driver; the owning peer spawns this alongside the worker.
    pub async fn run_interval(self: Arc<Self>) {
        let interval = self.config.read().expect("config poisoned").interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.events.send(ReplicationEvent::Tick).await.is_err() {
                break;
            }
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.config
            .read()
            .expect("config poisoned")
            .replication_factor
    }

    /// Hook for the STORE handler: a put landed locally.
    pub fn on_local_put(&self, location: Number160) {
        let _ = self.events.try_send(ReplicationEvent::LocalPut(location));
    }

    async fn handle_event(&self, event: ReplicationEvent) {
        match event {
            ReplicationEvent::PeerInserted(address) => self.peer_inserted(&address).await,
            ReplicationEvent::PeerRemoved(peer_id) => self.peer_removed(&peer_id).await,
            ReplicationEvent::LocalPut(location) => {
                self.storage.update_responsibility(location, self.self_id);
            }
            ReplicationEvent::Tick => self.sweep().await,
        }
    }

    /// A verified peer joined: hand over every owned location it is now
    /// closer to, after jitter.
    async fn peer_inserted(&self, other: &PeerAddress) {
        let owned = self.storage.find_content_for_responsible_peer(&self.self_id);
        for location in owned {
            let other_closer = distance_then_id(&location, &other.peer_id, &self.self_id)
                == std::cmp::Ordering::Less;
            if !other_closer {
                continue;
            }
            let replicas = self.replication_factor();
            let responsible = self
                .peer_map
                .read()
                .expect("peer map poisoned")
                .is_responsible(&other.peer_id, &location, replicas);
            if responsible {
                self.storage.update_responsibility(location, other.peer_id);
                self.other_responsible(location, other.clone(), true).await;
            }
        }
    }

    /// A peer left: wherever it held responsibility and this node is now
    /// among the R closest, re-seed the neighborhood.
    async fn peer_removed(&self, peer_id: &Number160) {
        let orphaned = self.storage.find_content_for_responsible_peer(peer_id);
        for location in orphaned {
            self.storage.remove_responsibility_of(&location, peer_id);
            let replicas = self.replication_factor();
            let mine = self
                .peer_map
                .read()
                .expect("peer map poisoned")
                .is_responsible(&self.self_id, &location, replicas);
            if mine {
                self.me_responsible(location).await;
            }
        }
    }

    /// This node is one of the R closest to `location`: push its copies to
    /// the current closest R-1 peers.
    pub async fn me_responsible(&self, location: Number160) {
        debug!(%location, "now responsible, synchronizing");
        self.synchronize(location).await;
    }

    /// `other` became closer to `location`. Immediate transfers send right
    /// away; delayed ones fire after the jitter.
    pub async fn other_responsible(&self, location: Number160, other: PeerAddress, delayed: bool) {
        if !delayed {
            let entries = self.entries_under(location).await;
            self.sender.send_to(&other, location, entries).await;
            return;
        }
        let (delay, recheck) = {
            let config = self.config.read().expect("config poisoned");
            (config.delay, config.recheck_on_delayed_fire)
        };
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..delay.max(Duration::from_millis(1)));
        tokio::time::sleep(jitter).await;

        if recheck {
            let replicas = self.replication_factor();
            let still_responsible = self
                .peer_map
                .read()
                .expect("peer map poisoned")
                .is_responsible(&other.peer_id, &location, replicas);
            if !still_responsible {
                trace!(peer = %other.peer_id, %location, "delayed handover dropped, no longer responsible");
                return;
            }
        }
        let entries = self.entries_under(location).await;
        self.sender.send_to(&other, location, entries).await;
    }

    /// The periodic refresh: push every owned location to the current
    /// closest R-1 peers, then refresh R.
    async fn sweep(&self) {
        let owned = self.storage.find_content_for_responsible_peer(&self.self_id);
        trace!(locations = owned.len(), "replication sweep");
        for location in owned {
            self.synchronize(location).await;
        }
        if let Some(source) = &self.factor_source {
            let factor = source();
            let mut config = self.config.write().expect("config poisoned");
            if config.replication_factor != factor {
                debug!(old = config.replication_factor, new = factor, "replication factor refreshed");
                config.replication_factor = factor;
            }
        }
    }

    async fn synchronize(&self, location: Number160) {
        let entries = self.entries_under(location).await;
        if entries.is_empty() {
            return;
        }
        let replicas = self.replication_factor().saturating_sub(1);
        let targets = self
            .peer_map
            .read()
            .expect("peer map poisoned")
            .closest_peers(&location, replicas);
        if targets.is_empty() {
            return;
        }
        for target in targets {
            self.sender.send_to(&target, location, entries.clone()).await;
        }
    }

    async fn entries_under(&self, location: Number160) -> Vec<(Number640, Data)> {
        let (from, to) = Number640::location_range(location);
        let entries = self.storage.get_range(from, to).await;
        if entries.is_empty() {
            warn!(%location, "responsible for a location with no entries");
        }
        entries.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Number160;
    use std::sync::Mutex as StdMutex;

    struct RecordingSender {
        sent: StdMutex<Vec<(Number160, Number160, usize)>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(Number160, Number160, usize)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplicationSender for RecordingSender {
        async fn send_to(
            &self,
            other: &PeerAddress,
            location: Number160,
            entries: Vec<(Number640, Data)>,
        ) {
            self.sent
                .lock()
                .unwrap()
                .push((other.peer_id, location, entries.len()));
        }
    }

    struct Fixture {
        controller: Arc<ReplicationController>,
        sender: Arc<RecordingSender>,
        peer_map: Arc<RwLock<PeerMap>>,
        storage: Arc<StorageLayer>,
    }

    fn fixture(config: ReplicationConfig) -> Fixture {
        let peer_map = Arc::new(RwLock::new(PeerMap::new(Number160::from_u32(1), 20)));
        let storage = Arc::new(StorageLayer::in_memory());
        let sender = RecordingSender::new();
        let (controller, worker) = ReplicationController::new(
            peer_map.clone(),
            storage.clone(),
            sender.clone(),
            config,
            None,
        );
        tokio::spawn(worker);
        Fixture {
            controller,
            sender,
            peer_map,
            storage,
        }
    }

    async fn store_owned(fixture: &Fixture, location: Number160) {
        let key = Number640::new(location, Number160::ZERO, Number160::ZERO, Number160::ZERO);
        fixture
            .storage
            .put(key, Data::new(&b"payload"[..]), None, false, false)
            .await;
        fixture
            .storage
            .update_responsibility(location, Number160::from_u32(1));
    }

    fn quick_config() -> ReplicationConfig {
        ReplicationConfig {
            replication_factor: 3,
            interval: Duration::from_millis(50),
            delay: Duration::from_millis(20),
            recheck_on_delayed_fire: true,
        }
    }

    #[tokio::test]
    async fn me_responsible_sends_to_closest_r_minus_one() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;
        for id in [2u32, 3, 101, 102] {
            fixture
                .peer_map
                .write()
                .unwrap()
                .add(PeerAddress::local(Number160::from_u32(id), 4000), true);
        }

        fixture.controller.me_responsible(location).await;

        let sent = fixture.sender.sent();
        // R-1 = 2 transfers to the two peers closest to the location.
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, l, n)| *l == location && *n == 1));
        assert!(sent.iter().any(|(p, _, _)| *p == Number160::from_u32(101)));
        assert!(sent.iter().any(|(p, _, _)| *p == Number160::from_u32(102)));
    }

    #[tokio::test]
    async fn immediate_handover_sends_without_delay() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;

        let other = PeerAddress::local(Number160::from_u32(101), 4000);
        fixture
            .controller
            .other_responsible(location, other, false)
            .await;

        assert_eq!(fixture.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn delayed_send_rechecks_responsibility() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;

        // The target never enters the map, so at fire time it is not
        // among the R closest and the transfer is dropped.
        let other = PeerAddress::local(Number160::from_u32(101), 4000);
        fixture
            .controller
            .other_responsible(location, other, true)
            .await;

        assert!(fixture.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn delayed_send_unconditional() {
        let mut config = quick_config();
        config.recheck_on_delayed_fire = false;
        let fixture = fixture(config);
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;

        // Same setup as above, but the original unconditional behavior
        // sends anyway.
        let other = PeerAddress::local(Number160::from_u32(101), 4000);
        fixture
            .controller
            .other_responsible(location, other, true)
            .await;

        assert_eq!(fixture.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn peer_insert_triggers_delayed_handover() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;

        // Peer 101 is closer to location 100 than self (1).
        fixture
            .peer_map
            .write()
            .unwrap()
            .add(PeerAddress::local(Number160::from_u32(101), 4000), true);

        // Allow event processing plus the jitter (bounded by 20ms).
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = fixture.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Number160::from_u32(101));
        // Responsibility was recorded for the new owner.
        assert!(fixture
            .storage
            .find_content_for_responsible_peer(&Number160::from_u32(101))
            .contains(&location));
    }

    #[tokio::test]
    async fn peer_removal_makes_me_responsible() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;

        let leaving = Number160::from_u32(101);
        fixture
            .peer_map
            .write()
            .unwrap()
            .add(PeerAddress::local(leaving, 4000), true);
        fixture
            .peer_map
            .write()
            .unwrap()
            .add(PeerAddress::local(Number160::from_u32(3), 4000), true);
        fixture.storage.update_responsibility(location, leaving);
        // Drain the insert events before the removal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.sender.sent.lock().unwrap().clear();

        fixture
            .peer_map
            .write()
            .unwrap()
            .remove(&leaving, RemoveReason::NotReachable);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Departed peer's responsibility is gone and we re-seeded.
        assert!(!fixture
            .storage
            .find_peers_for_responsible_content(&location)
            .contains(&leaving));
        assert!(!fixture.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn periodic_sweep_republishes() {
        let fixture = fixture(quick_config());
        let location = Number160::from_u32(100);
        store_owned(&fixture, location).await;
        fixture
            .peer_map
            .write()
            .unwrap()
            .add(PeerAddress::local(Number160::from_u32(3), 4000), true);

        tokio::spawn(fixture.controller.clone().run_interval());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!fixture.sender.sent().is_empty());
    }
}
