//! # Peer Assembly
//!
//! [`PeerBuilder`] wires the subsystems into a running [`Peer`]:
//! transport registration, peer map, storage, messenger, replication,
//! dispatcher with the enabled request handlers, and the maintenance
//! tasks (TTL sweep, replication refresh, relay upkeep).
//!
//! Components are built leaves-first and hold plain `Arc` handles
//! downward only, so there are no reference cycles to break; shutdown
//! tears things down in reverse instantiation order.
//!
//! A disabled capability is simply never registered with the dispatcher:
//! remote peers asking for it get a failure reply, and the corresponding
//! distributed operation is unavailable.

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address::{PeerAddress, MAX_RELAYS};
use crate::crypto::{Ed25519SignatureFactory, KeyPair, PublicKey};
use crate::data::Data;
use crate::dht::{
    DataResult, DigestResult, Operations, OperationsConfig, PutOptions, StatusResult,
};
use crate::id::{Number160, Number320, Number640};
use crate::messages::{Command, FailureReason};
use crate::peer_map::PeerMap;
use crate::relay::{RelayConfig, RelayHandler, RelayManager};
use crate::replication::{
    DirectReplicationSender, ReplicationConfig, ReplicationController, ReplicationFactorSource,
};
use crate::routing::{route_to_closest, RoutingConfig};
use crate::rpc::{
    spawn_dispatch_loop, BroadcastHandler, DirectHandler, DirectReplyHandler, Dispatcher,
    Messenger, NeighborsHandler, PeerExchangeHandler, PingHandler, PutListener, QuitHandler,
    StoreHandler,
};
use crate::storage::{SimpleBloomFilter, StorageLayer};
use crate::transport::{ChannelReservation, MeshTransport};

/// Messages a broadcast delivers locally: the message key and its data
/// map.
pub type BroadcastMessage = (Number160, Vec<(Number640, Data)>);

/// Fan-out of the flooding broadcast.
const BROADCAST_FANOUT: usize = 8;

/// Depth of the local broadcast delivery queue.
const BROADCAST_QUEUE: usize = 64;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validated configuration of one peer. Plain data; the builder applies
/// it.
#[derive(Clone)]
pub struct PeerConfig {
    /// Replicas per location key.
    pub replication_factor: usize,
    /// Verified (and overflow) slots per routing bucket.
    pub bag_size: usize,
    /// TTL sweep period.
    pub storage_interval: Duration,
    /// Peer map upkeep period: overflow entries are pinged and promoted
    /// to verified on success.
    pub peer_maintenance_interval: Duration,
    /// Replication refresh period.
    pub replication_interval: Duration,
    /// Jitter bound for delayed replication handovers.
    pub replication_delay: Duration,
    /// Re-check responsibility when a delayed handover fires.
    pub recheck_on_delayed_fire: bool,
    /// Channel pool caps.
    pub max_permits_permanent_tcp: usize,
    pub max_permits_tcp: usize,
    pub max_permits_udp: usize,
    /// Per-request idle timeout.
    pub rpc_timeout: Duration,
    pub routing: RoutingConfig,
    /// Capability toggles. A disabled RPC is not registered.
    pub enable_handshake: bool,
    pub enable_storage: bool,
    pub enable_neighbor: bool,
    pub enable_direct_data: bool,
    pub enable_quit: bool,
    pub enable_peer_exchange: bool,
    pub enable_broadcast: bool,
    /// This peer cannot accept incoming connections and relies on the
    /// relay subsystem.
    pub behind_firewall: bool,
    pub max_relays: usize,
    pub min_relays: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            replication_factor: 6,
            bag_size: 2,
            storage_interval: Duration::from_millis(60_000),
            peer_maintenance_interval: Duration::from_millis(5_000),
            replication_interval: Duration::from_millis(60_000),
            replication_delay: Duration::from_millis(30_000),
            recheck_on_delayed_fire: true,
            max_permits_permanent_tcp: 250,
            max_permits_tcp: 250,
            max_permits_udp: 250,
            rpc_timeout: crate::rpc::DEFAULT_RPC_TIMEOUT,
            routing: RoutingConfig::default(),
            enable_handshake: true,
            enable_storage: true,
            enable_neighbor: true,
            enable_direct_data: true,
            enable_quit: true,
            enable_peer_exchange: true,
            enable_broadcast: true,
            behind_firewall: false,
            max_relays: MAX_RELAYS,
            min_relays: 1,
        }
    }
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.replication_factor >= 1, "replication factor must be at least 1");
        ensure!(self.bag_size >= 1, "bag size must be at least 1");
        ensure!(
            self.max_relays <= MAX_RELAYS,
            "max relays is capped at {MAX_RELAYS}"
        );
        ensure!(
            self.min_relays <= self.max_relays,
            "min relays cannot exceed max relays"
        );
        ensure!(self.routing.alpha >= 1, "alpha must be at least 1");
        ensure!(self.routing.k >= 1, "k must be at least 1");
        Ok(())
    }
}

pub struct PeerBuilder {
    keypair: Option<KeyPair>,
    port: u16,
    config: PeerConfig,
    transport: Option<Arc<MeshTransport>>,
    factor_source: Option<ReplicationFactorSource>,
}

impl PeerBuilder {
    pub fn new() -> Self {
        Self {
            keypair: None,
            port: 0,
            config: PeerConfig::default(),
            transport: None,
            factor_source: None,
        }
    }

    pub fn keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<MeshTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn behind_firewall(mut self, behind: bool) -> Self {
        self.config.behind_firewall = behind;
        self
    }

    /// Callback refreshing the replication factor on every sweep.
    pub fn replication_factor_source(mut self, source: ReplicationFactorSource) -> Self {
        self.factor_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Peer> {
        let config = self.config;
        config.validate()?;
        let transport = self
            .transport
            .context("a transport is required to build a peer")?;
        let keypair = self.keypair.unwrap_or_else(KeyPair::generate);
        let peer_id = keypair.peer_id();

        let mut initial_address = PeerAddress::local(peer_id, self.port);
        if config.behind_firewall {
            initial_address.flags.firewalled_tcp = true;
            initial_address.flags.firewalled_udp = true;
        }
        let inbox = transport.register(&initial_address);
        if config.behind_firewall {
            transport.set_unreachable(peer_id);
        }
        let address = Arc::new(RwLock::new(initial_address));

        let peer_map = Arc::new(RwLock::new(PeerMap::new(peer_id, config.bag_size)));
        let storage = Arc::new(StorageLayer::in_memory());
        let reservation = ChannelReservation::new(
            config.max_permits_permanent_tcp,
            config.max_permits_tcp,
            config.max_permits_udp,
        );
        let messenger = Arc::new(Messenger::new(
            address.clone(),
            peer_map.clone(),
            transport.clone(),
            reservation,
            config.rpc_timeout,
        ));

        let replication_config = ReplicationConfig {
            replication_factor: config.replication_factor,
            interval: config.replication_interval,
            delay: config.replication_delay,
            recheck_on_delayed_fire: config.recheck_on_delayed_fire,
        };
        let (replication, replication_worker) = ReplicationController::new(
            peer_map.clone(),
            storage.clone(),
            Arc::new(DirectReplicationSender::new(messenger.clone())),
            replication_config,
            self.factor_source,
        );

        let dispatcher = Dispatcher::new(address.clone(), peer_map.clone());
        let direct = Arc::new(DirectHandler::new());
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);
        let broadcast = Arc::new(BroadcastHandler::new(
            peer_map.clone(),
            messenger.clone(),
            broadcast_tx,
            BROADCAST_FANOUT,
        ));

        if config.enable_handshake {
            dispatcher.register(Command::Ping, Arc::new(PingHandler));
        }
        if config.enable_storage {
            let listener: PutListener = {
                let replication = replication.clone();
                Arc::new(move |location| replication.on_local_put(location))
            };
            dispatcher.register(
                Command::Store,
                Arc::new(StoreHandler::new(
                    storage.clone(),
                    Arc::new(Ed25519SignatureFactory),
                    Some(listener),
                )),
            );
        }
        if config.enable_neighbor {
            dispatcher.register(
                Command::Neighbors,
                Arc::new(NeighborsHandler::new(peer_map.clone(), storage.clone())),
            );
        }
        if config.enable_direct_data {
            dispatcher.register(Command::Direct, direct.clone());
        }
        if config.enable_quit {
            dispatcher.register(Command::Quit, Arc::new(QuitHandler::new(peer_map.clone())));
        }
        if config.enable_peer_exchange {
            dispatcher.register(
                Command::PeerExchange,
                Arc::new(PeerExchangeHandler::new(peer_map.clone())),
            );
        }
        if config.enable_broadcast {
            dispatcher.register(Command::Broadcast, broadcast.clone());
        }
        // Reachable peers serve as relays for the unreachable ones.
        if !config.behind_firewall {
            dispatcher.register(
                Command::Relay,
                Arc::new(RelayHandler::new(
                    dispatcher.clone(),
                    peer_map.clone(),
                    transport.clone(),
                )),
            );
        }

        spawn_dispatch_loop(dispatcher.clone(), inbox);

        let operations = Operations::new(
            messenger.clone(),
            peer_map.clone(),
            storage.clone(),
            OperationsConfig {
                routing: config.routing.clone(),
                replication_factor: config.replication_factor,
            },
        );

        let relay_manager = config.behind_firewall.then(|| {
            Arc::new(RelayManager::new(
                messenger.clone(),
                peer_map.clone(),
                address.clone(),
                RelayConfig {
                    max_relays: config.max_relays,
                    min_relays: config.min_relays,
                },
            ))
        });

        // Maintenance tasks, owned by the peer and stopped on shutdown.
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(replication_worker));
        tasks.push(tokio::spawn(replication.clone().run_interval()));
        {
            let storage = storage.clone();
            let interval = config.storage_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    storage.check_timeouts(now_millis()).await;
                }
            }));
        }
        {
            // Overflow verification: hearsay peers answering a ping are
            // promoted to verified by the messenger's bookkeeping. This
            // is also how relayed peers become routable.
            let peer_map = peer_map.clone();
            let messenger = messenger.clone();
            let interval = config.peer_maintenance_interval;
            tasks.push(tokio::spawn(async move {
                const PROBES_PER_ROUND: usize = 5;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let probes: Vec<PeerAddress> = {
                        let map = peer_map.read().expect("peer map poisoned");
                        map.all_overflow().into_iter().take(PROBES_PER_ROUND).collect()
                    };
                    for probe in probes {
                        let _ = messenger.ping(&probe).await;
                    }
                }
            }));
        }
        if let Some(manager) = &relay_manager {
            let manager = manager.clone();
            let interval = config.replication_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !manager.relay_addresses().is_empty() {
                        manager.maintain().await;
                    }
                }
            }));
        }

        info!(peer = %peer_id, firewalled = config.behind_firewall, "peer started");
        Ok(Peer {
            keypair,
            address,
            peer_map,
            storage,
            messenger,
            dispatcher,
            operations,
            replication,
            relay_manager,
            direct,
            broadcast,
            broadcast_rx: StdMutex::new(Some(broadcast_rx)),
            transport,
            tasks: StdMutex::new(tasks),
            config,
        })
    }
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running peer of the overlay.
pub struct Peer {
    keypair: KeyPair,
    address: Arc<RwLock<PeerAddress>>,
    peer_map: Arc<RwLock<PeerMap>>,
    storage: Arc<StorageLayer>,
    messenger: Arc<Messenger>,
    dispatcher: Arc<Dispatcher>,
    operations: Operations,
    replication: Arc<ReplicationController>,
    relay_manager: Option<Arc<RelayManager>>,
    direct: Arc<DirectHandler>,
    broadcast: Arc<BroadcastHandler>,
    broadcast_rx: StdMutex<Option<mpsc::Receiver<BroadcastMessage>>>,
    transport: Arc<MeshTransport>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    config: PeerConfig,
}

impl Peer {
    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    pub fn peer_id(&self) -> Number160 {
        self.address.read().expect("address poisoned").peer_id
    }

    pub fn address(&self) -> PeerAddress {
        self.address.read().expect("address poisoned").clone()
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn peer_map(&self) -> &Arc<RwLock<PeerMap>> {
        &self.peer_map
    }

    pub fn storage(&self) -> &Arc<StorageLayer> {
        &self.storage
    }

    pub fn replication(&self) -> &Arc<ReplicationController> {
        &self.replication
    }

    pub fn relay_manager(&self) -> Option<&Arc<RelayManager>> {
        self.relay_manager.as_ref()
    }

    /// Join the overlay through a known peer: learn it, then route toward
    /// the own id to populate the neighborhood.
    pub async fn bootstrap(&self, seed: &PeerAddress) -> Result<(), FailureReason> {
        self.messenger.ping(seed).await?;
        let result = route_to_closest(
            &self.messenger,
            &self.peer_map,
            self.peer_id(),
            &self.config.routing,
            Some(seed.clone()),
        )
        .await;
        debug!(found = result.closest.len(), "bootstrap routing finished");
        Ok(())
    }

    /// Select and register relays. Only meaningful on a peer built with
    /// `behind_firewall`.
    pub async fn setup_relays(&self) -> Result<usize> {
        let manager = self
            .relay_manager
            .as_ref()
            .context("peer is not behind a firewall")?;
        let count = manager.setup().await?;
        manager.advertise().await;
        Ok(count)
    }

    pub async fn ping(&self, to: &PeerAddress) -> Result<(), FailureReason> {
        self.messenger.ping(to).await
    }

    pub async fn put(
        &self,
        entries: Vec<(Number640, Data)>,
        options: PutOptions,
    ) -> Result<StatusResult, FailureReason> {
        self.operations.put(entries, options).await
    }

    /// Single-entry convenience over [`Peer::put`].
    pub async fn put_single(
        &self,
        key: Number640,
        data: Data,
        options: PutOptions,
    ) -> Result<StatusResult, FailureReason> {
        self.operations.put(vec![(key, data)], options).await
    }

    pub async fn add(
        &self,
        location: Number160,
        domain: Number160,
        data: Data,
        options: PutOptions,
    ) -> Result<StatusResult, FailureReason> {
        self.operations.add(location, domain, data, options).await
    }

    pub async fn get(&self, keys: Vec<Number640>) -> Result<DataResult, FailureReason> {
        self.operations.get(keys).await
    }

    pub async fn get_single(&self, key: Number640) -> Result<Option<Data>, FailureReason> {
        let result = self.operations.get(vec![key]).await?;
        Ok(result.evaluate().remove(&key))
    }

    pub async fn get_range(
        &self,
        from: Number640,
        to: Number640,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    ) -> Result<DataResult, FailureReason> {
        self.operations.get_range(from, to, key_bloom, content_bloom).await
    }

    pub async fn remove(
        &self,
        keys: Vec<Number640>,
        public_key: Option<PublicKey>,
    ) -> Result<StatusResult, FailureReason> {
        self.operations.remove(keys, public_key).await
    }

    pub async fn digest(
        &self,
        location_and_domain: Number320,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    ) -> Result<DigestResult, FailureReason> {
        self.operations
            .digest(location_and_domain, key_bloom, content_bloom)
            .await
    }

    pub async fn send_direct(
        &self,
        target: Number160,
        payload: Vec<u8>,
        raw: bool,
        cancel_on_finish: bool,
    ) -> Result<Vec<(Number160, Vec<u8>)>, FailureReason> {
        self.operations
            .send_direct(target, payload, raw, cancel_on_finish)
            .await
    }

    /// Streamed direct send: the payload is pipelined in chunks, with
    /// per-peer progress reported on the listener channel.
    pub async fn send_direct_streaming(
        &self,
        target: Number160,
        payload: Vec<u8>,
        chunk_size: usize,
        raw: bool,
        progress: Option<mpsc::Sender<(Number160, usize)>>,
    ) -> Result<Vec<(Number160, Vec<u8>)>, FailureReason> {
        self.operations
            .send_direct_streaming(target, payload, chunk_size, raw, progress)
            .await
    }

    /// Flood a data map through the overlay under `message_key`.
    pub async fn broadcast(
        &self,
        message_key: Number160,
        entries: Vec<(Number640, Data)>,
    ) -> Result<(), FailureReason> {
        if !self.config.enable_broadcast {
            return Err(FailureReason::IllegalArgument("broadcast disabled".into()));
        }
        if self.peer_map.read().expect("peer map poisoned").verified_count() == 0 {
            return Err(FailureReason::NoBroadcastAddress);
        }
        self.broadcast.mark_seen(&message_key);
        self.broadcast.refan(message_key, 0, entries, None);
        Ok(())
    }

    /// The local delivery stream of broadcast messages. Can be taken
    /// once.
    pub fn broadcast_receiver(&self) -> Option<mpsc::Receiver<BroadcastMessage>> {
        self.broadcast_rx
            .lock()
            .expect("broadcast receiver poisoned")
            .take()
    }

    /// Install the application handler answering DIRECT payloads.
    pub fn set_direct_reply_handler(&self, handler: Arc<dyn DirectReplyHandler>) {
        self.direct.set_reply_handler(handler);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Leave the overlay: stop maintenance, announce QUIT to the
    /// neighborhood, fail pending work with the shutdown sentinel and
    /// leave the transport. Reverse of construction order.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self.tasks.lock().expect("tasks poisoned"),
        );
        for task in &tasks {
            task.abort();
        }

        let neighbors = self.peer_map.read().expect("peer map poisoned").all();
        for neighbor in neighbors {
            let _ = self.messenger.quit(&neighbor).await;
        }

        self.messenger.shut_down();
        self.transport.deregister(&self.peer_id());
        info!(peer = %self.peer_id(), "peer shut down");
    }
}
