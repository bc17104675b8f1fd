//! # RPC Layer
//!
//! Request/response plumbing between peers, split into a client side and a
//! server side:
//!
//! - [`Messenger`]: builds request envelopes, reserves a channel permit,
//!   delivers over the [`Wire`] and interprets replies. Successful replies
//!   upsert the responder as a verified peer; transport failures downgrade
//!   it (three strikes remove).
//! - [`Dispatcher`]: routes inbound requests to the registered
//!   [`RequestHandler`] per command. A disabled capability is simply never
//!   registered. Requests addressed to a *different* peer id consult the
//!   [`Forwarder`] table; that is the hook the relay subsystem uses to
//!   answer for its unreachable clients.
//!
//! Handlers for the fixed command set live here too, each owning exactly
//! the state it serves: storage for STORE, the peer map for NEIGHBORS /
//! QUIT / PEER-EXCHANGE, a pluggable reply object for DIRECT, and a
//! flooding dispatcher for BROADCAST.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::address::PeerAddress;
use crate::crypto::SignatureFactory;
use crate::id::{Number160, Number640};
use crate::messages::{
    Body, Command, Envelope, FailureReason, Kind, StoreRequest, StoreResponse,
};
use crate::peer_map::{PeerMap, RemoveReason};
use crate::storage::{DigestInfo, PutStatus, StorageLayer};
use crate::transport::{ChannelKind, ChannelReservation, Inbox, Wire};

/// Default per-request idle timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Verified peers returned by NEIGHBORS and PEER-EXCHANGE responses.
const NEIGHBOR_LIMIT: usize = 20;

/// Broadcast messages remembered for deduplication.
const BROADCAST_SEEN_CAP: usize = 1024;

/// Hop budget for the default flooding broadcast.
const BROADCAST_MAX_HOPS: u32 = 4;

// ============================================================================
// Messenger (client side)
// ============================================================================

pub struct Messenger {
    self_address: Arc<RwLock<PeerAddress>>,
    peer_map: Arc<RwLock<PeerMap>>,
    wire: Arc<dyn Wire>,
    reservation: ChannelReservation,
    next_message_id: AtomicU32,
    shutting_down: AtomicBool,
    rpc_timeout: Duration,
}

impl Messenger {
    pub fn new(
        self_address: Arc<RwLock<PeerAddress>>,
        peer_map: Arc<RwLock<PeerMap>>,
        wire: Arc<dyn Wire>,
        reservation: ChannelReservation,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            self_address,
            peer_map,
            wire,
            reservation,
            next_message_id: AtomicU32::new(1),
            shutting_down: AtomicBool::new(false),
            rpc_timeout,
        }
    }

    pub fn self_address(&self) -> PeerAddress {
        self.self_address.read().expect("address poisoned").clone()
    }

    pub fn self_id(&self) -> Number160 {
        self.self_address().peer_id
    }

    /// After this, every request fails with [`FailureReason::Shutdown`].
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.reservation.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn channel_kind(command: Command) -> ChannelKind {
        match command {
            Command::Direct => ChannelKind::Tcp,
            Command::Relay => ChannelKind::PermanentTcp,
            _ => ChannelKind::Udp,
        }
    }

    /// Send one request and await its reply. Transport failures downgrade
    /// the peer; any reply upserts it as verified.
    pub async fn send(
        &self,
        to: &PeerAddress,
        command: Command,
        body: Body,
    ) -> Result<Envelope, FailureReason> {
        if self.is_shutting_down() {
            return Err(FailureReason::Shutdown);
        }
        let _permit = self.reservation.reserve(Self::channel_kind(command)).await?;
        let envelope = Envelope::request(
            command,
            self.next_message_id.fetch_add(1, Ordering::Relaxed),
            self.self_address(),
            to.peer_id,
            body,
        );
        let outcome = tokio::time::timeout(self.rpc_timeout, self.wire.deliver(to, envelope))
            .await
            .map_err(|_| FailureReason::Timeout)
            .and_then(|r| r);

        match &outcome {
            Ok(reply) => {
                let sender = reply.sender.clone();
                if sender.peer_id == to.peer_id {
                    self.peer_map
                        .write()
                        .expect("peer map poisoned")
                        .add(sender, true);
                }
            }
            Err(FailureReason::Timeout) | Err(FailureReason::PeerUnreachable) => {
                trace!(peer = %to.peer_id, ?command, "request failed, downgrading peer");
                self.peer_map
                    .write()
                    .expect("peer map poisoned")
                    .report_failure(&to.peer_id);
            }
            Err(_) => {}
        }
        outcome
    }

    /// Send and insist on a non-failure reply.
    async fn send_expect_ok(
        &self,
        to: &PeerAddress,
        command: Command,
        body: Body,
    ) -> Result<Envelope, FailureReason> {
        let reply = self.send(to, command, body).await?;
        match reply.failure() {
            Some(reason) => Err(reason),
            None => Ok(reply),
        }
    }

    pub async fn ping(&self, to: &PeerAddress) -> Result<(), FailureReason> {
        self.send_expect_ok(to, Command::Ping, Body::Empty)
            .await
            .map(|_| ())
    }

    pub async fn neighbors(
        &self,
        to: &PeerAddress,
        target: Number160,
    ) -> Result<(Vec<PeerAddress>, DigestInfo), FailureReason> {
        let reply = self
            .send_expect_ok(to, Command::Neighbors, Body::Neighbors { target })
            .await?;
        match reply.body {
            Body::NeighborsReply { peers, digest } => Ok((peers, digest)),
            _ => Err(FailureReason::ProtocolViolation),
        }
    }

    pub async fn store(
        &self,
        to: &PeerAddress,
        request: StoreRequest,
    ) -> Result<StoreResponse, FailureReason> {
        let reply = self
            .send_expect_ok(to, Command::Store, Body::Store(request))
            .await?;
        match reply.body {
            Body::StoreReply(response) => Ok(response),
            _ => Err(FailureReason::ProtocolViolation),
        }
    }

    pub async fn direct(
        &self,
        to: &PeerAddress,
        payload: Vec<u8>,
        raw: bool,
    ) -> Result<Vec<u8>, FailureReason> {
        let reply = self
            .send_expect_ok(to, Command::Direct, Body::Direct { payload, raw })
            .await?;
        match reply.body {
            Body::DirectReply { payload } => Ok(payload),
            Body::Empty => Ok(Vec::new()),
            _ => Err(FailureReason::ProtocolViolation),
        }
    }

    /// Send one chunk of a streamed direct payload. Intermediate chunks
    /// come back as `Partial`; the final chunk yields the application
    /// reply.
    pub async fn direct_stream(
        &self,
        to: &PeerAddress,
        stream_id: u64,
        seq: u32,
        last: bool,
        raw: bool,
        chunk: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, FailureReason> {
        let reply = self
            .send_expect_ok(
                to,
                Command::Direct,
                Body::DirectStream {
                    stream_id,
                    seq,
                    last,
                    raw,
                    chunk,
                },
            )
            .await?;
        match (reply.kind, reply.body) {
            (Kind::Partial, _) => Ok(None),
            (_, Body::DirectReply { payload }) => Ok(Some(payload)),
            (_, Body::Empty) => Ok(Some(Vec::new())),
            _ => Err(FailureReason::ProtocolViolation),
        }
    }

    pub async fn quit(&self, to: &PeerAddress) -> Result<(), FailureReason> {
        self.send(to, Command::Quit, Body::Empty).await.map(|_| ())
    }

    pub async fn peer_exchange(
        &self,
        to: &PeerAddress,
        peers: Vec<PeerAddress>,
    ) -> Result<Vec<PeerAddress>, FailureReason> {
        let reply = self
            .send_expect_ok(to, Command::PeerExchange, Body::PeerExchange { peers })
            .await?;
        match reply.body {
            Body::PeerExchange { peers } => Ok(peers),
            _ => Err(FailureReason::ProtocolViolation),
        }
    }

    pub async fn broadcast(
        &self,
        to: &PeerAddress,
        message_key: Number160,
        hop_count: u32,
        entries: Vec<(Number640, crate::data::Data)>,
    ) -> Result<(), FailureReason> {
        self.send(
            to,
            Command::Broadcast,
            Body::Broadcast {
                message_key,
                hop_count,
                entries,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn relay_setup(&self, to: &PeerAddress) -> Result<(), FailureReason> {
        self.send_expect_ok(to, Command::Relay, Body::RelaySetup)
            .await
            .map(|_| ())
    }
}

// ============================================================================
// Dispatcher (server side)
// ============================================================================

/// Serves one request family.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason>;
}

/// Answers or forwards requests addressed to another peer id. Installed by
/// the relay subsystem, keyed by the destination.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: Envelope) -> Result<Envelope, FailureReason>;
}

pub struct Dispatcher {
    self_address: Arc<RwLock<PeerAddress>>,
    peer_map: Arc<RwLock<PeerMap>>,
    handlers: RwLock<HashMap<Command, Arc<dyn RequestHandler>>>,
    forwarders: RwLock<HashMap<Number160, Arc<dyn Forwarder>>>,
}

impl Dispatcher {
    pub fn new(
        self_address: Arc<RwLock<PeerAddress>>,
        peer_map: Arc<RwLock<PeerMap>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_address,
            peer_map,
            handlers: RwLock::new(HashMap::new()),
            forwarders: RwLock::new(HashMap::new()),
        })
    }

    /// Register the handler for a command. Capabilities that are disabled
    /// by configuration are never registered.
    pub fn register(&self, command: Command, handler: Arc<dyn RequestHandler>) {
        self.handlers
            .write()
            .expect("handlers poisoned")
            .insert(command, handler);
    }

    pub fn register_forwarder(&self, destination: Number160, forwarder: Arc<dyn Forwarder>) {
        debug!(peer = %destination, "forwarder installed");
        self.forwarders
            .write()
            .expect("forwarders poisoned")
            .insert(destination, forwarder);
    }

    pub fn remove_forwarder(&self, destination: &Number160) {
        self.forwarders
            .write()
            .expect("forwarders poisoned")
            .remove(destination);
    }

    fn self_address(&self) -> PeerAddress {
        self.self_address.read().expect("address poisoned").clone()
    }

    pub async fn dispatch(&self, request: Envelope) -> Envelope {
        if !request.is_request() {
            return request.fail(self.self_address(), FailureReason::ProtocolViolation);
        }

        // Every inbound request teaches us its sender, unverified.
        {
            let sender = request.sender.clone();
            let mut map = self.peer_map.write().expect("peer map poisoned");
            if sender.peer_id != map.self_id() {
                map.add(sender, false);
            }
        }

        let self_id = self.self_address().peer_id;
        if request.recipient != self_id {
            let forwarder = self
                .forwarders
                .read()
                .expect("forwarders poisoned")
                .get(&request.recipient)
                .cloned();
            return match forwarder {
                Some(forwarder) => match forwarder.forward(request.clone()).await {
                    Ok(reply) => reply,
                    Err(reason) => request.fail(self.self_address(), reason),
                },
                None => {
                    trace!(recipient = %request.recipient, "no forwarder for foreign recipient");
                    request.fail(self.self_address(), FailureReason::PeerUnreachable)
                }
            };
        }

        let handler = self
            .handlers
            .read()
            .expect("handlers poisoned")
            .get(&request.command)
            .cloned();
        match handler {
            Some(handler) => match handler.handle(&request).await {
                Ok((kind, body)) => request.reply(kind, self.self_address(), body),
                Err(reason) => request.fail(self.self_address(), reason),
            },
            None => request.fail(
                self.self_address(),
                FailureReason::Remote(format!("{:?} not enabled", request.command)),
            ),
        }
    }
}

/// Drain a transport inbox into the dispatcher until the inbox closes.
/// Each request is served on its own task so a slow handler does not stall
/// the queue.
pub fn spawn_dispatch_loop(dispatcher: Arc<Dispatcher>, mut inbox: Inbox) {
    tokio::spawn(async move {
        while let Some(incoming) = inbox.recv().await {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let reply = dispatcher.dispatch(incoming.envelope).await;
                let _ = incoming.reply.send(reply);
            });
        }
    });
}

// ============================================================================
// Handlers
// ============================================================================

/// PING: proof of liveness, nothing else.
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    async fn handle(&self, _request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        Ok((Kind::Ok, Body::Empty))
    }
}

/// Called with the location key of every successfully stored entry; the
/// replication controller listens here.
pub type PutListener = Arc<dyn Fn(Number160) + Send + Sync>;

/// STORE: put/get/remove/digest against the local storage layer.
pub struct StoreHandler {
    storage: Arc<StorageLayer>,
    factory: Arc<dyn SignatureFactory>,
    put_listener: Option<PutListener>,
}

impl StoreHandler {
    pub fn new(
        storage: Arc<StorageLayer>,
        factory: Arc<dyn SignatureFactory>,
        put_listener: Option<PutListener>,
    ) -> Self {
        Self {
            storage,
            factory,
            put_listener,
        }
    }
}

#[async_trait]
impl RequestHandler for StoreHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        let Body::Store(store) = &request.body else {
            return Err(FailureReason::ProtocolViolation);
        };
        let response = match store {
            StoreRequest::Put {
                entries,
                public_key,
                put_if_absent,
                claim_domain,
            } => {
                let mut statuses = Vec::with_capacity(entries.len());
                for (key, data) in entries {
                    // A signed entry carrying its key must actually
                    // verify; forged payloads are rejected before they
                    // touch storage.
                    if data.is_signed()
                        && data.public_key().is_some()
                        && data.verify(self.factory.as_ref(), None).is_err()
                    {
                        debug!(key = %key, "rejecting entry with invalid signature");
                        return Err(FailureReason::SignatureInvalid);
                    }
                    let status = self
                        .storage
                        .put(
                            *key,
                            data.clone(),
                            public_key.as_ref(),
                            *put_if_absent,
                            *claim_domain,
                        )
                        .await;
                    if status == PutStatus::Ok {
                        if let Some(listener) = &self.put_listener {
                            listener(key.location);
                        }
                    }
                    statuses.push((*key, status));
                }
                StoreResponse::Status(statuses)
            }
            StoreRequest::Get { keys } => {
                let mut entries = Vec::new();
                for key in keys {
                    if let Some(data) = self.storage.get(*key).await {
                        entries.push((*key, data));
                    }
                }
                StoreResponse::Entries(entries)
            }
            StoreRequest::GetRange {
                from,
                to,
                key_bloom,
                content_bloom,
            } => {
                let entries = self
                    .storage
                    .get_range_filtered(*from, *to, key_bloom.as_ref(), content_bloom.as_ref())
                    .await;
                StoreResponse::Entries(entries.into_iter().collect())
            }
            StoreRequest::Remove { keys, public_key } => {
                let mut statuses = Vec::new();
                for key in keys {
                    let removed = self.storage.remove(*key, public_key.as_ref()).await;
                    statuses.push((
                        *key,
                        if removed.is_some() {
                            PutStatus::Ok
                        } else {
                            PutStatus::Failed
                        },
                    ));
                }
                StoreResponse::Status(statuses)
            }
            StoreRequest::RemoveRange {
                from,
                to,
                public_key,
            } => match self.storage.remove_range(*from, *to, public_key.as_ref()).await {
                Some(removed) => StoreResponse::Entries(removed.into_iter().collect()),
                None => StoreResponse::Status(vec![(*from, PutStatus::FailedSecurity)]),
            },
            StoreRequest::Digest {
                location_and_domain,
                key_bloom,
                content_bloom,
            } => StoreResponse::Digest(
                self.storage
                    .digest(*location_and_domain, key_bloom.as_ref(), content_bloom.as_ref())
                    .await,
            ),
            StoreRequest::DigestRange { from, to } => {
                StoreResponse::Digest(self.storage.digest_range(*from, *to).await)
            }
            StoreRequest::DigestKeys { keys } => {
                StoreResponse::Digest(self.storage.digest_keys(keys).await)
            }
        };
        Ok((Kind::Ok, Body::StoreReply(response)))
    }
}

/// NEIGHBORS: the k closest verified peers plus a digest of the queried
/// branch, so routing can compare replica contents without extra round
/// trips.
pub struct NeighborsHandler {
    peer_map: Arc<RwLock<PeerMap>>,
    storage: Arc<StorageLayer>,
}

impl NeighborsHandler {
    pub fn new(peer_map: Arc<RwLock<PeerMap>>, storage: Arc<StorageLayer>) -> Self {
        Self { peer_map, storage }
    }
}

#[async_trait]
impl RequestHandler for NeighborsHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        let Body::Neighbors { target } = &request.body else {
            return Err(FailureReason::ProtocolViolation);
        };
        let peers = self
            .peer_map
            .read()
            .expect("peer map poisoned")
            .closest_peers(target, NEIGHBOR_LIMIT);
        let (from, to) = Number640::location_range(*target);
        let digest = self.storage.digest_range(from, to).await;
        Ok((Kind::Ok, Body::NeighborsReply { peers, digest }))
    }
}

/// Application hook for DIRECT payloads.
#[async_trait]
pub trait DirectReplyHandler: Send + Sync {
    async fn reply(&self, sender: &PeerAddress, payload: &[u8], raw: bool) -> Result<Vec<u8>>;
}

/// Concurrent inbound streams remembered for reassembly.
const DIRECT_STREAM_CAP: usize = 64;

/// DIRECT: hand the opaque payload to the registered reply object.
/// Streamed payloads are reassembled per `(sender, stream id)` and handed
/// over once the final chunk arrives.
pub struct DirectHandler {
    reply_object: RwLock<Option<Arc<dyn DirectReplyHandler>>>,
    streams: StdMutex<LruCache<(Number160, u64), Vec<u8>>>,
}

impl DirectHandler {
    pub fn new() -> Self {
        Self {
            reply_object: RwLock::new(None),
            streams: StdMutex::new(LruCache::new(
                NonZeroUsize::new(DIRECT_STREAM_CAP).expect("cap is non-zero"),
            )),
        }
    }

    pub fn set_reply_handler(&self, handler: Arc<dyn DirectReplyHandler>) {
        *self.reply_object.write().expect("reply object poisoned") = Some(handler);
    }

    async fn deliver(
        &self,
        sender: &PeerAddress,
        payload: &[u8],
        raw: bool,
    ) -> Result<(Kind, Body), FailureReason> {
        let reply_object = self
            .reply_object
            .read()
            .expect("reply object poisoned")
            .clone();
        match reply_object {
            Some(handler) => {
                let reply = handler
                    .reply(sender, payload, raw)
                    .await
                    .map_err(|e| FailureReason::Remote(e.to_string()))?;
                Ok((Kind::Ok, Body::DirectReply { payload: reply }))
            }
            // No application handler installed: acknowledge receipt.
            None => Ok((Kind::Ack, Body::Empty)),
        }
    }
}

impl Default for DirectHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestHandler for DirectHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        match &request.body {
            Body::Direct { payload, raw } => self.deliver(&request.sender, payload, *raw).await,
            Body::DirectStream {
                stream_id,
                seq,
                last,
                raw,
                chunk,
            } => {
                let slot = (request.sender.peer_id, *stream_id);
                let assembled = {
                    let mut streams = self.streams.lock().expect("streams poisoned");
                    if *seq == 0 && streams.contains(&slot) {
                        streams.pop(&slot);
                    }
                    let buffer = streams.get_or_insert_mut(slot, Vec::new);
                    buffer.extend_from_slice(chunk);
                    if *last {
                        streams.pop(&slot)
                    } else {
                        None
                    }
                };
                match assembled {
                    Some(payload) => self.deliver(&request.sender, &payload, *raw).await,
                    None => Ok((Kind::Partial, Body::Empty)),
                }
            }
            _ => Err(FailureReason::ProtocolViolation),
        }
    }
}

/// QUIT: the sender is leaving, drop it from the map.
pub struct QuitHandler {
    peer_map: Arc<RwLock<PeerMap>>,
}

impl QuitHandler {
    pub fn new(peer_map: Arc<RwLock<PeerMap>>) -> Self {
        Self { peer_map }
    }
}

#[async_trait]
impl RequestHandler for QuitHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        self.peer_map
            .write()
            .expect("peer map poisoned")
            .remove(&request.sender.peer_id, RemoveReason::Shutdown);
        Ok((Kind::Ack, Body::Empty))
    }
}

/// PEER-EXCHANGE: absorb the offered peers as hearsay, answer with a
/// sample of our own verified peers.
pub struct PeerExchangeHandler {
    peer_map: Arc<RwLock<PeerMap>>,
}

impl PeerExchangeHandler {
    pub fn new(peer_map: Arc<RwLock<PeerMap>>) -> Self {
        Self { peer_map }
    }
}

#[async_trait]
impl RequestHandler for PeerExchangeHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        let Body::PeerExchange { peers } = &request.body else {
            return Err(FailureReason::ProtocolViolation);
        };
        let mut map = self.peer_map.write().expect("peer map poisoned");
        for peer in peers {
            map.add(peer.clone(), false);
        }
        let sample = map.closest_peers(&request.sender.peer_id, NEIGHBOR_LIMIT);
        Ok((Kind::Ok, Body::PeerExchange { peers: sample }))
    }
}

/// Receives broadcast payloads that reached this peer.
pub type BroadcastDelivery = mpsc::Sender<(Number160, Vec<(Number640, crate::data::Data)>)>;

/// BROADCAST: structured flooding with a hop budget and a seen-cache.
pub struct BroadcastHandler {
    peer_map: Arc<RwLock<PeerMap>>,
    messenger: Arc<Messenger>,
    seen: StdMutex<LruCache<Number160, ()>>,
    delivery: BroadcastDelivery,
    fanout: usize,
}

impl BroadcastHandler {
    pub fn new(
        peer_map: Arc<RwLock<PeerMap>>,
        messenger: Arc<Messenger>,
        delivery: BroadcastDelivery,
        fanout: usize,
    ) -> Self {
        Self {
            peer_map,
            messenger,
            seen: StdMutex::new(LruCache::new(
                NonZeroUsize::new(BROADCAST_SEEN_CAP).expect("cap is non-zero"),
            )),
            delivery,
            fanout,
        }
    }

    /// First sighting of a message key wins; repeats are dropped.
    pub fn mark_seen(&self, message_key: &Number160) -> bool {
        self.seen
            .lock()
            .expect("seen cache poisoned")
            .put(*message_key, ())
            .is_none()
    }

    /// Re-flood to our neighborhood of the message key.
    pub fn refan(
        &self,
        message_key: Number160,
        hop_count: u32,
        entries: Vec<(Number640, crate::data::Data)>,
        skip: Option<Number160>,
    ) {
        if hop_count >= BROADCAST_MAX_HOPS {
            return;
        }
        let targets: Vec<PeerAddress> = self
            .peer_map
            .read()
            .expect("peer map poisoned")
            .closest_peers(&message_key, self.fanout)
            .into_iter()
            .filter(|p| Some(p.peer_id) != skip)
            .collect();
        for target in targets {
            let messenger = self.messenger.clone();
            let entries = entries.clone();
            tokio::spawn(async move {
                if let Err(e) = messenger
                    .broadcast(&target, message_key, hop_count + 1, entries)
                    .await
                {
                    trace!(peer = %target.peer_id, %e, "broadcast hop failed");
                }
            });
        }
    }
}

#[async_trait]
impl RequestHandler for BroadcastHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        let Body::Broadcast {
            message_key,
            hop_count,
            entries,
        } = &request.body
        else {
            return Err(FailureReason::ProtocolViolation);
        };
        if !self.mark_seen(message_key) {
            return Ok((Kind::Ack, Body::Empty));
        }
        if self.delivery.send((*message_key, entries.clone())).await.is_err() {
            warn!("broadcast delivery channel closed");
        }
        self.refan(
            *message_key,
            *hop_count,
            entries.clone(),
            Some(request.sender.peer_id),
        );
        Ok((Kind::Ack, Body::Empty))
    }
}
