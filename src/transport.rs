//! # Transport Seam
//!
//! The raw socket layer is an external collaborator; the overlay talks to
//! a [`Wire`]: deliver one request envelope, get one response envelope.
//! What multiplexes that over UDP datagrams or framed TCP streams is
//! somebody else's business.
//!
//! Two pieces live here:
//!
//! - [`ChannelReservation`]: counted permits bounding concurrent channel
//!   use (permanent-TCP, one-shot TCP, UDP pools). Acquisition suspends
//!   until a permit frees up; dropping the permit releases it.
//! - [`MeshTransport`]: an in-process wire connecting every registered
//!   peer, used by the test scenarios and the demo binary. It models
//!   firewalled peers faithfully: a peer marked unreachable refuses
//!   inbound delivery, and can only be spoken to through a relay link
//!   (its own outbound connection, see [`MeshTransport::open_link`]).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::trace;

use crate::address::PeerAddress;
use crate::id::Number160;
use crate::messages::{Envelope, FailureReason};

/// Capacity of a peer's inbound request queue.
const INBOX_DEPTH: usize = 256;

/// One inbound request plus the slot for its response.
pub struct IncomingRequest {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<Envelope>,
}

/// Inbound queue handed to a peer's dispatch loop on registration.
pub type Inbox = mpsc::Receiver<IncomingRequest>;

/// Sender half of a peer's inbound queue. A relay holds one of these as
/// the long-lived link to its unreachable client.
pub type Link = mpsc::Sender<IncomingRequest>;

/// Request/response delivery to a remote peer.
#[async_trait]
pub trait Wire: Send + Sync {
    async fn deliver(&self, to: &PeerAddress, envelope: Envelope)
        -> Result<Envelope, FailureReason>;
}

/// Access to the reverse tunnel a peer keeps open toward us. The relay
/// subsystem turns this into its forwarding link.
pub trait LinkOpener: Send + Sync {
    fn open_link(&self, peer: &Number160) -> Option<Link>;
}

/// Counted permits for the three channel pools.
pub struct ChannelReservation {
    permanent_tcp: Arc<Semaphore>,
    tcp: Arc<Semaphore>,
    udp: Arc<Semaphore>,
}

/// Which pool a reservation draws from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelKind {
    PermanentTcp,
    Tcp,
    Udp,
}

impl ChannelReservation {
    pub fn new(max_permanent_tcp: usize, max_tcp: usize, max_udp: usize) -> Self {
        Self {
            permanent_tcp: Arc::new(Semaphore::new(max_permanent_tcp)),
            tcp: Arc::new(Semaphore::new(max_tcp)),
            udp: Arc::new(Semaphore::new(max_udp)),
        }
    }

    /// Acquire a permit, suspending while the pool is exhausted. Fails
    /// only when the pool is closed (shutdown).
    pub async fn reserve(
        &self,
        kind: ChannelKind,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, FailureReason> {
        let pool = match kind {
            ChannelKind::PermanentTcp => &self.permanent_tcp,
            ChannelKind::Tcp => &self.tcp,
            ChannelKind::Udp => &self.udp,
        };
        pool.clone()
            .acquire_owned()
            .await
            .map_err(|_| FailureReason::ChannelReservationFailed)
    }

    /// Close every pool; pending and future reservations fail.
    pub fn shut_down(&self) {
        self.permanent_tcp.close();
        self.tcp.close();
        self.udp.close();
    }

    pub fn available(&self, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::PermanentTcp => self.permanent_tcp.available_permits(),
            ChannelKind::Tcp => self.tcp.available_permits(),
            ChannelKind::Udp => self.udp.available_permits(),
        }
    }
}

struct MeshState {
    peers: HashMap<Number160, Link>,
    /// Socket-port routing for relayed targets: relay endpoints are socket
    /// addresses, the registry resolves them back to peers.
    ports: HashMap<u16, Number160>,
    /// Peers refusing inbound connections.
    unreachable: std::collections::HashSet<Number160>,
}

/// In-process transport registry connecting all peers of a test mesh.
pub struct MeshTransport {
    state: std::sync::Mutex<MeshState>,
}

impl MeshTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(MeshState {
                peers: HashMap::new(),
                ports: HashMap::new(),
                unreachable: std::collections::HashSet::new(),
            }),
        })
    }

    /// Register a peer; the returned inbox feeds its dispatch loop.
    pub fn register(&self, address: &PeerAddress) -> Inbox {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let mut state = self.state.lock().expect("mesh state poisoned");
        state.peers.insert(address.peer_id, tx);
        state.ports.insert(address.socket.udp_port, address.peer_id);
        rx
    }

    pub fn deregister(&self, peer_id: &Number160) {
        let mut state = self.state.lock().expect("mesh state poisoned");
        state.peers.remove(peer_id);
        state.ports.retain(|_, id| id != peer_id);
        state.unreachable.remove(peer_id);
    }

    /// Mark a peer as refusing inbound connections (behind a firewall).
    pub fn set_unreachable(&self, peer_id: Number160) {
        self.state
            .lock()
            .expect("mesh state poisoned")
            .unreachable
            .insert(peer_id);
    }

    /// Open a reverse link to a peer, modeling that peer's own long-lived
    /// outbound connection. Works for unreachable peers; this is the
    /// relay's tunnel to its client.
    pub fn open_link(&self, peer_id: &Number160) -> Option<Link> {
        self.state
            .lock()
            .expect("mesh state poisoned")
            .peers
            .get(peer_id)
            .cloned()
    }

    fn route(&self, to: &PeerAddress) -> Result<Link, FailureReason> {
        let state = self.state.lock().expect("mesh state poisoned");
        if state.unreachable.contains(&to.peer_id) {
            // No direct inbound path. Route through one of the advertised
            // relay endpoints instead.
            for relay in &to.relays {
                if let Some(peer) = state.ports.get(&relay.udp_port) {
                    if let Some(link) = state.peers.get(peer) {
                        trace!(target = %to.peer_id, relay = %peer, "routing via relay");
                        return Ok(link.clone());
                    }
                }
            }
            return Err(FailureReason::PeerUnreachable);
        }
        state
            .peers
            .get(&to.peer_id)
            .cloned()
            .ok_or(FailureReason::PeerUnreachable)
    }

    /// Serialize and re-parse an envelope, as the real wire would. Keeps
    /// every in-process exchange honest about the binary format.
    fn over_the_wire(envelope: Envelope) -> Result<Envelope, FailureReason> {
        let mut bytes = envelope
            .encode()
            .map_err(|_| FailureReason::ProtocolViolation)?;
        Envelope::decode(&mut bytes).ok_or(FailureReason::ProtocolViolation)
    }

    /// Deliver over an explicit link, bypassing the registry. Used by the
    /// relay forwarder.
    pub async fn deliver_on_link(
        link: &Link,
        envelope: Envelope,
    ) -> Result<Envelope, FailureReason> {
        let envelope = Self::over_the_wire(envelope)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        link.send(IncomingRequest {
            envelope,
            reply: reply_tx,
        })
        .await
        .map_err(|_| FailureReason::PeerUnreachable)?;
        let reply = reply_rx.await.map_err(|_| FailureReason::PeerUnreachable)?;
        Self::over_the_wire(reply)
    }
}

impl LinkOpener for MeshTransport {
    fn open_link(&self, peer: &Number160) -> Option<Link> {
        MeshTransport::open_link(self, peer)
    }
}

#[async_trait]
impl Wire for MeshTransport {
    async fn deliver(
        &self,
        to: &PeerAddress,
        envelope: Envelope,
    ) -> Result<Envelope, FailureReason> {
        let link = self.route(to)?;
        MeshTransport::deliver_on_link(&link, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Body, Command, Kind};

    fn addr(id: u32, port: u16) -> PeerAddress {
        PeerAddress::local(Number160::from_u32(id), port)
    }

    fn ping(from: &PeerAddress, to: &PeerAddress) -> Envelope {
        Envelope::request(
            Command::Ping,
            1,
            from.clone(),
            to.peer_id,
            Body::Empty,
        )
    }

    #[tokio::test]
    async fn round_trip_through_mesh() {
        let mesh = MeshTransport::new();
        let a = addr(1, 4001);
        let b = addr(2, 4002);
        let _inbox_a = mesh.register(&a);
        let mut inbox_b = mesh.register(&b);

        let b_addr = b.clone();
        tokio::spawn(async move {
            let incoming = inbox_b.recv().await.unwrap();
            let reply = incoming
                .envelope
                .reply(Kind::Ok, b_addr.clone(), Body::Empty);
            let _ = incoming.reply.send(reply);
        });

        let reply = mesh.deliver(&b, ping(&a, &b)).await.unwrap();
        assert_eq!(reply.kind, Kind::Ok);
        assert_eq!(reply.sender.peer_id, b.peer_id);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let mesh = MeshTransport::new();
        let a = addr(1, 4001);
        let ghost = addr(9, 4009);
        let _inbox = mesh.register(&a);

        assert_eq!(
            mesh.deliver(&ghost, ping(&a, &ghost)).await.unwrap_err(),
            FailureReason::PeerUnreachable
        );
    }

    #[tokio::test]
    async fn unreachable_peer_refuses_direct_delivery() {
        let mesh = MeshTransport::new();
        let a = addr(1, 4001);
        let u = addr(2, 4002);
        let _inbox_a = mesh.register(&a);
        let _inbox_u = mesh.register(&u);
        mesh.set_unreachable(u.peer_id);

        assert_eq!(
            mesh.deliver(&u, ping(&a, &u)).await.unwrap_err(),
            FailureReason::PeerUnreachable
        );

        // The reverse link still works: it models U's outbound connection.
        assert!(mesh.open_link(&u.peer_id).is_some());
    }

    #[tokio::test]
    async fn relayed_address_routes_to_relay() {
        let mesh = MeshTransport::new();
        let relay = addr(3, 4003);
        let u = addr(2, 4002);
        let mut relay_inbox = mesh.register(&relay);
        let _u_inbox = mesh.register(&u);
        mesh.set_unreachable(u.peer_id);

        let u_relayed = u.as_relayed(vec![relay.socket]);
        let relay_addr = relay.clone();
        tokio::spawn(async move {
            let incoming = relay_inbox.recv().await.unwrap();
            // The relay answers on behalf of U here.
            let reply = incoming
                .envelope
                .reply(Kind::Ok, relay_addr.clone(), Body::Empty);
            let _ = incoming.reply.send(reply);
        });

        let sender = addr(1, 4001);
        let reply = mesh
            .deliver(&u_relayed, ping(&sender, &u_relayed))
            .await
            .unwrap();
        assert_eq!(reply.kind, Kind::Ok);
    }

    #[tokio::test]
    async fn reservation_blocks_and_releases() {
        let reservation = ChannelReservation::new(1, 1, 1);
        let permit = reservation.reserve(ChannelKind::Udp).await.unwrap();
        assert_eq!(reservation.available(ChannelKind::Udp), 0);
        drop(permit);
        assert_eq!(reservation.available(ChannelKind::Udp), 1);
    }

    #[tokio::test]
    async fn closed_reservation_fails() {
        let reservation = ChannelReservation::new(1, 1, 1);
        reservation.shut_down();
        assert_eq!(
            reservation.reserve(ChannelKind::Tcp).await.unwrap_err(),
            FailureReason::ChannelReservationFailed
        );
    }
}
