//! # Relay Subsystem
//!
//! A peer behind a firewall cannot accept connections, so on its own it
//! can neither hold replicas nor serve as a routing stop. The relay
//! subsystem fixes that with plain forwarding:
//!
//! 1. The unreachable peer picks up to `max_relays` reachable peers from
//!    its bootstrap neighborhood and registers with each (`RELAY` setup)
//!    over a connection it keeps open.
//! 2. Each relay installs a [`RelayForwarder`] in its dispatcher: any
//!    request addressed to the client's id is pushed down that connection
//!    and the response relayed back. NEIGHBORS is the exception: the
//!    relay answers it from its own peer map, standing in for the
//!    client's view of the network.
//! 3. The client rewrites its advertised address with `relayed` set and
//!    the relay endpoints attached; everyone else now reaches it through
//!    those.
//!
//! [`RelayManager`] runs on the unreachable side: selection, setup,
//! monitoring, and replacement when a relay dies. Setup fails below
//! `min_relays`.

use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::address::{PeerAddress, PeerSocketAddress, MAX_RELAYS};
use crate::id::Number160;
use crate::messages::{Body, Command, Envelope, FailureReason, Kind};
use crate::peer_map::PeerMap;
use crate::rpc::{Dispatcher, Forwarder, Messenger, RequestHandler};
use crate::storage::DigestInfo;
use crate::transport::{LinkOpener, Link, MeshTransport};

/// Neighbors returned when answering on behalf of a relayed client.
const PROXY_NEIGHBOR_LIMIT: usize = 20;

// ============================================================================
// Relay side
// ============================================================================

/// Forwards requests for one unreachable client over its standing
/// connection. Installed in the dispatcher's forwarder table under the
/// client's peer id.
pub struct RelayForwarder {
    client: PeerAddress,
    link: Link,
    peer_map: Arc<RwLock<PeerMap>>,
}

impl RelayForwarder {
    pub fn new(client: PeerAddress, link: Link, peer_map: Arc<RwLock<PeerMap>>) -> Self {
        Self {
            client,
            link,
            peer_map,
        }
    }
}

#[async_trait]
impl Forwarder for RelayForwarder {
    async fn forward(&self, request: Envelope) -> Result<Envelope, FailureReason> {
        // Routing queries are answered here: the relay's map stands in
        // for the unreachable peer's view of the network.
        if request.command == Command::Neighbors {
            let Body::Neighbors { target } = &request.body else {
                return Err(FailureReason::ProtocolViolation);
            };
            let peers = self
                .peer_map
                .read()
                .expect("peer map poisoned")
                .closest_peers(target, PROXY_NEIGHBOR_LIMIT);
            return Ok(request.reply(
                Kind::Ok,
                self.client.clone(),
                Body::NeighborsReply {
                    peers,
                    digest: DigestInfo::default(),
                },
            ));
        }
        MeshTransport::deliver_on_link(&self.link, request).await
    }
}

/// Serves RELAY setup requests on reachable peers.
pub struct RelayHandler {
    dispatcher: Arc<Dispatcher>,
    peer_map: Arc<RwLock<PeerMap>>,
    link_opener: Arc<dyn LinkOpener>,
}

impl RelayHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        peer_map: Arc<RwLock<PeerMap>>,
        link_opener: Arc<dyn LinkOpener>,
    ) -> Self {
        Self {
            dispatcher,
            peer_map,
            link_opener,
        }
    }
}

#[async_trait]
impl RequestHandler for RelayHandler {
    async fn handle(&self, request: &Envelope) -> Result<(Kind, Body), FailureReason> {
        let Body::RelaySetup = &request.body else {
            return Err(FailureReason::ProtocolViolation);
        };
        let client = request.sender.clone();
        let Some(link) = self.link_opener.open_link(&client.peer_id) else {
            return Err(FailureReason::PeerUnreachable);
        };
        info!(client = %client.peer_id, "relay client registered");
        self.dispatcher.register_forwarder(
            client.peer_id,
            Arc::new(RelayForwarder::new(client, link, self.peer_map.clone())),
        );
        Ok((Kind::Ok, Body::Empty))
    }
}

// ============================================================================
// Client side
// ============================================================================

#[derive(Clone)]
pub struct RelayConfig {
    /// Upper bound on concurrent relay registrations.
    pub max_relays: usize,
    /// Setup fails below this many established relays.
    pub min_relays: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_relays: MAX_RELAYS,
            min_relays: 1,
        }
    }
}

/// Runs on the unreachable peer: relay selection, registration, address
/// rewriting and replacement of failed relays.
pub struct RelayManager {
    messenger: Arc<Messenger>,
    peer_map: Arc<RwLock<PeerMap>>,
    self_address: Arc<RwLock<PeerAddress>>,
    config: RelayConfig,
    relays: RwLock<Vec<PeerAddress>>,
}

impl RelayManager {
    pub fn new(
        messenger: Arc<Messenger>,
        peer_map: Arc<RwLock<PeerMap>>,
        self_address: Arc<RwLock<PeerAddress>>,
        config: RelayConfig,
    ) -> Self {
        Self {
            messenger,
            peer_map,
            self_address,
            config,
            relays: RwLock::new(Vec::new()),
        }
    }

    pub fn relay_addresses(&self) -> Vec<PeerAddress> {
        self.relays.read().expect("relays poisoned").clone()
    }

    /// A peer qualifies as relay when it accepts incoming connections.
    fn candidates(&self, exclude: &[PeerAddress]) -> Vec<PeerAddress> {
        let self_id = self.self_address.read().expect("address poisoned").peer_id;
        self.peer_map
            .read()
            .expect("peer map poisoned")
            .all()
            .into_iter()
            .filter(|p| p.is_reachable() && p.peer_id != self_id)
            .filter(|p| !exclude.iter().any(|r| r.peer_id == p.peer_id))
            .collect()
    }

    /// Select and register relays from the current neighborhood, then
    /// advertise the relayed address. Fails below `min_relays`.
    pub async fn setup(&self) -> Result<usize> {
        let established = self.relay_addresses();
        let mut count = established.len();
        if count >= self.config.max_relays {
            return Ok(count);
        }
        for candidate in self.candidates(&established) {
            if count >= self.config.max_relays {
                break;
            }
            match self.messenger.relay_setup(&candidate).await {
                Ok(()) => {
                    debug!(relay = %candidate.peer_id, "relay established");
                    self.relays
                        .write()
                        .expect("relays poisoned")
                        .push(candidate);
                    count += 1;
                }
                Err(reason) => {
                    debug!(relay = %candidate.peer_id, %reason, "relay setup failed");
                }
            }
        }
        if count < self.config.min_relays {
            bail!(
                "relay setup failed: {count} of at least {} required relays",
                self.config.min_relays
            );
        }
        self.rewrite_address();
        // Re-register so every forwarder holds the rewritten (relayed)
        // address; that is what relays advertise when answering on our
        // behalf.
        for relay in self.relay_addresses() {
            let _ = self.messenger.relay_setup(&relay).await;
        }
        Ok(count)
    }

    /// Rewrite the advertised address to carry the current relay set.
    fn rewrite_address(&self) {
        let relays: Vec<PeerSocketAddress> = self
            .relay_addresses()
            .iter()
            .map(|r| r.socket)
            .collect();
        let mut address = self.self_address.write().expect("address poisoned");
        let mut rewritten = address.as_relayed(relays);
        rewritten.flags.firewalled_tcp = false;
        rewritten.flags.firewalled_udp = false;
        *address = rewritten;
        debug!(relays = address.relays.len(), "advertised address rewritten");
    }

    /// Announce the relayed address to the neighborhood so overlays pick
    /// it up before the next maintenance round.
    pub async fn advertise(&self) {
        let neighbors = self.peer_map.read().expect("peer map poisoned").all();
        for neighbor in neighbors {
            let _ = self.messenger.ping(&neighbor).await;
        }
    }

    /// Probe every relay; replace the dead ones. Returns the number of
    /// replacements made.
    pub async fn maintain(&self) -> usize {
        let current = self.relay_addresses();
        let mut lost = Vec::new();
        for relay in &current {
            if self.messenger.ping(relay).await.is_err() {
                warn!(relay = %relay.peer_id, "relay connection lost");
                lost.push(relay.peer_id);
            }
        }
        if lost.is_empty() {
            return 0;
        }
        self.relays
            .write()
            .expect("relays poisoned")
            .retain(|r| !lost.contains(&r.peer_id));

        let before = self.relay_addresses().len();
        match self.setup().await {
            Ok(now) => {
                self.advertise().await;
                now.saturating_sub(before)
            }
            Err(e) => {
                warn!(%e, "relay replacement failed");
                self.rewrite_address();
                self.advertise().await;
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_map::PeerMap;

    fn manager_with_map(peers: Vec<PeerAddress>) -> RelayManager {
        let self_id = Number160::from_u32(99);
        let mut map = PeerMap::new(self_id, 20);
        for peer in peers {
            map.add(peer, true);
        }
        let self_address = {
            let mut address = PeerAddress::local(self_id, 4099);
            address.flags.firewalled_tcp = true;
            address.flags.firewalled_udp = true;
            Arc::new(RwLock::new(address))
        };
        let peer_map = Arc::new(RwLock::new(map));
        let mesh = MeshTransport::new();
        let messenger = Arc::new(Messenger::new(
            self_address.clone(),
            peer_map.clone(),
            mesh,
            crate::transport::ChannelReservation::new(8, 8, 8),
            std::time::Duration::from_millis(200),
        ));
        RelayManager::new(messenger, peer_map, self_address, RelayConfig::default())
    }

    #[test]
    fn candidates_exclude_firewalled_and_relayed() {
        let reachable = PeerAddress::local(Number160::from_u32(1), 4001);
        let mut firewalled = PeerAddress::local(Number160::from_u32(2), 4002);
        firewalled.flags.firewalled_udp = true;
        let relayed = PeerAddress::local(Number160::from_u32(3), 4003)
            .as_relayed(vec![reachable.socket]);

        let manager = manager_with_map(vec![reachable.clone(), firewalled, relayed]);
        let candidates = manager.candidates(&[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, reachable.peer_id);
    }

    #[tokio::test]
    async fn setup_fails_below_min_relays() {
        // Nobody in the map answers RELAY, so setup cannot reach
        // min_relays.
        let reachable = PeerAddress::local(Number160::from_u32(1), 4001);
        let manager = manager_with_map(vec![reachable]);
        assert!(manager.setup().await.is_err());
    }
}
