//! Shared helpers for the multi-peer scenarios: build a local overlay on
//! the in-process mesh and optionally wire every peer map directly
//! (perfect routing), so tests exercise storage and replication without
//! waiting for discovery.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cairn::node::PeerConfig;
use cairn::routing::RoutingConfig;
use cairn::{MeshTransport, Number160, Number640, Peer};

/// A configuration tuned for tests: big bags so small overlays know
/// everyone, fast maintenance, short timeouts.
pub fn test_config(replication_factor: usize) -> PeerConfig {
    PeerConfig {
        replication_factor,
        bag_size: 20,
        storage_interval: Duration::from_millis(500),
        peer_maintenance_interval: Duration::from_millis(200),
        replication_interval: Duration::from_millis(500),
        replication_delay: Duration::from_millis(50),
        rpc_timeout: Duration::from_millis(2_000),
        routing: RoutingConfig {
            alpha: 3,
            k: 20,
            max_failures: 3,
            max_no_new_info: 2,
        },
        ..PeerConfig::default()
    }
}

pub fn create_peers(
    mesh: &Arc<MeshTransport>,
    count: usize,
    config: PeerConfig,
) -> Vec<Peer> {
    (0..count)
        .map(|i| {
            Peer::builder()
                .transport(mesh.clone())
                .port(4000 + i as u16)
                .config(config.clone())
                .build()
                .expect("peer must build")
        })
        .collect()
}

/// Insert every peer into every other peer's map as verified, the way the
/// original test utilities pre-wire their overlays.
pub fn perfect_routing(peers: &[Peer]) {
    for peer in peers {
        let mut map = peer.peer_map().write().unwrap();
        for other in peers {
            if other.peer_id() != peer.peer_id() {
                map.add(other.address(), true);
            }
        }
    }
}

/// The peers of `peers` sorted by XOR distance to `target`.
pub fn sorted_by_distance(peers: &[Peer], target: &Number160) -> Vec<Number160> {
    let mut ids: Vec<Number160> = peers.iter().map(|p| p.peer_id()).collect();
    ids.sort_by(|a, b| {
        target
            .xor(a)
            .cmp(&target.xor(b))
            .then_with(|| a.cmp(b))
    });
    ids
}

/// A `Number640` at `(location, 0, 0, 0)`.
pub fn location_key(label: &[u8]) -> Number640 {
    Number640::new(
        Number160::hash_of(label),
        Number160::ZERO,
        Number160::ZERO,
        Number160::ZERO,
    )
}
