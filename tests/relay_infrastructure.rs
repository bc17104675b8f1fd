//! Relay scenarios: an unreachable peer joins through relays, gets
//! advertised with the relayed flag, becomes a routable storage replica,
//! and survives the loss of a relay.

mod common;

use std::time::Duration;

use cairn::dht::PutOptions;
use cairn::{Data, MeshTransport, Number160, Number640, Peer};

use common::{create_peers, perfect_routing, test_config};

fn unreachable_peer(mesh: &std::sync::Arc<MeshTransport>, port: u16) -> Peer {
    Peer::builder()
        .transport(mesh.clone())
        .port(port)
        .config(test_config(3))
        .behind_firewall(true)
        .build()
        .expect("peer must build")
}

#[tokio::test]
async fn relay_setup_rewrites_address() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 8, test_config(3));
    perfect_routing(&peers);

    let unreachable = unreachable_peer(&mesh, 4900);
    assert!(unreachable.address().flags.firewalled_tcp);
    assert!(unreachable.address().flags.firewalled_udp);

    unreachable
        .bootstrap(&peers[0].address())
        .await
        .expect("bootstrap through outbound connections works");
    let relays = unreachable
        .setup_relays()
        .await
        .expect("relay setup must succeed");
    assert!(relays >= 1 && relays <= cairn::MAX_RELAYS);

    let address = unreachable.address();
    assert!(address.flags.relayed);
    assert!(!address.flags.firewalled_tcp);
    assert!(!address.flags.firewalled_udp);
    assert_eq!(address.relays.len(), relays);

    for peer in &peers {
        peer.shutdown().await;
    }
    unreachable.shutdown().await;
}

#[tokio::test]
async fn other_peers_learn_the_relayed_address() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 6, test_config(3));
    perfect_routing(&peers);

    let unreachable = unreachable_peer(&mesh, 4900);
    unreachable.bootstrap(&peers[0].address()).await.unwrap();
    unreachable.setup_relays().await.unwrap();

    // The advertisement pings push the relayed address into the
    // neighborhood's overflow bags.
    let seen_with_relays = peers.iter().any(|peer| {
        let map = peer.peer_map().read().unwrap();
        let mut known = map.all_overflow();
        known.extend(map.all());
        known
            .iter()
            .any(|a| a.peer_id == unreachable.peer_id() && a.flags.relayed && !a.relays.is_empty())
    });
    assert!(seen_with_relays, "nobody learned the relayed address");

    for peer in &peers {
        peer.shutdown().await;
    }
    unreachable.shutdown().await;
}

#[tokio::test]
async fn put_reaches_the_unreachable_peer() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 6, test_config(3));
    perfect_routing(&peers);

    let unreachable = unreachable_peer(&mesh, 4900);
    unreachable.bootstrap(&peers[0].address()).await.unwrap();
    unreachable.setup_relays().await.unwrap();

    // Let maintenance verify the relayed peer through its relays.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    // Store under the unreachable peer's own id: it is the closest peer
    // to that location by definition.
    let key = Number640::new(
        unreachable.peer_id(),
        Number160::ZERO,
        Number160::ZERO,
        Number160::ZERO,
    );
    let writer = &peers[2];
    writer
        .put_single(key, Data::new(&b"delivered"[..]), PutOptions::default())
        .await
        .expect("put must succeed");

    // Allow the replicas and handover paths to settle.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(
        unreachable.storage().contains(key).await,
        "the unreachable peer never received its replica"
    );

    for peer in &peers {
        peer.shutdown().await;
    }
    unreachable.shutdown().await;
}

#[tokio::test]
async fn ping_unreachable_peer_through_relay() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 6, test_config(3));
    perfect_routing(&peers);

    let unreachable = unreachable_peer(&mesh, 4900);
    unreachable.bootstrap(&peers[0].address()).await.unwrap();
    unreachable.setup_relays().await.unwrap();

    // Direct ping with the relayed address goes through a relay and
    // comes back.
    let relayed_address = unreachable.address();
    peers[3]
        .ping(&relayed_address)
        .await
        .expect("relayed ping must succeed");

    for peer in &peers {
        peer.shutdown().await;
    }
    unreachable.shutdown().await;
}

#[tokio::test]
async fn lost_relay_is_replaced() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 8, test_config(3));
    perfect_routing(&peers);

    let unreachable = Peer::builder()
        .transport(mesh.clone())
        .port(4900)
        .config({
            let mut config = test_config(3);
            config.max_relays = 2;
            config
        })
        .behind_firewall(true)
        .build()
        .unwrap();
    unreachable.bootstrap(&peers[0].address()).await.unwrap();
    unreachable.setup_relays().await.unwrap();

    let manager = unreachable.relay_manager().expect("firewalled peer has a manager");
    let before: Vec<Number160> = manager.relay_addresses().iter().map(|r| r.peer_id).collect();
    assert_eq!(before.len(), 2);

    // Kill one relay and let maintenance replace it.
    let dead = before[0];
    let victim = peers.iter().find(|p| p.peer_id() == dead).unwrap();
    victim.shutdown().await;

    let replaced = manager.maintain().await;
    assert!(replaced >= 1, "a replacement relay should be selected");

    let after: Vec<Number160> = manager.relay_addresses().iter().map(|r| r.peer_id).collect();
    assert!(!after.contains(&dead));
    assert_eq!(after.len(), 2);
    // The advertised address reflects the new relay set.
    assert_eq!(unreachable.address().relays.len(), 2);

    for peer in &peers {
        if peer.peer_id() != dead {
            peer.shutdown().await;
        }
    }
    unreachable.shutdown().await;
}

#[tokio::test]
async fn relay_setup_fails_without_candidates() {
    let mesh = MeshTransport::new();
    let unreachable = unreachable_peer(&mesh, 4900);

    // No bootstrap, no candidates, not even one relay.
    assert!(unreachable.setup_relays().await.is_err());

    unreachable.shutdown().await;
}
