//! End-to-end scenarios over the public peer API: bootstrap, ping,
//! replicated storage, TTL expiry, access protection, direct send and
//! broadcast. All overlays run on the in-process mesh transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn::dht::PutOptions;
use cairn::rpc::DirectReplyHandler;
use cairn::storage::PutStatus;
use cairn::{Data, FailureReason, MeshTransport, Number160, Number320, Number640, Peer, PeerAddress};

use common::{create_peers, location_key, perfect_routing, sorted_by_distance, test_config};

#[tokio::test]
async fn bootstrap_and_ping_full_overlay() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 10, test_config(6));
    perfect_routing(&peers);

    for target in peers.iter().skip(1) {
        peers[0]
            .ping(&target.address())
            .await
            .expect("ping must succeed");
    }
    assert_eq!(peers[0].peer_map().read().unwrap().all().len(), 9);

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_discovers_neighborhood() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 6, test_config(3));

    // Join one by one through peer 0, discovery only.
    let seed = peers[0].address();
    for peer in peers.iter().skip(1) {
        peer.bootstrap(&seed).await.expect("bootstrap must succeed");
    }

    // Let maintenance promote the hearsay entries.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    // The late joiner knows more than just the seed.
    let known = peers[5].peer_map().read().unwrap().all().len();
    assert!(known >= 2, "expected discovery beyond the seed, got {known}");

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn put_get_survives_closest_peer_shutdown() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 8, test_config(3));
    perfect_routing(&peers);

    let key = location_key(b"apple");
    peers[0]
        .put_single(key, Data::new(&b"red"[..]), PutOptions::default())
        .await
        .expect("put must succeed");

    // Kill the peer closest to the key.
    let order = sorted_by_distance(&peers, &key.location);
    let closest = order[0];
    let victim = peers
        .iter()
        .find(|p| p.peer_id() == closest)
        .expect("closest peer exists");
    victim.shutdown().await;

    // Any surviving peer still reads the value back.
    let reader = peers
        .iter()
        .find(|p| p.peer_id() != closest)
        .expect("a survivor exists");
    let data = reader
        .get_single(key)
        .await
        .expect("get must succeed")
        .expect("value must survive the loss of one replica");
    assert_eq!(data.payload().as_ref(), b"red");

    for peer in &peers {
        if peer.peer_id() != closest {
            peer.shutdown().await;
        }
    }
}

#[tokio::test]
async fn ttl_expiry_removes_entry_everywhere() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 4, test_config(3));
    perfect_routing(&peers);

    let key = location_key(b"ephemeral");
    peers[0]
        .put_single(
            key,
            Data::new(&b"short lived"[..]).with_ttl_seconds(1),
            PutOptions::default(),
        )
        .await
        .expect("put must succeed");

    // Visible immediately.
    assert!(peers[1].get_single(key).await.unwrap().is_some());

    // After expiry plus a sweep period: gone for readers and from the
    // stores themselves.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(peers[1].get_single(key).await.unwrap().is_none());
    for peer in &peers {
        assert!(
            !peer.storage().contains(key).await,
            "peer {} still holds the expired entry",
            peer.peer_id()
        );
    }

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn domain_protection_rejects_foreign_key() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 5, test_config(3));
    perfect_routing(&peers);

    let location = Number160::hash_of(b"contested");
    let domain = Number160::hash_of(b"the-domain");
    let key_a = Number640::new(location, domain, Number160::from_u32(1), Number160::ZERO);
    let key_b = Number640::new(location, domain, Number160::from_u32(2), Number160::ZERO);

    let alice = &peers[0];
    let bob = &peers[1];

    let result = alice
        .put_single(
            key_a,
            Data::new(&b"mine"[..]),
            PutOptions {
                public_key: Some(alice.public_key()),
                put_if_absent: false,
                claim_domain: true,
            },
        )
        .await
        .expect("claiming put must run");
    assert!(result.is_success());

    // Bob's key differs, so every replica refuses him.
    let result = bob
        .put_single(
            key_b,
            Data::new(&b"theirs"[..]),
            PutOptions {
                public_key: Some(bob.public_key()),
                put_if_absent: false,
                claim_domain: true,
            },
        )
        .await
        .expect("the put itself runs");
    assert!(result.contains_status(PutStatus::FailedSecurity));
    assert!(!result.is_success());

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn put_if_absent_conflicts_on_existing() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 4, test_config(3));
    perfect_routing(&peers);

    let key = location_key(b"once");
    peers[0]
        .put_single(key, Data::new(&b"first"[..]), PutOptions::default())
        .await
        .unwrap();

    let result = peers[1]
        .put_single(
            key,
            Data::new(&b"second"[..]),
            PutOptions {
                put_if_absent: true,
                ..PutOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(result.contains_status(PutStatus::FailedNotAbsent));

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn add_keeps_multiple_values_per_domain() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 4, test_config(3));
    perfect_routing(&peers);

    let location = Number160::hash_of(b"shelf");
    let domain = Number160::ZERO;
    for value in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        peers[0]
            .add(location, domain, Data::new(value), PutOptions::default())
            .await
            .expect("add must succeed");
    }

    let (from, to) = Number640::location_range(location);
    let result = peers[1]
        .get_range(from, to, None, None)
        .await
        .expect("range get must succeed");
    assert_eq!(result.evaluate().len(), 3);

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn remove_respects_signer() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 4, test_config(3));
    perfect_routing(&peers);

    let factory = cairn::Ed25519SignatureFactory;
    let alice = &peers[0];
    let key = location_key(b"signed");
    alice
        .put_single(
            key,
            Data::new(&b"owned"[..]).sign(alice.keypair(), &factory),
            PutOptions::default(),
        )
        .await
        .unwrap();

    // A stranger's remove does nothing.
    let bob = &peers[1];
    bob.remove(vec![key], Some(bob.public_key())).await.unwrap();
    assert!(peers[2].get_single(key).await.unwrap().is_some());

    // The owner's remove clears the replicas.
    alice
        .remove(vec![key], Some(alice.public_key()))
        .await
        .unwrap();
    assert!(peers[2].get_single(key).await.unwrap().is_none());

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn digest_compares_replicas_without_payload() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 4, test_config(3));
    perfect_routing(&peers);

    let location = Number160::hash_of(b"digestible");
    let domain = Number160::ZERO;
    let key = Number640::new(location, domain, Number160::from_u32(7), Number160::ZERO);
    let data = Data::new(&b"content"[..]);
    let expected_hash = data.hash();
    peers[0]
        .put_single(key, data, PutOptions::default())
        .await
        .unwrap();

    let digest = peers[1]
        .digest(Number320::new(location, domain), None, None)
        .await
        .unwrap()
        .evaluate();
    assert_eq!(digest.get(&key), Some(&expected_hash));

    for peer in &peers {
        peer.shutdown().await;
    }
}

struct Echo;

#[async_trait]
impl DirectReplyHandler for Echo {
    async fn reply(
        &self,
        _sender: &PeerAddress,
        payload: &[u8],
        _raw: bool,
    ) -> anyhow::Result<Vec<u8>> {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(payload);
        Ok(reply)
    }
}

#[tokio::test]
async fn send_direct_reaches_closest_peers() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 6, test_config(3));
    perfect_routing(&peers);
    for peer in &peers {
        peer.set_direct_reply_handler(Arc::new(Echo));
    }

    let target = Number160::hash_of(b"rendezvous");
    let replies = peers[0]
        .send_direct(target, b"hello".to_vec(), false, false)
        .await
        .expect("send_direct must succeed");
    assert!(!replies.is_empty());
    for (_, reply) in &replies {
        assert_eq!(reply.as_slice(), b"echo:hello");
    }

    // With cancel_on_finish a single acknowledgment suffices.
    let replies = peers[0]
        .send_direct(target, b"quick"[..].to_vec(), false, true)
        .await
        .expect("send_direct must succeed");
    assert!(!replies.is_empty());

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn streamed_send_direct_reassembles() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 5, test_config(2));
    perfect_routing(&peers);
    for peer in &peers {
        peer.set_direct_reply_handler(Arc::new(Echo));
    }

    let target = Number160::hash_of(b"stream target");
    let payload = vec![0xA5u8; 10_000];
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel(256);

    let replies = peers[0]
        .send_direct_streaming(target, payload.clone(), 1_024, false, Some(progress_tx))
        .await
        .expect("streamed send must succeed");
    assert!(!replies.is_empty());
    for (_, reply) in &replies {
        assert_eq!(reply.len(), 5 + payload.len());
        assert_eq!(&reply[..5], b"echo:");
        assert_eq!(&reply[5..], &payload[..]);
    }

    // Progress was reported up to the full payload for at least one peer.
    let mut max_reported = 0usize;
    while let Ok(Some((_, sent))) =
        tokio::time::timeout(Duration::from_millis(200), progress_rx.recv()).await
    {
        max_reported = max_reported.max(sent);
    }
    assert_eq!(max_reported, payload.len());

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn broadcast_floods_the_overlay() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 5, test_config(3));
    perfect_routing(&peers);

    let mut receivers: Vec<_> = peers
        .iter()
        .skip(1)
        .map(|p| p.broadcast_receiver().expect("receiver taken once"))
        .collect();

    let message_key = Number160::hash_of(b"announcement");
    let entries = vec![(location_key(b"announcement"), Data::new(&b"hear ye"[..]))];
    peers[0]
        .broadcast(message_key, entries)
        .await
        .expect("broadcast must start");

    let mut received = 0usize;
    for receiver in &mut receivers {
        if let Ok(Some((key, entries))) =
            tokio::time::timeout(Duration::from_secs(3), receiver.recv()).await
        {
            assert_eq!(key, message_key);
            assert_eq!(entries.len(), 1);
            received += 1;
        }
    }
    assert!(received >= 3, "flood reached only {received} of 4 peers");

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn broadcast_without_neighbors_fails() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 1, test_config(3));

    let err = peers[0]
        .broadcast(Number160::hash_of(b"void"), Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err, FailureReason::NoBroadcastAddress);

    peers[0].shutdown().await;
}

#[tokio::test]
async fn single_peer_put_get() {
    let mesh = MeshTransport::new();
    let peers = create_peers(&mesh, 1, test_config(6));

    let key = location_key(b"lonely");
    peers[0]
        .put_single(key, Data::new(&b"value"[..]), PutOptions::default())
        .await
        .expect("local put must succeed");
    let data = peers[0]
        .get_single(key)
        .await
        .expect("get must run")
        .expect("own value must be found");
    assert_eq!(data.payload().as_ref(), b"value");

    peers[0].shutdown().await;
}

#[tokio::test]
async fn replication_heals_after_join() {
    let mesh = MeshTransport::new();
    let config = test_config(3);
    let peers = create_peers(&mesh, 3, config.clone());
    perfect_routing(&peers);

    let key = location_key(b"healing");
    peers[0]
        .put_single(key, Data::new(&b"spread"[..]), PutOptions::default())
        .await
        .unwrap();

    // A newcomer joins and becomes part of the neighborhood.
    let newcomer = Peer::builder()
        .transport(mesh.clone())
        .port(4900)
        .config(config)
        .build()
        .unwrap();
    newcomer.bootstrap(&peers[0].address()).await.unwrap();

    // Give the replication sweep a few periods to settle.
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    let mut holders = 0usize;
    for peer in peers.iter().chain(std::iter::once(&newcomer)) {
        if peer.storage().contains(key).await {
            holders += 1;
        }
    }
    assert!(
        holders >= 3,
        "expected at least R=3 holders after healing, got {holders}"
    );

    for peer in peers.iter().chain(std::iter::once(&newcomer)) {
        peer.shutdown().await;
    }
}
