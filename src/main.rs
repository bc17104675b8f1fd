//! Demo binary: spin up a small local overlay, store a value, fetch it
//! back from another peer, and print what happened.

use anyhow::Result;
use clap::Parser;

use cairn::{
    Data, MeshTransport, Number160, Number640, Peer, PutOptions,
};

#[derive(Parser, Debug)]
#[command(name = "cairn", about = "Kademlia-style DHT overlay demo")]
struct Args {
    /// Number of peers in the local overlay.
    #[arg(long, default_value_t = 10)]
    peers: usize,

    /// Content to store.
    #[arg(long, default_value = "red")]
    value: String,

    /// Location label the content is stored under.
    #[arg(long, default_value = "apple")]
    location: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.peers >= 2, "need at least two peers");

    let mesh = MeshTransport::new();
    let mut peers = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let peer = Peer::builder()
            .transport(mesh.clone())
            .port(4000 + i as u16)
            .build()?;
        peers.push(peer);
    }

    // Everyone joins through the first peer.
    let seed = peers[0].address();
    for peer in peers.iter().skip(1) {
        peer.bootstrap(&seed).await?;
    }

    let location = Number160::hash_of(args.location.as_bytes());
    let key = Number640::new(location, Number160::ZERO, Number160::ZERO, Number160::ZERO);

    let writer = &peers[1];
    let result = writer
        .put_single(
            key,
            Data::new(args.value.clone().into_bytes()),
            PutOptions::default(),
        )
        .await?;
    println!(
        "stored {:?} under {} on {} replicas",
        args.value,
        location,
        result.raw.len()
    );

    let reader = peers.last().expect("at least two peers");
    match reader.get_single(key).await? {
        Some(data) => println!(
            "peer {} read back: {:?}",
            reader.peer_id(),
            String::from_utf8_lossy(data.payload())
        ),
        None => println!("value not found"),
    }

    for peer in &peers {
        peer.shutdown().await;
    }
    Ok(())
}
