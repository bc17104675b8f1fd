//! # Cairn: Kademlia-style DHT with Indirect Replication and Relaying
//!
//! Cairn is a peer-to-peer overlay storing opaque, typed, optionally
//! signed data items on the peers whose 160-bit identifiers are closest
//! to each item's location key. It provides:
//!
//! - **XOR-metric routing**: a 160-bucket peer map with verified and
//!   overflow bags, and α-parallel iterative lookups
//! - **Keyed storage**: four-component keys `(location, domain, content,
//!   version)`, TTL expiry, hierarchical locking, and public-key access
//!   protection for domains and entries
//! - **Indirect replication**: a responsibility tracker reacting to
//!   churn plus a periodic sweep keeping every item on the R closest
//!   peers
//! - **Relaying**: firewalled peers register with relay peers that
//!   forward requests to them and answer routing queries on their behalf
//!
//! The raw transport is a seam ([`transport::Wire`]); an in-process mesh
//! implementation drives the test scenarios and the demo binary.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mesh = MeshTransport::new();
//! let alice = Peer::builder().transport(mesh.clone()).build()?;
//! let bob = Peer::builder().transport(mesh.clone()).build()?;
//! bob.bootstrap(&alice.address()).await?;
//!
//! let key = Number640::new(
//!     Number160::hash_of(b"apple"), Number160::ZERO,
//!     Number160::ZERO, Number160::ZERO,
//! );
//! alice.put_single(key, Data::new(&b"red"[..]), PutOptions::default()).await?;
//! let data = bob.get_single(key).await?;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 160-bit identifiers, XOR metric, composite keys |
//! | `address` | Peer addresses, reachability flags, relay endpoints |
//! | `crypto` | Signature capability (Ed25519 default), key hashing |
//! | `data` | Stored entries and their streaming wire codec |
//! | `peer_map` | Bucketed routing table with verified/overflow bags |
//! | `storage` | Keyed storage, TTL, locks, protection, digests |
//! | `messages` | Envelope format and typed message bodies |
//! | `transport` | Wire seam, channel permits, in-process mesh |
//! | `rpc` | Messenger, dispatcher, request handlers, forwarders |
//! | `routing` | Iterative α-parallel closest-node search |
//! | `dht` | Distributed operations with voting evaluation |
//! | `replication` | Responsibility tracking and periodic refresh |
//! | `relay` | Relay manager and request forwarder |
//! | `node` | Peer builder and the public operation surface |

pub mod address;
pub mod crypto;
pub mod data;
pub mod dht;
pub mod id;
pub mod messages;
pub mod node;
pub mod peer_map;
pub mod relay;
pub mod replication;
pub mod routing;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use address::{AddressFlags, PeerAddress, PeerSocketAddress, MAX_RELAYS};
pub use crypto::{Ed25519SignatureFactory, KeyPair, PublicKey, SignatureFactory};
pub use data::{Data, DataType};
pub use dht::{PutOptions, StatusResult};
pub use id::{Number160, Number320, Number480, Number640};
pub use messages::FailureReason;
pub use node::{Peer, PeerBuilder, PeerConfig};
pub use storage::{DigestInfo, PutStatus, SimpleBloomFilter, StorageLayer};
pub use transport::MeshTransport;
