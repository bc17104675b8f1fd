//! # Distributed Operations
//!
//! PUT / ADD / GET / REMOVE / DIGEST / SEND-DIRECT over the overlay. Every
//! operation has the same shape: route to the location key, fan the
//! operation RPC out to the R closest peers in parallel, and merge the raw
//! per-peer results by majority vote.
//!
//! ## Voting
//!
//! A key (or an entry, compared by content hash) is accepted into the
//! consolidated result iff it appears identically in more than
//! `raw.len() / 2` responses (integer division). With one responder that
//! is simply its answer; with three, two must agree; diverging contents
//! under the same key cancel each other out.
//!
//! The local peer takes part as one ordinary voter whenever it is itself
//! responsible for the location, which also makes a single-peer network
//! behave correctly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::address::PeerAddress;
use crate::crypto::PublicKey;
use crate::data::Data;
use crate::id::{Number160, Number320, Number640};
use crate::messages::{FailureReason, StoreRequest, StoreResponse};
use crate::peer_map::PeerMap;
use crate::routing::{join_threshold, route_to_closest, RoutingConfig, RoutingResult};
use crate::rpc::Messenger;
use crate::storage::{DigestInfo, PutStatus, SimpleBloomFilter, StorageLayer};

/// Options of a distributed put.
#[derive(Clone, Default)]
pub struct PutOptions {
    pub public_key: Option<PublicKey>,
    pub put_if_absent: bool,
    pub claim_domain: bool,
}

/// Raw and evaluated outcome of a distributed put or remove.
#[derive(Debug, Default)]
pub struct StatusResult {
    /// Per-peer raw status lists.
    pub raw: HashMap<Number160, Vec<(Number640, PutStatus)>>,
}

impl StatusResult {
    /// Keys confirmed OK by a majority of responders.
    pub fn evaluate(&self) -> BTreeSet<Number640> {
        let keyed: HashMap<Number160, Vec<Number640>> = self
            .raw
            .iter()
            .map(|(peer, statuses)| {
                (
                    *peer,
                    statuses
                        .iter()
                        .filter(|(_, s)| *s == PutStatus::Ok)
                        .map(|(k, _)| *k)
                        .collect(),
                )
            })
            .collect();
        evaluate_keys(&keyed)
    }

    /// Whether any responder reported the given status.
    pub fn contains_status(&self, status: PutStatus) -> bool {
        self.raw
            .values()
            .flatten()
            .any(|(_, s)| *s == status)
    }

    pub fn is_success(&self) -> bool {
        !self.evaluate().is_empty()
    }
}

/// Raw and evaluated outcome of a distributed get.
#[derive(Debug, Default)]
pub struct DataResult {
    pub raw: HashMap<Number160, Vec<(Number640, Data)>>,
}

impl DataResult {
    pub fn evaluate(&self) -> BTreeMap<Number640, Data> {
        evaluate_entries(&self.raw)
    }
}

/// Raw and evaluated outcome of a distributed digest.
#[derive(Debug, Default)]
pub struct DigestResult {
    pub raw: HashMap<Number160, DigestInfo>,
}

impl DigestResult {
    pub fn evaluate(&self) -> DigestInfo {
        let keyed: HashMap<Number160, Vec<(Number640, Number160)>> = self
            .raw
            .iter()
            .map(|(peer, digest)| (*peer, digest.iter().map(|(k, h)| (*k, *h)).collect()))
            .collect();
        let n = keyed.len();
        let mut votes: HashMap<(Number640, Number160), usize> = HashMap::new();
        for entries in keyed.values() {
            for entry in entries {
                *votes.entry(*entry).or_default() += 1;
            }
        }
        let mut result = DigestInfo::default();
        for ((key, hash), count) in votes {
            if count > n / 2 {
                result.put(key, hash);
            }
        }
        result
    }
}

/// Majority vote over per-peer key lists.
pub fn evaluate_keys(raw: &HashMap<Number160, Vec<Number640>>) -> BTreeSet<Number640> {
    let n = raw.len();
    let mut votes: HashMap<Number640, usize> = HashMap::new();
    for keys in raw.values() {
        for key in keys {
            *votes.entry(*key).or_default() += 1;
        }
    }
    votes
        .into_iter()
        .filter(|(_, count)| *count > n / 2)
        .map(|(key, _)| key)
        .collect()
}

/// Majority vote over per-peer entry maps; entries agree when their
/// content hashes match.
pub fn evaluate_entries(raw: &HashMap<Number160, Vec<(Number640, Data)>>) -> BTreeMap<Number640, Data> {
    let n = raw.len();
    let mut votes: HashMap<(Number640, Number160), (usize, Data)> = HashMap::new();
    for entries in raw.values() {
        for (key, data) in entries {
            let slot = votes
                .entry((*key, data.hash()))
                .or_insert_with(|| (0, data.clone()));
            slot.0 += 1;
        }
    }
    let mut result = BTreeMap::new();
    for ((key, _), (count, data)) in votes {
        if count > n / 2 {
            result.insert(key, data);
        }
    }
    result
}

/// Configuration of the operation fan-out.
#[derive(Clone, Debug)]
pub struct OperationsConfig {
    pub routing: RoutingConfig,
    pub replication_factor: usize,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            replication_factor: 6,
        }
    }
}

/// The operation engine of one peer.
pub struct Operations {
    messenger: Arc<Messenger>,
    peer_map: Arc<RwLock<PeerMap>>,
    storage: Arc<StorageLayer>,
    config: OperationsConfig,
}

impl Operations {
    pub fn new(
        messenger: Arc<Messenger>,
        peer_map: Arc<RwLock<PeerMap>>,
        storage: Arc<StorageLayer>,
        config: OperationsConfig,
    ) -> Self {
        Self {
            messenger,
            peer_map,
            storage,
            config,
        }
    }

    async fn route(&self, target: Number160) -> RoutingResult {
        route_to_closest(
            &self.messenger,
            &self.peer_map,
            target,
            &self.config.routing,
            None,
        )
        .await
    }

    /// Read targets: among the R closest, prefer the peers whose routing
    /// digest showed content for the location. Peers that reported an
    /// empty branch would only dilute the vote.
    fn read_targets(&self, routing: &RoutingResult, replicas: usize) -> Vec<PeerAddress> {
        let top = routing.top(replicas);
        let holders: Vec<PeerAddress> = top
            .iter()
            .filter(|p| {
                routing
                    .digests
                    .get(&p.peer_id)
                    .map(|d| !d.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if holders.is_empty() {
            top
        } else {
            holders
        }
    }

    fn self_responsible(&self, location: &Number160, replicas: usize) -> bool {
        let map = self.peer_map.read().expect("peer map poisoned");
        let self_id = map.self_id();
        map.is_responsible(&self_id, location, replicas)
    }

    /// Store entries on the R peers closest to the shared location key.
    pub async fn put(
        &self,
        entries: Vec<(Number640, Data)>,
        options: PutOptions,
    ) -> Result<StatusResult, FailureReason> {
        let location = shared_location(&entries)?;
        let routing = self.route(location).await;
        let replicas = self.config.replication_factor;
        let targets = routing.top(replicas);

        let mut result = StatusResult::default();

        // The local peer is one of the replicas whenever it is
        // responsible (always true on a lone peer).
        if targets.is_empty() || self.self_responsible(&location, replicas) {
            let mut statuses = Vec::new();
            for (key, data) in &entries {
                let status = self
                    .storage
                    .put(
                        *key,
                        data.clone(),
                        options.public_key.as_ref(),
                        options.put_if_absent,
                        options.claim_domain,
                    )
                    .await;
                if status == PutStatus::Ok {
                    let self_id = self.messenger.self_id();
                    self.storage.update_responsibility(key.location, self_id);
                }
                statuses.push((*key, status));
            }
            result.raw.insert(self.messenger.self_id(), statuses);
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let messenger = self.messenger.clone();
                let entries = entries.clone();
                let options = options.clone();
                async move {
                    let response = messenger
                        .store(
                            &target,
                            StoreRequest::Put {
                                entries,
                                public_key: options.public_key,
                                put_if_absent: options.put_if_absent,
                                claim_domain: options.claim_domain,
                            },
                        )
                        .await;
                    match response {
                        Ok(StoreResponse::Status(statuses)) => Some((target.peer_id, statuses)),
                        _ => None,
                    }
                }
            })
            .collect();
        let replies = join_threshold(tasks, usize::MAX, false).await;
        for (peer, statuses) in replies {
            result.raw.insert(peer, statuses);
        }

        if result.raw.is_empty() {
            return Err(FailureReason::PeerUnreachable);
        }
        debug!(location = %location, voters = result.raw.len(), "put completed");
        Ok(result)
    }

    /// List-append: store under the entry's own content hash so multiple
    /// values coexist below one `(location, domain)`.
    pub async fn add(
        &self,
        location: Number160,
        domain: Number160,
        data: Data,
        options: PutOptions,
    ) -> Result<StatusResult, FailureReason> {
        let key = Number640::new(location, domain, data.hash(), Number160::ZERO);
        self.put(vec![(key, data)], options).await
    }

    /// Fetch entries by exact keys from the R closest peers and merge by
    /// majority.
    pub async fn get(&self, keys: Vec<Number640>) -> Result<DataResult, FailureReason> {
        let location = shared_location_of_keys(&keys)?;
        let routing = self.route(location).await;
        let replicas = self.config.replication_factor;
        let targets = self.read_targets(&routing, replicas);

        let mut result = DataResult::default();
        if targets.is_empty() || self.self_responsible(&location, replicas) {
            let mut entries = Vec::new();
            for key in &keys {
                if let Some(data) = self.storage.get(*key).await {
                    entries.push((*key, data));
                }
            }
            if !entries.is_empty() {
                result.raw.insert(self.messenger.self_id(), entries);
            }
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let messenger = self.messenger.clone();
                let keys = keys.clone();
                async move {
                    match messenger
                        .store(&target, StoreRequest::Get { keys })
                        .await
                    {
                        Ok(StoreResponse::Entries(entries)) => Some((target.peer_id, entries)),
                        _ => None,
                    }
                }
            })
            .collect();
        for (peer, entries) in join_threshold(tasks, usize::MAX, false).await {
            result.raw.insert(peer, entries);
        }
        Ok(result)
    }

    /// Fetch a whole range below one location key.
    pub async fn get_range(
        &self,
        from: Number640,
        to: Number640,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    ) -> Result<DataResult, FailureReason> {
        if from.location != to.location {
            return Err(FailureReason::IllegalArgument(
                "range must share the location key".into(),
            ));
        }
        let location = from.location;
        let routing = self.route(location).await;
        let replicas = self.config.replication_factor;
        let targets = self.read_targets(&routing, replicas);

        let mut result = DataResult::default();
        if targets.is_empty() || self.self_responsible(&location, replicas) {
            let entries = self
                .storage
                .get_range_filtered(from, to, key_bloom.as_ref(), content_bloom.as_ref())
                .await;
            if !entries.is_empty() {
                result
                    .raw
                    .insert(self.messenger.self_id(), entries.into_iter().collect());
            }
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let messenger = self.messenger.clone();
                let key_bloom = key_bloom.clone();
                let content_bloom = content_bloom.clone();
                async move {
                    match messenger
                        .store(
                            &target,
                            StoreRequest::GetRange {
                                from,
                                to,
                                key_bloom,
                                content_bloom,
                            },
                        )
                        .await
                    {
                        Ok(StoreResponse::Entries(entries)) => Some((target.peer_id, entries)),
                        _ => None,
                    }
                }
            })
            .collect();
        for (peer, entries) in join_threshold(tasks, usize::MAX, false).await {
            result.raw.insert(peer, entries);
        }
        Ok(result)
    }

    /// Remove entries from the R closest peers.
    pub async fn remove(
        &self,
        keys: Vec<Number640>,
        public_key: Option<PublicKey>,
    ) -> Result<StatusResult, FailureReason> {
        let location = shared_location_of_keys(&keys)?;
        let routing = self.route(location).await;
        let replicas = self.config.replication_factor;
        let targets = routing.top(replicas);

        let mut result = StatusResult::default();
        if targets.is_empty() || self.self_responsible(&location, replicas) {
            let mut statuses = Vec::new();
            for key in &keys {
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
            result.raw.insert(self.messenger.self_id(), statuses);
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let messenger = self.messenger.clone();
                let keys = keys.clone();
                let public_key = public_key.clone();
                async move {
                    match messenger
                        .store(&target, StoreRequest::Remove { keys, public_key })
                        .await
                    {
                        Ok(StoreResponse::Status(statuses)) => Some((target.peer_id, statuses)),
                        _ => None,
                    }
                }
            })
            .collect();
        for (peer, statuses) in join_threshold(tasks, usize::MAX, false).await {
            result.raw.insert(peer, statuses);
        }
        Ok(result)
    }

    /// Collect digests of one `(location, domain)` branch from the R
    /// closest peers.
    pub async fn digest(
        &self,
        location_and_domain: Number320,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    ) -> Result<DigestResult, FailureReason> {
        let location = location_and_domain.location;
        let routing = self.route(location).await;
        let replicas = self.config.replication_factor;
        let targets = self.read_targets(&routing, replicas);

        let mut result = DigestResult::default();
        if targets.is_empty() || self.self_responsible(&location, replicas) {
            let digest = self
                .storage
                .digest(location_and_domain, key_bloom.as_ref(), content_bloom.as_ref())
                .await;
            if !digest.is_empty() {
                result.raw.insert(self.messenger.self_id(), digest);
            }
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let messenger = self.messenger.clone();
                let key_bloom = key_bloom.clone();
                let content_bloom = content_bloom.clone();
                async move {
                    match messenger
                        .store(
                            &target,
                            StoreRequest::Digest {
                                location_and_domain,
                                key_bloom,
                                content_bloom,
                            },
                        )
                        .await
                    {
                        Ok(StoreResponse::Digest(digest)) => Some((target.peer_id, digest)),
                        _ => None,
                    }
                }
            })
            .collect();
        for (peer, digest) in join_threshold(tasks, usize::MAX, false).await {
            result.raw.insert(peer, digest);
        }
        Ok(result)
    }

    /// Streamed variant of [`Operations::send_direct`]: the payload is
    /// pipelined to each of the R closest peers in `chunk_size` pieces.
    /// After every acknowledged chunk the progress listener (if any)
    /// receives `(peer, bytes_sent_so_far)`.
    pub async fn send_direct_streaming(
        &self,
        target: Number160,
        payload: Vec<u8>,
        chunk_size: usize,
        raw: bool,
        progress: Option<tokio::sync::mpsc::Sender<(Number160, usize)>>,
    ) -> Result<Vec<(Number160, Vec<u8>)>, FailureReason> {
        if chunk_size == 0 {
            return Err(FailureReason::IllegalArgument("chunk size is zero".into()));
        }
        let routing = self.route(target).await;
        let targets = routing.top(self.config.replication_factor);
        if targets.is_empty() {
            return Err(FailureReason::PeerUnreachable);
        }

        let chunks: Vec<Vec<u8>> = if payload.is_empty() {
            vec![Vec::new()]
        } else {
            payload.chunks(chunk_size).map(|c| c.to_vec()).collect()
        };
        let stream_id = rand::random::<u64>();

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|peer| {
                let messenger = self.messenger.clone();
                let chunks = chunks.clone();
                let progress = progress.clone();
                async move {
                    let total = chunks.len();
                    let mut sent = 0usize;
                    for (seq, chunk) in chunks.into_iter().enumerate() {
                        let last = seq + 1 == total;
                        sent += chunk.len();
                        match messenger
                            .direct_stream(&peer, stream_id, seq as u32, last, raw, chunk)
                            .await
                        {
                            Ok(reply) => {
                                if let Some(progress) = &progress {
                                    let _ = progress.send((peer.peer_id, sent)).await;
                                }
                                if last {
                                    return reply.map(|payload| (peer.peer_id, payload));
                                }
                            }
                            Err(_) => return None,
                        }
                    }
                    None
                }
            })
            .collect();
        let replies = join_threshold(tasks, usize::MAX, false).await;
        if replies.is_empty() {
            return Err(FailureReason::PeerUnreachable);
        }
        Ok(replies)
    }

    /// Send an opaque buffer to the R peers closest to `target`. With
    /// `cancel_on_finish`, outstanding sends are cancelled after the
    /// first acknowledgment.
    pub async fn send_direct(
        &self,
        target: Number160,
        payload: Vec<u8>,
        raw: bool,
        cancel_on_finish: bool,
    ) -> Result<Vec<(Number160, Vec<u8>)>, FailureReason> {
        let routing = self.route(target).await;
        let targets = routing.top(self.config.replication_factor);
        if targets.is_empty() {
            return Err(FailureReason::PeerUnreachable);
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|peer| {
                let messenger = self.messenger.clone();
                let payload = payload.clone();
                async move {
                    match messenger.direct(&peer, payload, raw).await {
                        Ok(reply) => Some((peer.peer_id, reply)),
                        Err(_) => None,
                    }
                }
            })
            .collect();
        let threshold = if cancel_on_finish { 1 } else { usize::MAX };
        let replies = join_threshold(tasks, threshold, cancel_on_finish).await;
        if replies.is_empty() {
            return Err(FailureReason::PeerUnreachable);
        }
        Ok(replies)
    }
}

fn shared_location(entries: &[(Number640, Data)]) -> Result<Number160, FailureReason> {
    let first = entries
        .first()
        .ok_or_else(|| FailureReason::IllegalArgument("no entries".into()))?;
    let location = first.0.location;
    if entries.iter().any(|(k, _)| k.location != location) {
        return Err(FailureReason::IllegalArgument(
            "entries must share the location key".into(),
        ));
    }
    Ok(location)
}

fn shared_location_of_keys(keys: &[Number640]) -> Result<Number160, FailureReason> {
    let first = keys
        .first()
        .ok_or_else(|| FailureReason::IllegalArgument("no keys".into()))?;
    let location = first.location;
    if keys.iter().any(|k| k.location != location) {
        return Err(FailureReason::IllegalArgument(
            "keys must share the location key".into(),
        ));
    }
    Ok(location)
}
