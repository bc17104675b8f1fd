//! # Iterative Routing
//!
//! The lookup engine behind every distributed operation: starting from the
//! local peer map, repeatedly query the α unvisited candidates closest to
//! the target with NEIGHBORS, merge what they report, and stop when the
//! neighborhood stops shrinking.
//!
//! Termination, whichever comes first:
//!
//! 1. the k closest known peers have all been queried successfully,
//! 2. `max_no_new_info` consecutive rounds brought no closer peer,
//! 3. `max_failures` failed queries accumulated.
//!
//! Candidates are ordered by XOR distance with the numeric peer id as tie
//! break. Relayed peers are ordinary routing stops; the transport reaches
//! them through their relays.
//!
//! Along the way the engine collects the neighborhood digest each peer
//! reports, which the storage operations use for replica comparison.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::id::{distance_then_id, Number160};
use crate::messages::FailureReason;
use crate::peer_map::PeerMap;
use crate::rpc::Messenger;
use crate::storage::DigestInfo;

/// Hard ceiling on lookup rounds, against pathological topologies.
const MAX_ROUTING_ROUNDS: usize = 32;

/// Knobs of one routing run.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Parallelism per round.
    pub alpha: usize,
    /// Size of the result set.
    pub k: usize,
    /// Failed-query budget.
    pub max_failures: usize,
    /// Rounds without a closer peer before giving up.
    pub max_no_new_info: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            k: 20,
            max_failures: 3,
            max_no_new_info: 2,
        }
    }
}

/// Outcome of a routing run.
#[derive(Debug, Default)]
pub struct RoutingResult {
    /// Peers observed closest to the target, ascending XOR distance.
    pub closest: Vec<PeerAddress>,
    /// Peers that answered a NEIGHBORS query.
    pub queried: HashSet<Number160>,
    /// Neighborhood digest reported by each answering peer.
    pub digests: HashMap<Number160, DigestInfo>,
}

impl RoutingResult {
    /// The `count` closest peers that the operation RPCs fan out to.
    pub fn top(&self, count: usize) -> Vec<PeerAddress> {
        self.closest.iter().take(count).cloned().collect()
    }
}

/// Run one iterative lookup toward `target`. `seed` adds a bootstrap
/// contact to the initial candidate set, before the peer map knows anyone.
pub async fn route_to_closest(
    messenger: &Arc<Messenger>,
    peer_map: &Arc<RwLock<PeerMap>>,
    target: Number160,
    config: &RoutingConfig,
    seed: Option<PeerAddress>,
) -> RoutingResult {
    let self_id = messenger.self_id();
    let mut shortlist: Vec<PeerAddress> = peer_map
        .read()
        .expect("peer map poisoned")
        .closest_peers(&target, config.k);
    if let Some(seed) = seed {
        if seed.peer_id != self_id && !shortlist.iter().any(|p| p.peer_id == seed.peer_id) {
            shortlist.push(seed);
        }
    }

    let mut known: HashSet<Number160> = shortlist.iter().map(|p| p.peer_id).collect();
    let mut queried: HashSet<Number160> = HashSet::new();
    let mut digests: HashMap<Number160, DigestInfo> = HashMap::new();
    let mut failures = 0usize;
    let mut no_new_info = 0usize;
    let mut best = shortlist.first().map(|p| target.xor(&p.peer_id));

    for round in 0..MAX_ROUTING_ROUNDS {
        let candidates: Vec<PeerAddress> = shortlist
            .iter()
            .filter(|p| !queried.contains(&p.peer_id) && p.peer_id != self_id)
            .take(config.alpha)
            .cloned()
            .collect();
        if candidates.is_empty() {
            break;
        }

        let mut join_set = JoinSet::new();
        for candidate in candidates {
            let messenger = messenger.clone();
            join_set.spawn(async move {
                let outcome = messenger.neighbors(&candidate, target).await;
                (candidate, outcome)
            });
        }

        let mut round_failures = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let Ok((candidate, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok((peers, digest)) => {
                    queried.insert(candidate.peer_id);
                    digests.insert(candidate.peer_id, digest);
                    for peer in peers {
                        if peer.peer_id == self_id {
                            continue;
                        }
                        if known.insert(peer.peer_id) {
                            // Hearsay until maintenance verifies it.
                            peer_map
                                .write()
                                .expect("peer map poisoned")
                                .add(peer.clone(), false);
                            shortlist.push(peer);
                        }
                    }
                }
                Err(reason) => {
                    trace!(peer = %candidate.peer_id, %reason, "neighbor query failed");
                    round_failures += 1;
                    shortlist.retain(|p| p.peer_id != candidate.peer_id);
                    known.remove(&candidate.peer_id);
                }
            }
        }
        failures += round_failures;

        shortlist.sort_by(|a, b| distance_then_id(&target, &a.peer_id, &b.peer_id));
        shortlist.truncate(config.k);

        let new_best = shortlist.first().map(|p| target.xor(&p.peer_id));
        let closer = match (&best, &new_best) {
            (Some(old), Some(new)) => new < old,
            (None, Some(_)) => true,
            _ => false,
        };
        if closer {
            best = new_best;
            no_new_info = 0;
        } else {
            no_new_info += 1;
        }

        let all_queried = shortlist.iter().all(|p| queried.contains(&p.peer_id));
        if all_queried || no_new_info >= config.max_no_new_info || failures >= config.max_failures {
            trace!(
                round,
                all_queried,
                no_new_info,
                failures,
                "routing terminated"
            );
            break;
        }
    }

    debug!(
        target = %target,
        found = shortlist.len(),
        queried = queried.len(),
        "iterative routing completed"
    );
    RoutingResult {
        closest: shortlist,
        queried,
        digests,
    }
}

/// Wait for threshold successes out of a set of tasks, optionally
/// cancelling the stragglers once the threshold is met. Each task yields
/// `Some(result)` on success, `None` on failure.
pub async fn join_threshold<T: Send + 'static, F>(
    tasks: Vec<F>,
    success_threshold: usize,
    cancel_on_threshold: bool,
) -> Vec<T>
where
    F: std::future::Future<Output = Option<T>> + Send + 'static,
{
    let mut join_set = JoinSet::new();
    for task in tasks {
        join_set.spawn(task);
    }
    let mut successes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(Some(result)) = joined {
            successes.push(result);
            if cancel_on_threshold && successes.len() >= success_threshold {
                join_set.abort_all();
                break;
            }
        }
    }
    successes
}
