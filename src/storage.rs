//! # Storage Layer
//!
//! Keyed storage for [`Data`] entries under [`Number640`] coordinates, with
//! TTL expiry, hierarchical locking and access protection. The layer wraps
//! a [`StorageBackend`] (in-memory by default) and adds:
//!
//! - **Protection**: the first `claim_domain` write to a `(location,
//!   domain)` pair binds it to the writer's public key; later writers need
//!   that key or the master key (`key_hash(pk) == domain`). Entries signed
//!   with a key are only overwritable by that key or the content-key
//!   master.
//! - **Locking**: four ref-counted keyed lock tables at prefix lengths
//!   160/320/480/640 plus a storage-wide lock. Range operations take the
//!   coarsest lock that still confines them to one branch; point
//!   operations always take the 640 lock.
//! - **Expiry**: a secondary index `expires_at -> {key}`; the periodic
//!   sweep removes everything at or before the current wall clock.
//! - **Digests**: `(key, content-hash)` maps for replica comparison
//!   without payload transfer, with optional bloom-filter narrowing.
//!
//! The backend also carries the replication responsibility map
//! (`location -> {peer}` and its reverse), which the replication
//! controller queries and maintains.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::crypto::PublicKey;
use crate::data::Data;
use crate::id::{Number160, Number320, Number480, Number640};

/// Result of a put operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum PutStatus {
    Ok,
    FailedNotAbsent,
    FailedSecurity,
    Failed,
    VersionConflict,
}

/// Who may protect a domain or entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtectionEnable {
    /// Anyone may protect.
    All,
    /// Only identity-proving keys (master key) may.
    None,
}

/// Whether the master-key override (`key_hash(pk) == key`) applies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtectionMode {
    NoMaster,
    MasterPublicKey,
}

/// Bound on version-chain walks during cycle detection.
const MAX_VERSION_WALK: usize = 128;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Expired entries are invisible to reads; the sweeper collects them.
fn is_expired(data: &Data) -> bool {
    data.expiration_millis() <= now_millis()
}

// ============================================================================
// Bloom filter
// ============================================================================

/// A compact bloom filter over [`Number160`] keys, used to narrow digest
/// and range queries without shipping key sets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleBloomFilter {
    bits: Vec<u64>,
    bit_count: usize,
    hash_count: u8,
}

impl SimpleBloomFilter {
    /// `bit_count` is rounded up to a multiple of 64.
    pub fn new(bit_count: usize, hash_count: u8) -> Self {
        let words = bit_count.div_ceil(64).max(1);
        Self {
            bits: vec![0u64; words],
            bit_count: words * 64,
            hash_count: hash_count.max(1),
        }
    }

    fn indexes(&self, key: &Number160) -> impl Iterator<Item = usize> + '_ {
        let base = key.as_bytes().to_vec();
        let bit_count = self.bit_count;
        (0..self.hash_count).map(move |i| {
            let mut input = base.clone();
            input.push(i);
            let digest = blake3::hash(&input);
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest.as_bytes()[..8]);
            (u64::from_be_bytes(word) as usize) % bit_count
        })
    }

    pub fn insert(&mut self, key: &Number160) {
        let idx: Vec<usize> = self.indexes(key).collect();
        for i in idx {
            self.bits[i / 64] |= 1 << (i % 64);
        }
    }

    pub fn contains(&self, key: &Number160) -> bool {
        self.indexes(key)
            .collect::<Vec<_>>()
            .into_iter()
            .all(|i| self.bits[i / 64] & (1 << (i % 64)) != 0)
    }
}

// ============================================================================
// Ref-counted keyed locks
// ============================================================================

struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

/// A table of per-key async locks. Slots are created on demand and removed
/// when the last holder releases, so the table stays bounded under
/// random-key workloads.
pub struct KeyLock<K: Eq + Hash + Clone> {
    slots: StdMutex<HashMap<K, Slot>>,
    held: AtomicUsize,
}

impl<K: Eq + Hash + Clone> KeyLock<K> {
    pub fn new() -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            held: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock for `key`, waiting behind current holders.
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let mutex = {
            let mut slots = self.slots.lock().expect("lock table poisoned");
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.mutex.clone()
        };
        let guard = mutex.lock_owned().await;
        self.held.fetch_add(1, Ordering::Relaxed);
        KeyGuard {
            table: self,
            key,
            _guard: guard,
        }
    }

    /// Number of distinct keys currently tracked.
    pub fn table_len(&self) -> usize {
        self.slots.lock().expect("lock table poisoned").len()
    }

    fn release(&self, key: &K) {
        let mut slots = self.slots.lock().expect("lock table poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
        self.held.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<K: Eq + Hash + Clone> Default for KeyLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a keyed lock until dropped.
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    table: &'a KeyLock<K>,
    key: K,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// The lock actually taken by a range operation.
enum RangeGuard<'a> {
    Storage(tokio::sync::MutexGuard<'a, ()>),
    Location(KeyGuard<'a, Number160>),
    LocationDomain(KeyGuard<'a, Number320>),
    LocationDomainContent(KeyGuard<'a, Number480>),
    Point(KeyGuard<'a, Number640>),
}

// ============================================================================
// Digest
// ============================================================================

/// A `(key, content-hash)` map for comparing replica contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInfo {
    digests: BTreeMap<Number640, Number160>,
}

impl DigestInfo {
    pub fn put(&mut self, key: Number640, hash: Number160) {
        self.digests.insert(key, hash);
    }

    pub fn get(&self, key: &Number640) -> Option<&Number160> {
        self.digests.get(key)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Number640> {
        self.digests.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Number640, &Number160)> {
        self.digests.iter()
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Raw keyed storage plus the secondary structures the layer relies on.
/// Implementations need no internal synchronization; the layer serializes
/// access.
pub trait StorageBackend: Send {
    fn contains(&self, key: &Number640) -> bool;
    fn put(&mut self, key: Number640, data: Data) -> bool;
    fn get(&self, key: &Number640) -> Option<Data>;
    fn remove(&mut self, key: &Number640) -> Option<Data>;
    fn range(&self, from: &Number640, to: &Number640) -> BTreeMap<Number640, Data>;

    fn add_timeout(&mut self, key: Number640, expires_at_millis: u64);
    fn remove_timeout(&mut self, key: &Number640);
    fn timed_out(&self, now_millis: u64) -> Vec<Number640>;

    fn protect_domain(&mut self, key: Number320, public_key: PublicKey) -> bool;
    fn is_domain_protected_by_others(
        &self,
        key: &Number320,
        public_key: Option<&PublicKey>,
    ) -> bool;

    fn update_responsibility(&mut self, location: Number160, peer: Number160) -> bool;
    fn remove_responsibility(&mut self, location: &Number160);
    fn remove_responsibility_of(&mut self, location: &Number160, peer: &Number160);
    fn find_content_for_responsible_peer(&self, peer: &Number160) -> Vec<Number160>;
    fn find_peers_for_responsible_content(&self, location: &Number160) -> Vec<Number160>;
}

/// The default in-memory backend.
#[derive(Default)]
pub struct MemoryStorage {
    data: BTreeMap<Number640, Data>,
    timeouts: BTreeMap<u64, BTreeSet<Number640>>,
    timeouts_rev: HashMap<Number640, u64>,
    protected_domains: HashMap<Number320, PublicKey>,
    responsibility: HashMap<Number160, HashSet<Number160>>,
    responsibility_rev: HashMap<Number160, HashSet<Number160>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn contains(&self, key: &Number640) -> bool {
        self.data.contains_key(key)
    }

    fn put(&mut self, key: Number640, data: Data) -> bool {
        self.data.insert(key, data);
        true
    }

    fn get(&self, key: &Number640) -> Option<Data> {
        self.data.get(key).cloned()
    }

    fn remove(&mut self, key: &Number640) -> Option<Data> {
        self.data.remove(key)
    }

    fn range(&self, from: &Number640, to: &Number640) -> BTreeMap<Number640, Data> {
        self.data
            .range(*from..=*to)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn add_timeout(&mut self, key: Number640, expires_at_millis: u64) {
        if expires_at_millis == u64::MAX {
            return;
        }
        self.remove_timeout(&key);
        self.timeouts
            .entry(expires_at_millis)
            .or_default()
            .insert(key);
        self.timeouts_rev.insert(key, expires_at_millis);
    }

    fn remove_timeout(&mut self, key: &Number640) {
        if let Some(expires) = self.timeouts_rev.remove(key) {
            if let Some(set) = self.timeouts.get_mut(&expires) {
                set.remove(key);
                if set.is_empty() {
                    self.timeouts.remove(&expires);
                }
            }
        }
    }

    fn timed_out(&self, now_millis: u64) -> Vec<Number640> {
        self.timeouts
            .range(..=now_millis)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect()
    }

    fn protect_domain(&mut self, key: Number320, public_key: PublicKey) -> bool {
        self.protected_domains.insert(key, public_key);
        true
    }

    fn is_domain_protected_by_others(
        &self,
        key: &Number320,
        public_key: Option<&PublicKey>,
    ) -> bool {
        match self.protected_domains.get(key) {
            Some(owner) => Some(owner) != public_key,
            None => false,
        }
    }

    fn update_responsibility(&mut self, location: Number160, peer: Number160) -> bool {
        let is_new = self.responsibility.entry(location).or_default().insert(peer);
        self.responsibility_rev
            .entry(peer)
            .or_default()
            .insert(location);
        is_new
    }

    fn remove_responsibility(&mut self, location: &Number160) {
        if let Some(peers) = self.responsibility.remove(location) {
            for peer in peers {
                if let Some(locations) = self.responsibility_rev.get_mut(&peer) {
                    locations.remove(location);
                    if locations.is_empty() {
                        self.responsibility_rev.remove(&peer);
                    }
                }
            }
        }
    }

    fn remove_responsibility_of(&mut self, location: &Number160, peer: &Number160) {
        if let Some(peers) = self.responsibility.get_mut(location) {
            peers.remove(peer);
            if peers.is_empty() {
                self.responsibility.remove(location);
            }
        }
        if let Some(locations) = self.responsibility_rev.get_mut(peer) {
            locations.remove(location);
            if locations.is_empty() {
                self.responsibility_rev.remove(peer);
            }
        }
    }

    fn find_content_for_responsible_peer(&self, peer: &Number160) -> Vec<Number160> {
        self.responsibility_rev
            .get(peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn find_peers_for_responsible_content(&self, location: &Number160) -> Vec<Number160> {
        self.responsibility
            .get(location)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Storage layer
// ============================================================================

pub struct StorageLayer {
    backend: StdMutex<Box<dyn StorageBackend>>,
    domain_enable: ProtectionEnable,
    domain_mode: ProtectionMode,
    entry_enable: ProtectionEnable,
    entry_mode: ProtectionMode,
    removed_domains: StdMutex<HashSet<Number160>>,
    lock_storage: tokio::sync::Mutex<()>,
    lock_160: KeyLock<Number160>,
    lock_320: KeyLock<Number320>,
    lock_480: KeyLock<Number480>,
    lock_640: KeyLock<Number640>,
}

impl StorageLayer {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: StdMutex::new(backend),
            domain_enable: ProtectionEnable::All,
            domain_mode: ProtectionMode::MasterPublicKey,
            entry_enable: ProtectionEnable::All,
            entry_mode: ProtectionMode::MasterPublicKey,
            removed_domains: StdMutex::new(HashSet::new()),
            lock_storage: tokio::sync::Mutex::new(()),
            lock_160: KeyLock::new(),
            lock_320: KeyLock::new(),
            lock_480: KeyLock::new(),
            lock_640: KeyLock::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    pub fn set_protection(
        &mut self,
        domain_enable: ProtectionEnable,
        domain_mode: ProtectionMode,
        entry_enable: ProtectionEnable,
        entry_mode: ProtectionMode,
    ) {
        self.domain_enable = domain_enable;
        self.domain_mode = domain_mode;
        self.entry_enable = entry_enable;
        self.entry_mode = entry_mode;
    }

    /// Mark a domain as removed: it becomes unprotectable and globally
    /// writable.
    pub fn remove_domain_protection(&self, domain: Number160) {
        self.removed_domains
            .lock()
            .expect("removed domains poisoned")
            .insert(domain);
    }

    fn is_domain_removed(&self, domain: &Number160) -> bool {
        self.removed_domains
            .lock()
            .expect("removed domains poisoned")
            .contains(domain)
    }

    fn with_backend<T>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> T) -> T {
        let mut backend = self.backend.lock().expect("backend poisoned");
        f(backend.as_mut())
    }

    /// Store an entry. `public_key` identifies the writer for the
    /// protection checks; `claim_domain` attempts to bind the
    /// `(location, domain)` pair to that key.
    pub async fn put(
        &self,
        key: Number640,
        data: Data,
        public_key: Option<&PublicKey>,
        put_if_absent: bool,
        claim_domain: bool,
    ) -> PutStatus {
        let _guard = self.lock_640.lock(key).await;

        if !self.security_domain_check(&key.location_and_domain(), public_key, claim_domain) {
            return PutStatus::FailedSecurity;
        }
        let contains = self.with_backend(|b| b.contains(&key));
        if put_if_absent && contains {
            return PutStatus::FailedNotAbsent;
        }
        if contains {
            let old = self.with_backend(|b| b.get(&key));
            if !self.can_update_entry(&key.content, old.as_ref(), &data) {
                return PutStatus::FailedSecurity;
            }
        }
        if self.closes_version_cycle(&key, &data) {
            debug!(%key, "rejecting put: version ancestry closes a cycle");
            return PutStatus::VersionConflict;
        }

        let expiration = data.expiration_millis();
        let stored = self.with_backend(|b| {
            let ok = b.put(key, data);
            if ok {
                b.add_timeout(key, expiration);
            }
            ok
        });
        if stored {
            PutStatus::Ok
        } else {
            PutStatus::Failed
        }
    }

    pub async fn get(&self, key: Number640) -> Option<Data> {
        let _guard = self.lock_640.lock(key).await;
        self.with_backend(|b| b.get(&key)).filter(|d| !is_expired(d))
    }

    pub async fn contains(&self, key: Number640) -> bool {
        let _guard = self.lock_640.lock(key).await;
        self.with_backend(|b| b.contains(&key))
    }

    pub async fn get_range(&self, from: Number640, to: Number640) -> BTreeMap<Number640, Data> {
        let _guard = self.find_and_lock(&from, &to).await;
        let mut entries = self.with_backend(|b| b.range(&from, &to));
        entries.retain(|_, data| !is_expired(data));
        entries
    }

    /// Range scan narrowed by optional bloom filters: `key_bloom` matches
    /// content keys, `content_bloom` matches payload hashes.
    pub async fn get_range_filtered(
        &self,
        from: Number640,
        to: Number640,
        key_bloom: Option<&SimpleBloomFilter>,
        content_bloom: Option<&SimpleBloomFilter>,
    ) -> BTreeMap<Number640, Data> {
        let _guard = self.find_and_lock(&from, &to).await;
        let mut entries = self.with_backend(|b| b.range(&from, &to));
        entries.retain(|key, data| {
            if is_expired(data) {
                return false;
            }
            if let Some(bloom) = key_bloom {
                if !bloom.contains(&key.content) {
                    return false;
                }
            }
            if let Some(bloom) = content_bloom {
                if !bloom.contains(&data.hash()) {
                    return false;
                }
            }
            true
        });
        entries
    }

    /// Remove a single entry. Fails silently (returns `None`) when the
    /// writer may not touch the domain or the entry is bound to another
    /// key.
    pub async fn remove(&self, key: Number640, public_key: Option<&PublicKey>) -> Option<Data> {
        let _guard = self.lock_640.lock(key).await;
        if !self.can_claim_domain(&key.location_and_domain(), public_key) {
            return None;
        }
        let data = self.with_backend(|b| b.get(&key))?;
        if data.public_key().is_none() || data.public_key() == public_key {
            return self.with_backend(|b| {
                b.remove_timeout(&key);
                b.remove_responsibility(&key.location);
                b.remove(&key)
            });
        }
        None
    }

    /// Remove every entry in the range. Fail-fast: if any covered
    /// `(location, domain)` is protected against the writer, nothing is
    /// removed.
    pub async fn remove_range(
        &self,
        from: Number640,
        to: Number640,
        public_key: Option<&PublicKey>,
    ) -> Option<BTreeMap<Number640, Data>> {
        let _guard = self.find_and_lock(&from, &to).await;
        let covered = self.with_backend(|b| b.range(&from, &to));
        let domains: HashSet<Number320> =
            covered.keys().map(|k| k.location_and_domain()).collect();
        for domain in &domains {
            if !self.can_claim_domain(domain, public_key) {
                return None;
            }
        }
        let mut removed = BTreeMap::new();
        self.with_backend(|b| {
            for (key, data) in covered {
                if data.public_key().is_none() || data.public_key() == public_key {
                    b.remove_timeout(&key);
                    b.remove_responsibility(&key.location);
                    if let Some(data) = b.remove(&key) {
                        removed.insert(key, data);
                    }
                }
            }
        });
        Some(removed)
    }

    /// Remove all expired entries; returns the removed keys.
    pub async fn check_timeouts(&self, now_millis: u64) -> Vec<Number640> {
        let _guard = self.lock_storage.lock().await;
        self.with_backend(|b| {
            let expired = b.timed_out(now_millis);
            for key in &expired {
                b.remove(key);
                b.remove_timeout(key);
            }
            if !expired.is_empty() {
                debug!(count = expired.len(), "expired entries removed");
            }
            expired
        })
    }

    pub async fn digest_range(&self, from: Number640, to: Number640) -> DigestInfo {
        let _guard = self.find_and_lock(&from, &to).await;
        let mut digest = DigestInfo::default();
        for (key, data) in self.with_backend(|b| b.range(&from, &to)) {
            if !is_expired(&data) {
                digest.put(key, data.hash());
            }
        }
        digest
    }

    /// Digest of one `(location, domain)` branch, narrowed by optional
    /// bloom filters.
    pub async fn digest(
        &self,
        location_and_domain: Number320,
        key_bloom: Option<&SimpleBloomFilter>,
        content_bloom: Option<&SimpleBloomFilter>,
    ) -> DigestInfo {
        let _guard = self.lock_320.lock(location_and_domain).await;
        let from = location_and_domain.min_key();
        let to = location_and_domain.max_key();
        let mut digest = DigestInfo::default();
        for (key, data) in self.with_backend(|b| b.range(&from, &to)) {
            if is_expired(&data) {
                continue;
            }
            if let Some(bloom) = key_bloom {
                if !bloom.contains(&key.content) {
                    continue;
                }
            }
            if let Some(bloom) = content_bloom {
                if !bloom.contains(&data.hash()) {
                    continue;
                }
            }
            digest.put(key, data.hash());
        }
        digest
    }

    /// Digest of an explicit key collection.
    pub async fn digest_keys(&self, keys: &[Number640]) -> DigestInfo {
        let mut digest = DigestInfo::default();
        for key in keys {
            let _guard = self.lock_640.lock(*key).await;
            if let Some(data) = self.with_backend(|b| b.get(key)) {
                if !is_expired(&data) {
                    digest.put(*key, data.hash());
                }
            }
        }
        digest
    }

    // --- responsibility bookkeeping (used by the replication controller) ---

    pub fn update_responsibility(&self, location: Number160, peer: Number160) -> bool {
        self.with_backend(|b| b.update_responsibility(location, peer))
    }

    pub fn remove_responsibility_of(&self, location: &Number160, peer: &Number160) {
        self.with_backend(|b| b.remove_responsibility_of(location, peer))
    }

    pub fn find_content_for_responsible_peer(&self, peer: &Number160) -> Vec<Number160> {
        self.with_backend(|b| b.find_content_for_responsible_peer(peer))
    }

    pub fn find_peers_for_responsible_content(&self, location: &Number160) -> Vec<Number160> {
        self.with_backend(|b| b.find_peers_for_responsible_content(location))
    }

    // --- protection internals ---

    fn master_override(&self, mode: ProtectionMode, key: &Number160, public_key: Option<&PublicKey>) -> bool {
        match (mode, public_key) {
            (ProtectionMode::MasterPublicKey, Some(pk)) => pk.key_hash() == *key,
            _ => false,
        }
    }

    fn can_claim_domain(&self, key: &Number320, public_key: Option<&PublicKey>) -> bool {
        let protected_by_others =
            self.with_backend(|b| b.is_domain_protected_by_others(key, public_key));
        !protected_by_others || self.master_override(self.domain_mode, &key.domain, public_key)
    }

    fn can_protect_domain(&self, domain: &Number160, public_key: Option<&PublicKey>) -> bool {
        if self.is_domain_removed(domain) {
            return false;
        }
        match self.domain_enable {
            ProtectionEnable::All => true,
            ProtectionEnable::None => self.master_override(self.domain_mode, domain, public_key),
        }
    }

    fn security_domain_check(
        &self,
        key: &Number320,
        public_key: Option<&PublicKey>,
        claim_domain: bool,
    ) -> bool {
        let protected_by_others =
            self.with_backend(|b| b.is_domain_protected_by_others(key, public_key));
        if !claim_domain {
            return !protected_by_others
                || self.master_override(self.domain_mode, &key.domain, public_key);
        }
        if self.can_claim_domain(key, public_key) {
            if self.can_protect_domain(&key.domain, public_key) {
                if let Some(pk) = public_key {
                    trace!(domain = %key.domain, "domain claimed");
                    return self.with_backend(|b| b.protect_domain(*key, pk.clone()));
                }
            }
            return true;
        }
        false
    }

    fn can_update_entry(&self, content_key: &Number160, old: Option<&Data>, new: &Data) -> bool {
        // An existing protected entry bound to a key yields only to that
        // key or the content-key master.
        if let Some(old) = old {
            if old.is_protected_entry() {
                if let Some(old_pk) = old.public_key() {
                    if new.public_key() != Some(old_pk)
                        && !self.master_override(self.entry_mode, content_key, new.public_key())
                    {
                        return false;
                    }
                }
            }
        }
        if new.is_protected_entry() {
            return self.can_protect_entry(content_key, old, new);
        }
        true
    }

    fn can_protect_entry(&self, content_key: &Number160, old: Option<&Data>, new: &Data) -> bool {
        if self.entry_enable == ProtectionEnable::All {
            match old.and_then(|d| d.public_key()) {
                None => return true,
                Some(old_pk) if new.public_key() == Some(old_pk) => return true,
                Some(_) => {}
            }
        }
        self.master_override(self.entry_mode, content_key, new.public_key())
    }

    /// Whether storing `data` at `key` would close a cycle in the version
    /// DAG of its `(location, domain, content)` triple.
    fn closes_version_cycle(&self, key: &Number640, data: &Data) -> bool {
        let Some(mut cursor) = data.based_on() else {
            return false;
        };
        if cursor == key.version {
            return true;
        }
        let mut seen = HashSet::new();
        for _ in 0..MAX_VERSION_WALK {
            if !seen.insert(cursor) {
                // Pre-existing loop below us; our write does not close it.
                return false;
            }
            let ancestor = self.with_backend(|b| b.get(&key.with_version(cursor)));
            match ancestor.and_then(|d| d.based_on()) {
                Some(next) if next == key.version => return true,
                Some(next) => cursor = next,
                None => return false,
            }
        }
        false
    }

    /// Pick the coarsest lock that still confines the range to a single
    /// branch.
    async fn find_and_lock(&self, from: &Number640, to: &Number640) -> RangeGuard<'_> {
        if from.location != to.location {
            RangeGuard::Storage(self.lock_storage.lock().await)
        } else if from.domain != to.domain {
            RangeGuard::Location(self.lock_160.lock(from.location).await)
        } else if from.content != to.content {
            RangeGuard::LocationDomain(self.lock_320.lock(from.location_and_domain()).await)
        } else if from.version != to.version {
            RangeGuard::LocationDomainContent(
                self.lock_480.lock(from.location_domain_and_content()).await,
            )
        } else {
            RangeGuard::Point(self.lock_640.lock(*from).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn key(location: u32, domain: u32, content: u32, version: u32) -> Number640 {
        Number640::new(
            Number160::from_u32(location),
            Number160::from_u32(domain),
            Number160::from_u32(content),
            Number160::from_u32(version),
        )
    }

    #[tokio::test]
    async fn put_then_get() {
        let storage = StorageLayer::in_memory();
        let k = key(1, 0, 0, 0);
        let status = storage
            .put(k, Data::new(&b"red"[..]), None, false, false)
            .await;
        assert_eq!(status, PutStatus::Ok);
        assert_eq!(
            storage.get(k).await.unwrap().payload().as_ref(),
            b"red"
        );
    }

    #[tokio::test]
    async fn put_if_absent_respects_existing() {
        let storage = StorageLayer::in_memory();
        let k = key(1, 0, 0, 0);
        storage
            .put(k, Data::new(&b"a"[..]), None, false, false)
            .await;
        let status = storage
            .put(k, Data::new(&b"b"[..]), None, true, false)
            .await;
        assert_eq!(status, PutStatus::FailedNotAbsent);
        assert_eq!(storage.get(k).await.unwrap().payload().as_ref(), b"a");
    }

    #[tokio::test]
    async fn domain_protection_blocks_other_keys() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate().public_key();
        let bob = KeyPair::generate().public_key();

        let k1 = key(1, 2, 3, 0);
        let k2 = key(1, 2, 4, 0);

        assert_eq!(
            storage
                .put(k1, Data::new(&b"a"[..]), Some(&alice), false, true)
                .await,
            PutStatus::Ok
        );
        // Bob writes into Alice's domain: refused, claiming or not.
        assert_eq!(
            storage
                .put(k2, Data::new(&b"b"[..]), Some(&bob), false, true)
                .await,
            PutStatus::FailedSecurity
        );
        assert_eq!(
            storage
                .put(k2, Data::new(&b"b"[..]), Some(&bob), false, false)
                .await,
            PutStatus::FailedSecurity
        );
        // Alice herself still writes freely.
        assert_eq!(
            storage
                .put(k2, Data::new(&b"c"[..]), Some(&alice), false, false)
                .await,
            PutStatus::Ok
        );
    }

    #[tokio::test]
    async fn master_key_overrides_domain_protection() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate().public_key();
        let master = KeyPair::generate();

        // The domain IS the hash of the master public key.
        let domain = master.public_key().key_hash();
        let k1 = Number640::new(
            Number160::from_u32(1),
            domain,
            Number160::from_u32(3),
            Number160::ZERO,
        );
        assert_eq!(
            storage
                .put(k1, Data::new(&b"a"[..]), Some(&alice), false, true)
                .await,
            PutStatus::Ok
        );
        // The master key takes the domain over.
        assert_eq!(
            storage
                .put(
                    k1,
                    Data::new(&b"b"[..]),
                    Some(&master.public_key()),
                    false,
                    true
                )
                .await,
            PutStatus::Ok
        );
    }

    #[tokio::test]
    async fn removed_domain_is_unprotectable() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate().public_key();
        let bob = KeyPair::generate().public_key();

        let domain = Number160::from_u32(9);
        storage.remove_domain_protection(domain);

        let k = Number640::new(
            Number160::from_u32(1),
            domain,
            Number160::from_u32(3),
            Number160::ZERO,
        );
        // Claiming succeeds but binds nothing; anyone may write.
        assert_eq!(
            storage
                .put(k, Data::new(&b"a"[..]), Some(&alice), false, true)
                .await,
            PutStatus::Ok
        );
        assert_eq!(
            storage
                .put(k, Data::new(&b"b"[..]), Some(&bob), false, false)
                .await,
            PutStatus::Ok
        );
    }

    #[tokio::test]
    async fn entry_protection_binds_to_key() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let factory = crate::crypto::Ed25519SignatureFactory;

        let k = key(1, 0, 3, 0);
        let protected = Data::new(&b"mine"[..])
            .with_protected_entry()
            .sign(&alice, &factory);
        assert_eq!(
            storage.put(k, protected, None, false, false).await,
            PutStatus::Ok
        );

        // Bob cannot overwrite, protected or not.
        let attempt = Data::new(&b"theirs"[..])
            .with_protected_entry()
            .sign(&bob, &factory);
        assert_eq!(
            storage.put(k, attempt, None, false, false).await,
            PutStatus::FailedSecurity
        );
        let plain = Data::new(&b"plain"[..]);
        assert_eq!(
            storage.put(k, plain, None, false, false).await,
            PutStatus::FailedSecurity
        );

        // Alice may.
        let update = Data::new(&b"updated"[..])
            .with_protected_entry()
            .sign(&alice, &factory);
        assert_eq!(
            storage.put(k, update, None, false, false).await,
            PutStatus::Ok
        );
    }

    #[tokio::test]
    async fn remove_respects_entry_key() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let factory = crate::crypto::Ed25519SignatureFactory;

        let k = key(1, 0, 3, 0);
        storage
            .put(
                k,
                Data::new(&b"mine"[..]).sign(&alice, &factory),
                None,
                false,
                false,
            )
            .await;

        assert!(storage.remove(k, Some(&bob.public_key())).await.is_none());
        assert!(storage
            .remove(k, Some(&alice.public_key()))
            .await
            .is_some());
        assert!(storage.get(k).await.is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_removes_entries() {
        let storage = StorageLayer::in_memory();
        let k = key(1, 0, 0, 0);
        let data = Data::new(&b"short lived"[..]).with_ttl_seconds(1);
        let expires = data.expiration_millis();
        storage.put(k, data, None, false, false).await;

        // Not yet expired.
        assert!(storage.check_timeouts(expires - 1).await.is_empty());
        assert!(storage.get(k).await.is_some());

        let removed = storage.check_timeouts(expires).await;
        assert_eq!(removed, vec![k]);
        assert!(storage.get(k).await.is_none());
    }

    #[tokio::test]
    async fn range_and_digest() {
        let storage = StorageLayer::in_memory();
        for content in 0..4u32 {
            storage
                .put(
                    key(1, 0, content, 0),
                    Data::new(vec![content as u8]),
                    None,
                    false,
                    false,
                )
                .await;
        }
        let (from, to) = Number640::location_range(Number160::from_u32(1));
        assert_eq!(storage.get_range(from, to).await.len(), 4);

        let digest = storage.digest_range(from, to).await;
        assert_eq!(digest.len(), 4);
        assert_eq!(
            digest.get(&key(1, 0, 2, 0)),
            Some(&Number160::hash_of(&[2u8]))
        );
    }

    #[tokio::test]
    async fn bloom_filters_narrow_results() {
        let storage = StorageLayer::in_memory();
        for content in 0..4u32 {
            storage
                .put(
                    key(1, 0, content, 0),
                    Data::new(vec![content as u8]),
                    None,
                    false,
                    false,
                )
                .await;
        }
        let mut bloom = SimpleBloomFilter::new(1024, 3);
        bloom.insert(&Number160::from_u32(1));
        bloom.insert(&Number160::from_u32(3));

        let (from, to) = Number640::location_range(Number160::from_u32(1));
        let filtered = storage
            .get_range_filtered(from, to, Some(&bloom), None)
            .await;
        assert!(filtered.contains_key(&key(1, 0, 1, 0)));
        assert!(filtered.contains_key(&key(1, 0, 3, 0)));
        assert!(!filtered.contains_key(&key(1, 0, 0, 0)));

        let digest = storage
            .digest(
                Number320::new(Number160::from_u32(1), Number160::from_u32(0)),
                Some(&bloom),
                None,
            )
            .await;
        assert_eq!(digest.len(), 2);
    }

    #[tokio::test]
    async fn version_cycle_rejected() {
        let storage = StorageLayer::in_memory();
        let v1 = Number160::from_u32(1);
        let v2 = Number160::from_u32(2);

        // v2 based on v1.
        storage
            .put(key(1, 0, 0, 2), Data::new(&b"b"[..]).with_based_on(v1), None, false, false)
            .await;
        // v1 based on v2 closes the loop.
        assert_eq!(
            storage
                .put(
                    key(1, 0, 0, 1),
                    Data::new(&b"a"[..]).with_based_on(v2),
                    None,
                    false,
                    false
                )
                .await,
            PutStatus::VersionConflict
        );
        // Self-reference is the degenerate cycle.
        assert_eq!(
            storage
                .put(
                    key(1, 0, 0, 3),
                    Data::new(&b"c"[..]).with_based_on(Number160::from_u32(3)),
                    None,
                    false,
                    false
                )
                .await,
            PutStatus::VersionConflict
        );
    }

    #[tokio::test]
    async fn remove_range_fail_fast_on_protected_domain() {
        let storage = StorageLayer::in_memory();
        let alice = KeyPair::generate().public_key();
        let bob = KeyPair::generate().public_key();

        storage
            .put(key(1, 2, 0, 0), Data::new(&b"a"[..]), Some(&alice), false, true)
            .await;
        storage
            .put(key(1, 2, 1, 0), Data::new(&b"b"[..]), Some(&alice), false, false)
            .await;

        let (from, to) = Number640::location_range(Number160::from_u32(1));
        assert!(storage.remove_range(from, to, Some(&bob)).await.is_none());
        assert_eq!(storage.get_range(from, to).await.len(), 2);

        let removed = storage.remove_range(from, to, Some(&alice)).await.unwrap();
        assert_eq!(removed.len(), 2);
    }

    #[tokio::test]
    async fn lock_tables_do_not_leak() {
        let storage = StorageLayer::in_memory();
        for i in 0..64u32 {
            storage
                .put(key(i, 0, 0, 0), Data::new(vec![i as u8]), None, false, false)
                .await;
        }
        assert_eq!(storage.lock_640.table_len(), 0);
        assert_eq!(storage.lock_320.table_len(), 0);
    }

    #[tokio::test]
    async fn responsibility_round_trip() {
        let storage = StorageLayer::in_memory();
        let location = Number160::from_u32(7);
        let peer = Number160::from_u32(42);

        assert!(storage.update_responsibility(location, peer));
        assert!(!storage.update_responsibility(location, peer));
        assert_eq!(
            storage.find_content_for_responsible_peer(&peer),
            vec![location]
        );
        assert_eq!(
            storage.find_peers_for_responsible_content(&location),
            vec![peer]
        );

        storage.remove_responsibility_of(&location, &peer);
        assert!(storage.find_content_for_responsible_peer(&peer).is_empty());
    }

    #[test]
    fn bloom_filter_basics() {
        let mut bloom = SimpleBloomFilter::new(512, 3);
        let members: Vec<Number160> = (0..20).map(Number160::from_u32).collect();
        for m in &members {
            bloom.insert(m);
        }
        for m in &members {
            assert!(bloom.contains(m));
        }
        // Non-members are overwhelmingly rejected at this load factor.
        let misses = (1000..1100)
            .map(Number160::from_u32)
            .filter(|k| bloom.contains(k))
            .count();
        assert!(misses < 5, "false positive rate too high: {misses}/100");
    }
}
