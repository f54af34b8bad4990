//! # Peer Store
//!
//! Persistent mapping from peer id to everything the node knows about that
//! peer: addresses (with certification flags and dial outcomes), supported
//! protocols, metadata, tags, and the latest signed peer record.
//!
//! ## Storage model
//!
//! Entries are bincode values under `/peers/<hex peer id>` in a
//! [`Datastore`]. All mutations are serialized behind a single write lock;
//! readers get point-in-time snapshots ([`PeerInfo`]), never live references.
//!
//! ## Mutation DSL
//!
//! - [`PeerStore::save`]: full replace
//! - [`PeerStore::patch`]: field-wise replace (only fields present in the
//!   update are touched)
//! - [`PeerStore::merge`]: union for addresses and protocols, last-wins for
//!   metadata, sequence-number-dominant for the signed record
//!
//! ## Invariants
//!
//! - A peer's addresses never contain duplicates by string equality; merging
//!   keeps the strongest `is_certified` flag.
//! - A stored signed record's sequence number never decreases.
//! - Tags with an elapsed TTL are invisible to readers and removed on the
//!   next write to the entry.
//! - `ErrNotFound` is the routine outcome for unknown peers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{now_ms, PeerId};
use crate::multiaddr::Multiaddr;
use crate::record::PeerRecord;

/// Metadata key under which identify stores the remote agent version.
pub const METADATA_AGENT_VERSION: &str = "AgentVersion";

/// Metadata key under which identify stores the remote protocol version.
pub const METADATA_PROTOCOL_VERSION: &str = "ProtocolVersion";

/// Highest permitted tag value.
pub const MAX_TAG_VALUE: u8 = 100;

/// Datastore key prefix for peer entries.
const PEER_KEY_PREFIX: &str = "/peers/";

// ============================================================================
// Datastore abstraction
// ============================================================================

/// Minimal binary key-value store the peer store persists into.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>>;
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
    async fn has(&self, key: &[u8]) -> Result<bool>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    /// All pairs whose key starts with `prefix`, in key order.
    async fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory datastore over a sorted map.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.read().await.get(key).cloned().ok_or(Error::NotFound)
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.inner.write().await.insert(key.to_vec(), value);
        Ok(())
    }

    async fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner.read().await.contains_key(key))
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ============================================================================
// Entry types
// ============================================================================

/// One known address of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub multiaddr: Multiaddr,
    /// True when this address arrived inside a verified signed record.
    pub is_certified: bool,
    /// Last successful dial to this address, ms since epoch.
    pub last_success: Option<u64>,
    /// Last failed dial to this address, ms since epoch.
    pub last_failure: Option<u64>,
}

impl AddressRecord {
    pub fn new(multiaddr: Multiaddr) -> Self {
        Self { multiaddr, is_certified: false, last_success: None, last_failure: None }
    }

    pub fn certified(multiaddr: Multiaddr) -> Self {
        Self { multiaddr, is_certified: true, last_success: None, last_failure: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct TagEntry {
    value: u8,
    /// Absolute expiry, ms since epoch. `None` = no TTL.
    expires_at: Option<u64>,
}

/// Stored form of a peer entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct PeerEntry {
    addresses: Vec<AddressRecord>,
    protocols: Vec<String>,
    metadata: BTreeMap<String, Vec<u8>>,
    tags: BTreeMap<String, TagEntry>,
    peer_record_envelope: Option<Vec<u8>>,
    /// Sequence number of the stored envelope, kept denormalized so
    /// dominance checks don't re-parse the envelope.
    record_seq: Option<u64>,
}

impl PeerEntry {
    fn prune_expired_tags(&mut self, now: u64) {
        self.tags.retain(|_, tag| tag.expires_at.is_none_or(|at| at > now));
    }

    fn live_tags(&self, now: u64) -> Vec<(String, u8)> {
        self.tags
            .iter()
            .filter(|(_, tag)| tag.expires_at.is_none_or(|at| at > now))
            .map(|(name, tag)| (name.clone(), tag.value))
            .collect()
    }
}

/// Point-in-time public snapshot of a peer entry.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addresses: Vec<AddressRecord>,
    /// Sorted, deduplicated protocol list.
    pub protocols: Vec<String>,
    pub metadata: BTreeMap<String, Vec<u8>>,
    /// Visible (unexpired) tags.
    pub tags: Vec<(String, u8)>,
    /// Latest verified signed record, sealed.
    pub peer_record_envelope: Option<Vec<u8>>,
}

impl PeerInfo {
    /// Plain multiaddrs of this peer.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.addresses.iter().map(|a| a.multiaddr.clone()).collect()
    }

    /// Sum of visible tag values; the ordering key for pruning and auto-dial.
    pub fn tag_value_sum(&self) -> u32 {
        self.tags.iter().map(|(_, v)| *v as u32).sum()
    }
}

/// Partial update for [`PeerStore::patch`] / [`PeerStore::merge`].
/// `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct PeerUpdate {
    pub addresses: Option<Vec<AddressRecord>>,
    pub protocols: Option<Vec<String>>,
    pub metadata: Option<Vec<(String, Vec<u8>)>>,
    pub peer_record_envelope: Option<Vec<u8>>,
}

impl PeerUpdate {
    /// Update carrying only plain (uncertified) addresses.
    pub fn with_multiaddrs(addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        Self {
            addresses: Some(addrs.into_iter().map(AddressRecord::new).collect()),
            ..Self::default()
        }
    }
}

/// Options for [`PeerStore::tag_peer`].
#[derive(Clone, Copy, Debug)]
pub struct TagOptions {
    /// Tag weight, `0..=100`.
    pub value: u8,
    /// Optional time-to-live; the tag disappears after this elapses.
    pub ttl: Option<Duration>,
}

// ============================================================================
// PeerStore
// ============================================================================

/// The node's knowledge base about peers.
pub struct PeerStore {
    local_peer: PeerId,
    datastore: Arc<dyn Datastore>,
    /// Serializes read-modify-write cycles; plain reads go straight to the
    /// datastore.
    write_lock: Mutex<()>,
    events: EventBus,
}

impl PeerStore {
    pub fn new(local_peer: PeerId, datastore: Arc<dyn Datastore>, events: EventBus) -> Self {
        Self { local_peer, datastore, write_lock: Mutex::new(()), events }
    }

    fn key_for(peer: &PeerId) -> Vec<u8> {
        format!("{PEER_KEY_PREFIX}{peer}").into_bytes()
    }

    async fn load(&self, peer: &PeerId) -> Result<PeerEntry> {
        let bytes = self.datastore.get(&Self::key_for(peer)).await?;
        crate::messages::deserialize_bounded(&bytes)
    }

    fn snapshot(peer: &PeerId, entry: &PeerEntry, now: u64) -> PeerInfo {
        PeerInfo {
            id: peer.clone(),
            addresses: entry.addresses.clone(),
            protocols: entry.protocols.clone(),
            metadata: entry.metadata.clone(),
            tags: entry.live_tags(now),
            peer_record_envelope: entry.peer_record_envelope.clone(),
        }
    }

    /// Fetch a snapshot of a peer entry.
    ///
    /// # Errors
    /// `ErrNotFound` when the peer is unknown, a routine outcome rather than a
    /// fault.
    pub async fn get(&self, peer: &PeerId) -> Result<PeerInfo> {
        let entry = self.load(peer).await?;
        Ok(Self::snapshot(peer, &entry, now_ms()))
    }

    pub async fn has(&self, peer: &PeerId) -> bool {
        self.datastore.has(&Self::key_for(peer)).await.unwrap_or(false)
    }

    /// Remove a peer entirely.
    pub async fn delete(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.datastore.delete(&Self::key_for(peer)).await
    }

    /// Snapshot of every stored peer, optionally filtered. The local peer's
    /// self-entry is excluded.
    pub async fn all(&self, filter: Option<&(dyn Fn(&PeerInfo) -> bool + Sync)>) -> Vec<PeerInfo> {
        let pairs = match self.datastore.query(PEER_KEY_PREFIX.as_bytes()).await {
            Ok(pairs) => pairs,
            Err(_) => return Vec::new(),
        };
        let now = now_ms();
        let mut out = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let Ok(key_str) = std::str::from_utf8(&key) else { continue };
            let Some(id_hex) = key_str.strip_prefix(PEER_KEY_PREFIX) else { continue };
            let Ok(id) = id_hex.parse::<PeerId>() else { continue };
            if id == self.local_peer {
                continue;
            }
            let Ok(entry) = crate::messages::deserialize_bounded::<PeerEntry>(&value) else {
                continue;
            };
            let info = Self::snapshot(&id, &entry, now);
            if filter.is_none_or(|f| f(&info)) {
                out.push(info);
            }
        }
        out
    }

    /// Read-modify-write cycle with change detection and event emission.
    async fn mutate<F>(&self, peer: &PeerId, apply: F) -> Result<PeerInfo>
    where
        F: FnOnce(&mut PeerEntry),
    {
        let _guard = self.write_lock.lock().await;
        let now = now_ms();

        let previous = match self.load(peer).await {
            Ok(entry) => Some(entry),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let mut entry = previous.clone().unwrap_or_default();
        entry.prune_expired_tags(now);
        apply(&mut entry);
        normalize_entry(&mut entry);

        let info = Self::snapshot(peer, &entry, now);
        if previous.as_ref() == Some(&entry) {
            return Ok(info); // no state change, no event
        }

        let encoded = crate::messages::serialize_entry(&entry)?;
        self.datastore.put(&Self::key_for(peer), encoded).await?;

        let previous_info = previous.as_ref().map(|e| Self::snapshot(peer, e, now));
        trace!(peer = %peer.short(), first = previous_info.is_none(), "peer entry updated");
        // The self entry announces itself through self:peer:update, not the
        // peer channels.
        if *peer != self.local_peer {
            if previous_info.is_none() {
                self.events.emit(NodeEvent::PeerDiscovery(info.clone()));
            }
            self.events.emit(NodeEvent::PeerUpdate { peer: info.clone(), previous: previous_info });
        }
        Ok(info)
    }

    /// Full replace of a peer entry (tags and dial outcomes excepted: `save`
    /// rewrites what the update carries and clears what it doesn't).
    pub async fn save(&self, peer: &PeerId, update: PeerUpdate) -> Result<PeerInfo> {
        self.mutate(peer, |entry| {
            entry.addresses = update.addresses.unwrap_or_default();
            entry.protocols = update.protocols.unwrap_or_default();
            entry.metadata = update.metadata.unwrap_or_default().into_iter().collect();
            entry.peer_record_envelope = update.peer_record_envelope;
            entry.record_seq = None;
        })
        .await
    }

    /// Field-wise replace: only fields present in the update are replaced.
    pub async fn patch(&self, peer: &PeerId, update: PeerUpdate) -> Result<PeerInfo> {
        self.mutate(peer, |entry| {
            if let Some(addresses) = update.addresses {
                entry.addresses = addresses;
            }
            if let Some(protocols) = update.protocols {
                entry.protocols = protocols;
            }
            if let Some(metadata) = update.metadata {
                entry.metadata = metadata.into_iter().collect();
            }
            if let Some(envelope) = update.peer_record_envelope {
                entry.peer_record_envelope = Some(envelope);
                entry.record_seq = None;
            }
        })
        .await
    }

    /// Union merge: addresses and protocols are unioned, metadata is
    /// last-wins per key, and a signed record only replaces the stored one
    /// when its sequence number is higher.
    pub async fn merge(&self, peer: &PeerId, update: PeerUpdate) -> Result<PeerInfo> {
        // Parse the incoming envelope's seq outside the entry closure.
        let incoming_record = match &update.peer_record_envelope {
            Some(bytes) => Some((bytes.clone(), PeerRecord::open(bytes, Some(peer))?)),
            None => None,
        };
        self.mutate(peer, |entry| {
            if let Some(addresses) = update.addresses {
                entry.addresses.extend(addresses);
            }
            if let Some(protocols) = update.protocols {
                entry.protocols.extend(protocols);
            }
            if let Some(metadata) = update.metadata {
                for (key, value) in metadata {
                    entry.metadata.insert(key, value);
                }
            }
            if let Some((bytes, record)) = incoming_record {
                let stored_seq = entry.record_seq.unwrap_or(0);
                if entry.peer_record_envelope.is_none() || record.seq > stored_seq {
                    entry.peer_record_envelope = Some(bytes);
                    entry.record_seq = Some(record.seq);
                }
            }
        })
        .await
    }

    /// Verify a sealed peer record and, if it dominates the stored one,
    /// adopt it: its addresses replace the certified set for the peer.
    ///
    /// Returns `true` when the record was adopted, `false` when a stored
    /// record with an equal-or-higher sequence number won.
    pub async fn consume_peer_record(
        &self,
        envelope_bytes: &[u8],
        expected_peer: Option<&PeerId>,
    ) -> Result<bool> {
        let record = PeerRecord::open(envelope_bytes, expected_peer)?;
        let peer = record.peer_id.clone();

        let mut adopted = false;
        self.mutate(&peer, |entry| {
            let stored_seq = entry.record_seq.unwrap_or(0);
            if entry.peer_record_envelope.is_some() && record.seq <= stored_seq {
                return;
            }
            adopted = true;
            entry.peer_record_envelope = Some(envelope_bytes.to_vec());
            entry.record_seq = Some(record.seq);
            entry
                .addresses
                .extend(record.addresses.iter().cloned().map(AddressRecord::certified));
        })
        .await?;
        Ok(adopted)
    }

    /// Record the outcome of a dial attempt against one of the peer's
    /// addresses.
    pub async fn record_dial_outcome(
        &self,
        peer: &PeerId,
        addr: &Multiaddr,
        success: bool,
    ) -> Result<()> {
        // Dial candidates carry a /p2p suffix; stored addresses don't.
        let addr_str = addr.decapsulate("p2p").to_string();
        self.mutate(peer, |entry| {
            let now = now_ms();
            for record in &mut entry.addresses {
                if record.multiaddr.decapsulate("p2p").to_string() == addr_str {
                    if success {
                        record.last_success = Some(now);
                    } else {
                        record.last_failure = Some(now);
                    }
                }
            }
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    /// Attach a named tag to a peer.
    ///
    /// # Errors
    /// `ErrInvalidParameters` when `value` exceeds [`MAX_TAG_VALUE`].
    pub async fn tag_peer(&self, peer: &PeerId, name: &str, options: TagOptions) -> Result<()> {
        if options.value > MAX_TAG_VALUE {
            return Err(Error::invalid_parameters(format!(
                "tag value {} exceeds maximum {}",
                options.value, MAX_TAG_VALUE
            )));
        }
        let expires_at = options.ttl.map(|ttl| now_ms() + ttl.as_millis() as u64);
        self.mutate(peer, |entry| {
            entry
                .tags
                .insert(name.to_string(), TagEntry { value: options.value, expires_at });
        })
        .await?;
        Ok(())
    }

    pub async fn untag_peer(&self, peer: &PeerId, name: &str) -> Result<()> {
        self.mutate(peer, |entry| {
            entry.tags.remove(name);
        })
        .await?;
        Ok(())
    }

    /// Visible (unexpired) tags for a peer. Unknown peers have no tags.
    pub async fn get_tags(&self, peer: &PeerId) -> Vec<(String, u8)> {
        match self.load(peer).await {
            Ok(entry) => entry.live_tags(now_ms()),
            Err(_) => Vec::new(),
        }
    }

    /// Sum of visible tag values for a peer.
    pub async fn tag_value_sum(&self, peer: &PeerId) -> u32 {
        self.get_tags(peer).await.into_iter().map(|(_, v)| v as u32).sum()
    }
}

/// Dedupe addresses by string form (keeping the strongest certification and
/// most recent outcomes) and sort-dedupe protocols.
fn normalize_entry(entry: &mut PeerEntry) {
    let mut seen: BTreeMap<String, AddressRecord> = BTreeMap::new();
    for record in entry.addresses.drain(..) {
        let key = record.multiaddr.to_string();
        match seen.get_mut(&key) {
            Some(existing) => {
                existing.is_certified |= record.is_certified;
                existing.last_success = existing.last_success.max(record.last_success);
                existing.last_failure = existing.last_failure.max(record.last_failure);
            }
            None => {
                seen.insert(key, record);
            }
        }
    }
    entry.addresses = seen.into_values().collect();

    entry.protocols.sort();
    entry.protocols.dedup();
}
