//! # Address Manager
//!
//! Tracks this node's own addresses, partitioned into:
//!
//! - **listen**: what transports actually bound
//! - **announce**: configured overrides for advertisement
//! - **observed**: what remote peers report seeing (via identify), each with
//!   a confidence flag that flips to confirmed only after external
//!   confirmation
//!
//! The advertised set is announce (or listen when announce is empty) plus
//! the confirmed observed addresses, optionally rewritten through DNS
//! mappings, deduplicated, suffixed with `/p2p/<self>`, and passed through
//! the user's announce filter.
//!
//! Changes to the advertised set (listeners starting or stopping,
//! observed-address confidence flipping) are debounced for one second and
//! then patched into the peer store's self entry, emitting
//! `self:peer:update`: one event per burst, not per change.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, trace};

use crate::events::{EventBus, NodeEvent};
use crate::identity::PeerId;
use crate::multiaddr::{Multiaddr, Protocol};
use crate::peer_store::{PeerStore, PeerUpdate};
use crate::signal::AbortSignal;
use crate::transport::TransportManager;

/// Default cap on tracked observed addresses.
pub const DEFAULT_MAX_OBSERVED_ADDRESSES: usize = 10;

/// Debounce window for self-update emission.
const SELF_UPDATE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Optional user hook filtering the advertised address set.
pub type AnnounceFilter = Arc<dyn Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync>;

struct ObservedAddr {
    addr: Multiaddr,
    confident: bool,
}

/// Tracks listen/announce/observed self-addresses and keeps the peer
/// store's self entry current.
pub struct AddressManager {
    local_peer: PeerId,
    transports: Arc<TransportManager>,
    peer_store: Arc<PeerStore>,
    events: EventBus,
    announce: Vec<Multiaddr>,
    announce_filter: Option<AnnounceFilter>,
    observed: Mutex<LruCache<String, ObservedAddr>>,
    dns_mappings: RwLock<HashMap<String, Vec<IpAddr>>>,
    update_notify: Arc<Notify>,
}

impl AddressManager {
    pub fn new(
        local_peer: PeerId,
        transports: Arc<TransportManager>,
        peer_store: Arc<PeerStore>,
        events: EventBus,
        announce: Vec<Multiaddr>,
        announce_filter: Option<AnnounceFilter>,
        max_observed_addresses: usize,
    ) -> Arc<Self> {
        let cap = NonZeroUsize::new(max_observed_addresses.max(1)).expect("max(1) is non-zero");
        Arc::new(Self {
            local_peer,
            transports,
            peer_store,
            events,
            announce,
            announce_filter,
            observed: Mutex::new(LruCache::new(cap)),
            dns_mappings: RwLock::new(HashMap::new()),
            update_notify: Arc::new(Notify::new()),
        })
    }

    /// Start the debounced self-update task. Also reacts to transports
    /// starting or stopping listeners.
    pub fn start(self: &Arc<Self>, shutdown: AbortSignal) {
        let manager = self.clone();
        let mut listener_events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                // Wait for the first trigger.
                tokio::select! {
                    _ = manager.update_notify.notified() => {}
                    event = listener_events.recv() => {
                        match event {
                            Ok(NodeEvent::TransportListening { .. })
                            | Ok(NodeEvent::TransportClose { .. }) => {}
                            Ok(_) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(_) => return,
                        }
                    }
                    _ = shutdown.aborted() => return,
                }
                // Debounce: keep extending the window while triggers arrive.
                loop {
                    tokio::select! {
                        _ = manager.update_notify.notified() => continue,
                        _ = tokio::time::sleep(SELF_UPDATE_DEBOUNCE) => break,
                        _ = shutdown.aborted() => return,
                    }
                }
                manager.flush_self_update().await;
            }
        });
    }

    async fn flush_self_update(&self) {
        // Self entry holds the advertised set without the /p2p suffix; the
        // peer id is the entry key.
        let addrs: Vec<Multiaddr> = self
            .get_addresses()
            .await
            .into_iter()
            .map(|a| a.decapsulate("p2p"))
            .collect();
        if let Err(e) = self
            .peer_store
            .patch(&self.local_peer, PeerUpdate::with_multiaddrs(addrs))
            .await
        {
            debug!(error = %e, "failed to patch self entry");
        }
        self.events.emit(NodeEvent::SelfPeerUpdate { peer: self.local_peer.clone() });
        trace!("self addresses flushed");
    }

    fn schedule_self_update(&self) {
        self.update_notify.notify_one();
    }

    // ------------------------------------------------------------------------
    // Partitions
    // ------------------------------------------------------------------------

    pub async fn get_listen_addrs(&self) -> Vec<Multiaddr> {
        self.transports.listen_addrs().await
    }

    pub fn get_announce_addrs(&self) -> Vec<Multiaddr> {
        self.announce.clone()
    }

    pub async fn get_observed_addrs(&self) -> Vec<Multiaddr> {
        self.observed.lock().await.iter().map(|(_, o)| o.addr.clone()).collect()
    }

    /// Track an address a remote peer observed us at. Unconfirmed until
    /// [`AddressManager::confirm_observed_addr`].
    pub async fn add_observed_addr(&self, addr: &Multiaddr) {
        let addr = addr.decapsulate("p2p");
        let key = addr.to_string();
        let mut observed = self.observed.lock().await;
        if observed.contains(&key) {
            return;
        }
        trace!(addr = %addr, "tracking observed address");
        observed.push(key, ObservedAddr { addr, confident: false });
    }

    /// Promote an observed address to confirmed. A transition schedules a
    /// debounced `self:peer:update`.
    pub async fn confirm_observed_addr(&self, addr: &Multiaddr) {
        let addr = addr.decapsulate("p2p");
        let key = addr.to_string();
        let mut observed = self.observed.lock().await;
        let transitioned = match observed.get_mut(&key) {
            Some(entry) if !entry.confident => {
                entry.confident = true;
                true
            }
            Some(_) => false,
            None => {
                observed.push(key, ObservedAddr { addr: addr.clone(), confident: true });
                true
            }
        };
        drop(observed);
        if transitioned {
            debug!(addr = %addr, "observed address confirmed");
            self.schedule_self_update();
        }
    }

    pub async fn remove_observed_addr(&self, addr: &Multiaddr) {
        let key = addr.decapsulate("p2p").to_string();
        self.observed.lock().await.pop(&key);
    }

    // ------------------------------------------------------------------------
    // DNS mappings
    // ------------------------------------------------------------------------

    /// Advertise `domain` in place of any of `ips`.
    pub async fn add_dns_mapping(&self, domain: &str, ips: Vec<IpAddr>) {
        self.dns_mappings.write().await.insert(domain.to_string(), ips);
        self.schedule_self_update();
    }

    pub async fn remove_dns_mapping(&self, domain: &str) {
        if self.dns_mappings.write().await.remove(domain).is_some() {
            self.schedule_self_update();
        }
    }

    async fn apply_dns_mappings(&self, addr: Multiaddr) -> Multiaddr {
        let mappings = self.dns_mappings.read().await;
        if mappings.is_empty() {
            return addr;
        }
        let mut out = Multiaddr::empty();
        for component in addr.iter() {
            let mapped = match component {
                Protocol::Ip4(ip) => mappings
                    .iter()
                    .find(|(_, ips)| ips.contains(&IpAddr::V4(*ip)))
                    .map(|(domain, _)| Protocol::Dns4(domain.clone())),
                Protocol::Ip6(ip) => mappings
                    .iter()
                    .find(|(_, ips)| ips.contains(&IpAddr::V6(*ip)))
                    .map(|(domain, _)| Protocol::Dns6(domain.clone())),
                _ => None,
            };
            out.push(mapped.unwrap_or_else(|| component.clone()));
        }
        out
    }

    // ------------------------------------------------------------------------
    // Advertised set
    // ------------------------------------------------------------------------

    /// The full advertised address set: announce (or listen) plus confirmed
    /// observed, DNS-mapped, deduplicated, `/p2p`-suffixed, filtered.
    pub async fn get_addresses(&self) -> Vec<Multiaddr> {
        let mut base = if self.announce.is_empty() {
            self.get_listen_addrs().await
        } else {
            self.announce.clone()
        };
        {
            let observed = self.observed.lock().await;
            base.extend(
                observed.iter().filter(|(_, o)| o.confident).map(|(_, o)| o.addr.clone()),
            );
        }

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(base.len());
        for addr in base {
            let addr = self.apply_dns_mappings(addr).await;
            let addr = match addr.with_peer_id(&self.local_peer) {
                Ok(addr) => addr,
                Err(_) => continue, // carries a foreign peer id; not ours to advertise
            };
            if seen.insert(addr.to_string()) {
                out.push(addr);
            }
        }

        match &self.announce_filter {
            Some(filter) => filter(out),
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::peer_store::MemoryDatastore;
    use crate::transport::{MemoryHub, MemoryTransport, Transport};

    async fn manager_with(
        announce: Vec<Multiaddr>,
        filter: Option<AnnounceFilter>,
    ) -> (Arc<AddressManager>, Arc<TransportManager>, PeerId) {
        let events = EventBus::new();
        let local = Keypair::generate().peer_id();
        let transports = Arc::new(TransportManager::new(
            vec![Arc::new(MemoryTransport::new(MemoryHub::new())) as Arc<dyn Transport>],
            events.clone(),
        ));
        let peer_store = Arc::new(PeerStore::new(
            local.clone(),
            Arc::new(MemoryDatastore::new()),
            events.clone(),
        ));
        let manager = AddressManager::new(
            local.clone(),
            transports.clone(),
            peer_store,
            events,
            announce,
            filter,
            DEFAULT_MAX_OBSERVED_ADDRESSES,
        );
        (manager, transports, local)
    }

    #[tokio::test]
    async fn listen_addrs_are_advertised_when_no_announce() {
        let (manager, transports, local) = manager_with(vec![], None).await;
        transports.listen_on(&"/memory/am-a".parse().unwrap()).await.unwrap();

        let addrs = manager.get_addresses().await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id(), Some(&local));
        assert!(addrs[0].to_string().starts_with("/memory/am-a"));
    }

    #[tokio::test]
    async fn announce_overrides_listen() {
        let announce: Multiaddr = "/dns4/node.example/tcp/443".parse().unwrap();
        let (manager, transports, _) = manager_with(vec![announce.clone()], None).await;
        transports.listen_on(&"/memory/am-b".parse().unwrap()).await.unwrap();

        let addrs = manager.get_addresses().await;
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].to_string().starts_with("/dns4/node.example"));
    }

    #[tokio::test]
    async fn observed_addresses_require_confirmation() {
        let (manager, _, _) = manager_with(vec![], None).await;
        let seen: Multiaddr = "/memory/from-outside".parse().unwrap();

        manager.add_observed_addr(&seen).await;
        assert!(
            manager.get_addresses().await.is_empty(),
            "unconfirmed observed addresses are not advertised"
        );

        manager.confirm_observed_addr(&seen).await;
        let addrs = manager.get_addresses().await;
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].to_string().starts_with("/memory/from-outside"));
    }

    #[tokio::test]
    async fn observed_addresses_are_stripped_of_peer_suffix() {
        let (manager, _, local) = manager_with(vec![], None).await;
        let with_us: Multiaddr = "/memory/xyz".parse::<Multiaddr>().unwrap().with_peer_id(&local).unwrap();

        manager.add_observed_addr(&with_us).await;
        let observed = manager.get_observed_addrs().await;
        assert_eq!(observed, vec!["/memory/xyz".parse::<Multiaddr>().unwrap()]);
    }

    #[tokio::test]
    async fn dns_mapping_rewrites_ip_components() {
        let (manager, _, _) = manager_with(vec!["/ip4/203.0.113.7/tcp/443".parse().unwrap()], None).await;
        manager.add_dns_mapping("node.example", vec!["203.0.113.7".parse().unwrap()]).await;

        let addrs = manager.get_addresses().await;
        assert!(addrs[0].to_string().starts_with("/dns4/node.example/tcp/443"));
    }

    #[tokio::test]
    async fn announce_filter_is_applied_last() {
        let filter: AnnounceFilter =
            Arc::new(|addrs| addrs.into_iter().filter(|a| a.is_public()).collect());
        let (manager, transports, _) = manager_with(vec![], Some(filter)).await;
        transports.listen_on(&"/memory/am-c".parse().unwrap()).await.unwrap();

        // Memory addresses are non-public; the filter removes everything.
        assert!(manager.get_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn confirmation_debounces_one_self_update() {
        let (manager, _, _) = manager_with(vec![], None).await;
        let events_rx = manager.events.subscribe();
        manager.start(AbortSignal::never());

        // A burst of confirmations coalesces into one update.
        for i in 0..3 {
            let addr: Multiaddr = format!("/memory/obs-{i}").parse().unwrap();
            manager.add_observed_addr(&addr).await;
            manager.confirm_observed_addr(&addr).await;
        }

        let mut events_rx = events_rx;
        let first = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let NodeEvent::SelfPeerUpdate { .. } = events_rx.recv().await.unwrap() {
                    return;
                }
            }
        })
        .await;
        assert!(first.is_ok(), "debounced self update should fire");

        // No second update without further changes.
        let second = tokio::time::timeout(Duration::from_millis(1500), async {
            loop {
                if let NodeEvent::SelfPeerUpdate { .. } = events_rx.recv().await.unwrap() {
                    return;
                }
            }
        })
        .await;
        assert!(second.is_err(), "burst must coalesce into a single update");
    }
}
