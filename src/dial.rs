//! # Dial Queue
//!
//! Concurrent dial coordinator: resolves a target to candidate addresses,
//! deduplicates concurrent dials, races candidates under concurrency
//! bounds, and applies gating and timeouts.
//!
//! ## Algorithm
//!
//! 1. Resolve the target to `(peer?, addresses)`; a bare peer id loads
//!    addresses from the peer store.
//! 2. Reject dialing self; apply the `deny_dial_peer` gate.
//! 3. Expand `dnsaddr` addresses through the per-node resolver table,
//!    filter to addresses some transport can dial, dedupe by string form
//!    (OR-merging certified flags), cap the candidate count, apply the
//!    per-address gate, suffix `/p2p/<peer>`, and sort (public first).
//! 4. Dedup against in-flight dials: by peer id when present, by exact
//!    address set otherwise. A match joins the existing dial and resolves
//!    or rejects with it.
//! 5. Race the candidates: a per-peer bound nested inside the global
//!    parallel-dial bound. First success cancels every sibling through its
//!    own abort signal; if all fail, a single failure surfaces unwrapped
//!    and several become an aggregate.
//! 6. The whole dial runs under caller signal + node shutdown + dial
//!    timeout; a fired timeout surfaces as `ErrTimeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::errors::{Error, Result};
use crate::gater::ConnectionGater;
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use crate::peer_store::PeerStore;
use crate::signal::{AbortHandle, AbortSignal};
use crate::transport::TransportManager;
use crate::upgrader::Upgrader;

pub const DEFAULT_MAX_PARALLEL_DIALS: usize = 100;
pub const DEFAULT_MAX_CONCURRENT_DIALS_PER_PEER: usize = 10;
pub const DEFAULT_MAX_PEER_ADDRESSES_TO_DIAL: usize = 25;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Priority recorded for user-initiated dials.
pub const DEFAULT_DIAL_PRIORITY: u8 = 50;

/// Priority recorded for dials submitted by the auto-dial loop.
pub const AUTO_DIAL_PRIORITY: u8 = 0;

/// Recursion bound for dnsaddr expansion.
const MAX_RESOLVE_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct DialQueueConfig {
    pub max_parallel_dials: usize,
    pub max_concurrent_dials_per_peer: usize,
    pub max_peer_addresses_to_dial: usize,
    pub dial_timeout: Duration,
}

impl Default for DialQueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_dials: DEFAULT_MAX_PARALLEL_DIALS,
            max_concurrent_dials_per_peer: DEFAULT_MAX_CONCURRENT_DIALS_PER_PEER,
            max_peer_addresses_to_dial: DEFAULT_MAX_PEER_ADDRESSES_TO_DIAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// What to dial: a peer id (addresses loaded from the peer store) or one or
/// more addresses (optionally `/p2p`-suffixed).
#[derive(Clone, Debug)]
pub enum DialTarget {
    Peer(PeerId),
    Addrs(Vec<Multiaddr>),
}

impl From<PeerId> for DialTarget {
    fn from(peer: PeerId) -> Self {
        DialTarget::Peer(peer)
    }
}

impl From<Multiaddr> for DialTarget {
    fn from(addr: Multiaddr) -> Self {
        DialTarget::Addrs(vec![addr])
    }
}

impl From<Vec<Multiaddr>> for DialTarget {
    fn from(addrs: Vec<Multiaddr>) -> Self {
        DialTarget::Addrs(addrs)
    }
}

#[derive(Clone)]
pub struct DialOptions {
    pub signal: AbortSignal,
    pub priority: u8,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self { signal: AbortSignal::never(), priority: DEFAULT_DIAL_PRIORITY }
    }
}

/// Resolves one address scheme (e.g. `dnsaddr`) to further addresses.
#[async_trait]
pub trait AddrResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<Multiaddr>>;
}

/// Orders candidate addresses; smaller sorts first (dialed earlier).
pub type AddressSorter = Arc<dyn Fn(&Candidate, &Candidate) -> std::cmp::Ordering + Send + Sync>;

/// A dialable candidate address with its certification flag.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub addr: Multiaddr,
    pub is_certified: bool,
}

/// Default sorter: public addresses first, certified first among equals.
pub fn default_address_sorter() -> AddressSorter {
    Arc::new(|a, b| {
        b.addr
            .is_public()
            .cmp(&a.addr.is_public())
            .then(b.is_certified.cmp(&a.is_certified))
    })
}

type DialResult = std::result::Result<Arc<Connection>, Error>;

struct PendingDial {
    id: u64,
    peer: Option<PeerId>,
    /// Sorted address strings; the dedup key when no peer id is known.
    addr_key: Vec<String>,
    priority: u8,
    result_rx: tokio::sync::watch::Receiver<Option<DialResult>>,
}

/// The node's dial coordinator.
pub struct DialQueue {
    local_peer: PeerId,
    transports: Arc<TransportManager>,
    peer_store: Arc<PeerStore>,
    gater: Arc<dyn ConnectionGater>,
    upgrader: Arc<Upgrader>,
    config: DialQueueConfig,
    resolvers: HashMap<String, Arc<dyn AddrResolver>>,
    sorter: AddressSorter,
    pending: Mutex<Vec<PendingDial>>,
    global_slots: Arc<Semaphore>,
    shutdown: AbortSignal,
    next_dial_id: AtomicU64,
    /// Wired in phase two of node construction.
    manager: OnceLock<Weak<ConnectionManager>>,
}

impl DialQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        transports: Arc<TransportManager>,
        peer_store: Arc<PeerStore>,
        gater: Arc<dyn ConnectionGater>,
        upgrader: Arc<Upgrader>,
        config: DialQueueConfig,
        resolvers: HashMap<String, Arc<dyn AddrResolver>>,
        sorter: Option<AddressSorter>,
        shutdown: AbortSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            transports,
            peer_store,
            gater,
            upgrader,
            global_slots: Arc::new(Semaphore::new(config.max_parallel_dials)),
            config,
            resolvers,
            sorter: sorter.unwrap_or_else(default_address_sorter),
            pending: Mutex::new(Vec::new()),
            shutdown,
            next_dial_id: AtomicU64::new(1),
            manager: OnceLock::new(),
        })
    }

    pub(crate) fn set_manager(&self, manager: Weak<ConnectionManager>) {
        let _ = self.manager.set(manager);
    }

    /// True when a dial for `peer` is in flight.
    pub async fn has_pending(&self, peer: &PeerId) -> bool {
        self.pending.lock().await.iter().any(|p| p.peer.as_ref() == Some(peer))
    }

    /// Number of in-flight dials.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Dial `target`, joining an equivalent in-flight dial if one exists.
    pub async fn dial(&self, target: impl Into<DialTarget>, options: DialOptions) -> Result<Arc<Connection>> {
        let target = target.into();

        // --- resolution -----------------------------------------------------
        let (peer, raw_candidates) = self.resolve_target(target).await?;
        if peer.as_ref() == Some(&self.local_peer) {
            return Err(Error::DialedSelf);
        }
        if let Some(peer) = &peer {
            if self.gater.deny_dial_peer(peer).await {
                return Err(Error::PeerDialIntercepted);
            }
        }
        let candidates = self.calculate_addresses(peer.as_ref(), raw_candidates).await?;

        // --- dedup ----------------------------------------------------------
        let addr_key: Vec<String> = {
            let mut key: Vec<String> = candidates.iter().map(|c| c.addr.to_string()).collect();
            key.sort();
            key
        };
        let mut result_rx = {
            let mut pending = self.pending.lock().await;
            let existing = pending.iter().find(|p| match (&p.peer, &peer) {
                (Some(a), Some(b)) => a == b,
                (None, None) => p.addr_key == addr_key,
                _ => false,
            });
            if let Some(existing) = existing {
                trace!(dial = existing.id, priority = existing.priority, "joining in-flight dial");
                existing.result_rx.clone()
            } else {
                let id = self.next_dial_id.fetch_add(1, Ordering::Relaxed);
                let (result_tx, result_rx) = tokio::sync::watch::channel(None);
                pending.push(PendingDial {
                    id,
                    peer: peer.clone(),
                    addr_key,
                    priority: options.priority,
                    result_rx: result_rx.clone(),
                });
                drop(pending);

                let queue = QueueHandle {
                    transports: self.transports.clone(),
                    peer_store: self.peer_store.clone(),
                    upgrader: self.upgrader.clone(),
                    global_slots: self.global_slots.clone(),
                    manager: self.manager.get().cloned(),
                };
                let op_signal = options
                    .signal
                    .merge(&self.shutdown)
                    .merge(&AbortSignal::deadline(self.config.dial_timeout));
                let per_peer_bound = self.config.max_concurrent_dials_per_peer;
                let peer_for_run = peer.clone();
                tokio::spawn(async move {
                    let result =
                        run_dial(queue, peer_for_run, candidates, per_peer_bound, op_signal).await;
                    let _ = result_tx.send(Some(result));
                });

                result_rx
            }
        };

        // --- await the shared outcome --------------------------------------
        let outcome = loop {
            if let Some(result) = result_rx.borrow().clone() {
                break result;
            }
            if result_rx.changed().await.is_err() {
                break Err(Error::Aborted);
            }
        };

        // Drop every entry whose outcome is published. Late joiners that
        // raced this removal start a fresh dial, which is correct: the
        // previous one is finished.
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|p| p.result_rx.borrow().is_none());
        }

        outcome
    }

    async fn resolve_target(&self, target: DialTarget) -> Result<(Option<PeerId>, Vec<Candidate>)> {
        match target {
            DialTarget::Peer(peer) => {
                let candidates = match self.peer_store.get(&peer).await {
                    Ok(info) => info
                        .addresses
                        .into_iter()
                        .map(|r| Candidate { addr: r.multiaddr, is_certified: r.is_certified })
                        .collect(),
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                };
                Ok((Some(peer), candidates))
            }
            DialTarget::Addrs(addrs) => {
                // All addresses must agree on the peer id, if any carry one.
                let mut peer: Option<PeerId> = None;
                for addr in &addrs {
                    if let Some(id) = addr.peer_id() {
                        match &peer {
                            Some(existing) if existing != id => {
                                return Err(Error::invalid_parameters(
                                    "addresses disagree on target peer id",
                                ));
                            }
                            _ => peer = Some(id.clone()),
                        }
                    }
                }
                let candidates = addrs
                    .into_iter()
                    .map(|addr| Candidate { addr, is_certified: false })
                    .collect();
                Ok((peer, candidates))
            }
        }
    }

    /// Steps 3 of the dial algorithm: expansion, filtering, dedup, caps,
    /// gating, suffixing, sorting.
    async fn calculate_addresses(
        &self,
        peer: Option<&PeerId>,
        raw: Vec<Candidate>,
    ) -> Result<Vec<Candidate>> {
        // Recursive dnsaddr expansion.
        let mut expanded: Vec<Candidate> = Vec::new();
        for candidate in raw {
            self.expand_candidate(candidate, 0, &mut expanded).await;
        }

        // Keep only what some transport can dial, dedupe by string form.
        let mut by_string: HashMap<String, Candidate> = HashMap::new();
        for candidate in expanded {
            if self.transports.transport_for(&candidate.addr).is_none() {
                continue;
            }
            by_string
                .entry(candidate.addr.to_string())
                .and_modify(|existing| existing.is_certified |= candidate.is_certified)
                .or_insert(candidate);
        }
        let mut candidates: Vec<Candidate> = by_string.into_values().collect();

        if candidates.len() > self.config.max_peer_addresses_to_dial {
            return Err(Error::TooManyAddresses {
                count: candidates.len(),
                limit: self.config.max_peer_addresses_to_dial,
            });
        }

        // Per-address gate, then the peer-scoped filter.
        let mut gated = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            if !self.gater.deny_dial_multiaddr(&candidate.addr).await {
                gated.push(candidate);
            }
        }
        if let Some(peer) = peer {
            let allowed = self
                .gater
                .filter_multiaddrs_for_peer(peer, gated.iter().map(|c| c.addr.clone()).collect())
                .await;
            let allowed: std::collections::HashSet<String> =
                allowed.into_iter().map(|a| a.to_string()).collect();
            gated.retain(|c| allowed.contains(&c.addr.to_string()));
        }

        if gated.is_empty() {
            return Err(Error::NoValidAddresses);
        }

        // Suffix the peer id onto non-path addresses that lack it.
        if let Some(peer) = peer {
            for candidate in &mut gated {
                if let Ok(with_peer) = candidate.addr.with_peer_id(peer) {
                    candidate.addr = with_peer;
                }
            }
        }

        gated.sort_by(|a, b| (self.sorter)(a, b));
        Ok(gated)
    }

    async fn expand_candidate(&self, candidate: Candidate, depth: usize, out: &mut Vec<Candidate>) {
        if depth >= MAX_RESOLVE_DEPTH {
            return;
        }
        let Some(host) = candidate.addr.dnsaddr_host().map(str::to_string) else {
            out.push(candidate);
            return;
        };
        let Some(resolver) = self.resolvers.get("dnsaddr") else {
            // No resolver configured; the unexpanded address is filtered out
            // later unless a transport dials dnsaddr natively.
            out.push(candidate);
            return;
        };
        match resolver.resolve(&host).await {
            Ok(resolved) => {
                for addr in resolved {
                    let next = Candidate { addr, is_certified: candidate.is_certified };
                    Box::pin(self.expand_candidate(next, depth + 1, out)).await;
                }
            }
            Err(e) => {
                debug!(host = %host, error = %e, "dnsaddr resolution failed");
            }
        }
    }
}

/// The capabilities one racing dial needs, detached from the queue's
/// lifetime.
struct QueueHandle {
    transports: Arc<TransportManager>,
    peer_store: Arc<PeerStore>,
    upgrader: Arc<Upgrader>,
    global_slots: Arc<Semaphore>,
    manager: Option<Weak<ConnectionManager>>,
}

/// Race the candidates for one pending dial.
async fn run_dial(
    queue: QueueHandle,
    peer: Option<PeerId>,
    candidates: Vec<Candidate>,
    per_peer_bound: usize,
    op_signal: AbortSignal,
) -> DialResult {
    let per_peer_slots = Arc::new(Semaphore::new(per_peer_bound));
    let mut attempts: JoinSet<(Multiaddr, DialResult)> = JoinSet::new();
    let mut abort_handles: Vec<AbortHandle> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let (abort_handle, attempt_abort) = AbortSignal::manual();
        abort_handles.push(abort_handle);
        let attempt_signal = op_signal.merge(&attempt_abort);

        let transports = queue.transports.clone();
        let upgrader = queue.upgrader.clone();
        let per_peer = per_peer_slots.clone();
        let global = queue.global_slots.clone();
        let expected_peer = peer.clone();

        attempts.spawn(async move {
            let addr = candidate.addr.clone();
            let result = async {
                // Per-peer bound wraps the global bound.
                let _peer_permit =
                    per_peer.acquire().await.map_err(|_| Error::Aborted)?;
                let _global_permit =
                    global.acquire().await.map_err(|_| Error::Aborted)?;
                if attempt_signal.is_aborted() {
                    return Err(Error::Aborted);
                }
                let raw = transports.dial(&candidate.addr, &attempt_signal).await?;
                upgrader
                    .upgrade_outbound(raw, expected_peer.as_ref(), &attempt_signal)
                    .await
            }
            .await;
            (addr, result)
        });
    }

    let mut errors: Vec<Error> = Vec::new();
    let winner = loop {
        let joined = tokio::select! {
            joined = attempts.join_next() => joined,
            _ = op_signal.aborted() => {
                attempts.abort_all();
                for handle in &abort_handles {
                    handle.abort();
                }
                return Err(if op_signal.deadline_elapsed() { Error::Timeout } else { Error::Aborted });
            }
        };
        match joined {
            None => break None,
            Some(Err(join_error)) => {
                if !join_error.is_cancelled() {
                    warn!(error = %join_error, "dial attempt panicked");
                }
            }
            Some(Ok((addr, Ok(connection)))) => {
                if let Some(peer) = &peer {
                    let _ = queue.peer_store.record_dial_outcome(peer, &addr, true).await;
                }
                break Some(connection);
            }
            Some(Ok((addr, Err(e)))) => {
                if let Some(peer) = &peer {
                    let _ = queue.peer_store.record_dial_outcome(peer, &addr, false).await;
                }
                trace!(addr = %addr, error = %e, "dial attempt failed");
                errors.push(e);
            }
        }
    };

    // First success cancels all siblings.
    for handle in &abort_handles {
        handle.abort();
    }
    attempts.abort_all();

    match winner {
        Some(connection) => {
            debug!(peer = %connection.remote_peer().short(), addr = %connection.remote_addr(), "dial succeeded");
            let connection = match queue.manager.as_ref().and_then(Weak::upgrade) {
                Some(manager) => manager.accept(connection).await,
                None => connection,
            };
            Ok(connection)
        }
        None => Err(Error::aggregate_dial(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sorter_puts_public_certified_first() {
        let sorter = default_address_sorter();
        let mut candidates = vec![
            Candidate { addr: "/memory/local".parse().unwrap(), is_certified: false },
            Candidate { addr: "/ip4/93.184.216.34/tcp/1".parse().unwrap(), is_certified: false },
            Candidate { addr: "/ip4/93.184.216.34/tcp/2".parse().unwrap(), is_certified: true },
        ];
        candidates.sort_by(|a, b| sorter(a, b));
        assert!(candidates[0].is_certified && candidates[0].addr.is_public());
        assert!(candidates[1].addr.is_public());
        assert!(!candidates[2].addr.is_public());
    }

    #[test]
    fn dial_target_conversions() {
        let addr: Multiaddr = "/memory/a".parse().unwrap();
        assert!(matches!(DialTarget::from(addr.clone()), DialTarget::Addrs(a) if a.len() == 1));
        assert!(matches!(
            DialTarget::from(vec![addr.clone(), addr]),
            DialTarget::Addrs(a) if a.len() == 2
        ));
    }
}
