//! # Registrar
//!
//! Per-connection demultiplexing of streams to protocol handlers.
//!
//! The registrar keeps three things:
//!
//! - **handlers**: protocol → handler + per-protocol stream caps
//! - **topologies**: protocol → subscriptions notified when peers that
//!   support the protocol connect or disconnect
//! - **live counts**: streams per (connection, protocol, direction), held as
//!   weak bookkeeping only; streams are owned by their handlers
//!
//! Inbound streams are negotiated against the supported protocol set; a
//! stream that would exceed its protocol's `max_inbound_streams` on that
//! connection is reset. Outbound opens go through the same check against
//! `max_outbound_streams`. Protocols that did not opt in via
//! `run_on_transient_connection` are refused on transient connections.
//!
//! Registering or removing a handler changes this node's advertised
//! protocol set, so both emit `self:peer:update`; the identify service
//! turns that into a push to connected peers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, Direction};
use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::PeerId;
use crate::muxing::{Stream, StreamEnd};
use crate::select;

/// Default cap on concurrent inbound streams per protocol per connection.
pub const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;

/// Default cap on concurrent outbound streams per protocol per connection.
pub const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 64;

/// A protocol handler: receives each negotiated inbound stream together
/// with its connection.
pub type StreamHandlerFn = Arc<
    dyn Fn(Stream, Arc<Connection>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Per-protocol registration options.
#[derive(Clone, Copy, Debug)]
pub struct StreamHandlerOptions {
    pub max_inbound_streams: usize,
    pub max_outbound_streams: usize,
    /// Allow this protocol on data/duration-limited connections.
    pub run_on_transient_connection: bool,
}

impl Default for StreamHandlerOptions {
    fn default() -> Self {
        Self {
            max_inbound_streams: DEFAULT_MAX_INBOUND_STREAMS,
            max_outbound_streams: DEFAULT_MAX_OUTBOUND_STREAMS,
            run_on_transient_connection: false,
        }
    }
}

/// A subscription for connect/disconnect notifications about peers that
/// support a protocol.
#[derive(Clone, Default)]
pub struct Topology {
    pub on_connect: Option<Arc<dyn Fn(PeerId, Arc<Connection>) + Send + Sync>>,
    pub on_disconnect: Option<Arc<dyn Fn(PeerId) + Send + Sync>>,
    /// Also notify for transient connections.
    pub notify_on_transient: bool,
}

struct RegisteredHandler {
    handler: StreamHandlerFn,
    options: StreamHandlerOptions,
}

#[derive(Default)]
struct Counts {
    /// (connection id, protocol, direction) → live stream count.
    streams: HashMap<(u64, String, Direction), usize>,
    /// Connection id → remote peer, for notifications after streams end.
    peers: HashMap<u64, PeerId>,
}

/// The per-node protocol registry.
pub struct Registrar {
    local_peer: PeerId,
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
    topologies: RwLock<HashMap<String, Vec<(u64, Topology)>>>,
    next_subscription: AtomicU64,
    counts: Mutex<Counts>,
    stream_end_tx: mpsc::UnboundedSender<StreamEnd>,
    events: EventBus,
}

impl Registrar {
    pub fn new(local_peer: PeerId, events: EventBus) -> Arc<Self> {
        let (stream_end_tx, stream_end_rx) = mpsc::unbounded_channel();
        let registrar = Arc::new(Self {
            local_peer,
            handlers: RwLock::new(HashMap::new()),
            topologies: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            counts: Mutex::new(Counts::default()),
            stream_end_tx,
            events,
        });
        tokio::spawn(stream_end_loop(Arc::downgrade(&registrar), stream_end_rx));
        registrar
    }

    // ------------------------------------------------------------------------
    // Handler registry
    // ------------------------------------------------------------------------

    /// Register (or replace) the handler for `protocol`.
    pub async fn handle(
        &self,
        protocol: &str,
        handler: StreamHandlerFn,
        options: StreamHandlerOptions,
    ) {
        self.handlers
            .write()
            .await
            .insert(protocol.to_string(), RegisteredHandler { handler, options });
        debug!(protocol, "registered protocol handler");
        self.events.emit(NodeEvent::SelfPeerUpdate { peer: self.local_peer.clone() });
    }

    /// Remove the handler for `protocol`. Idempotent.
    pub async fn unhandle(&self, protocol: &str) {
        if self.handlers.write().await.remove(protocol).is_some() {
            debug!(protocol, "removed protocol handler");
            self.events.emit(NodeEvent::SelfPeerUpdate { peer: self.local_peer.clone() });
        }
    }

    pub async fn has_handler(&self, protocol: &str) -> bool {
        self.handlers.read().await.contains_key(protocol)
    }

    /// Currently supported protocols, sorted and deduplicated.
    pub async fn get_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        protocols.sort();
        protocols.dedup();
        protocols
    }

    // ------------------------------------------------------------------------
    // Topologies
    // ------------------------------------------------------------------------

    /// Subscribe to connect/disconnect notifications for peers supporting
    /// `protocol`. Returns the subscription id for [`Registrar::unregister`].
    pub async fn register(&self, protocol: &str, topology: Topology) -> u64 {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.topologies
            .write()
            .await
            .entry(protocol.to_string())
            .or_default()
            .push((id, topology));
        id
    }

    /// Drop a topology subscription. Idempotent.
    pub async fn unregister(&self, id: u64) {
        let mut topologies = self.topologies.write().await;
        for subs in topologies.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        topologies.retain(|_, subs| !subs.is_empty());
    }

    // ------------------------------------------------------------------------
    // Stream dispatch
    // ------------------------------------------------------------------------

    /// Negotiate and dispatch one inbound stream. Called by the connection
    /// manager for every stream the muxer accepts.
    pub async fn on_inbound_stream(self: &Arc<Self>, connection: Arc<Connection>, mut stream: Stream) {
        let supported = self.get_protocols().await;
        let protocol = match select::handle(&mut stream, &supported).await {
            Ok(protocol) => protocol,
            Err(e) => {
                trace!(error = %e, "inbound stream negotiation failed");
                stream.reset();
                return;
            }
        };

        let (handler, options) = {
            let handlers = self.handlers.read().await;
            match handlers.get(&protocol) {
                Some(entry) => (entry.handler.clone(), entry.options),
                None => {
                    stream.reset();
                    return;
                }
            }
        };

        if connection.is_transient() && !options.run_on_transient_connection {
            debug!(
                protocol = %protocol,
                peer = %connection.remote_peer().short(),
                "refusing protocol on transient connection"
            );
            stream.reset();
            return;
        }

        // Cap check and count increment are one critical section, so racing
        // streams cannot both slip under the cap.
        {
            let mut counts = self.counts.lock().await;
            let key = (connection.id(), protocol.clone(), Direction::Inbound);
            let current = counts.streams.get(&key).copied().unwrap_or(0);
            if current >= options.max_inbound_streams {
                drop(counts);
                warn!(
                    protocol = %protocol,
                    peer = %connection.remote_peer().short(),
                    limit = options.max_inbound_streams,
                    "{}", Error::TooManyInboundStreams
                );
                stream.reset();
                return;
            }
            counts.streams.insert(key, current + 1);
            counts.peers.insert(connection.id(), connection.remote_peer().clone());
        }

        stream.set_protocol(&protocol);
        stream.on_end = Some((self.stream_end_tx.clone(), connection.id()));
        trace!(protocol = %protocol, stream = stream.id(), "dispatching inbound stream");
        tokio::spawn(handler(stream, connection));
    }

    /// Enforce outbound caps for a freshly negotiated stream. Called from
    /// [`Connection::new_stream`] after protocol selection.
    pub async fn on_outbound_stream(
        &self,
        connection: &Arc<Connection>,
        stream: &mut Stream,
    ) -> Result<()> {
        let protocol = stream.protocol().ok_or(Error::UnsupportedProtocol)?.to_string();
        let options = {
            let handlers = self.handlers.read().await;
            handlers.get(&protocol).map(|e| e.options).unwrap_or_default()
        };

        if connection.is_transient() && !options.run_on_transient_connection {
            return Err(Error::TransientConnection);
        }

        let mut counts = self.counts.lock().await;
        let key = (connection.id(), protocol, Direction::Outbound);
        let current = counts.streams.get(&key).copied().unwrap_or(0);
        if current >= options.max_outbound_streams {
            return Err(Error::TooManyOutboundStreams);
        }
        counts.streams.insert(key, current + 1);
        counts.peers.insert(connection.id(), connection.remote_peer().clone());
        drop(counts);

        stream.on_end = Some((self.stream_end_tx.clone(), connection.id()));
        Ok(())
    }

    /// Drop all bookkeeping for a closed connection and notify topologies
    /// for every protocol the peer had live streams on.
    pub fn on_connection_closed(self: &Arc<Self>, connection: &Arc<Connection>) {
        let registrar = self.clone();
        let connection_id = connection.id();
        let peer = connection.remote_peer().clone();
        tokio::spawn(async move {
            let protocols: Vec<String> = {
                let mut counts = registrar.counts.lock().await;
                counts.peers.remove(&connection_id);
                let mut protocols: Vec<String> = counts
                    .streams
                    .keys()
                    .filter(|(conn, _, _)| *conn == connection_id)
                    .map(|(_, protocol, _)| protocol.clone())
                    .collect();
                counts.streams.retain(|(conn, _, _), _| *conn != connection_id);
                // Both directions may carry the same protocol; notify once.
                protocols.sort();
                protocols.dedup();
                protocols
            };
            for protocol in protocols {
                registrar.notify_disconnect(&protocol, &peer).await;
            }
        });
    }

    /// Apply an identify-driven protocol delta for a peer: newly advertised
    /// protocols fire `on_connect`, withdrawn ones fire `on_disconnect`.
    pub async fn on_peer_protocols_update(
        &self,
        peer: &PeerId,
        connection: &Arc<Connection>,
        added: &[String],
        removed: &[String],
    ) {
        for protocol in added {
            let topologies = self.topologies.read().await;
            if let Some(subs) = topologies.get(protocol) {
                for (_, topology) in subs {
                    if connection.is_transient() && !topology.notify_on_transient {
                        continue;
                    }
                    if let Some(on_connect) = &topology.on_connect {
                        on_connect(peer.clone(), connection.clone());
                    }
                }
            }
        }
        for protocol in removed {
            self.notify_disconnect(protocol, peer).await;
        }
    }

    async fn notify_disconnect(&self, protocol: &str, peer: &PeerId) {
        let topologies = self.topologies.read().await;
        if let Some(subs) = topologies.get(protocol) {
            for (_, topology) in subs {
                if let Some(on_disconnect) = &topology.on_disconnect {
                    on_disconnect(peer.clone());
                }
            }
        }
    }

    /// Live stream count for one (connection, protocol, direction).
    pub async fn stream_count(
        &self,
        connection_id: u64,
        protocol: &str,
        direction: Direction,
    ) -> usize {
        self.counts
            .lock()
            .await
            .streams
            .get(&(connection_id, protocol.to_string(), direction))
            .copied()
            .unwrap_or(0)
    }
}

/// Drains stream-end notifications: decrements counts and fires topology
/// `on_disconnect` once a peer has no stream left for a protocol on a
/// connection.
async fn stream_end_loop(
    registrar: Weak<Registrar>,
    mut stream_end_rx: mpsc::UnboundedReceiver<StreamEnd>,
) {
    while let Some(end) = stream_end_rx.recv().await {
        let Some(registrar) = registrar.upgrade() else { return };
        let peer = {
            let mut counts = registrar.counts.lock().await;
            let key = (end.connection_id, end.protocol.clone(), end.direction);
            if let Some(count) = counts.streams.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.streams.remove(&key);
                }
            }
            let any_left = counts
                .streams
                .keys()
                .any(|(conn, protocol, _)| *conn == end.connection_id && *protocol == end.protocol);
            if any_left {
                None
            } else {
                counts.peers.get(&end.connection_id).cloned()
            }
        };
        if let Some(peer) = peer {
            registrar.notify_disconnect(&end.protocol, &peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn registrar() -> Arc<Registrar> {
        Registrar::new(Keypair::generate().peer_id(), EventBus::new())
    }

    fn noop_handler() -> StreamHandlerFn {
        Arc::new(|_stream, _conn| Box::pin(async {}))
    }

    #[tokio::test]
    async fn protocols_are_sorted_and_deduplicated() {
        let registrar = registrar();
        registrar.handle("/b/1.0.0", noop_handler(), Default::default()).await;
        registrar.handle("/a/1.0.0", noop_handler(), Default::default()).await;
        // Replacing is idempotent for the protocol list.
        registrar.handle("/a/1.0.0", noop_handler(), Default::default()).await;

        assert_eq!(registrar.get_protocols().await, vec!["/a/1.0.0", "/b/1.0.0"]);

        registrar.unhandle("/a/1.0.0").await;
        assert_eq!(registrar.get_protocols().await, vec!["/b/1.0.0"]);
    }

    #[tokio::test]
    async fn handle_and_unhandle_emit_self_update() {
        let events = EventBus::new();
        let registrar = Registrar::new(Keypair::generate().peer_id(), events.clone());
        let mut rx = events.subscribe();

        registrar.handle("/x/1.0.0", noop_handler(), Default::default()).await;
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::SelfPeerUpdate { .. }));

        registrar.unhandle("/x/1.0.0").await;
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::SelfPeerUpdate { .. }));

        // Removing an absent protocol must not emit.
        registrar.unhandle("/x/1.0.0").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn topology_register_unregister() {
        let registrar = registrar();
        let connected = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let connected_in_cb = connected.clone();

        let id = registrar
            .register(
                "/x/1.0.0",
                Topology {
                    on_connect: Some(Arc::new(move |_, _| {
                        connected_in_cb.fetch_add(1, Ordering::SeqCst);
                    })),
                    ..Default::default()
                },
            )
            .await;
        assert!(id > 0);
        registrar.unregister(id).await;
        registrar.unregister(id).await; // idempotent
        assert!(registrar.topologies.read().await.is_empty());
    }
}
