//! # High-Level Node API
//!
//! This module provides the main entry point for using Lattica. A [`Node`]
//! combines all the underlying components into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let node = Node::builder()
//!     .listen_on("/memory/0".parse()?)
//!     .transport(Arc::new(MemoryTransport::new(hub)))
//!     .plaintext_security()
//!     .muxer(Arc::new(FramedMuxerFactory::new()))
//!     .build()?;
//! node.start().await?;
//!
//! // Serve a protocol and dial a peer.
//! node.handle("/echo/1.0.0", |stream, _conn| async move { /* ... */ }, Default::default()).await;
//! let conn = node.dial(remote_addr, Default::default()).await?;
//! let rtt = node.ping(conn.remote_peer(), &AbortSignal::never()).await?;
//! ```
//!
//! ## Component Integration
//!
//! The Node orchestrates these components:
//! - **TransportManager**: owns transports and listeners
//! - **Upgrader**: security and muxer negotiation on every connection
//! - **Registrar**: protocol handlers, caps, topology notifications
//! - **DialQueue** / **ConnectionManager**: outbound dials and inventory
//! - **IdentifyService** / **PeerStore** / **AddressManager**: peer knowledge
//!
//! Construction is two-phase: components are allocated, then wired through
//! weak back-references, so the natural reference cycles (connection manager
//! ↔ dial queue, identify ↔ connection manager) never leak.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::address_manager::{AddressManager, AnnounceFilter, DEFAULT_MAX_OBSERVED_ADDRESSES};
use crate::connection::Connection;
use crate::connection_manager::{ConnectionLimits, ConnectionManager};
use crate::dial::{AddrResolver, DialOptions, DialQueue, DialQueueConfig, DialTarget};
use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::gater::{AllowAllGater, ConnectionGater};
use crate::identify::{IdentifyConfig, IdentifyService};
use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::muxing::{Stream, StreamMuxerFactory};
use crate::peer_store::{Datastore, MemoryDatastore, PeerStore};
use crate::ping;
use crate::registrar::{Registrar, StreamHandlerOptions, Topology};
use crate::security::{ConnectionSecurity, PlaintextSecurity, Protector};
use crate::signal::{AbortHandle, AbortSignal};
use crate::transport::{Transport, TransportManager};
use crate::upgrader::{Upgrader, UpgraderConfig};

/// Default bound on graceful shutdown.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Deferred security construction: runs against the node's keypair at
/// build time.
type SecurityFactory = Box<dyn FnOnce(&Keypair) -> Arc<dyn ConnectionSecurity> + Send>;

// ============================================================================
// Builder
// ============================================================================

/// Configures and builds a [`Node`].
pub struct NodeBuilder {
    keypair: Option<Keypair>,
    listen_addrs: Vec<Multiaddr>,
    announce_addrs: Vec<Multiaddr>,
    announce_filter: Option<AnnounceFilter>,
    transports: Vec<Arc<dyn Transport>>,
    securities: Vec<SecurityFactory>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    gater: Option<Arc<dyn ConnectionGater>>,
    protector: Option<Arc<dyn Protector>>,
    datastore: Option<Arc<dyn Datastore>>,
    resolvers: HashMap<String, Arc<dyn AddrResolver>>,
    dial_config: DialQueueConfig,
    limits: ConnectionLimits,
    upgrader_config: UpgraderConfig,
    identify_config: IdentifyConfig,
    max_observed_addresses: usize,
    stop_timeout: Duration,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            keypair: None,
            listen_addrs: Vec::new(),
            announce_addrs: Vec::new(),
            announce_filter: None,
            transports: Vec::new(),
            securities: Vec::new(),
            muxers: Vec::new(),
            gater: None,
            protector: None,
            datastore: None,
            resolvers: HashMap::new(),
            dial_config: DialQueueConfig::default(),
            limits: ConnectionLimits::default(),
            upgrader_config: UpgraderConfig::default(),
            identify_config: IdentifyConfig::default(),
            max_observed_addresses: DEFAULT_MAX_OBSERVED_ADDRESSES,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl NodeBuilder {
    /// Use an existing keypair instead of generating a fresh one.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Add a listen address. May be called repeatedly.
    pub fn listen_on(mut self, addr: Multiaddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    /// Add an announce override address.
    pub fn announce(mut self, addr: Multiaddr) -> Self {
        self.announce_addrs.push(addr);
        self
    }

    /// Filter applied to the advertised address set.
    pub fn announce_filter(mut self, filter: AnnounceFilter) -> Self {
        self.announce_filter = Some(filter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Add a security method built against the node's keypair.
    pub fn security<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&Keypair) -> Arc<dyn ConnectionSecurity> + Send + 'static,
    {
        self.securities.push(Box::new(factory));
        self
    }

    /// Shorthand for the identity-exchange security method.
    pub fn plaintext_security(self) -> Self {
        self.security(|keypair| Arc::new(PlaintextSecurity::new(keypair.clone())))
    }

    pub fn muxer(mut self, muxer: Arc<dyn StreamMuxerFactory>) -> Self {
        self.muxers.push(muxer);
        self
    }

    pub fn gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = Some(gater);
        self
    }

    /// Pre-protection transform for private networks.
    pub fn protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Backing datastore for the peer store. Defaults to in-memory.
    pub fn datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Register a resolver for an address scheme (e.g. `dnsaddr`).
    pub fn resolver(mut self, scheme: &str, resolver: Arc<dyn AddrResolver>) -> Self {
        self.resolvers.insert(scheme.to_string(), resolver);
        self
    }

    pub fn dial_config(mut self, config: DialQueueConfig) -> Self {
        self.dial_config = config;
        self
    }

    pub fn connection_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn upgrader_config(mut self, config: UpgraderConfig) -> Self {
        self.upgrader_config = config;
        self
    }

    pub fn identify_config(mut self, config: IdentifyConfig) -> Self {
        self.identify_config = config;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Cap on tracked observed self-addresses.
    pub fn max_observed_addresses(mut self, cap: usize) -> Self {
        self.max_observed_addresses = cap;
        self
    }

    /// Allocate and wire all components.
    ///
    /// # Errors
    /// `ErrTransportsRequired` without a transport,
    /// `ErrConnEncryptionRequired` without a security method,
    /// `ErrInvalidParameters` when `max_connections < min_connections`.
    pub fn build(self) -> Result<Node> {
        if self.transports.is_empty() {
            return Err(Error::TransportsRequired);
        }
        if self.securities.is_empty() {
            return Err(Error::ConnEncryptionRequired);
        }
        if self.limits.max_connections < self.limits.min_connections {
            return Err(Error::invalid_parameters(
                "max_connections must be at least min_connections",
            ));
        }

        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let local_peer = keypair.peer_id();
        let (shutdown_handle, shutdown) = AbortSignal::manual();
        let events = EventBus::new();

        // Phase one: allocate.
        let securities: Vec<Arc<dyn ConnectionSecurity>> =
            self.securities.into_iter().map(|f| f(&keypair)).collect();
        let gater = self.gater.unwrap_or_else(|| Arc::new(AllowAllGater::new()));
        let datastore = self.datastore.unwrap_or_else(|| Arc::new(MemoryDatastore::new()));

        let peer_store = Arc::new(PeerStore::new(local_peer.clone(), datastore, events.clone()));
        let transports = Arc::new(TransportManager::new(self.transports, events.clone()));
        let address_manager = AddressManager::new(
            local_peer.clone(),
            transports.clone(),
            peer_store.clone(),
            events.clone(),
            self.announce_addrs,
            self.announce_filter,
            self.max_observed_addresses,
        );
        let registrar = Registrar::new(local_peer.clone(), events.clone());
        let upgrader = Arc::new(Upgrader::new(
            local_peer.clone(),
            securities,
            self.muxers,
            self.protector,
            gater.clone(),
            events.clone(),
            self.upgrader_config,
        ));
        let dial_queue = DialQueue::new(
            local_peer.clone(),
            transports.clone(),
            peer_store.clone(),
            gater,
            upgrader.clone(),
            self.dial_config,
            self.resolvers,
            None,
            shutdown.clone(),
        );
        let identify = IdentifyService::new(
            keypair.clone(),
            registrar.clone(),
            peer_store.clone(),
            address_manager.clone(),
            events.clone(),
            self.identify_config,
        );

        // Phase two: wire the cycles through weak references.
        let connection_manager = ConnectionManager::new(
            dial_queue,
            upgrader,
            peer_store.clone(),
            registrar.clone(),
            events.clone(),
            self.limits,
            shutdown.clone(),
        );
        identify.set_connection_manager(Arc::downgrade(&connection_manager));

        Ok(Node {
            keypair,
            local_peer,
            listen_addrs: self.listen_addrs,
            events,
            peer_store,
            transports,
            address_manager,
            registrar,
            connection_manager,
            identify,
            shutdown_handle,
            shutdown,
            stop_timeout: self.stop_timeout,
            started: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Node
// ============================================================================

/// A running (or startable) peer-to-peer node.
pub struct Node {
    keypair: Keypair,
    local_peer: PeerId,
    listen_addrs: Vec<Multiaddr>,
    events: EventBus,
    peer_store: Arc<PeerStore>,
    transports: Arc<TransportManager>,
    address_manager: Arc<AddressManager>,
    registrar: Arc<Registrar>,
    connection_manager: Arc<ConnectionManager>,
    identify: Arc<IdentifyService>,
    shutdown_handle: AbortHandle,
    shutdown: AbortSignal,
    stop_timeout: Duration,
    started: AtomicBool,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Subscribe to node events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    pub fn address_manager(&self) -> &Arc<AddressManager> {
        &self.address_manager
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    /// Bind listeners, start the background services, and begin accepting.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Services subscribe to the bus before any connection can open, so
        // no connection:open ever goes unobserved.
        ping::register(&self.registrar).await;
        self.identify.start(self.shutdown.clone()).await;
        self.address_manager.start(self.shutdown.clone());
        self.connection_manager.start();

        for addr in &self.listen_addrs {
            self.transports.listen_on(addr).await?;
        }

        // Accept loop: raw inbound connections flow into the connection
        // manager's admission path.
        if let Some(mut inbound) = self.transports.take_inbound().await {
            let manager = self.connection_manager.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let raw = tokio::select! {
                        raw = inbound.recv() => raw,
                        _ = shutdown.aborted() => return,
                    };
                    match raw {
                        Some(raw) => {
                            let manager = manager.clone();
                            tokio::spawn(async move { manager.handle_inbound(raw).await });
                        }
                        None => return,
                    }
                }
            });
        }

        info!(peer = %self.local_peer, "node started");
        Ok(())
    }

    /// Fire the shutdown signal, stop listeners, and close every
    /// connection. Bounded by the configured stop timeout.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.local_peer.short(), "stopping node");
        self.shutdown_handle.abort();
        self.transports.close().await;

        let close_all = self.connection_manager.close_all();
        if tokio::time::timeout(self.stop_timeout, close_all).await.is_err() {
            warn!("graceful close timed out, aborting remaining connections");
            for connection in self.connection_manager.get_connections(None).await {
                connection.abort();
            }
        }
        info!(peer = %self.local_peer.short(), "node stopped");
    }

    /// Addresses transports are bound to.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.transports.listen_addrs().await
    }

    /// The full advertised address set.
    pub async fn addresses(&self) -> Vec<Multiaddr> {
        self.address_manager.get_addresses().await
    }

    // ------------------------------------------------------------------------
    // Dialing
    // ------------------------------------------------------------------------

    /// Dial a peer id or address, reusing an open connection when possible.
    pub async fn dial(
        &self,
        target: impl Into<DialTarget>,
        options: DialOptions,
    ) -> Result<Arc<Connection>> {
        self.connection_manager.open_connection(target, options).await
    }

    /// Close all connections to `peer`.
    pub async fn hang_up(&self, peer: &PeerId) {
        self.connection_manager.close_connections(peer).await;
    }

    /// Open a stream to `peer` negotiating one of `protocols`, dialing if
    /// necessary.
    pub async fn dial_protocol(
        &self,
        target: impl Into<DialTarget>,
        protocols: &[String],
        signal: &AbortSignal,
    ) -> Result<Stream> {
        let options = DialOptions { signal: signal.clone(), ..Default::default() };
        let connection = self.dial(target, options).await?;
        connection.new_stream(protocols, signal).await
    }

    /// Current connections, optionally restricted to one peer.
    pub async fn get_connections(&self, peer: Option<&PeerId>) -> Vec<Arc<Connection>> {
        self.connection_manager.get_connections(peer).await
    }

    // ------------------------------------------------------------------------
    // Protocols
    // ------------------------------------------------------------------------

    /// Register a handler for `protocol`. Connected peers learn about it
    /// through an identify push.
    pub async fn handle<F, Fut>(&self, protocol: &str, handler: F, options: StreamHandlerOptions)
    where
        F: Fn(Stream, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registrar
            .handle(protocol, Arc::new(move |stream, conn| Box::pin(handler(stream, conn))), options)
            .await;
    }

    /// Remove the handler for `protocol`.
    pub async fn unhandle(&self, protocol: &str) {
        self.registrar.unhandle(protocol).await;
    }

    /// Protocols this node currently handles.
    pub async fn get_protocols(&self) -> Vec<String> {
        self.registrar.get_protocols().await
    }

    /// Subscribe to connect/disconnect notifications for peers supporting
    /// `protocol`.
    pub async fn register(&self, protocol: &str, topology: Topology) -> u64 {
        self.registrar.register(protocol, topology).await
    }

    pub async fn unregister(&self, id: u64) {
        self.registrar.unregister(id).await;
    }

    // ------------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------------

    /// Ping `peer` once, dialing if necessary. Returns the round-trip time.
    pub async fn ping(&self, peer: &PeerId, signal: &AbortSignal) -> Result<Duration> {
        let options = DialOptions { signal: signal.clone(), ..Default::default() };
        let connection = self.dial(peer.clone(), options).await?;
        ping::ping(&connection, signal).await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer", &self.local_peer.short())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
