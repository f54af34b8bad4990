//! # Transports
//!
//! The transport layer turns multiaddresses into raw byte streams. Concrete
//! transports (TCP, QUIC, WebSocket) live outside this crate; what lives
//! here is:
//!
//! - the [`Transport`] / [`TransportListener`] contracts
//! - the [`TransportManager`], which owns registered transports and
//!   dispatches each dial or listen to the transport claiming the address
//! - the [`MemoryTransport`], an in-process transport over a shared
//!   [`MemoryHub`], used by the test harness and any embedded deployments
//!
//! ## Address dispatch
//!
//! Each transport answers [`Transport::can_dial`] for addresses it
//! understands; the manager walks its transports in registration order and
//! uses the first match. Listen addresses work the same way.
//!
//! ## Memory addresses
//!
//! `/memory/<name>` addresses resolve within one [`MemoryHub`]. Hubs are
//! plain values shared by construction; there is no process-global address
//! table, so two independent node clusters in one process never collide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::multiaddr::{Multiaddr, Protocol};
use crate::signal::AbortSignal;

/// Object-safe alias for anything readable and writable.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// A boxed raw byte stream.
pub type BoxedIo = Box<dyn IoStream>;

/// Queued inbound connections per manager before accept loops suspend.
const INBOUND_QUEUE_DEPTH: usize = 32;

/// Buffer capacity of each in-memory connection.
const MEMORY_CONNECTION_BUFFER: usize = 1024 * 1024;

/// A freshly dialed or accepted connection, before upgrade.
pub struct RawConnection {
    pub io: BoxedIo,
    /// Address of the remote end.
    pub remote_addr: Multiaddr,
    /// True for data- or duration-limited connections (e.g. relayed).
    pub transient: bool,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .field("transient", &self.transient)
            .finish()
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// A way of reaching peers: dials addresses and accepts inbound connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and protocol selection.
    fn tag(&self) -> &'static str;

    /// Whether this transport understands `addr`.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Open a connection to `addr`. Must abandon the attempt and release
    /// resources when `signal` fires.
    async fn dial(&self, addr: &Multiaddr, signal: &AbortSignal) -> Result<RawConnection>;

    /// Bind to `addr` and start accepting.
    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn TransportListener>>;
}

/// An open listener yielding raw inbound connections.
#[async_trait]
pub trait TransportListener: Send {
    /// Wait for the next inbound connection.
    ///
    /// # Errors
    /// `ErrConnectionClosed` once the listener shuts down.
    async fn accept(&mut self) -> Result<RawConnection>;

    /// The bound address (with wildcard parts resolved).
    fn local_addr(&self) -> Multiaddr;
}

// ============================================================================
// TransportManager
// ============================================================================

struct ActiveListener {
    addr: Multiaddr,
    task: JoinHandle<()>,
}

/// Owns the node's transports, its live listeners, and the shared inbound
/// queue the node drains.
pub struct TransportManager {
    transports: Vec<Arc<dyn Transport>>,
    listeners: Mutex<Vec<ActiveListener>>,
    inbound_tx: mpsc::Sender<RawConnection>,
    /// Takeable exactly once by the accept loop owner.
    inbound_rx: Mutex<Option<mpsc::Receiver<RawConnection>>>,
    events: EventBus,
}

impl TransportManager {
    pub fn new(transports: Vec<Arc<dyn Transport>>, events: EventBus) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Self {
            transports,
            listeners: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events,
        }
    }

    /// The transport claiming `addr`, if any.
    pub fn transport_for(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.can_dial(addr)).cloned()
    }

    /// Dial `addr` through whichever transport claims it.
    pub async fn dial(&self, addr: &Multiaddr, signal: &AbortSignal) -> Result<RawConnection> {
        let transport = self
            .transport_for(addr)
            .ok_or_else(|| Error::transport_dial(format!("no transport for {addr}")))?;
        debug!(addr = %addr, transport = transport.tag(), "dialing");
        transport.dial(addr, signal).await
    }

    /// Bind a listener on `addr` and start feeding the inbound queue.
    /// Returns the resolved listen address.
    pub async fn listen_on(&self, addr: &Multiaddr) -> Result<Multiaddr> {
        let transport = self
            .transport_for(addr)
            .ok_or_else(|| Error::transport_dial(format!("no transport for {addr}")))?;
        let mut listener = transport.listen(addr).await?;
        let local = listener.local_addr();
        info!(addr = %local, transport = transport.tag(), "listening");

        let inbound_tx = self.inbound_tx.clone();
        let task_addr = local.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(raw) => {
                        if inbound_tx.send(raw).await.is_err() {
                            return; // node stopped draining
                        }
                    }
                    Err(e) => {
                        if !matches!(e, Error::ConnectionClosed) {
                            warn!(addr = %task_addr, error = %e, "listener accept failed");
                        }
                        return;
                    }
                }
            }
        });

        self.listeners.lock().await.push(ActiveListener { addr: local.clone(), task });
        self.events.emit(NodeEvent::TransportListening { addrs: vec![local.clone()] });
        Ok(local)
    }

    /// Addresses currently bound by transports.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listeners.lock().await.iter().map(|l| l.addr.clone()).collect()
    }

    /// Take the inbound queue. Only one caller gets it.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<RawConnection>> {
        self.inbound_rx.lock().await.take()
    }

    /// Stop all listeners.
    pub async fn close(&self) {
        let mut listeners = self.listeners.lock().await;
        if listeners.is_empty() {
            return;
        }
        let addrs: Vec<Multiaddr> = listeners.iter().map(|l| l.addr.clone()).collect();
        for listener in listeners.drain(..) {
            listener.task.abort();
        }
        self.events.emit(NodeEvent::TransportClose { addrs });
    }
}

// ============================================================================
// Memory transport
// ============================================================================

/// In-process address table connecting [`MemoryTransport`] instances.
/// Share one hub between the transports that should be able to reach each
/// other.
#[derive(Default)]
pub struct MemoryHub {
    registry: RwLock<HashMap<String, mpsc::Sender<RawConnection>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Counter for synthetic dialer-side addresses, unique per transport.
static DIAL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Transport over in-process pipes. `/memory/<name>` addresses resolve
/// within the hub the transport was built with.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    fn memory_name(addr: &Multiaddr) -> Option<String> {
        match addr.iter().next() {
            Some(Protocol::Memory(name)) => Some(name.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn tag(&self) -> &'static str {
        "memory"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        Self::memory_name(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr, signal: &AbortSignal) -> Result<RawConnection> {
        let name = Self::memory_name(addr)
            .ok_or_else(|| Error::transport_dial(format!("not a memory address: {addr}")))?;

        let accept_tx = {
            let registry = self.hub.registry.read().await;
            registry
                .get(&name)
                .cloned()
                .ok_or_else(|| Error::transport_dial(format!("no listener at /memory/{name}")))?
        };

        let (near, far) = tokio::io::duplex(MEMORY_CONNECTION_BUFFER);
        let dialer_addr: Multiaddr = Protocol::Memory(format!(
            "dial-{}",
            DIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
        .into();

        let delivery = accept_tx.send(RawConnection {
            io: Box::new(far),
            remote_addr: dialer_addr,
            transient: false,
        });
        tokio::select! {
            sent = delivery => {
                sent.map_err(|_| Error::transport_dial(format!("listener at /memory/{name} is gone")))?;
            }
            _ = signal.aborted() => {
                return Err(if signal.deadline_elapsed() { Error::Timeout } else { Error::Aborted });
            }
        }

        let remote_addr = addr.decapsulate("p2p");
        Ok(RawConnection { io: Box::new(near), remote_addr, transient: false })
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn TransportListener>> {
        let requested = Self::memory_name(addr)
            .ok_or_else(|| Error::invalid_parameters(format!("not a memory address: {addr}")))?;
        // "/memory/0" asks for an unused name, like binding TCP port zero.
        let name = if requested == "0" {
            format!("{:016x}", rand::random::<u64>())
        } else {
            requested
        };

        let (accept_tx, accept_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        {
            let mut registry = self.hub.registry.write().await;
            if registry.contains_key(&name) {
                return Err(Error::invalid_parameters(format!(
                    "/memory/{name} is already bound"
                )));
            }
            registry.insert(name.clone(), accept_tx);
        }

        Ok(Box::new(MemoryListener {
            local: Protocol::Memory(name.clone()).into(),
            name,
            hub: self.hub.clone(),
            accept_rx,
        }))
    }
}

struct MemoryListener {
    local: Multiaddr,
    name: String,
    hub: Arc<MemoryHub>,
    accept_rx: mpsc::Receiver<RawConnection>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&mut self) -> Result<RawConnection> {
        self.accept_rx.recv().await.ok_or(Error::ConnectionClosed)
    }

    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        // Deregister synchronously when uncontended so the name is
        // immediately reusable; fall back to a task otherwise.
        match self.hub.registry.try_write() {
            Ok(mut registry) => {
                registry.remove(&name);
            }
            Err(_) => {
                let hub = self.hub.clone();
                tokio::spawn(async move {
                    hub.registry.write().await.remove(&name);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_listener_on_same_hub() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let addr: Multiaddr = "/memory/alpha".parse().unwrap();

        let mut listener = transport.listen(&addr).await.unwrap();
        assert_eq!(listener.local_addr(), addr);

        let mut dialed = transport.dial(&addr, &AbortSignal::never()).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        dialed.io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn separate_hubs_do_not_see_each_other() {
        let a = MemoryTransport::new(MemoryHub::new());
        let b = MemoryTransport::new(MemoryHub::new());
        let addr: Multiaddr = "/memory/alpha".parse().unwrap();

        let _listener = a.listen(&addr).await.unwrap();
        let err = b.dial(&addr, &AbortSignal::never()).await.unwrap_err();
        assert_eq!(err.code(), "ErrTransportDialFailed");
    }

    #[tokio::test]
    async fn listen_on_zero_allocates_a_fresh_name() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub);
        let zero: Multiaddr = "/memory/0".parse().unwrap();

        let a = transport.listen(&zero).await.unwrap();
        let b = transport.listen(&zero).await.unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let addr: Multiaddr = "/memory/taken".parse().unwrap();
        let _first = transport.listen(&addr).await.unwrap();
        assert!(transport.listen(&addr).await.is_err());
    }

    #[tokio::test]
    async fn dial_strips_peer_suffix_for_lookup() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub);
        let addr: Multiaddr = "/memory/beta".parse().unwrap();
        let mut listener = transport.listen(&addr).await.unwrap();

        let peer = crate::identity::Keypair::generate().peer_id();
        let with_peer = addr.with_peer_id(&peer).unwrap();
        let dialed = transport.dial(&with_peer, &AbortSignal::never()).await.unwrap();
        assert_eq!(dialed.remote_addr, addr);
        let _ = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn manager_dispatches_and_tracks_listeners() {
        let hub = MemoryHub::new();
        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let manager = TransportManager::new(
            vec![Arc::new(MemoryTransport::new(hub)) as Arc<dyn Transport>],
            events,
        );

        let local = manager.listen_on(&"/memory/gamma".parse().unwrap()).await.unwrap();
        assert_eq!(manager.listen_addrs().await, vec![local.clone()]);
        match event_rx.recv().await.unwrap() {
            NodeEvent::TransportListening { addrs } => assert_eq!(addrs, vec![local.clone()]),
            other => panic!("unexpected event {other:?}"),
        }

        // Dials through the manager reach the listener's inbound queue.
        let mut inbound = manager.take_inbound().await.expect("first take succeeds");
        assert!(manager.take_inbound().await.is_none(), "queue is take-once");

        let _conn = manager.dial(&local, &AbortSignal::never()).await.unwrap();
        let accepted = tokio::time::timeout(std::time::Duration::from_secs(1), inbound.recv())
            .await
            .expect("accept within deadline")
            .expect("connection delivered");
        assert!(!accepted.transient);

        manager.close().await;
        match event_rx.recv().await.unwrap() {
            NodeEvent::TransportClose { addrs } => assert_eq!(addrs, vec![local]),
            other => panic!("unexpected event {other:?}"),
        }

        // Unsupported addresses are rejected.
        let err = manager
            .dial(&"/ip4/127.0.0.1/tcp/1".parse().unwrap(), &AbortSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ErrTransportDialFailed");
    }
}
