//! # Connections
//!
//! A [`Connection`] is the authenticated, multiplexed handle produced by the
//! upgrader: bound to exactly one remote peer, carrying the negotiated
//! security and muxer labels, and able to open protocol streams.
//!
//! ## Lifecycle
//!
//! Created `open` on successful upgrade. [`Connection::close`] gracefully
//! closes all streams and then the underlying resource; [`Connection::abort`]
//! is immediate and best-effort. Both are idempotent and end in the terminal
//! `closed` state, emitting exactly one `connection:close` event.
//!
//! ## Ownership
//!
//! Connections are jointly referenced by the connection manager (for
//! lifecycle and pruning) and by any task holding them; streams are owned by
//! whoever opened or accepted them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use tracing::debug;

use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{now_ms, PeerId};
use crate::multiaddr::Multiaddr;
use crate::muxing::{Stream, StreamMuxer};
use crate::registrar::Registrar;
use crate::select;
use crate::signal::AbortSignal;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Who initiated the connection (or opened the stream).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

/// Millisecond timestamps of lifecycle transitions.
#[derive(Clone, Copy, Debug)]
pub struct Timeline {
    pub open: u64,
    pub close: Option<u64>,
}

/// An authenticated, multiplexed connection to one remote peer.
pub struct Connection {
    id: u64,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    status: RwLock<ConnectionStatus>,
    timeline: RwLock<Timeline>,
    /// Security protocol label negotiated during upgrade.
    encryption: String,
    /// Muxer protocol label negotiated during upgrade.
    multiplexer: String,
    /// Data- or duration-limited (e.g. relayed). Protocols must opt in to
    /// run over transient connections.
    transient: bool,
    muxer: Arc<dyn StreamMuxer>,
    events: EventBus,
    /// Wired by the connection manager when the connection is accepted.
    registrar: OnceLock<Weak<Registrar>>,
    close_emitted: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        direction: Direction,
        encryption: String,
        multiplexer: String,
        transient: bool,
        muxer: Arc<dyn StreamMuxer>,
        events: EventBus,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_peer,
            remote_addr,
            direction,
            status: RwLock::new(ConnectionStatus::Open),
            timeline: RwLock::new(Timeline { open: now_ms(), close: None }),
            encryption,
            multiplexer,
            transient,
            muxer,
            events,
            registrar: OnceLock::new(),
            close_emitted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("status lock poisoned")
    }

    pub fn timeline(&self) -> Timeline {
        *self.timeline.read().expect("timeline lock poisoned")
    }

    /// Security protocol this connection was encrypted with.
    pub fn encryption(&self) -> &str {
        &self.encryption
    }

    /// Stream multiplexer this connection runs.
    pub fn multiplexer(&self) -> &str {
        &self.multiplexer
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Ids of streams currently open on this connection.
    pub fn streams(&self) -> Vec<u32> {
        self.muxer.stream_ids()
    }

    pub(crate) fn muxer(&self) -> &Arc<dyn StreamMuxer> {
        &self.muxer
    }

    pub(crate) fn set_registrar(&self, registrar: Weak<Registrar>) {
        let _ = self.registrar.set(registrar);
    }

    fn registrar(&self) -> Option<Arc<Registrar>> {
        self.registrar.get().and_then(Weak::upgrade)
    }

    /// Open a stream and negotiate one of `protocols` over it.
    ///
    /// The registrar's outbound cap for the negotiated protocol is enforced
    /// here; a stream that would exceed it is reset before the error is
    /// returned. Protocols that did not opt in to transient connections are
    /// refused on transient connections.
    pub async fn new_stream(
        self: &Arc<Self>,
        protocols: &[String],
        signal: &AbortSignal,
    ) -> Result<Stream> {
        if self.status() != ConnectionStatus::Open {
            return Err(Error::ConnectionClosed);
        }
        let mut stream = self.muxer.open_stream().await?;
        let chosen = match select::select(&mut stream, protocols, signal).await {
            Ok(chosen) => chosen,
            Err(e) => {
                stream.reset();
                return Err(e);
            }
        };
        stream.set_protocol(&chosen);

        if let Some(registrar) = self.registrar() {
            if let Err(e) = registrar.on_outbound_stream(self, &mut stream).await {
                stream.reset();
                return Err(e);
            }
        }
        Ok(stream)
    }

    fn emit_close(self: &Arc<Self>) {
        if !self.close_emitted.swap(true, Ordering::AcqRel) {
            if let Some(registrar) = self.registrar() {
                registrar.on_connection_closed(self);
            }
            self.events.emit(NodeEvent::ConnectionClose(self.clone()));
        }
    }

    /// Gracefully close all streams, then the underlying resource.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut status = self.status.write().expect("status lock poisoned");
            if *status != ConnectionStatus::Open {
                return;
            }
            *status = ConnectionStatus::Closing;
        }
        debug!(peer = %self.remote_peer.short(), conn = self.id, "closing connection");
        self.muxer.close().await;
        {
            let mut status = self.status.write().expect("status lock poisoned");
            *status = ConnectionStatus::Closed;
        }
        self.timeline.write().expect("timeline lock poisoned").close = Some(now_ms());
        self.emit_close();
    }

    /// Immediate, best-effort teardown. Streams observe resets.
    pub fn abort(self: &Arc<Self>) {
        {
            let mut status = self.status.write().expect("status lock poisoned");
            if *status == ConnectionStatus::Closed {
                return;
            }
            *status = ConnectionStatus::Closed;
        }
        debug!(peer = %self.remote_peer.short(), conn = self.id, "aborting connection");
        self.muxer.abort();
        self.timeline.write().expect("timeline lock poisoned").close = Some(now_ms());
        self.emit_close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.remote_peer.short())
            .field("addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("transient", &self.transient)
            .finish()
    }
}
