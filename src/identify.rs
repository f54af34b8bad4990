//! # Identify
//!
//! In-band peer introduction. Two sub-protocols, negotiated per stream:
//!
//! - **Identify** (`/ipfs/id/1.0.0`): request-response. The requester opens
//!   a stream; the responder writes one length-prefixed message built from
//!   its registrar and address-manager state and closes.
//! - **Identify Push** (`/ipfs/id/push/1.0.0`): one-shot push. Whenever this
//!   node's own state changes (`self:peer:update`), it pushes a fresh
//!   message to every connected peer that advertises push support.
//!
//! On every `connection:open` the service runs outbound identify against
//! the new peer, validates the result (public key present and matching the
//! authenticated peer, not our own id, signed record verified and
//! sequence-dominant), merges it into the peer store, feeds the observed
//! address (stripped of its trailing peer id) to the address manager, and
//! emits `peer:identify`.
//!
//! Identify failures are logged and never tear down the connection, with
//! one exception: a peer-id mismatch proves the remote is lying about its
//! identity, and the connection is aborted.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use prost::Message;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::address_manager::AddressManager;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::errors::{Error, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{read_framed, write_framed, IdentifyProto, MAX_IDENTIFY_MESSAGE_SIZE};
use crate::multiaddr::Multiaddr;
use crate::muxing::Stream;
use crate::peer_store::{
    PeerStore, PeerUpdate, METADATA_AGENT_VERSION, METADATA_PROTOCOL_VERSION,
};
use crate::record::PeerRecord;
use crate::registrar::{Registrar, StreamHandlerOptions};
use crate::signal::AbortSignal;

/// Identify request-response protocol id.
pub const PROTOCOL_IDENTIFY: &str = "/ipfs/id/1.0.0";

/// Identify push protocol id.
pub const PROTOCOL_IDENTIFY_PUSH: &str = "/ipfs/id/push/1.0.0";

/// Default bound on one identify exchange.
pub const DEFAULT_IDENTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct IdentifyConfig {
    pub timeout: Duration,
    /// Hard cap on an encoded message; over-size is a fatal protocol error.
    pub max_message_size: usize,
    pub protocol_version: String,
    pub agent_version: String,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_IDENTIFY_TIMEOUT,
            max_message_size: MAX_IDENTIFY_MESSAGE_SIZE,
            protocol_version: "lattica/1.0.0".to_string(),
            agent_version: concat!("lattica/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Outcome of one successful identify exchange.
#[derive(Clone, Debug)]
pub struct IdentifyResult {
    pub peer_id: PeerId,
    pub protocol_version: Option<String>,
    pub agent_version: Option<String>,
    pub protocols: Vec<String>,
    pub listen_addrs: Vec<Multiaddr>,
    pub observed_addr: Option<Multiaddr>,
    /// True when the message carried a signed record that verified.
    pub signed_peer_record: bool,
    pub connection_id: u64,
}

/// The identify service.
pub struct IdentifyService {
    keypair: Keypair,
    local_peer: PeerId,
    registrar: Arc<Registrar>,
    peer_store: Arc<PeerStore>,
    address_manager: Arc<AddressManager>,
    events: EventBus,
    config: IdentifyConfig,
    /// Wired in phase two of node construction.
    connection_manager: OnceLock<Weak<ConnectionManager>>,
}

impl IdentifyService {
    pub fn new(
        keypair: Keypair,
        registrar: Arc<Registrar>,
        peer_store: Arc<PeerStore>,
        address_manager: Arc<AddressManager>,
        events: EventBus,
        config: IdentifyConfig,
    ) -> Arc<Self> {
        let local_peer = keypair.peer_id();
        Arc::new(Self {
            keypair,
            local_peer,
            registrar,
            peer_store,
            address_manager,
            events,
            config,
            connection_manager: OnceLock::new(),
        })
    }

    pub(crate) fn set_connection_manager(&self, manager: Weak<ConnectionManager>) {
        let _ = self.connection_manager.set(manager);
    }

    /// Register both protocol handlers and start reacting to
    /// `connection:open` and `self:peer:update`.
    pub async fn start(self: &Arc<Self>, shutdown: AbortSignal) {
        let options = StreamHandlerOptions { run_on_transient_connection: true, ..Default::default() };

        // Identify responder.
        {
            let weak = Arc::downgrade(self);
            self.registrar
                .handle(
                    PROTOCOL_IDENTIFY,
                    Arc::new(move |stream, conn| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            if let Some(service) = weak.upgrade() {
                                service.respond_identify(stream, conn).await;
                            }
                        })
                    }),
                    options,
                )
                .await;
        }

        // Push receiver.
        {
            let weak = Arc::downgrade(self);
            self.registrar
                .handle(
                    PROTOCOL_IDENTIFY_PUSH,
                    Arc::new(move |stream, conn| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            if let Some(service) = weak.upgrade() {
                                service.receive_push(stream, conn).await;
                            }
                        })
                    }),
                    options,
                )
                .await;
        }

        // Event loop: outbound identify on open, push on self change.
        let weak = Arc::downgrade(self);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.aborted() => return,
                };
                let Some(service) = weak.upgrade() else { return };
                match event {
                    Ok(NodeEvent::ConnectionOpen(conn)) => {
                        tokio::spawn(async move {
                            match service.identify(&conn, &AbortSignal::never()).await {
                                Ok(result) => {
                                    trace!(peer = %result.peer_id.short(), "identify complete");
                                }
                                Err(Error::InvalidPeer { message }) => {
                                    warn!(
                                        peer = %conn.remote_peer().short(),
                                        %message,
                                        "identify proved peer mismatch, aborting connection"
                                    );
                                    conn.abort();
                                }
                                Err(e) => {
                                    debug!(peer = %conn.remote_peer().short(), error = %e, "identify failed");
                                }
                            }
                        });
                    }
                    Ok(NodeEvent::SelfPeerUpdate { .. }) => {
                        tokio::spawn(async move { service.push_to_peers().await });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => return,
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Outbound identify
    // ------------------------------------------------------------------------

    /// Run identify against the remote end of `connection`.
    pub async fn identify(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        signal: &AbortSignal,
    ) -> Result<IdentifyResult> {
        let signal = signal.merge(&AbortSignal::deadline(self.config.timeout));
        let mut stream = connection
            .new_stream(&[PROTOCOL_IDENTIFY.to_string()], &signal)
            .await?;

        let read = async {
            let bytes = read_framed(&mut stream, self.config.max_message_size).await?;
            IdentifyProto::decode(&bytes[..])
                .map_err(|e| Error::invalid_message(format!("identify decode: {e}")))
        };
        let outcome = tokio::select! {
            proto = read => proto,
            _ = signal.aborted() => {
                Err(if signal.deadline_elapsed() { Error::Timeout } else { Error::Aborted })
            }
        };
        let proto = match outcome {
            Ok(proto) => proto,
            Err(e) => {
                stream.reset();
                return Err(e);
            }
        };
        let _ = stream.shutdown().await;
        drop(stream);

        self.consume(connection, proto).await
    }

    /// Validate one identify message against its connection and merge it
    /// into the node's state.
    async fn consume(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        proto: IdentifyProto,
    ) -> Result<IdentifyResult> {
        let remote_peer = connection.remote_peer();

        if proto.public_key.is_empty() {
            return Err(Error::MissingPublicKey);
        }
        let public_key = PublicKey::from_protobuf_encoding(&proto.public_key)?;
        let derived = public_key.to_peer_id();
        if &derived != remote_peer {
            return Err(Error::invalid_peer(format!(
                "identify key derives {} but connection authenticated {}",
                derived.short(),
                remote_peer.short()
            )));
        }
        if derived == self.local_peer {
            return Err(Error::invalid_peer("identify claims our own peer id"));
        }

        let listen_addrs: Vec<Multiaddr> = proto
            .listen_addrs
            .iter()
            .filter_map(|bytes| std::str::from_utf8(bytes).ok())
            .filter_map(|s| s.parse().ok())
            .collect();

        // Signed record: verified and adopted only if it dominates the
        // stored one. An invalid record is logged, not fatal.
        let mut signed_peer_record = false;
        if !proto.signed_peer_record.is_empty() {
            match self
                .peer_store
                .consume_peer_record(&proto.signed_peer_record, Some(remote_peer))
                .await
            {
                Ok(adopted) => {
                    signed_peer_record = true;
                    trace!(peer = %remote_peer.short(), adopted, "signed peer record processed");
                }
                Err(e) => {
                    debug!(peer = %remote_peer.short(), error = %e, "ignoring invalid signed peer record");
                }
            }
        }

        // Protocol delta for topology notifications.
        let previous_protocols = match self.peer_store.get(remote_peer).await {
            Ok(info) => info.protocols,
            Err(_) => Vec::new(),
        };
        let added: Vec<String> = proto
            .protocols
            .iter()
            .filter(|p| !previous_protocols.contains(p))
            .cloned()
            .collect();
        let removed: Vec<String> = previous_protocols
            .iter()
            .filter(|p| !proto.protocols.contains(p))
            .cloned()
            .collect();

        // The advertised protocol list is authoritative: replace. Addresses
        // and metadata merge.
        self.peer_store
            .patch(remote_peer, PeerUpdate {
                protocols: Some(proto.protocols.clone()),
                ..Default::default()
            })
            .await?;
        let mut merge = PeerUpdate::with_multiaddrs(listen_addrs.clone());
        let mut metadata = Vec::new();
        if !proto.agent_version.is_empty() {
            metadata.push((METADATA_AGENT_VERSION.to_string(), proto.agent_version.clone().into_bytes()));
        }
        if !proto.protocol_version.is_empty() {
            metadata.push((
                METADATA_PROTOCOL_VERSION.to_string(),
                proto.protocol_version.clone().into_bytes(),
            ));
        }
        merge.metadata = Some(metadata);
        self.peer_store.merge(remote_peer, merge).await?;

        self.registrar
            .on_peer_protocols_update(remote_peer, connection, &added, &removed)
            .await;

        // Observed address, stripped of any trailing peer id.
        let observed_addr: Option<Multiaddr> = if proto.observed_addr.is_empty() {
            None
        } else {
            std::str::from_utf8(&proto.observed_addr)
                .ok()
                .and_then(|s| s.parse::<Multiaddr>().ok())
                .map(|a| a.decapsulate("p2p"))
        };
        if let Some(addr) = &observed_addr {
            self.address_manager.add_observed_addr(addr).await;
        }

        let result = IdentifyResult {
            peer_id: remote_peer.clone(),
            protocol_version: (!proto.protocol_version.is_empty()).then_some(proto.protocol_version),
            agent_version: (!proto.agent_version.is_empty()).then_some(proto.agent_version),
            protocols: proto.protocols,
            listen_addrs,
            observed_addr,
            signed_peer_record,
            connection_id: connection.id(),
        };
        self.events.emit(NodeEvent::PeerIdentify(result.clone()));
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Inbound responder and push
    // ------------------------------------------------------------------------

    async fn respond_identify(self: Arc<Self>, mut stream: Stream, connection: Arc<Connection>) {
        let message = self.build_message(&connection).await;
        let bytes = message.encode_to_vec();
        if let Err(e) = write_framed(&mut stream, &bytes).await {
            debug!(peer = %connection.remote_peer().short(), error = %e, "identify response failed");
            stream.reset();
            return;
        }
        let _ = stream.shutdown().await;
    }

    async fn receive_push(self: Arc<Self>, mut stream: Stream, connection: Arc<Connection>) {
        let proto = match read_framed(&mut stream, self.config.max_message_size).await {
            Ok(bytes) => match IdentifyProto::decode(&bytes[..]) {
                Ok(proto) => proto,
                Err(e) => {
                    debug!(error = %e, "identify push decode failed");
                    stream.reset();
                    return;
                }
            },
            Err(e) => {
                debug!(error = %e, "identify push read failed");
                stream.reset();
                return;
            }
        };
        drop(stream);
        match self.consume(&connection, proto).await {
            Ok(result) => trace!(peer = %result.peer_id.short(), "identify push consumed"),
            Err(Error::InvalidPeer { message }) => {
                warn!(%message, "identify push proved peer mismatch, aborting connection");
                connection.abort();
            }
            Err(e) => debug!(error = %e, "identify push rejected"),
        }
    }

    /// Push the current identify message to every connected peer that
    /// advertises push support. Errors are logged, never propagated.
    async fn push_to_peers(self: &Arc<Self>) {
        let Some(manager) = self.connection_manager.get().and_then(Weak::upgrade) else {
            return;
        };
        for connection in manager.get_connections(None).await {
            let supports_push = match self.peer_store.get(connection.remote_peer()).await {
                Ok(info) => info.protocols.iter().any(|p| p == PROTOCOL_IDENTIFY_PUSH),
                Err(_) => false,
            };
            if !supports_push {
                continue;
            }
            let service = self.clone();
            tokio::spawn(async move {
                let signal = AbortSignal::deadline(service.config.timeout);
                let mut stream = match connection
                    .new_stream(&[PROTOCOL_IDENTIFY_PUSH.to_string()], &signal)
                    .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(peer = %connection.remote_peer().short(), error = %e, "identify push stream failed");
                        return;
                    }
                };
                let message = service.build_message(&connection).await;
                if let Err(e) = write_framed(&mut stream, &message.encode_to_vec()).await {
                    debug!(peer = %connection.remote_peer().short(), error = %e, "identify push write failed");
                    stream.reset();
                    return;
                }
                let _ = stream.shutdown().await;
                trace!(peer = %connection.remote_peer().short(), "identify push sent");
            });
        }
    }

    /// Assemble the identify message from registrar and address-manager
    /// state. `observed_addr` is the remote's address as we see it.
    async fn build_message(&self, connection: &Arc<Connection>) -> IdentifyProto {
        let advertised: Vec<Multiaddr> = self
            .address_manager
            .get_addresses()
            .await
            .into_iter()
            .map(|a| a.decapsulate("p2p"))
            .collect();

        let signed_peer_record = PeerRecord::new(self.local_peer.clone(), advertised.clone())
            .seal(&self.keypair)
            .unwrap_or_else(|e| {
                debug!(error = %e, "failed to seal own peer record");
                Vec::new()
            });

        IdentifyProto {
            public_key: self.keypair.public().to_protobuf_encoding(),
            listen_addrs: advertised.iter().map(|a| a.to_string().into_bytes()).collect(),
            protocols: self.registrar.get_protocols().await,
            observed_addr: connection.remote_addr().to_string().into_bytes(),
            protocol_version: self.config.protocol_version.clone(),
            agent_version: self.config.agent_version.clone(),
            signed_peer_record,
        }
    }
}
