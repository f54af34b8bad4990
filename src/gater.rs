//! # Connection Gating
//!
//! Admission policy hooks. A [`ConnectionGater`] is consulted at every stage
//! where the node commits resources to a peer:
//!
//! | Predicate | Checkpoint |
//! |-----------|------------|
//! | `deny_dial_peer` | before a dial is queued |
//! | `deny_dial_multiaddr` | per candidate address, before the transport dials |
//! | `deny_inbound_connection` | after TCP-level accept, before upgrade |
//! | `deny_outbound_connection` | after the outbound security handshake |
//! | `deny_inbound_upgraded_connection` | inbound, after encryption and again after muxer selection |
//! | `deny_outbound_upgraded_connection` | outbound, after muxer selection |
//!
//! Every predicate answers `true` to deny. The default implementation of
//! each method allows everything, so implementors override only the
//! checkpoints they care about.

use async_trait::async_trait;

use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;

/// Admission policy consulted during dialing and upgrading.
#[async_trait]
pub trait ConnectionGater: Send + Sync {
    /// Deny dialing `peer` at all.
    async fn deny_dial_peer(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Deny dialing this specific address.
    async fn deny_dial_multiaddr(&self, _addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection right after accept, before any upgrade
    /// work is spent on it. The peer is not yet known.
    async fn deny_inbound_connection(&self, _addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound connection once the security handshake has
    /// authenticated the remote peer.
    async fn deny_outbound_connection(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection after encryption, and again after the
    /// muxer is selected.
    async fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound connection after the full upgrade.
    async fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        false
    }

    /// Filter which of a peer's known addresses may be dialed.
    async fn filter_multiaddrs_for_peer(
        &self,
        _peer: &PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Vec<Multiaddr> {
        addrs
    }
}

/// The default gater: admits everything.
#[derive(Default)]
pub struct AllowAllGater;

impl AllowAllGater {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionGater for AllowAllGater {}
