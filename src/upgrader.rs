//! # Connection Upgrader
//!
//! Transforms a raw transport connection into an authenticated, multiplexed
//! [`Connection`]:
//!
//! 1. apply the optional private-network protector
//! 2. negotiate a security method via protocol select, run its handshake
//! 3. negotiate a stream muxer over the secured stream and instantiate it
//! 4. consult the connection gater after accept, after encryption, and
//!    after the muxer is chosen; any deny aborts the upgrade
//!
//! Inbound upgrades run under `inbound_upgrade_timeout`; expiry aborts.
//!
//! The upgrader owns the raw connection until the [`Connection`] is handed
//! over. Every failure path drops the in-flight stream, which closes the
//! underlying transport resource; nothing leaks on timeout or denial.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::{Connection, Direction};
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::gater::ConnectionGater;
use crate::identity::PeerId;
use crate::muxing::StreamMuxerFactory;
use crate::security::{ConnectionSecurity, Protector};
use crate::select;
use crate::signal::AbortSignal;
use crate::transport::{BoxedIo, RawConnection};

/// Default bound on inbound upgrades (steps 2–3).
pub const DEFAULT_INBOUND_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub struct UpgraderConfig {
    pub inbound_upgrade_timeout: Duration,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self { inbound_upgrade_timeout: DEFAULT_INBOUND_UPGRADE_TIMEOUT }
    }
}

/// Runs the upgrade pipeline for both directions.
pub struct Upgrader {
    local_peer: PeerId,
    securities: Vec<Arc<dyn ConnectionSecurity>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn Protector>>,
    gater: Arc<dyn ConnectionGater>,
    events: EventBus,
    config: UpgraderConfig,
}

impl Upgrader {
    pub fn new(
        local_peer: PeerId,
        securities: Vec<Arc<dyn ConnectionSecurity>>,
        muxers: Vec<Arc<dyn StreamMuxerFactory>>,
        protector: Option<Arc<dyn Protector>>,
        gater: Arc<dyn ConnectionGater>,
        events: EventBus,
        config: UpgraderConfig,
    ) -> Self {
        Self { local_peer, securities, muxers, protector, gater, events, config }
    }

    fn security_protocols(&self) -> Vec<String> {
        self.securities.iter().map(|s| s.protocol().to_string()).collect()
    }

    fn muxer_protocols(&self) -> Vec<String> {
        self.muxers.iter().map(|m| m.protocol().to_string()).collect()
    }

    async fn apply_protector(&self, io: BoxedIo) -> Result<BoxedIo> {
        match &self.protector {
            Some(protector) => protector.protect(io).await,
            None => Ok(io),
        }
    }

    /// Upgrade a connection we dialed.
    pub async fn upgrade_outbound(
        &self,
        raw: RawConnection,
        expected_peer: Option<&PeerId>,
        signal: &AbortSignal,
    ) -> Result<Arc<Connection>> {
        let RawConnection { io, remote_addr, transient } = raw;
        let mut io = self.apply_protector(io).await?;

        // Security negotiation and handshake.
        let chosen = select::select(&mut io, &self.security_protocols(), signal).await?;
        let security = self
            .securities
            .iter()
            .find(|s| s.protocol() == chosen)
            .ok_or(Error::ConnEncryptionRequired)?;
        let secured = security.secure_outbound(io, expected_peer).await?;
        if secured.remote_peer == self.local_peer {
            return Err(Error::invalid_peer("connected to own peer id"));
        }
        trace!(peer = %secured.remote_peer.short(), security = %chosen, "outbound connection secured");

        if self.gater.deny_outbound_connection(&secured.remote_peer, &remote_addr).await {
            return Err(Error::ConnectionIntercepted);
        }

        // Muxer negotiation.
        let mut io = secured.io;
        let muxer_proto = match select::select(&mut io, &self.muxer_protocols(), signal).await {
            Ok(p) => p,
            Err(Error::UnsupportedProtocol) => return Err(Error::MuxerUnavailable),
            Err(e) => return Err(e),
        };
        let factory = self
            .muxers
            .iter()
            .find(|m| m.protocol() == muxer_proto)
            .ok_or(Error::MuxerUnavailable)?;

        if self
            .gater
            .deny_outbound_upgraded_connection(&secured.remote_peer, &remote_addr)
            .await
        {
            return Err(Error::ConnectionIntercepted);
        }

        let muxer = factory.create_stream_muxer(io, Direction::Outbound);
        debug!(
            peer = %secured.remote_peer.short(),
            addr = %remote_addr,
            muxer = %muxer_proto,
            "outbound upgrade complete"
        );
        Ok(Arc::new(Connection::new(
            secured.remote_peer,
            remote_addr,
            Direction::Outbound,
            chosen,
            muxer_proto,
            transient,
            muxer,
            self.events.clone(),
        )))
    }

    /// Upgrade a connection a listener accepted. Bounded by
    /// `inbound_upgrade_timeout`.
    pub async fn upgrade_inbound(&self, raw: RawConnection) -> Result<Arc<Connection>> {
        if self.gater.deny_inbound_connection(&raw.remote_addr).await {
            return Err(Error::ConnectionIntercepted);
        }
        let timeout = self.config.inbound_upgrade_timeout;
        let signal = AbortSignal::deadline(timeout);
        tokio::select! {
            result = self.upgrade_inbound_inner(raw) => result,
            _ = signal.aborted() => Err(Error::Timeout),
        }
    }

    async fn upgrade_inbound_inner(&self, raw: RawConnection) -> Result<Arc<Connection>> {
        let RawConnection { io, remote_addr, transient } = raw;
        let mut io = self.apply_protector(io).await?;

        let chosen = select::handle(&mut io, &self.security_protocols()).await?;
        let security = self
            .securities
            .iter()
            .find(|s| s.protocol() == chosen)
            .ok_or(Error::ConnEncryptionRequired)?;
        let secured = security.secure_inbound(io).await?;
        if secured.remote_peer == self.local_peer {
            return Err(Error::invalid_peer("inbound connection from own peer id"));
        }
        trace!(peer = %secured.remote_peer.short(), security = %chosen, "inbound connection secured");

        // Post-encrypt check.
        if self
            .gater
            .deny_inbound_upgraded_connection(&secured.remote_peer, &remote_addr)
            .await
        {
            return Err(Error::ConnectionIntercepted);
        }

        let mut io = secured.io;
        let muxer_proto = match select::handle(&mut io, &self.muxer_protocols()).await {
            Ok(p) => p,
            Err(Error::UnsupportedProtocol) => return Err(Error::MuxerUnavailable),
            Err(e) => return Err(e),
        };
        let factory = self
            .muxers
            .iter()
            .find(|m| m.protocol() == muxer_proto)
            .ok_or(Error::MuxerUnavailable)?;

        // Post-upgrade check.
        if self
            .gater
            .deny_inbound_upgraded_connection(&secured.remote_peer, &remote_addr)
            .await
        {
            return Err(Error::ConnectionIntercepted);
        }

        let muxer = factory.create_stream_muxer(io, Direction::Inbound);
        debug!(
            peer = %secured.remote_peer.short(),
            addr = %remote_addr,
            muxer = %muxer_proto,
            "inbound upgrade complete"
        );
        Ok(Arc::new(Connection::new(
            secured.remote_peer,
            remote_addr,
            Direction::Inbound,
            chosen,
            muxer_proto,
            transient,
            muxer,
            self.events.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::AllowAllGater;
    use crate::identity::Keypair;
    use crate::muxing::FramedMuxerFactory;
    use crate::security::PlaintextSecurity;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn upgrader_for(keypair: &Keypair, gater: Arc<dyn ConnectionGater>) -> Upgrader {
        Upgrader::new(
            keypair.peer_id(),
            vec![Arc::new(PlaintextSecurity::new(keypair.clone()))],
            vec![Arc::new(FramedMuxerFactory::new())],
            None,
            gater,
            EventBus::new(),
            UpgraderConfig::default(),
        )
    }

    fn raw_pair() -> (RawConnection, RawConnection) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            RawConnection {
                io: Box::new(a),
                remote_addr: "/memory/listener".parse().unwrap(),
                transient: false,
            },
            RawConnection {
                io: Box::new(b),
                remote_addr: "/memory/dialer".parse().unwrap(),
                transient: false,
            },
        )
    }

    #[tokio::test]
    async fn full_upgrade_yields_authenticated_connection() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let up_a = upgrader_for(&kp_a, Arc::new(AllowAllGater::new()));
        let up_b = upgrader_for(&kp_b, Arc::new(AllowAllGater::new()));

        let (raw_out, raw_in) = raw_pair();
        let inbound = tokio::spawn(async move { up_b.upgrade_inbound(raw_in).await });
        let conn_a = up_a
            .upgrade_outbound(raw_out, Some(&kp_b.peer_id()), &AbortSignal::never())
            .await
            .unwrap();
        let conn_b = inbound.await.unwrap().unwrap();

        assert_eq!(conn_a.remote_peer(), &kp_b.peer_id());
        assert_eq!(conn_b.remote_peer(), &kp_a.peer_id());
        assert_eq!(conn_a.direction(), Direction::Outbound);
        assert_eq!(conn_b.direction(), Direction::Inbound);
        assert_eq!(conn_a.encryption(), PlaintextSecurity::new(kp_a).protocol());

        // Streams work across the upgraded pair.
        let accept = tokio::spawn(async move { conn_b.muxer().accept_stream().await });
        let mut out = conn_a.muxer().open_stream().await.unwrap();
        out.write_all(b"upgraded").await.unwrap();
        out.flush().await.unwrap();
        let mut inbound_stream = accept.await.unwrap().unwrap();
        let mut buf = [0u8; 8];
        inbound_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"upgraded");
    }

    #[tokio::test]
    async fn expected_peer_mismatch_fails_with_invalid_peer() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let up_a = upgrader_for(&kp_a, Arc::new(AllowAllGater::new()));
        let up_b = upgrader_for(&kp_b, Arc::new(AllowAllGater::new()));

        let (raw_out, raw_in) = raw_pair();
        tokio::spawn(async move {
            let _ = up_b.upgrade_inbound(raw_in).await;
        });
        let stranger = Keypair::generate().peer_id();
        let err = up_a
            .upgrade_outbound(raw_out, Some(&stranger), &AbortSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ErrInvalidPeer");
    }

    struct DenyUpgraded;

    #[async_trait]
    impl ConnectionGater for DenyUpgraded {
        async fn deny_inbound_upgraded_connection(
            &self,
            _peer: &PeerId,
            _addr: &crate::multiaddr::Multiaddr,
        ) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn gater_denial_aborts_with_intercepted() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let up_a = upgrader_for(&kp_a, Arc::new(AllowAllGater::new()));
        let up_b = upgrader_for(&kp_b, Arc::new(DenyUpgraded));

        let (raw_out, raw_in) = raw_pair();
        let inbound = tokio::spawn(async move { up_b.upgrade_inbound(raw_in).await });
        let _ = up_a
            .upgrade_outbound(raw_out, Some(&kp_b.peer_id()), &AbortSignal::never())
            .await;
        let err = inbound.await.unwrap().unwrap_err();
        assert_eq!(err, Error::ConnectionIntercepted);
    }

    #[tokio::test]
    async fn inbound_upgrade_times_out_on_silent_dialer() {
        let kp = Keypair::generate();
        let mut upgrader = upgrader_for(&kp, Arc::new(AllowAllGater::new()));
        upgrader.config.inbound_upgrade_timeout = Duration::from_millis(50);

        // Dialer never speaks.
        let (_silent, raw_in) = raw_pair();
        let err = upgrader.upgrade_inbound(raw_in).await.unwrap_err();
        assert_eq!(err, Error::Timeout);
    }
}
