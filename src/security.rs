//! # Connection Security
//!
//! Contracts for the security handshake that authenticates a raw connection,
//! plus the two shipped implementations:
//!
//! - [`PlaintextSecurity`]: exchanges length-prefixed public-key messages and
//!   derives the remote peer id, with no encryption. Suitable for tests and
//!   for transports that already encrypt (the production handshakes, Noise
//!   and TLS, live outside this crate and plug in through the same trait).
//! - [`PskProtector`]: the optional pre-protection transform applied before
//!   any security negotiation, XOR-masking the raw stream with a shared key
//!   so that only nodes holding the key can even begin a handshake.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::messages::{read_framed, write_framed};
use crate::transport::BoxedIo;

/// Protocol id of the plaintext handshake.
pub const PLAINTEXT_PROTOCOL: &str = "/plaintext/2.0.0";

/// Upper bound on a handshake message (a protobuf-encoded public key).
const MAX_HANDSHAKE_MESSAGE: usize = 1024;

/// Result of a successful security handshake.
pub struct SecuredConnection {
    pub io: BoxedIo,
    pub remote_peer: PeerId,
    pub remote_public_key: PublicKey,
}

impl std::fmt::Debug for SecuredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredConnection")
            .field("remote_peer", &self.remote_peer)
            .field("remote_public_key", &self.remote_public_key)
            .finish_non_exhaustive()
    }
}

/// A security method negotiated during upgrade.
#[async_trait]
pub trait ConnectionSecurity: Send + Sync {
    /// Protocol id announced during security negotiation.
    fn protocol(&self) -> &str;

    /// Run the handshake as the dialer. When `expected_peer` is known the
    /// implementation must fail with `ErrInvalidPeer` on mismatch.
    async fn secure_outbound(
        &self,
        io: BoxedIo,
        expected_peer: Option<&PeerId>,
    ) -> Result<SecuredConnection>;

    /// Run the handshake as the listener.
    async fn secure_inbound(&self, io: BoxedIo) -> Result<SecuredConnection>;
}

// ============================================================================
// Plaintext
// ============================================================================

/// Identity exchange without encryption.
pub struct PlaintextSecurity {
    keypair: Keypair,
}

impl PlaintextSecurity {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    async fn exchange(
        &self,
        mut io: BoxedIo,
        expected_peer: Option<&PeerId>,
    ) -> Result<SecuredConnection> {
        write_framed(&mut io, &self.keypair.public().to_protobuf_encoding()).await?;
        let remote_key_bytes = read_framed(&mut io, MAX_HANDSHAKE_MESSAGE).await?;
        let remote_public_key = PublicKey::from_protobuf_encoding(&remote_key_bytes)
            .map_err(|e| Error::EncryptionFailed { message: e.to_string() })?;
        let remote_peer = remote_public_key.to_peer_id();

        if remote_peer == self.keypair.peer_id() {
            return Err(Error::invalid_peer("handshake with own key"));
        }
        if let Some(expected) = expected_peer {
            if expected != &remote_peer {
                return Err(Error::invalid_peer(format!(
                    "handshake authenticated {} but {} was expected",
                    remote_peer.short(),
                    expected.short()
                )));
            }
        }
        trace!(peer = %remote_peer.short(), "plaintext handshake complete");
        Ok(SecuredConnection { io, remote_peer, remote_public_key })
    }
}

#[async_trait]
impl ConnectionSecurity for PlaintextSecurity {
    fn protocol(&self) -> &str {
        PLAINTEXT_PROTOCOL
    }

    async fn secure_outbound(
        &self,
        io: BoxedIo,
        expected_peer: Option<&PeerId>,
    ) -> Result<SecuredConnection> {
        self.exchange(io, expected_peer).await
    }

    async fn secure_inbound(&self, io: BoxedIo) -> Result<SecuredConnection> {
        self.exchange(io, None).await
    }
}

// ============================================================================
// Private network protector
// ============================================================================

/// Pre-protection transform applied to raw connections before any
/// negotiation.
#[async_trait]
pub trait Protector: Send + Sync {
    async fn protect(&self, io: BoxedIo) -> Result<BoxedIo>;
}

/// Masks the raw stream with a repeating-key XOR derived from a 32-byte
/// pre-shared key. Nodes without the key see only noise and fail the
/// protocol-select version exchange immediately.
pub struct PskProtector {
    psk: [u8; 32],
}

impl PskProtector {
    pub fn new(psk: [u8; 32]) -> Self {
        Self { psk }
    }
}

#[async_trait]
impl Protector for PskProtector {
    async fn protect(&self, io: BoxedIo) -> Result<BoxedIo> {
        Ok(Box::new(XorStream::new(io, self.psk)))
    }
}

/// XOR both directions of a stream against a repeating key, tracking each
/// direction's offset independently.
struct XorStream {
    inner: BoxedIo,
    key: [u8; 32],
    read_offset: u64,
    write_offset: u64,
}

impl XorStream {
    fn new(inner: BoxedIo, key: [u8; 32]) -> Self {
        Self { inner, key, read_offset: 0, write_offset: 0 }
    }

    fn keystream_byte(&self, offset: u64) -> u8 {
        self.key[(offset % self.key.len() as u64) as usize]
    }
}

impl AsyncRead for XorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let offset = self.read_offset;
                let filled = buf.filled_mut();
                for (i, byte) in filled[before..].iter_mut().enumerate() {
                    *byte ^= self.keystream_byte(offset + i as u64);
                }
                self.read_offset += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for XorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        // Transform a copy at the current write offset; a partial write only
        // advances the offset by what the inner sink took, and the next call
        // re-derives the keystream from there.
        let offset = self.write_offset;
        let masked: Vec<u8> = data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.keystream_byte(offset + i as u64))
            .collect();
        match Pin::new(&mut self.inner).poll_write(cx, &masked) {
            Poll::Ready(Ok(n)) => {
                self.write_offset += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
