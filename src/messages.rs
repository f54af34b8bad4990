//! # Wire Protocol Messages
//!
//! All serializable message types used on Lattica's wire protocols, plus the
//! bounded (de)serialization helpers the peer store uses for persistence.
//!
//! ## Protocol Types
//!
//! | Protocol | Message | Encoding |
//! |----------|---------|----------|
//! | Identify / Identify Push | [`IdentifyProto`] | protobuf |
//! | Signed peer records | [`EnvelopeProto`], [`PeerRecordProto`] | protobuf |
//! | Key exchange | [`PublicKeyProto`] | protobuf |
//! | Peer store persistence | (entry types in `peer_store`) | bincode |
//!
//! Protobuf messages use proto3 semantics: a field left at its default
//! (empty bytes, empty string, zero) is treated as absent.
//!
//! ## Security Limits
//!
//! - [`MAX_IDENTIFY_MESSAGE_SIZE`]: hard cap on an encoded identify message;
//!   an over-size message is a fatal protocol error on that stream.
//! - All bincode deserialization goes through [`deserialize_bounded`], which
//!   enforces [`MAX_DESERIALIZE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{Error, Result};

/// Maximum encoded size of an identify message (8 KiB).
pub const MAX_IDENTIFY_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum buffer size for bincode deserialization.
/// Peer store entries stay well under this; the bound exists so a corrupted
/// datastore value cannot allocate unbounded memory.
pub const MAX_DESERIALIZE_SIZE: u64 = 1024 * 1024;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Serialize a persistence value.
pub fn serialize_entry<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode_options()
        .serialize(value)
        .map_err(|e| Error::invalid_message(format!("entry encode: {e}")))
}

/// Deserialize a persistence value with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| Error::invalid_message(format!("entry decode: {e}")))
}

// ============================================================================
// Binary framing
// ============================================================================

/// Write one varint-length-prefixed binary frame.
pub(crate) async fn write_framed<S>(io: &mut S, payload: &[u8]) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let mut prefix = [0u8; 10];
    let mut n = 0;
    let mut value = payload.len() as u64;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        prefix[n] = if value == 0 { byte } else { byte | 0x80 };
        n += 1;
        if value == 0 {
            break;
        }
    }
    io.write_all(&prefix[..n]).await.map_err(|_| Error::ConnectionEnded)?;
    io.write_all(payload).await.map_err(|_| Error::ConnectionEnded)?;
    io.flush().await.map_err(|_| Error::ConnectionEnded)
}

/// Read one varint-length-prefixed binary frame of at most `max_len` bytes.
///
/// # Errors
/// `ErrInvalidMessage` when the frame exceeds `max_len`, a fatal protocol
/// error on that stream; `ErrConnectionEnded` when the stream ends early.
pub(crate) async fn read_framed<S>(io: &mut S, max_len: usize) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = io.read_u8().await.map_err(|_| Error::ConnectionEnded)?;
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 28 {
            return Err(Error::invalid_message("frame length prefix too large"));
        }
    }
    let len = len as usize;
    if len > max_len {
        return Err(Error::invalid_message(format!(
            "frame of {len} bytes exceeds cap of {max_len}"
        )));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.map_err(|_| Error::ConnectionEnded)?;
    Ok(buf)
}

// ============================================================================
// Protobuf wire messages
// ============================================================================

/// Public identity key, as exchanged during handshakes and embedded in
/// peer ids.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PublicKeyProto {
    /// Key algorithm (1 = Ed25519).
    #[prost(int32, tag = "1")]
    pub key_type: i32,
    /// Raw key material.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Identify message: one per stream on `/ipfs/id/1.0.0` and its push
/// variant. Field numbers follow the published identify schema.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentifyProto {
    /// Sender's public key (protobuf-encoded [`PublicKeyProto`]).
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    /// Addresses the sender listens on (UTF-8 multiaddr strings).
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub listen_addrs: Vec<Vec<u8>>,
    /// Protocols the sender handles.
    #[prost(string, repeated, tag = "3")]
    pub protocols: Vec<String>,
    /// The receiver's address as observed by the sender.
    #[prost(bytes = "vec", tag = "4")]
    pub observed_addr: Vec<u8>,
    /// Version of the protocol family, e.g. `lattica/1.0.0`.
    #[prost(string, tag = "5")]
    pub protocol_version: String,
    /// Free-form implementation version.
    #[prost(string, tag = "6")]
    pub agent_version: String,
    /// Sealed envelope holding the sender's signed peer record.
    #[prost(bytes = "vec", tag = "8")]
    pub signed_peer_record: Vec<u8>,
}

/// Signed envelope: a domain-separated signature over a typed payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeProto {
    /// Signer's public key (protobuf-encoded [`PublicKeyProto`]).
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    /// Multicodec identifying the payload type.
    #[prost(bytes = "vec", tag = "2")]
    pub payload_type: Vec<u8>,
    /// The payload itself.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    /// Signature over the domain-prefixed payload.
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
}

/// Routing payload carried inside a signed envelope: the addresses a peer
/// claims to be reachable at, with a monotonically increasing sequence
/// number.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerRecordProto {
    /// Peer id (multihash bytes) the record describes.
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: Vec<u8>,
    /// Monotonically increasing sequence number.
    #[prost(uint64, tag = "2")]
    pub seq: u64,
    /// Claimed addresses.
    #[prost(message, repeated, tag = "3")]
    pub addresses: Vec<AddressInfoProto>,
}

/// One address inside a [`PeerRecordProto`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct AddressInfoProto {
    /// UTF-8 multiaddr string bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub multiaddr: Vec<u8>,
}
