//! # Signed Peer Records
//!
//! A [`PeerRecord`] is a peer's own claim about its reachable addresses,
//! sealed inside a signed [`EnvelopeProto`]. Any node can verify the
//! envelope against the public key embedded in the peer id, which makes the
//! address list tamper-evident even when relayed through third parties.
//!
//! Sequence numbers are milliseconds at sealing time, which gives the
//! monotonicity the store relies on: a record with a lower sequence number
//! than the stored one is stale and discarded.
//!
//! Signatures are domain-separated: the signed bytes are the payload type
//! and payload prefixed with [`PEER_RECORD_SIGNATURE_DOMAIN`], so a peer
//! record signature can never be replayed as any other kind of envelope.

use prost::Message;

use crate::errors::{Error, Result};
use crate::identity::{now_ms, Keypair, PeerId, PublicKey};
use crate::messages::{AddressInfoProto, EnvelopeProto, PeerRecordProto};
use crate::multiaddr::Multiaddr;

/// Domain separation string for peer record envelopes.
pub const PEER_RECORD_SIGNATURE_DOMAIN: &[u8] = b"libp2p-peer-record";

/// Multicodec identifying a peer record payload inside an envelope.
pub const PEER_RECORD_PAYLOAD_TYPE: &[u8] = &[0x03, 0x01];

/// A peer's signed claim of its own addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    /// The peer the record describes (and whose key signed it).
    pub peer_id: PeerId,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// Claimed addresses, without trailing peer-id components.
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    /// Build a fresh record for `peer_id` with the current time as its
    /// sequence number.
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id, seq: now_ms(), addresses }
    }

    fn to_payload(&self) -> Vec<u8> {
        let proto = PeerRecordProto {
            peer_id: self.peer_id.to_bytes(),
            seq: self.seq,
            addresses: self
                .addresses
                .iter()
                .map(|a| AddressInfoProto { multiaddr: a.to_string().into_bytes() })
                .collect(),
        };
        proto.encode_to_vec()
    }

    /// Seal this record into a signed envelope.
    ///
    /// # Errors
    /// `ErrInvalidParameters` when `keypair` does not belong to
    /// `self.peer_id` (the envelope would never verify).
    pub fn seal(&self, keypair: &Keypair) -> Result<Vec<u8>> {
        if keypair.peer_id() != self.peer_id {
            return Err(Error::invalid_parameters(
                "sealing keypair does not match record peer id",
            ));
        }
        let payload = self.to_payload();
        let signature = keypair.sign(&signing_input(&payload));
        let envelope = EnvelopeProto {
            public_key: keypair.public().to_protobuf_encoding(),
            payload_type: PEER_RECORD_PAYLOAD_TYPE.to_vec(),
            payload,
            signature,
        };
        Ok(envelope.encode_to_vec())
    }

    /// Open a sealed envelope, verifying the signature and the identity
    /// bindings.
    ///
    /// Checks, in order:
    /// 1. the envelope decodes and carries a peer record payload type;
    /// 2. the signature verifies against the envelope's public key;
    /// 3. the embedded peer id matches the envelope signer;
    /// 4. if `expected_peer` is given, the embedded peer id matches it.
    ///
    /// # Errors
    /// `ErrInvalidMessage` for decode/signature failures, `ErrInvalidPeer`
    /// for identity mismatches.
    pub fn open(envelope_bytes: &[u8], expected_peer: Option<&PeerId>) -> Result<PeerRecord> {
        let envelope = EnvelopeProto::decode(envelope_bytes)
            .map_err(|e| Error::invalid_message(format!("envelope decode: {e}")))?;
        if envelope.payload_type != PEER_RECORD_PAYLOAD_TYPE {
            return Err(Error::invalid_message("envelope payload is not a peer record"));
        }

        let signer = PublicKey::from_protobuf_encoding(&envelope.public_key)?;
        signer.verify(&signing_input(&envelope.payload), &envelope.signature)?;

        let proto = PeerRecordProto::decode(&envelope.payload[..])
            .map_err(|e| Error::invalid_message(format!("peer record decode: {e}")))?;
        let peer_id = PeerId::from_bytes(&proto.peer_id)?;

        if signer.to_peer_id() != peer_id {
            return Err(Error::invalid_peer("record peer id does not match envelope signer"));
        }
        if let Some(expected) = expected_peer {
            if expected != &peer_id {
                return Err(Error::invalid_peer(format!(
                    "record describes {} but {} was expected",
                    peer_id.short(),
                    expected.short()
                )));
            }
        }

        let mut addresses = Vec::with_capacity(proto.addresses.len());
        for info in proto.addresses {
            let s = String::from_utf8(info.multiaddr)
                .map_err(|_| Error::invalid_message("record address is not UTF-8"))?;
            addresses.push(s.parse::<Multiaddr>()?);
        }

        Ok(PeerRecord { peer_id, seq: proto.seq, addresses })
    }
}

/// Bytes actually signed: domain prefix, payload type, payload.
fn signing_input(payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(
        PEER_RECORD_SIGNATURE_DOMAIN.len() + PEER_RECORD_PAYLOAD_TYPE.len() + payload.len(),
    );
    input.extend_from_slice(PEER_RECORD_SIGNATURE_DOMAIN);
    input.extend_from_slice(PEER_RECORD_PAYLOAD_TYPE);
    input.extend_from_slice(payload);
    input
}
