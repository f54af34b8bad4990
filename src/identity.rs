//! # Identity and Peer Identifiers
//!
//! Core identity types used throughout Lattica:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PublicKey`]: a node's public identity key
//! - [`PeerId`]: canonical identifier derived from the public key
//!
//! ## Identity Model
//!
//! A peer id is the multihash of the protobuf encoding of the peer's public
//! key. Ed25519 keys are short enough that the *identity* multihash (code
//! `0x00`) is always used, which embeds the key verbatim: every peer id
//! therefore carries its own public key and is self-certifying.
//!
//! ## Security Invariants
//!
//! - P1: `PeerId::from_bytes(id.to_bytes()) == id` (round-trip preservation)
//! - P2: Only valid Ed25519 points are accepted as public keys
//! - P3: `PublicKey::to_peer_id` is deterministic; equal keys give equal ids
//! - P4: Signature verification binds messages to the key behind the peer id

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::messages::PublicKeyProto;

/// Multihash code for the identity hash function (payload embedded verbatim).
const MULTIHASH_IDENTITY_CODE: u8 = 0x00;

/// Protobuf enum value for Ed25519 in the public-key message.
const KEY_TYPE_ED25519: i32 = 1;

/// Upper bound on the digest portion of a peer id multihash.
/// An Ed25519 protobuf encoding is 36 bytes; anything larger is malformed.
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Returns current time as milliseconds since the Unix epoch.
/// Used for sequence numbers in signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random number generator.
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Reconstruct a keypair from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(&seed) }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing_key.verifying_key())
    }

    /// The peer id derived from this keypair's public key.
    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign `data`, returning a 64-byte Ed25519 signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("peer", &self.peer_id()).finish()
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// Public key of a node's identity.
///
/// Multiple algorithms exist in the wild, but Ed25519 support is the one
/// that is mandatory everywhere, and the only one Lattica implements.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519(VerifyingKey),
}

impl PublicKey {
    /// Encode into the protobuf structure exchanged with other nodes.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        use prost::Message;
        let PublicKey::Ed25519(key) = self;
        let proto = PublicKeyProto {
            key_type: KEY_TYPE_ED25519,
            data: key.to_bytes().to_vec(),
        };
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto.encode(&mut buf).expect("vec write cannot fail");
        buf
    }

    /// Decode from the protobuf structure received from another node.
    ///
    /// # Errors
    /// `ErrInvalidMessage` if the bytes are not a valid encoding or the
    /// algorithm is not Ed25519; `ErrInvalidPeer` if the key material is not
    /// a valid curve point.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<PublicKey> {
        use prost::Message;
        let proto = PublicKeyProto::decode(bytes)
            .map_err(|e| Error::invalid_message(format!("public key decode: {e}")))?;
        if proto.key_type != KEY_TYPE_ED25519 {
            return Err(Error::invalid_message(format!(
                "unsupported key type {}",
                proto.key_type
            )));
        }
        let raw: [u8; 32] = proto.data[..]
            .try_into()
            .map_err(|_| Error::invalid_message("ed25519 key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|_| Error::invalid_peer("public key is not a valid ed25519 point"))?;
        Ok(PublicKey::Ed25519(key))
    }

    /// Derive the canonical [`PeerId`] for this key.
    pub fn to_peer_id(&self) -> PeerId {
        let encoded = self.to_protobuf_encoding();
        debug_assert!(encoded.len() <= MAX_INLINE_KEY_LENGTH);
        let mut multihash = Vec::with_capacity(2 + encoded.len());
        multihash.push(MULTIHASH_IDENTITY_CODE);
        multihash.push(encoded.len() as u8);
        multihash.extend_from_slice(&encoded);
        PeerId { multihash }
    }

    /// Verify `signature` over `message` with this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let PublicKey::Ed25519(key) = self;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::invalid_message("signature must be 64 bytes"))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(message, &signature)
            .map_err(|_| Error::invalid_message("signature verification failed"))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let PublicKey::Ed25519(key) = self;
        write!(f, "Ed25519({})", hex::encode(&key.to_bytes()[..8]))
    }
}

// ============================================================================
// PeerId
// ============================================================================

/// Canonical identifier of a node: the identity multihash of its
/// protobuf-encoded public key. Compared by byte equality.
///
/// String form is lowercase hex of the multihash bytes.
#[derive(Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Vec<u8>,
}

impl PeerId {
    /// Parse a peer id from its raw multihash bytes.
    ///
    /// # Errors
    /// `ErrInvalidMessage` if the bytes are not a well-formed identity
    /// multihash carrying a plausible key payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<PeerId> {
        if bytes.len() < 2 {
            return Err(Error::invalid_message("peer id too short"));
        }
        if bytes[0] != MULTIHASH_IDENTITY_CODE {
            return Err(Error::invalid_message(format!(
                "unsupported multihash code 0x{:02x}",
                bytes[0]
            )));
        }
        let len = bytes[1] as usize;
        if len > MAX_INLINE_KEY_LENGTH || bytes.len() != 2 + len {
            return Err(Error::invalid_message("peer id multihash length mismatch"));
        }
        Ok(PeerId { multihash: bytes.to_vec() })
    }

    /// Raw multihash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    /// Owned copy of the multihash bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.clone()
    }

    /// Recover the public key embedded in this id.
    ///
    /// Ed25519 ids always embed their key (identity multihash), so this only
    /// fails for ids carrying a key this implementation cannot decode.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_protobuf_encoding(&self.multihash[2..])
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.multihash[..self.multihash.len().min(8)])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.multihash))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerId> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::invalid_message("peer id must be hex"))?;
        PeerId::from_bytes(&bytes)
    }
}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.multihash.hash(state);
    }
}

impl From<PublicKey> for PeerId {
    fn from(key: PublicKey) -> Self {
        key.to_peer_id()
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.multihash)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        PeerId::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_through_bytes() {
        let id = Keypair::generate().peer_id();
        let restored = PeerId::from_bytes(id.as_bytes()).expect("round trip");
        assert_eq!(id, restored);
    }

    #[test]
    fn peer_id_round_trips_through_string() {
        let id = Keypair::generate().peer_id();
        let restored: PeerId = id.to_string().parse().expect("hex round trip");
        assert_eq!(id, restored);
    }

    #[test]
    fn peer_id_embeds_public_key() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        let key = id.public_key().expect("identity multihash embeds the key");
        assert_eq!(key, keypair.public());
        assert_eq!(key.to_peer_id(), id);
    }

    #[test]
    fn distinct_keys_give_distinct_ids() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(PeerId::from_bytes(&[]).is_err());
        assert!(PeerId::from_bytes(&[0x12, 0x04, 1, 2, 3, 4]).is_err(), "non-identity code");
        assert!(PeerId::from_bytes(&[0x00, 0x05, 1, 2]).is_err(), "length mismatch");
        assert!("zz".parse::<PeerId>().is_err(), "non-hex string");
    }

    #[test]
    fn signatures_verify_against_public_key() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"payload");
        keypair.public().verify(b"payload", &sig).expect("valid signature");
        assert!(keypair.public().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn public_key_protobuf_round_trip() {
        let key = Keypair::generate().public();
        let encoded = key.to_protobuf_encoding();
        let decoded = PublicKey::from_protobuf_encoding(&encoded).expect("decode");
        assert_eq!(key, decoded);
    }
}
