//! # Error Taxonomy
//!
//! This module defines the crate-wide error type. Every failure a caller can
//! observe maps to exactly one variant, and every variant carries a stable
//! string code (see [`Error::code`]) that stays identical across releases and
//! language ports, so callers match on codes rather than on message text.
//!
//! ## Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | `TransportsRequired`, `ConnEncryptionRequired`, `ProtectorRequired` |
//! | Dial | `DialedSelf`, `NoValidAddresses`, `TooManyAddresses`, `PeerDialIntercepted`, `TransportDialFailed`, `AggregateDial`, `Timeout`, `Aborted` |
//! | Upgrade | `EncryptionFailed`, `MuxerUnavailable`, `ConnectionIntercepted` |
//! | Identify | `ConnectionEnded`, `InvalidMessage`, `MissingPublicKey`, `InvalidPeer` |
//! | Stream | `UnsupportedProtocol`, `StreamReset`, `TooManyInboundStreams`, `TooManyOutboundStreams`, `TransientConnection`, `ConnectionClosed` |
//! | Store | `NotFound`, `InvalidParameters` |
//!
//! ## Propagation policy
//!
//! - Dial-queue sibling errors are suppressed once any sibling succeeds. If
//!   all siblings fail and only one address was tried, that error surfaces
//!   unwrapped; otherwise the failures are collected into `AggregateDial`.
//! - `NotFound` from the peer store is a routine control-flow outcome for
//!   unknown peers. Callers treat it as "absent", never log it at error level.
//! - Identify failures are logged and do not tear down the connection, except
//!   `InvalidPeer` (a peer-id mismatch), which aborts it.

use std::fmt;

/// Crate-wide error type.
///
/// Variants are value types: `Clone`, `PartialEq`, `Eq`. Messages carried in
/// variants are context for humans; equality matching should use [`Error::code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // -- Configuration -------------------------------------------------------
    /// The node was built without any transport.
    TransportsRequired,
    /// The node was built without any connection encryption method.
    ConnEncryptionRequired,
    /// A pre-shared-key protected network was configured without a protector.
    ProtectorRequired,

    // -- Dial ----------------------------------------------------------------
    /// A dial targeted this node's own peer id.
    DialedSelf,
    /// Address resolution and filtering left nothing dialable.
    NoValidAddresses,
    /// A peer resolved to more addresses than the configured dial cap.
    TooManyAddresses {
        /// Number of addresses after resolution.
        count: usize,
        /// Configured `max_peer_addresses_to_dial`.
        limit: usize,
    },
    /// The connection gater denied dialing this peer.
    PeerDialIntercepted,
    /// A transport-level dial failed.
    TransportDialFailed { message: String },
    /// Every candidate address failed; the individual failures are retained.
    AggregateDial { errors: Vec<Error> },
    /// An operation exceeded its deadline.
    Timeout,
    /// The caller's abort signal (or node shutdown) fired.
    Aborted,

    // -- Upgrade -------------------------------------------------------------
    /// The security handshake failed.
    EncryptionFailed { message: String },
    /// No mutually supported stream multiplexer.
    MuxerUnavailable,
    /// The connection gater denied the connection during upgrade.
    ConnectionIntercepted,

    // -- Identify ------------------------------------------------------------
    /// The remote closed the stream before a full message arrived.
    ConnectionEnded,
    /// A wire message failed validation or exceeded its size cap.
    InvalidMessage { message: String },
    /// An identify message arrived without a public key.
    MissingPublicKey,
    /// The authenticated peer id does not match what was expected.
    InvalidPeer { message: String },

    // -- Stream --------------------------------------------------------------
    /// Protocol negotiation found no common protocol.
    UnsupportedProtocol,
    /// The stream was reset by the remote or aborted locally.
    StreamReset,
    /// The per-protocol inbound stream cap was reached.
    TooManyInboundStreams,
    /// The per-protocol outbound stream cap was reached.
    TooManyOutboundStreams,
    /// The protocol did not opt in to running on a transient connection.
    TransientConnection,
    /// The underlying connection is closing or closed.
    ConnectionClosed,

    // -- Store ---------------------------------------------------------------
    /// The requested entry does not exist. Routine for unknown peers.
    NotFound,
    /// A caller-supplied parameter was out of range or malformed.
    InvalidParameters { message: String },
}

impl Error {
    /// Stable string code for this error, usable for equality matching
    /// across processes and language implementations.
    pub fn code(&self) -> &'static str {
        match self {
            Error::TransportsRequired => "ErrTransportsRequired",
            Error::ConnEncryptionRequired => "ErrConnEncryptionRequired",
            Error::ProtectorRequired => "ErrProtectorRequired",
            Error::DialedSelf => "ErrDialedSelf",
            Error::NoValidAddresses => "ErrNoValidAddresses",
            Error::TooManyAddresses { .. } => "ErrTooManyAddresses",
            Error::PeerDialIntercepted => "ErrPeerDialIntercepted",
            Error::TransportDialFailed { .. } => "ErrTransportDialFailed",
            Error::AggregateDial { .. } => "ErrTransportDialFailed",
            Error::Timeout => "ErrTimeout",
            Error::Aborted => "ErrAborted",
            Error::EncryptionFailed { .. } => "ErrEncryptionFailed",
            Error::MuxerUnavailable => "ErrMuxerUnavailable",
            Error::ConnectionIntercepted => "ErrConnectionIntercepted",
            Error::ConnectionEnded => "ErrConnectionEnded",
            Error::InvalidMessage { .. } => "ErrInvalidMessage",
            Error::MissingPublicKey => "ErrMissingPublicKey",
            Error::InvalidPeer { .. } => "ErrInvalidPeer",
            Error::UnsupportedProtocol => "ErrUnsupportedProtocol",
            Error::StreamReset => "ErrStreamReset",
            Error::TooManyInboundStreams => "ErrTooManyInboundStreams",
            Error::TooManyOutboundStreams => "ErrTooManyOutboundStreams",
            Error::TransientConnection => "ErrTransientConnection",
            Error::ConnectionClosed => "ErrConnectionClosed",
            Error::NotFound => "ErrNotFound",
            Error::InvalidParameters { .. } => "ErrInvalidParameters",
        }
    }

    /// True when this is the routine "entry absent" outcome from the store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Collapse a set of sibling dial failures per the propagation policy:
    /// a single failure surfaces unwrapped, several become an aggregate,
    /// none at all degenerates to `NoValidAddresses`.
    pub fn aggregate_dial(mut errors: Vec<Error>) -> Error {
        match errors.len() {
            0 => Error::NoValidAddresses,
            1 => errors.remove(0),
            _ => Error::AggregateDial { errors },
        }
    }

    /// Helper for wrapping transport failures with context.
    pub fn transport_dial(message: impl Into<String>) -> Error {
        Error::TransportDialFailed {
            message: message.into(),
        }
    }

    /// Helper for invalid wire messages.
    pub fn invalid_message(message: impl Into<String>) -> Error {
        Error::InvalidMessage {
            message: message.into(),
        }
    }

    /// Helper for peer identity mismatches.
    pub fn invalid_peer(message: impl Into<String>) -> Error {
        Error::InvalidPeer {
            message: message.into(),
        }
    }

    /// Helper for out-of-range parameters.
    pub fn invalid_parameters(message: impl Into<String>) -> Error {
        Error::InvalidParameters {
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportsRequired => {
                write!(f, "{}: at least one transport is required", self.code())
            }
            Error::ConnEncryptionRequired => {
                write!(f, "{}: at least one connection encrypter is required", self.code())
            }
            Error::ProtectorRequired => {
                write!(f, "{}: a private network protector is required", self.code())
            }
            Error::DialedSelf => write!(f, "{}: refusing to dial own peer id", self.code()),
            Error::NoValidAddresses => {
                write!(f, "{}: no dialable addresses after resolution", self.code())
            }
            Error::TooManyAddresses { count, limit } => write!(
                f,
                "{}: peer resolved to {} addresses, limit is {}",
                self.code(),
                count,
                limit
            ),
            Error::PeerDialIntercepted => {
                write!(f, "{}: dial denied by connection gater", self.code())
            }
            Error::TransportDialFailed { message } => {
                write!(f, "{}: {}", self.code(), message)
            }
            Error::AggregateDial { errors } => {
                write!(f, "{}: all {} dial attempts failed", self.code(), errors.len())?;
                for e in errors {
                    write!(f, "; {e}")?;
                }
                Ok(())
            }
            Error::Timeout => write!(f, "{}: operation timed out", self.code()),
            Error::Aborted => write!(f, "{}: operation aborted", self.code()),
            Error::EncryptionFailed { message } => {
                write!(f, "{}: {}", self.code(), message)
            }
            Error::MuxerUnavailable => {
                write!(f, "{}: no mutually supported stream muxer", self.code())
            }
            Error::ConnectionIntercepted => {
                write!(f, "{}: connection denied by gater during upgrade", self.code())
            }
            Error::ConnectionEnded => {
                write!(f, "{}: stream ended before a full message arrived", self.code())
            }
            Error::InvalidMessage { message } => write!(f, "{}: {}", self.code(), message),
            Error::MissingPublicKey => {
                write!(f, "{}: identify message carried no public key", self.code())
            }
            Error::InvalidPeer { message } => write!(f, "{}: {}", self.code(), message),
            Error::UnsupportedProtocol => {
                write!(f, "{}: no protocol in common", self.code())
            }
            Error::StreamReset => write!(f, "{}: stream was reset", self.code()),
            Error::TooManyInboundStreams => {
                write!(f, "{}: inbound stream cap reached for protocol", self.code())
            }
            Error::TooManyOutboundStreams => {
                write!(f, "{}: outbound stream cap reached for protocol", self.code())
            }
            Error::TransientConnection => write!(
                f,
                "{}: protocol not registered to run on transient connections",
                self.code()
            ),
            Error::ConnectionClosed => write!(f, "{}: connection is closed", self.code()),
            Error::NotFound => write!(f, "{}: entry not found", self.code()),
            Error::InvalidParameters { message } => write!(f, "{}: {}", self.code(), message),
        }
    }
}

impl std::error::Error for Error {}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::DialedSelf.code(), "ErrDialedSelf");
        assert_eq!(Error::NotFound.code(), "ErrNotFound");
        assert_eq!(
            Error::TooManyAddresses { count: 30, limit: 25 }.code(),
            "ErrTooManyAddresses"
        );
        assert_eq!(Error::AggregateDial { errors: vec![] }.code(), "ErrTransportDialFailed");
    }

    #[test]
    fn aggregate_unwraps_single_error() {
        let single = Error::aggregate_dial(vec![Error::Timeout]);
        assert_eq!(single, Error::Timeout);

        let multi = Error::aggregate_dial(vec![Error::Timeout, Error::MuxerUnavailable]);
        assert!(matches!(multi, Error::AggregateDial { ref errors } if errors.len() == 2));

        assert_eq!(Error::aggregate_dial(vec![]), Error::NoValidAddresses);
    }

    #[test]
    fn display_includes_code() {
        let e = Error::invalid_peer("key does not match connection");
        assert!(e.to_string().starts_with("ErrInvalidPeer"));
    }
}
