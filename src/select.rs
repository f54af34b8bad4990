//! # Protocol Select
//!
//! The length-prefixed line protocol that negotiates which protocol runs
//! next over any byte stream. It is used twice during connection upgrade
//! (choosing the security method, then the muxer) and again on every new
//! stream (choosing the application protocol).
//!
//! ## Wire format
//!
//! Every message is a UTF-8 line terminated by `\n`, preceded by its length
//! as an unsigned varint. A new (sub)stream opens with both sides sending
//! the version line. The dialer then proposes protocols one at a time; the
//! listener echoes the first one it supports or answers `na`. A dialer may
//! send `ls` to enumerate the listener's protocols.
//!
//! ```text
//! dialer                         listener
//!   /multistream/1.0.0    -->
//!                         <--    /multistream/1.0.0
//!   /echo/1.0.0           -->
//!                         <--    na
//!   /echo/2.0.0           -->
//!                         <--    /echo/2.0.0        (negotiated)
//! ```
//!
//! Protocol names `ls` and `na` collide with the control tokens and can
//! never negotiate; don't name a protocol that.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::signal::AbortSignal;

/// Version line exchanged on every new (sub)stream.
pub const VERSION_LINE: &str = "/multistream/1.0.0";

/// Listener's refusal of a proposed protocol.
const TOKEN_NA: &str = "na";

/// Dialer's request to list supported protocols.
const TOKEN_LS: &str = "ls";

/// Maximum length of one message, varint prefix excluded.
pub const MAX_MESSAGE_LEN: usize = 1024;

// ============================================================================
// Framing
// ============================================================================

/// Read an unsigned LEB128 varint.
async fn read_varint<S: AsyncRead + Unpin>(io: &mut S) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = io.read_u8().await.map_err(|_| Error::ConnectionEnded)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 21 {
            // Frames are capped at MAX_MESSAGE_LEN; longer prefixes are hostile.
            return Err(Error::invalid_message("varint length prefix too large"));
        }
    }
}

async fn write_varint<S: AsyncWrite + Unpin>(io: &mut S, mut value: u64) -> Result<()> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        buf[n] = if value == 0 { byte } else { byte | 0x80 };
        n += 1;
        if value == 0 {
            break;
        }
    }
    io.write_all(&buf[..n]).await.map_err(|_| Error::ConnectionEnded)
}

/// Write one `\n`-terminated, length-prefixed message.
pub(crate) async fn write_message<S>(io: &mut S, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = message.len() + 1;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::invalid_message("protocol name too long"));
    }
    write_varint(io, len as u64).await?;
    io.write_all(message.as_bytes()).await.map_err(|_| Error::ConnectionEnded)?;
    io.write_all(b"\n").await.map_err(|_| Error::ConnectionEnded)?;
    io.flush().await.map_err(|_| Error::ConnectionEnded)
}

/// Read one message, stripping the trailing newline.
pub(crate) async fn read_message<S>(io: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await? as usize;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(Error::invalid_message(format!("message length {len} out of range")));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.map_err(|_| Error::ConnectionEnded)?;
    if buf.pop() != Some(b'\n') {
        return Err(Error::invalid_message("message missing newline terminator"));
    }
    String::from_utf8(buf).map_err(|_| Error::invalid_message("message is not UTF-8"))
}

// ============================================================================
// Negotiation
// ============================================================================

/// Dialer side: propose `candidates` in order and return the first one the
/// listener accepts.
///
/// # Errors
/// `ErrUnsupportedProtocol` when the listener supports none of the
/// candidates; `ErrAborted`/`ErrTimeout` when `signal` fires mid-handshake.
pub async fn select<S>(io: &mut S, candidates: &[String], signal: &AbortSignal) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let negotiation = async {
        write_message(io, VERSION_LINE).await?;
        let version = read_message(io).await?;
        if version != VERSION_LINE {
            return Err(Error::invalid_message(format!("unexpected version line '{version}'")));
        }

        for candidate in candidates {
            write_message(io, candidate).await?;
            let reply = read_message(io).await?;
            if reply == *candidate {
                trace!(protocol = %candidate, "negotiated protocol");
                return Ok(candidate.clone());
            }
            if reply != TOKEN_NA {
                return Err(Error::invalid_message(format!("unexpected reply '{reply}'")));
            }
        }
        Err(Error::UnsupportedProtocol)
    };

    tokio::select! {
        result = negotiation => result,
        _ = signal.aborted() => {
            Err(if signal.deadline_elapsed() { Error::Timeout } else { Error::Aborted })
        }
    }
}

/// Listener side: answer proposals until one matches `supported`, replying
/// `na` to unknown proposals and a protocol list to `ls`.
pub async fn handle<S>(io: &mut S, supported: &[String]) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let version = read_message(io).await?;
    if version != VERSION_LINE {
        return Err(Error::invalid_message(format!("unexpected version line '{version}'")));
    }
    write_message(io, VERSION_LINE).await?;

    loop {
        let proposal = read_message(io).await?;
        match proposal.as_str() {
            TOKEN_LS => {
                // One reply per supported protocol, on its own line inside
                // a single message.
                let listing = supported.join("\n");
                write_message(io, &listing).await?;
            }
            _ if supported.contains(&proposal) => {
                write_message(io, &proposal).await?;
                trace!(protocol = %proposal, "accepted protocol");
                return Ok(proposal);
            }
            _ => {
                write_message(io, TOKEN_NA).await?;
            }
        }
    }
}

/// Optimistic dialer side for a single protocol: send the version line and
/// the proposal without waiting for agreement, so the first application
/// write piggybacks on the negotiation round-trip.
///
/// The listener's answer is consumed by [`finish_lazy_select`]; a caller
/// that writes before finishing must be prepared for the peer to reset the
/// stream, which surfaces as `ErrUnsupportedProtocol` on the first read.
pub async fn lazy_select<S>(io: &mut S, protocol: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    write_message(io, VERSION_LINE).await?;
    write_message(io, protocol).await?;
    Ok(protocol.to_string())
}

/// Consume the listener's replies to a [`lazy_select`].
pub async fn finish_lazy_select<S>(io: &mut S, protocol: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let version = read_message(io).await.map_err(|_| Error::UnsupportedProtocol)?;
    if version != VERSION_LINE {
        return Err(Error::invalid_message(format!("unexpected version line '{version}'")));
    }
    let reply = read_message(io).await.map_err(|_| Error::UnsupportedProtocol)?;
    if reply == protocol {
        Ok(())
    } else {
        Err(Error::UnsupportedProtocol)
    }
}
