//! # Ping
//!
//! `/ipfs/ping/1.0.0`: the responder echoes 32-byte payloads back until the
//! requester closes the stream. One round trip measures peer latency.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::connection::Connection;
use crate::errors::{Error, Result};
use crate::registrar::{Registrar, StreamHandlerOptions};
use crate::signal::AbortSignal;

/// Ping protocol id.
pub const PROTOCOL_PING: &str = "/ipfs/ping/1.0.0";

/// Payload size of one ping.
const PING_SIZE: usize = 32;

/// Default bound on one ping round trip.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Register the echo responder.
pub(crate) async fn register(registrar: &Registrar) {
    registrar
        .handle(
            PROTOCOL_PING,
            Arc::new(|mut stream, _conn| {
                Box::pin(async move {
                    let mut buf = [0u8; PING_SIZE];
                    loop {
                        match stream.read_exact(&mut buf).await {
                            Ok(_) => {
                                if stream.write_all(&buf).await.is_err()
                                    || stream.flush().await.is_err()
                                {
                                    return;
                                }
                            }
                            Err(_) => return, // requester closed the stream
                        }
                    }
                })
            }),
            StreamHandlerOptions { run_on_transient_connection: true, ..Default::default() },
        )
        .await;
}

/// Ping the remote end of `connection` once, returning the round-trip time.
///
/// # Errors
/// `ErrInvalidMessage` when the echoed payload differs from what was sent;
/// negotiation and timeout errors pass through.
pub async fn ping(connection: &Arc<Connection>, signal: &AbortSignal) -> Result<Duration> {
    let signal = signal.merge(&AbortSignal::deadline(DEFAULT_PING_TIMEOUT));
    let mut stream = connection.new_stream(&[PROTOCOL_PING.to_string()], &signal).await?;

    let payload: [u8; PING_SIZE] = rand::random();
    let started = tokio::time::Instant::now();

    let round_trip = async {
        stream.write_all(&payload).await.map_err(|_| Error::ConnectionEnded)?;
        stream.flush().await.map_err(|_| Error::ConnectionEnded)?;
        let mut echoed = [0u8; PING_SIZE];
        stream.read_exact(&mut echoed).await.map_err(|_| Error::ConnectionEnded)?;
        if echoed != payload {
            return Err(Error::invalid_message("ping payload mismatch"));
        }
        Ok(started.elapsed())
    };

    let result = tokio::select! {
        result = round_trip => result,
        _ = signal.aborted() => {
            Err(if signal.deadline_elapsed() { Error::Timeout } else { Error::Aborted })
        }
    };
    match &result {
        Ok(rtt) => trace!(peer = %connection.remote_peer().short(), rtt_ms = rtt.as_millis() as u64, "ping"),
        Err(_) => stream.reset(),
    }
    let _ = stream.shutdown().await;
    result
}
