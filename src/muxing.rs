//! # Stream Multiplexing
//!
//! Traits for stream muxers plus the [`FramedMuxer`], a length-prefix-framed
//! multiplexer used by the in-memory test harness and any transport without
//! native streams.
//!
//! ## Frame format
//!
//! Every frame is a 9-byte header followed by an optional payload:
//!
//! ```text
//! stream_id:u32 BE | flags:u8 | length:u32 BE | payload[length]
//! ```
//!
//! Flags: `SYN` opens a stream, `DATA` carries payload, `FIN` half-closes
//! the sender's write side, `RST` aborts both halves. The dialer allocates
//! odd stream ids, the listener even ones, so simultaneous opens never
//! collide.
//!
//! ## Stream model
//!
//! A [`Stream`] is a bidirectional byte channel with independent half-close:
//! shutting down the write half sends `FIN`, the read half drains until the
//! remote's `FIN`, and [`Stream::reset`] aborts both halves with an `RST`
//! signalled to the peer. Internally each stream is one side of a
//! `tokio::io::duplex` pair; per-stream pump tasks bridge the other side to
//! the shared connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::Direction;
use crate::errors::{Error, Result};
use crate::transport::BoxedIo;

/// Protocol id the framed muxer negotiates under.
pub const FRAMED_MUXER_PROTOCOL: &str = "/framed/1.0.0";

const FLAG_SYN: u8 = 0x01;
const FLAG_DATA: u8 = 0x02;
const FLAG_FIN: u8 = 0x04;
const FLAG_RST: u8 = 0x08;

/// Maximum payload carried by one DATA frame.
const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Buffer capacity of each stream's internal duplex pair. Writers beyond
/// this suspend until the pump drains, which is the per-stream backpressure.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Outstanding frames towards the connection writer before senders suspend.
const WRITER_QUEUE_DEPTH: usize = 64;

// ============================================================================
// Traits
// ============================================================================

/// A live stream multiplexer over one connection.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Open an outbound stream.
    async fn open_stream(&self) -> Result<Stream>;

    /// Wait for the next inbound stream.
    async fn accept_stream(&self) -> Result<Stream>;

    /// Ids of streams currently open.
    fn stream_ids(&self) -> Vec<u32>;

    /// Graceful close: stops new streams and tears down the connection once
    /// pending frames have flushed.
    async fn close(&self);

    /// Immediate, best-effort teardown.
    fn abort(&self);
}

/// Creates muxers over upgraded connections.
pub trait StreamMuxerFactory: Send + Sync {
    /// Protocol id announced during muxer negotiation.
    fn protocol(&self) -> &str;

    /// Wrap `io` in a muxer. `direction` decides stream-id parity.
    fn create_stream_muxer(&self, io: BoxedIo, direction: Direction) -> Arc<dyn StreamMuxer>;
}

// ============================================================================
// Stream
// ============================================================================

/// Notification fired when a stream is dropped, so the registrar can keep
/// live per-protocol counts without owning the stream.
#[derive(Clone, Debug)]
pub(crate) struct StreamEnd {
    pub connection_id: u64,
    pub protocol: String,
    pub direction: Direction,
}

/// A bidirectional byte channel bound to a connection.
pub struct Stream {
    id: u32,
    direction: Direction,
    protocol: Option<String>,
    io: DuplexStream,
    reset_tx: mpsc::UnboundedSender<u32>,
    remote_reset: Arc<AtomicBool>,
    local_reset: bool,
    /// Set by the registrar before dispatch; fired on drop.
    pub(crate) on_end: Option<(mpsc::UnboundedSender<StreamEnd>, u64)>,
}

impl Stream {
    /// Id, unique within the connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Protocol assigned after negotiation, if any yet.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub(crate) fn set_protocol(&mut self, protocol: &str) {
        self.protocol = Some(protocol.to_string());
    }

    /// Abort both halves and signal `RST` to the peer.
    pub fn reset(&mut self) {
        if !self.local_reset {
            self.local_reset = true;
            let _ = self.reset_tx.send(self.id);
        }
    }

    /// True when the remote reset this stream.
    pub fn is_reset(&self) -> bool {
        self.local_reset || self.remote_reset.load(Ordering::Acquire)
    }

    fn check_reset(&self) -> std::io::Result<()> {
        if self.is_reset() {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, Error::StreamReset))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Err(e) = self.check_reset() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let Err(e) = self.check_reset() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.io).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    /// Half-close: shutting down the write side delivers `FIN`; reads stay
    /// usable until the remote's own `FIN`.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some((tx, connection_id)) = self.on_end.take() {
            if let Some(protocol) = self.protocol.clone() {
                let _ = tx.send(StreamEnd { connection_id, protocol, direction: self.direction });
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("protocol", &self.protocol)
            .finish()
    }
}

// ============================================================================
// FramedMuxer
// ============================================================================

struct Frame {
    stream_id: u32,
    flags: u8,
    payload: Vec<u8>,
}

/// Muxer-side bookkeeping for one stream.
struct StreamSlot {
    /// Write half of the muxer's side of the duplex pair; inbound DATA goes
    /// here.
    to_stream: Option<tokio::io::WriteHalf<DuplexStream>>,
    remote_reset: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

struct MuxerShared {
    streams: Mutex<HashMap<u32, StreamSlot>>,
    frame_tx: mpsc::Sender<Frame>,
    reset_tx: mpsc::UnboundedSender<u32>,
    closed: AtomicBool,
}

impl MuxerShared {
    /// Allocate the duplex pair and pump for one stream and hand back the
    /// user-facing half.
    async fn install_stream(self: &Arc<Self>, id: u32, direction: Direction) -> Stream {
        let (user_side, muxer_side) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (from_stream, to_stream) = tokio::io::split(muxer_side);
        let remote_reset = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(outbound_pump(id, from_stream, self.frame_tx.clone()));

        self.streams.lock().await.insert(
            id,
            StreamSlot { to_stream: Some(to_stream), remote_reset: remote_reset.clone(), pump },
        );

        Stream {
            id,
            direction,
            protocol: None,
            io: user_side,
            reset_tx: self.reset_tx.clone(),
            remote_reset,
            local_reset: false,
            on_end: None,
        }
    }

    async fn drop_stream(&self, id: u32, mark_reset: bool) {
        if let Some(slot) = self.streams.lock().await.remove(&id) {
            if mark_reset {
                slot.remote_reset.store(true, Ordering::Release);
            }
            slot.pump.abort();
            // Dropping `to_stream` makes the user half read EOF.
        }
    }
}

/// Reads application bytes from one stream's muxer-side half and frames
/// them onto the connection. EOF becomes `FIN`.
async fn outbound_pump(
    id: u32,
    mut from_stream: tokio::io::ReadHalf<DuplexStream>,
    frame_tx: mpsc::Sender<Frame>,
) {
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        match from_stream.read(&mut buf).await {
            Ok(0) => {
                let _ = frame_tx.send(Frame { stream_id: id, flags: FLAG_FIN, payload: Vec::new() }).await;
                return;
            }
            Ok(n) => {
                let frame = Frame { stream_id: id, flags: FLAG_DATA, payload: buf[..n].to_vec() };
                if frame_tx.send(frame).await.is_err() {
                    return; // connection writer is gone
                }
            }
            Err(_) => {
                let _ = frame_tx.send(Frame { stream_id: id, flags: FLAG_RST, payload: Vec::new() }).await;
                return;
            }
        }
    }
}

/// The shipped multiplexer. One demux task routes inbound frames, one
/// writer task serializes outbound frames, and each stream gets a pump.
pub struct FramedMuxer {
    shared: Arc<MuxerShared>,
    next_stream_id: AtomicU32,
    incoming_rx: Mutex<mpsc::Receiver<Stream>>,
    demux: JoinHandle<()>,
    writer: JoinHandle<()>,
    reset_task: JoinHandle<()>,
}

impl FramedMuxer {
    pub fn new(io: BoxedIo, direction: Direction) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(WRITER_QUEUE_DEPTH);
        let (reset_tx, reset_rx) = mpsc::unbounded_channel::<u32>();
        let (incoming_tx, incoming_rx) = mpsc::channel::<Stream>(32);

        let shared = Arc::new(MuxerShared {
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            reset_tx,
            closed: AtomicBool::new(false),
        });

        let demux = tokio::spawn(demux_loop(shared.clone(), read_half, incoming_tx));
        let writer = tokio::spawn(writer_loop(write_half, frame_rx));
        let reset_task = tokio::spawn(reset_loop(shared.clone(), reset_rx));

        // Dialer allocates odd ids, listener even ids.
        let first_id = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };

        Self {
            shared,
            next_stream_id: AtomicU32::new(first_id),
            incoming_rx: Mutex::new(incoming_rx),
            demux,
            writer,
            reset_task,
        }
    }
}

#[async_trait]
impl StreamMuxer for FramedMuxer {
    async fn open_stream(&self) -> Result<Stream> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.install_stream(id, Direction::Outbound).await;
        self.shared
            .frame_tx
            .send(Frame { stream_id: id, flags: FLAG_SYN, payload: Vec::new() })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(stream = id, "opened outbound stream");
        Ok(stream)
    }

    async fn accept_stream(&self) -> Result<Stream> {
        self.incoming_rx.lock().await.recv().await.ok_or(Error::ConnectionClosed)
    }

    fn stream_ids(&self) -> Vec<u32> {
        match self.shared.streams.try_lock() {
            Ok(streams) => streams.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Half-close every stream so peers observe FIN, then stop the loops.
        let ids: Vec<u32> = self.shared.streams.lock().await.keys().copied().collect();
        for id in ids {
            let _ = self
                .shared
                .frame_tx
                .send(Frame { stream_id: id, flags: FLAG_FIN, payload: Vec::new() })
                .await;
            self.shared.drop_stream(id, false).await;
        }
        // Give the writer a moment to flush queued frames, then release the
        // underlying resource so the remote observes EOF.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        self.demux.abort();
        self.reset_task.abort();
        self.writer.abort();
    }

    fn abort(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.demux.abort();
        self.writer.abort();
        self.reset_task.abort();
        if let Ok(mut streams) = self.shared.streams.try_lock() {
            for (_, slot) in streams.drain() {
                slot.remote_reset.store(true, Ordering::Release);
                slot.pump.abort();
            }
        }
    }
}

impl Drop for FramedMuxer {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn demux_loop(
    shared: Arc<MuxerShared>,
    mut read_half: tokio::io::ReadHalf<BoxedIo>,
    incoming_tx: mpsc::Sender<Stream>,
) {
    let mut header = [0u8; 9];
    loop {
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let stream_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let flags = header[4];
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            debug!(stream = stream_id, len, "oversize frame, tearing down muxer");
            break;
        }
        let mut payload = vec![0u8; len];
        if len > 0 && read_half.read_exact(&mut payload).await.is_err() {
            break;
        }

        match flags {
            FLAG_SYN => {
                let stream = shared.install_stream(stream_id, Direction::Inbound).await;
                if incoming_tx.send(stream).await.is_err() {
                    shared.drop_stream(stream_id, true).await;
                }
            }
            FLAG_DATA => {
                // Take the write half out of the slot so the stream table
                // lock is not held across the write: a stream whose reader
                // has stopped draining stalls only itself, while resets,
                // closes, and new streams keep making progress.
                let taken = {
                    let mut streams = shared.streams.lock().await;
                    streams.get_mut(&stream_id).and_then(|slot| slot.to_stream.take())
                };
                if let Some(mut to_stream) = taken {
                    let write_ok = to_stream.write_all(&payload).await.is_ok();
                    if write_ok {
                        let mut streams = shared.streams.lock().await;
                        if let Some(slot) = streams.get_mut(&stream_id) {
                            slot.to_stream = Some(to_stream);
                        }
                        // A missing slot means the stream was reset or the
                        // muxer closed while the write was in flight; the
                        // half is dropped and the user side reads EOF.
                    }
                }
            }
            FLAG_FIN => {
                let mut streams = shared.streams.lock().await;
                if let Some(slot) = streams.get_mut(&stream_id) {
                    if let Some(mut to_stream) = slot.to_stream.take() {
                        let _ = to_stream.shutdown().await;
                    }
                }
            }
            FLAG_RST => {
                shared.drop_stream(stream_id, true).await;
            }
            other => {
                debug!(stream = stream_id, flags = other, "unknown frame flags, ignoring");
            }
        }
    }

    // Connection is gone: every open stream observes EOF.
    shared.closed.store(true, Ordering::Release);
    let ids: Vec<u32> = shared.streams.lock().await.keys().copied().collect();
    for id in ids {
        shared.drop_stream(id, false).await;
    }
}

async fn writer_loop(
    mut write_half: tokio::io::WriteHalf<BoxedIo>,
    mut frame_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = frame_rx.recv().await {
        let mut buf = Vec::with_capacity(9 + frame.payload.len());
        buf.extend_from_slice(&frame.stream_id.to_be_bytes());
        buf.push(frame.flags);
        buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&frame.payload);
        if write_half.write_all(&buf).await.is_err() {
            return;
        }
        let _ = write_half.flush().await;
    }
    let _ = write_half.shutdown().await;
}

async fn reset_loop(shared: Arc<MuxerShared>, mut reset_rx: mpsc::UnboundedReceiver<u32>) {
    while let Some(id) = reset_rx.recv().await {
        let _ = shared
            .frame_tx
            .send(Frame { stream_id: id, flags: FLAG_RST, payload: Vec::new() })
            .await;
        shared.drop_stream(id, true).await;
    }
}

/// Factory for [`FramedMuxer`].
#[derive(Default)]
pub struct FramedMuxerFactory;

impl FramedMuxerFactory {
    pub fn new() -> Self {
        Self
    }
}

impl StreamMuxerFactory for FramedMuxerFactory {
    fn protocol(&self) -> &str {
        FRAMED_MUXER_PROTOCOL
    }

    fn create_stream_muxer(&self, io: BoxedIo, direction: Direction) -> Arc<dyn StreamMuxer> {
        Arc::new(FramedMuxer::new(io, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn muxer_pair() -> (Arc<dyn StreamMuxer>, Arc<dyn StreamMuxer>) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let factory = FramedMuxerFactory::new();
        let dialer = factory.create_stream_muxer(Box::new(a), Direction::Outbound);
        let listener = factory.create_stream_muxer(Box::new(b), Direction::Inbound);
        (dialer, listener)
    }

    #[tokio::test]
    async fn open_write_read_across_muxers() {
        let (dialer, listener) = muxer_pair();

        let mut out = dialer.open_stream().await.unwrap();
        out.write_all(b"hello over stream").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = listener.accept_stream().await.unwrap();
        let mut buf = vec![0u8; 17];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over stream");

        // Streams are bidirectional.
        inbound.write_all(b"echo").await.unwrap();
        inbound.flush().await.unwrap();
        let mut reply = vec![0u8; 4];
        out.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"echo");
    }

    #[tokio::test]
    async fn half_close_delivers_fin_but_keeps_reads() {
        let (dialer, listener) = muxer_pair();

        let mut out = dialer.open_stream().await.unwrap();
        out.write_all(b"last words").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = listener.accept_stream().await.unwrap();
        let mut all = Vec::new();
        inbound.read_to_end(&mut all).await.unwrap();
        assert_eq!(&all, b"last words");

        // The reverse direction still works after the remote's FIN.
        inbound.write_all(b"still open").await.unwrap();
        inbound.flush().await.unwrap();
        let mut buf = vec![0u8; 10];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still open");
    }

    #[tokio::test]
    async fn reset_aborts_both_halves() {
        let (dialer, listener) = muxer_pair();

        let mut out = dialer.open_stream().await.unwrap();
        out.write_all(b"x").await.unwrap();
        let mut inbound = listener.accept_stream().await.unwrap();

        out.reset();
        // The remote eventually observes the reset as an error or EOF-with-flag.
        let mut buf = [0u8; 16];
        loop {
            match inbound.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        assert!(inbound.is_reset() || out.is_reset());
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_interleave_payloads() {
        let (dialer, listener) = muxer_pair();

        let accept_task = {
            let listener = listener.clone();
            tokio::spawn(async move {
                let mut results = Vec::new();
                for _ in 0..4 {
                    let mut s = listener.accept_stream().await.unwrap();
                    results.push(tokio::spawn(async move {
                        let mut all = Vec::new();
                        s.read_to_end(&mut all).await.unwrap();
                        all
                    }));
                }
                let mut bodies = Vec::new();
                for r in results {
                    bodies.push(r.await.unwrap());
                }
                bodies
            })
        };

        let mut writers = Vec::new();
        for i in 0u8..4 {
            let dialer = dialer.clone();
            writers.push(tokio::spawn(async move {
                let mut s = dialer.open_stream().await.unwrap();
                let body = vec![i; 32 * 1024];
                s.write_all(&body).await.unwrap();
                s.shutdown().await.unwrap();
                body
            }));
        }
        let mut expected = Vec::new();
        for w in writers {
            expected.push(w.await.unwrap());
        }

        let mut bodies = accept_task.await.unwrap();
        bodies.sort();
        expected.sort();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn slow_reader_does_not_hold_the_stream_table_lock() {
        let (dialer, listener) = muxer_pair();
        let mut out = dialer.open_stream().await.unwrap();
        let inbound = listener.accept_stream().await.unwrap(); // never read

        // Overfill the inbound stream's buffer so the listener's demux task
        // blocks mid-write into it.
        let writer = tokio::spawn(async move {
            let chunk = vec![0u8; 64 * 1024];
            for _ in 0..8 {
                if out.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = out.flush().await;
            }
            out
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The stream table must still be reachable while that write is
        // stalled: opening a stream takes the same lock.
        tokio::time::timeout(std::time::Duration::from_secs(1), listener.open_stream())
            .await
            .expect("stream table must not be wedged by a slow reader")
            .expect("open succeeds");

        // Dropping the unread stream releases the stalled write.
        drop(inbound);
        let _ = writer.await;
    }

    #[tokio::test]
    async fn dialer_and_listener_ids_never_collide() {
        let (dialer, listener) = muxer_pair();
        let a = dialer.open_stream().await.unwrap();
        let b = listener.open_stream().await.unwrap();
        assert_ne!(a.id() % 2, b.id() % 2);
    }
}
