//! Integration tests for dial orchestration: self-dial rejection,
//! concurrent dial deduplication, cancellation, and timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattica::dial::DialQueueConfig;
use lattica::errors::Result as LatticaResult;
use lattica::multiaddr::Multiaddr;
use lattica::peer_store::PeerUpdate;
use lattica::signal::AbortSignal;
use lattica::transport::{MemoryHub, MemoryTransport, RawConnection, Transport, TransportListener};
use lattica::{DialOptions, FramedMuxerFactory, Node};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Opt into log output with RUST_LOG=lattica=trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Build and start a node listening on a fresh memory address in `hub`.
async fn spawn_node(hub: &Arc<MemoryHub>) -> Node {
    init_tracing();
    let node = Node::builder()
        .listen_on("/memory/0".parse().unwrap())
        .transport(Arc::new(MemoryTransport::new(hub.clone())))
        .plaintext_security()
        .muxer(Arc::new(FramedMuxerFactory::new()))
        .build()
        .expect("build node");
    node.start().await.expect("start node");
    node
}

/// Transport wrapper counting dial invocations.
struct CountingTransport {
    inner: MemoryTransport,
    dials: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for CountingTransport {
    fn tag(&self) -> &'static str {
        self.inner.tag()
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.inner.can_dial(addr)
    }

    async fn dial(&self, addr: &Multiaddr, signal: &AbortSignal) -> LatticaResult<RawConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(addr, signal).await
    }

    async fn listen(&self, addr: &Multiaddr) -> LatticaResult<Box<dyn TransportListener>> {
        self.inner.listen(addr).await
    }
}

#[tokio::test]
async fn dial_self_is_rejected_and_leaves_no_pending_dial() {
    let hub = MemoryHub::new();
    let node = spawn_node(&hub).await;

    let err = node
        .dial(node.peer_id().clone(), DialOptions::default())
        .await
        .expect_err("dialing own peer id must fail");
    assert_eq!(err.code(), "ErrDialedSelf");

    let dial_queue = node.connection_manager().get_dial_queue();
    assert_eq!(dial_queue.pending_count().await, 0, "no pending dial may remain");

    node.stop().await;
}

#[tokio::test]
async fn dial_by_address_connects_and_authenticates() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    let conn = timeout(TEST_TIMEOUT, n1.dial(addr, DialOptions::default()))
        .await
        .expect("dial within deadline")
        .expect("dial succeeds");

    assert_eq!(conn.remote_peer(), n2.peer_id());
    assert_eq!(n1.get_connections(Some(n2.peer_id())).await.len(), 1);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn concurrent_dials_share_one_connection_and_one_transport_dial() {
    let hub = MemoryHub::new();
    let dials = Arc::new(AtomicUsize::new(0));

    let n1 = Node::builder()
        .transport(Arc::new(CountingTransport {
            inner: MemoryTransport::new(hub.clone()),
            dials: dials.clone(),
        }))
        .plaintext_security()
        .muxer(Arc::new(FramedMuxerFactory::new()))
        .build()
        .expect("build node");
    n1.start().await.expect("start node");

    let n2 = spawn_node(&hub).await;

    // Teach n1 where n2 lives, then race ten dials at the peer id.
    let n2_addr = n2.listen_addrs().await[0].clone();
    n1.peer_store()
        .merge(n2.peer_id(), PeerUpdate::with_multiaddrs([n2_addr]))
        .await
        .expect("seed peer store");

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let n1 = &n1;
        let peer = n2.peer_id().clone();
        tasks.push(async move { n1.dial(peer, DialOptions::default()).await });
    }
    let results = timeout(TEST_TIMEOUT, futures_join_all(tasks))
        .await
        .expect("dials within deadline");

    let first = results[0].as_ref().expect("first dial succeeds").id();
    for result in &results {
        assert_eq!(
            result.as_ref().expect("every dial succeeds").id(),
            first,
            "all concurrent dials must resolve to the identical connection"
        );
    }
    assert_eq!(dials.load(Ordering::SeqCst), 1, "transport dial must run at most once");

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn dialing_unknown_peer_fails_with_no_valid_addresses() {
    let hub = MemoryHub::new();
    let node = spawn_node(&hub).await;

    let stranger = lattica::Keypair::generate().peer_id();
    let err = node
        .dial(stranger, DialOptions::default())
        .await
        .expect_err("no addresses known");
    assert_eq!(err.code(), "ErrNoValidAddresses");

    node.stop().await;
}

#[tokio::test]
async fn caller_abort_cancels_the_dial() {
    let hub = MemoryHub::new();
    let node = spawn_node(&hub).await;

    // A listener that accepts but never negotiates, so the upgrade hangs.
    let silent_transport = MemoryTransport::new(hub.clone());
    let mut silent = silent_transport.listen(&"/memory/silent".parse().unwrap()).await.unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok(conn) = silent.accept().await {
            held.push(conn); // keep the connection open, say nothing
        }
    });

    let (handle, signal) = AbortSignal::manual();
    let target: Multiaddr = "/memory/silent".parse().unwrap();
    let dial = node.dial(target, DialOptions { signal, ..Default::default() });

    let abort_after = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    };
    let (result, ()) = tokio::join!(dial, abort_after);
    let err = result.expect_err("aborted dial must fail");
    assert_eq!(err.code(), "ErrAborted");

    node.stop().await;
}

#[tokio::test]
async fn dial_timeout_surfaces_as_err_timeout() {
    let hub = MemoryHub::new();
    let node = Node::builder()
        .transport(Arc::new(MemoryTransport::new(hub.clone())))
        .plaintext_security()
        .muxer(Arc::new(FramedMuxerFactory::new()))
        .dial_config(DialQueueConfig { dial_timeout: Duration::from_millis(100), ..Default::default() })
        .build()
        .expect("build node");
    node.start().await.expect("start node");

    // Same silent listener: the dial can only end by timeout.
    let silent_transport = MemoryTransport::new(hub.clone());
    let mut silent = silent_transport.listen(&"/memory/tarpit".parse().unwrap()).await.unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok(conn) = silent.accept().await {
            held.push(conn);
        }
    });

    let target: Multiaddr = "/memory/tarpit".parse().unwrap();
    let err = timeout(TEST_TIMEOUT, node.dial(target, DialOptions::default()))
        .await
        .expect("dial must end before the harness deadline")
        .expect_err("dial must time out");
    assert_eq!(err.code(), "ErrTimeout");

    node.stop().await;
}

#[tokio::test]
async fn second_dial_reuses_the_open_connection() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    let first = n1.dial(addr, DialOptions::default()).await.expect("first dial");
    let second = n1
        .dial(n2.peer_id().clone(), DialOptions::default())
        .await
        .expect("second dial");
    assert_eq!(first.id(), second.id(), "open connection must be reused");

    n1.stop().await;
    n2.stop().await;
}

/// Join a small set of identical borrowing futures concurrently. Every
/// future is polled once before any can complete, so all ten dials are in
/// flight before the first resolves.
async fn futures_join_all<F>(futures: Vec<F>) -> Vec<F::Output>
where
    F: std::future::Future,
{
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct JoinAll<F: Future> {
        pending: Vec<Option<Pin<Box<F>>>>,
        done: Vec<Option<F::Output>>,
    }

    impl<F: Future> Future for JoinAll<F> {
        type Output = Vec<F::Output>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            // Safety: `pending` holds `Pin<Box<F>>` (address-stable via the
            // box) and `done` holds plain `F::Output` values that are never
            // pinned, so moving the `JoinAll` itself is sound.
            let this = unsafe { self.get_unchecked_mut() };
            let mut all_done = true;
            for (slot, out) in this.pending.iter_mut().zip(this.done.iter_mut()) {
                if let Some(fut) = slot {
                    match fut.as_mut().poll(cx) {
                        Poll::Ready(value) => {
                            *out = Some(value);
                            *slot = None;
                        }
                        Poll::Pending => all_done = false,
                    }
                }
            }
            if all_done {
                Poll::Ready(this.done.iter_mut().map(|o| o.take().unwrap()).collect())
            } else {
                Poll::Pending
            }
        }
    }

    let len = futures.len();
    JoinAll {
        pending: futures.into_iter().map(|f| Some(Box::pin(f))).collect(),
        done: (0..len).map(|_| None).collect(),
    }
    .await
}
