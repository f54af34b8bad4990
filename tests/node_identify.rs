//! Integration tests for the identify protocol: the post-connection
//! exchange, the push on self change, signed-record adoption, and observed
//! addresses.

use std::sync::Arc;
use std::time::Duration;

use lattica::events::NodeEvent;
use lattica::transport::{MemoryHub, MemoryTransport};
use lattica::{
    DialOptions, FramedMuxerFactory, Node, PeerId, PROTOCOL_IDENTIFY, PROTOCOL_IDENTIFY_PUSH,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Opt into log output with RUST_LOG=lattica=trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

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

/// Poll until `check` passes or the harness deadline expires.
async fn wait_for<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn known_protocols(node: &Node, peer: &PeerId) -> Vec<String> {
    match node.peer_store().get(peer).await {
        Ok(info) => info.protocols,
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn identify_runs_after_connection_open() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;
    let mut n1_events = n1.events();

    let addr = n2.listen_addrs().await[0].clone();
    n1.dial(addr, DialOptions::default()).await.expect("dial");

    // connection:open must arrive strictly before peer:identify.
    let ordered = timeout(TEST_TIMEOUT, async {
        let mut saw_open = false;
        loop {
            match n1_events.recv().await.expect("event stream open") {
                NodeEvent::ConnectionOpen(conn) if conn.remote_peer() == n2.peer_id() => {
                    saw_open = true;
                }
                NodeEvent::PeerIdentify(result) if &result.peer_id == n2.peer_id() => {
                    return saw_open;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("identify within deadline");
    assert!(ordered, "peer:identify must not precede connection:open");

    // The store now knows the peer's identify protocols.
    let protocols = known_protocols(&n1, n2.peer_id()).await;
    assert!(protocols.iter().any(|p| p == PROTOCOL_IDENTIFY), "{protocols:?}");
    assert!(protocols.iter().any(|p| p == PROTOCOL_IDENTIFY_PUSH), "{protocols:?}");

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn identify_certifies_addresses_from_the_signed_record() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    n1.dial(addr, DialOptions::default()).await.expect("dial");

    wait_for("certified addresses for n2", || async {
        match n1.peer_store().get(n2.peer_id()).await {
            Ok(info) => {
                info.peer_record_envelope.is_some()
                    && info.addresses.iter().any(|a| a.is_certified)
            }
            Err(_) => false,
        }
    })
    .await;

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn handle_pushes_new_protocol_to_connected_peers() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    n1.dial(addr, DialOptions::default()).await.expect("dial");

    // Wait for identify to settle in both directions, so each side knows
    // the other supports push.
    wait_for("mutual identify", || async {
        known_protocols(&n1, n2.peer_id()).await.iter().any(|p| p == PROTOCOL_IDENTIFY_PUSH)
            && known_protocols(&n2, n1.peer_id()).await.iter().any(|p| p == PROTOCOL_IDENTIFY_PUSH)
    })
    .await;

    // Registering a handler changes self state; the push carries it over.
    n1.handle("/foo/1.0.0", |_stream, _conn| async {}, Default::default()).await;

    wait_for("n2 to learn /foo/1.0.0 via push", || async {
        known_protocols(&n2, n1.peer_id()).await.iter().any(|p| p == "/foo/1.0.0")
    })
    .await;

    // And unhandle withdraws it again.
    n1.unhandle("/foo/1.0.0").await;
    wait_for("n2 to forget /foo/1.0.0 via push", || async {
        !known_protocols(&n2, n1.peer_id()).await.iter().any(|p| p == "/foo/1.0.0")
    })
    .await;

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn observed_addresses_are_tracked_but_not_advertised_until_confirmed() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    n1.dial(addr, DialOptions::default()).await.expect("dial");

    // n2 told n1 the address it observed n1 at (the dial-side pseudo
    // address of the memory transport).
    wait_for("n1 to record an observed address", || async {
        !n1.address_manager().get_observed_addrs().await.is_empty()
    })
    .await;

    let observed = n1.address_manager().get_observed_addrs().await;
    let advertised = n1.addresses().await;
    for addr in &observed {
        assert!(
            !advertised.iter().any(|a| a.decapsulate("p2p") == *addr),
            "unconfirmed observed address {addr} must not be advertised"
        );
    }

    // Confirmation promotes it into the advertised set.
    n1.address_manager().confirm_observed_addr(&observed[0]).await;
    let advertised = n1.addresses().await;
    assert!(
        advertised.iter().any(|a| a.decapsulate("p2p") == observed[0]),
        "confirmed observed address must be advertised"
    );

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn both_sides_learn_each_other() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;

    let addr = n2.listen_addrs().await[0].clone();
    n1.dial(addr, DialOptions::default()).await.expect("dial");

    // Identify is symmetric: the listener identifies the dialer too.
    wait_for("n2 to identify n1", || async {
        known_protocols(&n2, n1.peer_id()).await.iter().any(|p| p == PROTOCOL_IDENTIFY)
    })
    .await;

    // Agent metadata lands in the store.
    let info = n2.peer_store().get(n1.peer_id()).await.expect("n1 entry");
    let agent = info.metadata.get("AgentVersion").expect("agent version recorded");
    assert!(String::from_utf8_lossy(agent).starts_with("lattica/"));

    n1.stop().await;
    n2.stop().await;
}
