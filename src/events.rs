//! # Node Event Bus
//!
//! Typed intra-node pub/sub. Components emit [`NodeEvent`]s; any number of
//! subscribers receive them over a broadcast channel.
//!
//! ## Delivery semantics
//!
//! Emission never blocks and never awaits listeners: a subscriber that
//! cannot keep up lags and loses the *oldest* events (bounded channel).
//! Components that must act on an event and then suspend fan the work out
//! to their own tasks.
//!
//! ## Ordering
//!
//! Events emitted from one task arrive at each subscriber in emission
//! order. In particular `connection:open` for a connection is always
//! observed before any `peer:identify` for that connection, because
//! identify only starts after observing the open event.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::Connection;
use crate::identify::IdentifyResult;
use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;
use crate::peer_store::PeerInfo;

/// Buffered events per subscriber before lagging sets in.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a node announces about itself and its peers.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A connection completed its upgrade and entered the inventory.
    ConnectionOpen(Arc<Connection>),
    /// A connection reached its terminal state.
    ConnectionClose(Arc<Connection>),
    /// A peer store entry changed. `previous` is absent on first insertion.
    PeerUpdate {
        peer: PeerInfo,
        previous: Option<PeerInfo>,
    },
    /// A peer was seen for the first time.
    PeerDiscovery(PeerInfo),
    /// Identify completed on a connection.
    PeerIdentify(IdentifyResult),
    /// This node's own advertised state (addresses or protocols) changed.
    SelfPeerUpdate { peer: PeerId },
    /// Transports started listening on these addresses.
    TransportListening { addrs: Vec<Multiaddr> },
    /// Listeners on these addresses shut down.
    TransportClose { addrs: Vec<Multiaddr> },
}

/// Cheap-to-clone handle on the node's event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers. A bus with no subscribers
    /// silently drops the event.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let peer = Keypair::generate().peer_id();
        bus.emit(NodeEvent::SelfPeerUpdate { peer: peer.clone() });
        bus.emit(NodeEvent::TransportListening { addrs: vec!["/memory/a".parse().unwrap()] });

        match rx.recv().await.unwrap() {
            NodeEvent::SelfPeerUpdate { peer: got } => assert_eq!(got, peer),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            NodeEvent::TransportListening { addrs } => assert_eq!(addrs.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        // Must not panic or block.
        bus.emit(NodeEvent::TransportClose { addrs: vec![] });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
