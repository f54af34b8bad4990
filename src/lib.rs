//! # Lattica - Modular Peer-to-Peer Networking
//!
//! Lattica is a peer-to-peer networking node: it establishes, secures,
//! multiplexes, and manages authenticated connections to other nodes, and
//! runs protocols over them.
//!
//! - **Identity**: Ed25519 keypairs; peer ids are multihashes of the public key
//! - **Addresses**: self-describing layered multiaddresses
//! - **Upgrade**: raw byte stream → security handshake → stream muxer,
//!   negotiated over a length-prefixed protocol-selection line protocol
//! - **Dialing**: deduplicated, concurrency-bounded candidate racing
//! - **Identify**: in-band exchange of identity, protocols, addresses, and
//!   signed peer records, persisted in the peer store
//!
//! ## Architecture
//!
//! Components are allocated in one phase and wired in a second, with weak
//! back-references breaking the natural cycles. Each component serializes
//! its own mutations; readers get point-in-time snapshots. A typed event
//! bus (`connection:open`, `peer:update`, `peer:identify`, ...) carries
//! everything the node announces.
//!
//! Concrete transports, production handshakes, and muxers plug in through
//! the `Transport`, `ConnectionSecurity`, and `StreamMuxerFactory` traits;
//! in-memory implementations of all three ship with the crate.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, public keys, peer ids |
//! | `multiaddr` | Layered network addresses |
//! | `transport` | Transport contracts, manager, memory transport |
//! | `security` | Security handshake contracts, plaintext, PSK protector |
//! | `muxing` | Stream muxer contracts, framed muxer, streams |
//! | `upgrader` | Security + muxer negotiation pipeline |
//! | `select` | Protocol-selection line protocol |
//! | `connection` | Authenticated connection handles |
//! | `connection_manager` | Inventory, limits, pruning, auto-dial |
//! | `dial` | Dial queue: resolution, dedup, racing |
//! | `registrar` | Protocol handlers, stream caps, topologies |
//! | `identify` | Identify and identify-push protocols |
//! | `peer_store` | Persistent peer knowledge base |
//! | `address_manager` | Listen/announce/observed self-addresses |
//! | `record` | Signed peer records |
//! | `events` | Typed node event bus |
//! | `gater` | Connection admission policy |
//! | `ping` | Latency probe protocol |
//! | `errors` | Error taxonomy with stable codes |
//! | `signal` | Composable abort signals |

pub mod address_manager;
pub mod connection;
pub mod connection_manager;
pub mod dial;
pub mod errors;
pub mod events;
pub mod gater;
pub mod identify;
pub mod identity;
pub mod messages;
pub mod multiaddr;
pub mod muxing;
pub mod node;
pub mod peer_store;
pub mod ping;
pub mod record;
pub mod registrar;
pub mod security;
pub mod select;
pub mod signal;
pub mod transport;
pub mod upgrader;

pub use connection::{Connection, ConnectionStatus, Direction};
pub use connection_manager::{ConnectionLimits, KEEP_ALIVE_TAG};
pub use dial::{DialOptions, DialQueueConfig, DialTarget};
pub use errors::{Error, Result};
pub use events::NodeEvent;
pub use identify::{IdentifyConfig, IdentifyResult, PROTOCOL_IDENTIFY, PROTOCOL_IDENTIFY_PUSH};
pub use identity::{Keypair, PeerId, PublicKey};
pub use multiaddr::{Multiaddr, Protocol};
pub use muxing::{FramedMuxerFactory, Stream};
pub use node::{Node, NodeBuilder};
pub use peer_store::{AddressRecord, PeerInfo, PeerStore, TagOptions};
pub use record::PeerRecord;
pub use registrar::{StreamHandlerOptions, Topology};
pub use security::{PlaintextSecurity, PskProtector};
pub use signal::{AbortHandle, AbortSignal};
pub use transport::{MemoryHub, MemoryTransport, Transport};
