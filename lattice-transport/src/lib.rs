//! Peer-to-peer transport core for a consensus node.
//!
//! Maintains authenticated, multiplexed, bidirectional streaming sessions
//! between nodes over an unreliable-datagram transport and routes
//! application messages either directly to a destination peer or through
//! relayer peers. Delivery is best-effort: bounded per-peer queues,
//! fingerprint deduplication, priority-biased batching, and flood-style
//! relaying with TTL-based loop suppression.
//!
//! # Topology
//!
//! Every node may act as a consumer, a relayer, or both. A host accepts
//! inbound *consumer* sessions on its listener and keeps supervised
//! outbound sessions to its configured *relayers*. Relayers periodically
//! broadcast the consumer lists they serve; receiving hosts fold those
//! into a TTL'd destination → relayers table and use it to pick forwarding
//! candidates for peers they have no direct session with.
//!
//! # Boundaries
//!
//! The QUIC (or other) transport lives behind [`Transport`] / [`Listener`]
//! / [`Client`]. Everything application-shaped — authentication payloads,
//! message consumption, the dedup store — comes in through [`SyncHandle`].

mod auth;
pub mod cache;
pub mod config;
mod dispatch;
pub mod error;
pub mod handle;
pub mod host;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod neighbors;
pub mod peer;
pub mod ring;
pub mod transport;

pub use cache::{CacheStore, DedupCache, MokaStore};
pub use config::TransportConfig;
pub use error::TransportError;
pub use handle::{AuthToken, SyncHandle};
pub use host::PeerHost;
pub use identity::NodeId;
pub use message::{
    Fingerprint, NetworkMessage, MSG_AUTHENTICATION, MSG_CONSUMERS, MSG_RELAY, MSG_SNAPSHOT,
    PROTOCOL_VERSION,
};
pub use metrics::{MetricEntry, MetricPool};
pub use neighbors::{NeighborMap, RelayersMap};
pub use peer::PeerSession;
pub use ring::{ChanMsg, Priority, Ring};
pub use transport::{validate_address, Client, Frame, Listener, Transport};
