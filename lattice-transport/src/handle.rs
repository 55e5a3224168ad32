//! Consensus-layer contract.
//!
//! The transport core is deliberately ignorant of what flows through it.
//! Everything application-shaped — building and verifying authentication
//! messages, consuming delivered payloads, reacting to a neighbor's sync
//! plane, supplying the dedup store — comes in through [`SyncHandle`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::cache::CacheStore;
use crate::identity::NodeId;
use crate::message::NetworkMessage;

/// Identity and role proven by a completed handshake.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub peer_id: NodeId,
    /// Whether the peer forwards traffic on behalf of others.
    pub is_relayer: bool,
    /// Opaque credential, kept on the session for later authorization of
    /// control messages.
    pub credential: Vec<u8>,
}

/// Hooks the consensus layer provides to the transport core.
#[async_trait]
pub trait SyncHandle: Send + Sync {
    /// Build the authentication payload sent to `remote` right after
    /// dialing. The returned bytes are a complete type-prefixed payload;
    /// the core frames and transmits them without inspection.
    async fn build_authentication_message(&self, remote: NodeId) -> Result<Vec<u8>>;

    /// Verify an inbound authentication body and resolve the peer's
    /// identity and role. `timeout` is the verification budget.
    async fn authenticate_as(&self, local: NodeId, body: &[u8], timeout: Duration) -> Result<AuthToken>;

    /// Application dispatch for messages the core does not consume itself.
    /// An error terminates the delivering session.
    async fn handle_peer_message(&self, from: NodeId, msg: NetworkMessage) -> Result<()>;

    /// Drain target for a neighbor's sync ring. Semantics are opaque to
    /// the core; an error ends that neighbor's sync loop.
    async fn sync_to_neighbor(&self, peer: NodeId, data: Vec<u8>) -> Result<()>;

    /// The admission-controlled store backing the shared dedup cache.
    fn cache_store(&self) -> Arc<dyn CacheStore>;
}
