//! Error taxonomy of the transport core.

use thiserror::Error;

use crate::identity::NodeId;

/// Errors surfaced by the transport core.
///
/// Direct-send backpressure ([`TransportError::QueueFull`]) is the only
/// variant callers are expected to handle as a routine condition; the rest
/// terminate the session or operation that produced them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer's bounded send queue is full. Best-effort delivery timed
    /// out from the caller's point of view.
    #[error("send to peer {0} timed out: queue full")]
    QueueFull(NodeId),

    /// The ring buffer was disposed; the owning session is gone.
    #[error("ring buffer disposed")]
    RingDisposed,

    /// No live session for the addressed peer.
    #[error("no session for peer {0}")]
    UnknownPeer(NodeId),

    /// A relayer address failed validation.
    #[error("invalid network address {0:?}")]
    InvalidAddress(String),

    /// A frame or message body could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The handshake was rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The inbound handshake did not complete within its ceiling.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// An opaque failure from the transport or the consensus layer.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
