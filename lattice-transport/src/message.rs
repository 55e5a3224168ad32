//! Wire message schema and fingerprints.
//!
//! The outer frame belongs to the transport: a protocol version byte plus a
//! payload. The first payload byte is the message type. The core only
//! understands four types — authentication, consumer lists, snapshots and
//! the relay envelope — everything else is handed to the consensus layer
//! untouched.
//!
//! Fingerprints are blake3 hashes used as dedup keys. A relay envelope is
//! keyed per forwarding link: `H(H(envelope) ‖ "REMOTE")` scoped with the
//! candidate relayer's id, so the same logical payload may transit
//! different relayers while no single node re-forwards it within the TTL.

use crate::error::TransportError;
use crate::identity::NodeId;

/// Protocol version carried in the outer frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message type bytes known to the core.
pub const MSG_AUTHENTICATION: u8 = 1;
pub const MSG_CONSUMERS: u8 = 2;
pub const MSG_SNAPSHOT: u8 = 3;
pub const MSG_RELAY: u8 = 4;

/// Dedup key: a blake3 hash.
pub type Fingerprint = [u8; 32];

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub version: u8,
    pub mtype: u8,
    pub data: Vec<u8>,
}

impl NetworkMessage {
    /// Re-encode as a type-prefixed payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.mtype);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Split a frame payload into type byte and body.
pub fn parse_network_message(version: u8, payload: &[u8]) -> Result<NetworkMessage, TransportError> {
    if version != PROTOCOL_VERSION {
        return Err(TransportError::Malformed(format!("unsupported protocol version {version}")));
    }
    let (&mtype, data) = payload
        .split_first()
        .ok_or_else(|| TransportError::Malformed("empty payload".into()))?;
    Ok(NetworkMessage {
        version,
        mtype,
        data: data.to_vec(),
    })
}

/// Payload of the periodic consumer-list broadcast: the type byte followed
/// by the concatenated 32-byte ids.
pub fn build_consumers_message(ids: &[NodeId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + ids.len() * 32);
    out.push(MSG_CONSUMERS);
    for id in ids {
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Decode a consumer-list body (the bytes after the type byte).
pub fn parse_consumers_message(data: &[u8]) -> Result<Vec<NodeId>, TransportError> {
    if data.len() % 32 != 0 {
        return Err(TransportError::Malformed(format!(
            "consumer list length {} is not a multiple of 32",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .map(|chunk| {
            let mut id = [0u8; 32];
            id.copy_from_slice(chunk);
            NodeId::from_bytes(id)
        })
        .collect())
}

/// Relay envelope: type byte, destination id, then the inner type-prefixed
/// payload verbatim.
pub fn build_relay_message(dest: NodeId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 32 + payload.len());
    out.push(MSG_RELAY);
    out.extend_from_slice(dest.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a relay envelope body into (destination, inner payload).
pub fn parse_relay_message(data: &[u8]) -> Result<(NodeId, Vec<u8>), TransportError> {
    if data.len() < 32 {
        return Err(TransportError::Malformed("relay envelope shorter than a node id".into()));
    }
    let (id, inner) = data.split_at(32);
    if inner.is_empty() {
        return Err(TransportError::Malformed("relay envelope without inner payload".into()));
    }
    Ok((NodeId::try_from_slice(id)?, inner.to_vec()))
}

/// Hash bytes into a fingerprint.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    *blake3::hash(data).as_bytes()
}

/// Dedup key for a snapshot sent to one peer:
/// `H(dest ‖ snapshot ‖ "SNAP" ‖ type)`.
pub fn snapshot_message_key(dest: NodeId, snapshot: &[u8; 32], mtype: u8) -> Fingerprint {
    let mut buf = Vec::with_capacity(32 + 32 + 5);
    buf.extend_from_slice(dest.as_bytes());
    buf.extend_from_slice(snapshot);
    buf.extend_from_slice(b"SNAP");
    buf.push(mtype);
    fingerprint(&buf)
}

/// Base dedup key of a relay envelope, before per-link scoping.
pub fn relay_base_key(envelope: &[u8]) -> Fingerprint {
    let rk0 = fingerprint(envelope);
    let mut buf = Vec::with_capacity(32 + 6);
    buf.extend_from_slice(&rk0);
    buf.extend_from_slice(b"REMOTE");
    fingerprint(&buf)
}

/// Scope a relay base key to one forwarding link.
pub fn relay_link_key(base: &Fingerprint, link: NodeId) -> Fingerprint {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(base);
    buf.extend_from_slice(link.as_bytes());
    fingerprint(&buf)
}

/// Per-peer key for a broadcast payload: `H(payload ‖ peer)`.
pub fn peer_scoped_key(payload: &[u8], peer: NodeId) -> Fingerprint {
    let mut buf = Vec::with_capacity(payload.len() + 32);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(peer.as_bytes());
    fingerprint(&buf)
}
