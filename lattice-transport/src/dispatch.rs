//! Message routing.
//!
//! Outbound: [`PeerHost::send_to_peer`] decides between a silent success
//! (self or dedup hit), a direct ring offer, and a best-effort relay
//! fan-out. Inbound: [`PeerHost::route_peer_message`] consumes the control
//! types the core owns — consumer lists feed relay discovery, relay
//! envelopes are delivered or forwarded — and hands everything else to the
//! consensus layer.

use std::time::Duration;

use crate::error::TransportError;
use crate::host::PeerHost;
use crate::identity::NodeId;
use crate::message::{
    build_relay_message, parse_consumers_message, parse_network_message, parse_relay_message,
    relay_base_key, relay_link_key, snapshot_message_key, Fingerprint, NetworkMessage,
    MSG_AUTHENTICATION, MSG_CONSUMERS, MSG_RELAY,
};
use crate::ring::{ChanMsg, Priority};

/// Window within which a fingerprint suppresses re-sending.
pub(crate) const DEDUP_TTL: Duration = Duration::from_secs(60);

impl PeerHost {
    /// Route `data` to `dest`: directly when a session exists, otherwise
    /// wrapped in a relay envelope and fanned out across candidate
    /// relayers.
    ///
    /// Sending to ourselves and re-sending a fingerprint inside the dedup
    /// window both succeed silently. A full ring on the direct path is
    /// reported as [`TransportError::QueueFull`]; relay fan-out is
    /// best-effort and never fails the caller.
    pub fn send_to_peer(
        &self,
        dest: NodeId,
        mtype: u8,
        key: Option<Fingerprint>,
        data: &[u8],
        priority: Priority,
    ) -> Result<(), TransportError> {
        if dest == self.id() {
            return Ok(());
        }
        if let Some(key) = &key {
            if self.dedup.contains(key, DEDUP_TTL) {
                return Ok(());
            }
        }
        self.metrics.incr_sent(mtype);

        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(mtype);
        payload.extend_from_slice(data);

        if let Some(peer) = self.neighbor(dest) {
            return match peer.offer(priority, ChanMsg::new(key, payload))? {
                true => Ok(()),
                false => Err(TransportError::QueueFull(dest)),
            };
        }

        let envelope = build_relay_message(dest, &payload);
        self.relay_via_candidates(None, dest, envelope, priority);
        Ok(())
    }

    /// Send a snapshot, deduplicated per (destination, snapshot, type).
    pub fn send_snapshot_to_peer(
        &self,
        dest: NodeId,
        snapshot: &[u8; 32],
        mtype: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let key = snapshot_message_key(dest, snapshot, mtype);
        self.send_to_peer(dest, mtype, Some(key), data, Priority::Normal)
    }

    /// Fan a relay envelope out across candidate relayers, each enqueue
    /// keyed per link so no single relayer forwards the same envelope
    /// twice within the TTL while parallel relayers stay independent.
    /// Offer failures are logged, never propagated.
    fn relay_via_candidates(&self, exclude: Option<NodeId>, dest: NodeId, envelope: Vec<u8>, priority: Priority) {
        let base = relay_base_key(&envelope);
        let mut candidates = self
            .remote_relayers()
            .map(|map| map.get(dest))
            .unwrap_or_default();
        if candidates.is_empty() {
            candidates = self.relayers.slice().iter().map(|s| s.id()).collect();
        }
        if candidates.is_empty() {
            tracing::debug!(dest = %dest, "no relayer candidates, dropping message");
            return;
        }
        for candidate in candidates {
            if candidate == self.id() || Some(candidate) == exclude {
                continue;
            }
            let Some(peer) = self.neighbor(candidate) else {
                continue;
            };
            let key = relay_link_key(&base, candidate);
            match peer.offer(priority, ChanMsg::new(Some(key), envelope.clone())) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(relayer = %candidate, dest = %dest, "relay queue full, dropping");
                }
                Err(_) => {
                    tracing::debug!(relayer = %candidate, dest = %dest, "relay ring disposed");
                }
            }
        }
    }

    /// Handle one parsed inbound message from `from`. Errors terminate
    /// the delivering session.
    pub(crate) async fn route_peer_message(&self, from: NodeId, msg: NetworkMessage) -> Result<(), TransportError> {
        match msg.mtype {
            MSG_AUTHENTICATION => Err(TransportError::Malformed(
                "authentication message after handshake".into(),
            )),
            MSG_CONSUMERS => self.ingest_consumers(from, &msg.data),
            MSG_RELAY => self.relay_or_deliver(from, msg).await,
            _ => Ok(self.handle.handle_peer_message(from, msg).await?),
        }
    }

    /// A relayer told us which consumers it serves; feed relay discovery.
    fn ingest_consumers(&self, from: NodeId, data: &[u8]) -> Result<(), TransportError> {
        let Some(sender) = self.neighbor(from) else {
            return Ok(());
        };
        if !sender.is_relayer() {
            tracing::warn!(peer = %from, "ignoring consumer list from non-relayer");
            return Ok(());
        }
        let ids = parse_consumers_message(data)?;
        let Some(map) = self.remote_relayers() else {
            return Ok(());
        };
        for id in ids {
            if id != self.id() && id != from {
                map.add(id, from);
            }
        }
        Ok(())
    }

    /// A relay envelope arrived: unwrap it when we are the destination,
    /// otherwise forward it — to the destination itself when it is a
    /// direct neighbor, else across other relayers, never back to the
    /// sender.
    async fn relay_or_deliver(&self, from: NodeId, msg: NetworkMessage) -> Result<(), TransportError> {
        let (dest, inner) = parse_relay_message(&msg.data)?;
        if dest == self.id() {
            let inner = parse_network_message(msg.version, &inner)?;
            if inner.mtype == MSG_RELAY {
                return Err(TransportError::Malformed("nested relay envelope".into()));
            }
            return Ok(self.handle.handle_peer_message(from, inner).await?);
        }

        let envelope = msg.encode();
        if let Some(peer) = self.neighbor(dest) {
            let key = relay_link_key(&relay_base_key(&envelope), dest);
            match peer.offer(Priority::Normal, ChanMsg::new(Some(key), envelope)) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(peer = %dest, "forward queue full, dropping");
                }
                Err(_) => {}
            }
            return Ok(());
        }
        self.relay_via_candidates(Some(from), dest, envelope, Priority::Normal);
        Ok(())
    }
}
