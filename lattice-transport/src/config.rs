//! Host configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::host::PeerHost`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Cadence of the consumer-list broadcast, and the pause between
    /// reconnect attempts to a configured relayer.
    pub snapshot_round_gap: Duration,
    /// Budget handed to the consensus layer for verifying an inbound
    /// authentication message.
    pub handshake_timeout: Duration,
    /// Stream fan-in of the underlying multiplexed transport. Relayer
    /// sessions scale their ring capacity by this factor.
    pub max_incoming_streams: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            snapshot_round_gap: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            max_incoming_streams: 128,
        }
    }
}
