//! Per-message-type traffic counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sent/received totals for one message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricEntry {
    pub sent: u64,
    pub received: u64,
}

/// Counters indexed by the message type byte. Lock-free; increments are
/// relaxed since the totals are informational.
pub struct MetricPool {
    sent: [AtomicU64; 256],
    received: [AtomicU64; 256],
}

impl MetricPool {
    pub fn new() -> Self {
        Self {
            sent: std::array::from_fn(|_| AtomicU64::new(0)),
            received: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn incr_sent(&self, mtype: u8) {
        self.sent[mtype as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_received(&self, mtype: u8) {
        self.received[mtype as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, mtype: u8) -> u64 {
        self.sent[mtype as usize].load(Ordering::Relaxed)
    }

    pub fn received(&self, mtype: u8) -> u64 {
        self.received[mtype as usize].load(Ordering::Relaxed)
    }

    /// Snapshot of every type with at least one event.
    pub fn snapshot(&self) -> HashMap<u8, MetricEntry> {
        let mut out = HashMap::new();
        for t in 0..=u8::MAX {
            let entry = MetricEntry {
                sent: self.sent(t),
                received: self.received(t),
            };
            if entry != MetricEntry::default() {
                out.insert(t, entry);
            }
        }
        out
    }
}

impl Default for MetricPool {
    fn default() -> Self {
        Self::new()
    }
}
