//! Bounded, disposable message rings.
//!
//! Every session owns three rings (high, normal, sync). Producers never
//! block: a full ring reports `Ok(false)` from [`Ring::offer`] and the
//! caller decides whether that is an error (direct send) or a logged drop
//! (relay fan-out). Disposing a ring drains it and turns every later
//! `offer`/`poll` into [`TransportError::RingDisposed`], which is how
//! session teardown reaches producers and the sender loop.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::error::TransportError;
use crate::message::Fingerprint;

/// Scheduling class for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// One queued outbound message: an optional dedup fingerprint plus the
/// wire payload. A missing fingerprint means "do not dedup".
#[derive(Debug, Clone)]
pub struct ChanMsg {
    pub key: Option<Fingerprint>,
    pub data: Vec<u8>,
}

impl ChanMsg {
    pub fn new(key: Option<Fingerprint>, data: Vec<u8>) -> Self {
        Self { key, data }
    }
}

/// A bounded multi-producer/multi-consumer queue with one-shot disposal.
pub struct Ring {
    queue: ArrayQueue<ChanMsg>,
    disposed: AtomicBool,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            disposed: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue. `Ok(false)` when the ring is full.
    pub fn offer(&self, msg: ChanMsg) -> Result<bool, TransportError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::RingDisposed);
        }
        Ok(self.queue.push(msg).is_ok())
    }

    /// Non-blocking dequeue. `Ok(None)` when the ring is empty.
    pub fn poll(&self) -> Result<Option<ChanMsg>, TransportError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::RingDisposed);
        }
        Ok(self.queue.pop())
    }

    /// Idempotent. Drains pending messages; later `offer`/`poll` calls
    /// observe [`TransportError::RingDisposed`].
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            while self.queue.pop().is_some() {}
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
