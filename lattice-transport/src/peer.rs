//! Per-neighbor session state.
//!
//! A [`PeerSession`] is created by the inbound authenticator or the
//! outbound relayer supervisor and destroyed exactly once by
//! [`PeerSession::disconnect`]. It owns the bounded send plane (three
//! rings) and the two completion signals its long-lived tasks report
//! through: `ops` for the send/receive lifetime, `stn` for the sync loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cache::DedupCache;
use crate::error::TransportError;
use crate::handle::AuthToken;
use crate::identity::NodeId;
use crate::ring::{ChanMsg, Priority, Ring};

/// Ring capacity for ordinary sessions. Relayer sessions multiply this by
/// the transport's stream fan-in.
pub(crate) const RING_CAPACITY: usize = 1024;

/// Completion signal for a session task, in the shape of a held sender:
/// the task takes the guard at startup and drops it on exit; waiting
/// resolves once the channel reports no senders. A guard that was never
/// taken must not keep waiters blocked, so `wait` discards it first.
pub(crate) struct DoneSignal {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl DoneSignal {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Hand the live end to the task that must signal completion.
    pub(crate) fn guard(&self) -> Option<mpsc::Sender<()>> {
        self.tx.lock().take()
    }

    /// Resolve once every taken guard has been dropped.
    pub(crate) async fn wait(&self) {
        drop(self.tx.lock().take());
        let mut rx = self.rx.lock().await;
        while rx.recv().await.is_some() {}
    }
}

/// One live neighbor: identity, role, and the bounded send plane.
pub struct PeerSession {
    id: NodeId,
    addr: String,
    is_relayer: bool,
    pub(crate) high: Ring,
    pub(crate) normal: Ring,
    pub(crate) sync: Ring,
    closing: AtomicBool,
    pub(crate) ops: DoneSignal,
    pub(crate) stn: DoneSignal,
    auth_token: Mutex<Option<AuthToken>>,
    pub(crate) dedup: Arc<DedupCache>,
}

impl PeerSession {
    pub(crate) fn new(
        id: NodeId,
        addr: String,
        is_relayer: bool,
        ring_capacity: usize,
        dedup: Arc<DedupCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr,
            is_relayer,
            high: Ring::new(ring_capacity),
            normal: Ring::new(ring_capacity),
            sync: Ring::new(ring_capacity),
            closing: AtomicBool::new(false),
            ops: DoneSignal::new(),
            stn: DoneSignal::new(),
            auth_token: Mutex::new(None),
            dedup,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_relayer(&self) -> bool {
        self.is_relayer
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_auth_token(&self, token: AuthToken) {
        *self.auth_token.lock() = Some(token);
    }

    pub fn auth_token(&self) -> Option<AuthToken> {
        self.auth_token.lock().clone()
    }

    /// Enqueue onto the ring for `priority`. `Ok(false)` means full.
    pub(crate) fn offer(&self, priority: Priority, msg: ChanMsg) -> Result<bool, TransportError> {
        match priority {
            Priority::High => self.high.offer(msg),
            Priority::Normal => self.normal.offer(msg),
        }
    }

    /// Enqueue onto the sync ring.
    pub(crate) fn offer_sync(&self, data: Vec<u8>) -> Result<bool, TransportError> {
        self.sync.offer(ChanMsg::new(None, data))
    }

    /// Tear the session down exactly once: flag it, dispose the rings so
    /// producers and the loops observe the shutdown, then join the send
    /// and sync tasks. Safe to call from any task, any number of times.
    pub async fn disconnect(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.high.dispose();
        self.normal.dispose();
        self.sync.dispose();
        self.ops.wait().await;
        self.stn.wait().await;
        tracing::debug!(peer = %self.id, "session drained");
    }
}
