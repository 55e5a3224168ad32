//! Concurrent neighbor and remote-relayer bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::identity::NodeId;
use crate::peer::PeerSession;

/// How long a remote relayer stays visible after its last sighting.
pub(crate) const RELAYER_TTL: Duration = Duration::from_secs(60);

/// Live sessions keyed by node identity.
///
/// `put` is insert-if-absent; callers treat a collision as a broken
/// invariant and abort, so any replacement must go through an explicit
/// `remove` (or `set`) first.
pub struct NeighborMap {
    inner: RwLock<HashMap<NodeId, Arc<PeerSession>>>,
}

impl NeighborMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<PeerSession>> {
        self.inner.read().get(&id).cloned()
    }

    /// Insert-if-absent. Returns false when `id` is already present.
    #[must_use]
    pub fn put(&self, id: NodeId, session: Arc<PeerSession>) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, session);
        true
    }

    /// Unconditional overwrite. The displaced session, if any, must
    /// already have been disconnected by the caller.
    pub fn set(&self, id: NodeId, session: Arc<PeerSession>) {
        self.inner.write().insert(id, session);
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<PeerSession>> {
        self.inner.write().remove(&id)
    }

    /// Remove only if the entry is still `session`. Lets a finished
    /// session lifecycle clean up after itself without evicting a
    /// replacement that already took the slot.
    pub fn remove_if(&self, id: NodeId, session: &Arc<PeerSession>) -> bool {
        let mut map = self.inner.write();
        match map.get(&id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Read-locked snapshot for iteration.
    pub fn slice(&self) -> Vec<Arc<PeerSession>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for NeighborMap {
    fn default() -> Self {
        Self::new()
    }
}

struct RemoteRelayer {
    id: NodeId,
    active_at: Instant,
}

/// Destination → relayers known to serve it, each with an activity
/// timestamp. Entries age out after [`RELAYER_TTL`]; pruning happens on
/// both write and read so stale relayers are never handed to a caller.
pub struct RelayersMap {
    inner: RwLock<HashMap<NodeId, Vec<RemoteRelayer>>>,
    ttl: Duration,
}

impl RelayersMap {
    pub fn new() -> Self {
        Self::with_ttl(RELAYER_TTL)
    }

    fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Record that `relayer` currently serves `dest`. Refreshes the
    /// timestamp when the pair is already known.
    pub fn add(&self, dest: NodeId, relayer: NodeId) {
        let now = Instant::now();
        let mut map = self.inner.write();
        let records = map.entry(dest).or_default();
        records.retain(|r| now.duration_since(r.active_at) < self.ttl);
        match records.iter_mut().find(|r| r.id == relayer) {
            Some(r) => r.active_at = now,
            None => records.push(RemoteRelayer { id: relayer, active_at: now }),
        }
    }

    /// Still-active relayer ids for `dest`, pruning expired records.
    pub fn get(&self, dest: NodeId) -> Vec<NodeId> {
        let now = Instant::now();
        let mut map = self.inner.write();
        let Some(records) = map.get_mut(&dest) else {
            return Vec::new();
        };
        records.retain(|r| now.duration_since(r.active_at) < self.ttl);
        if records.is_empty() {
            map.remove(&dest);
            return Vec::new();
        }
        records.iter().map(|r| r.id).collect()
    }
}

impl Default for RelayersMap {
    fn default() -> Self {
        Self::new()
    }
}
