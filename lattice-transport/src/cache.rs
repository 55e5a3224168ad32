//! Fingerprint deduplication.
//!
//! The core never owns the underlying cache: the consensus layer supplies
//! an admission-controlled key/value store through
//! [`crate::handle::SyncHandle::cache_store`], and [`DedupCache`] is a thin
//! facade over it. Writes record the current nanosecond timestamp; reads
//! consult whatever TTL the caller cares about, so one store serves the
//! 60 s send-plane window and any other window a consumer picks.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use moka::sync::Cache;

use crate::message::Fingerprint;

/// Key/value store with cost-based admission and eviction.
///
/// Values are nanosecond timestamps; an evicted entry simply re-admits the
/// next send of the same fingerprint, which is safe for a best-effort
/// dedup plane.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<u64>;
    fn set(&self, key: &[u8], value: u64);
}

/// TTL-keyed fingerprint set shared by every session of a host.
pub struct DedupCache {
    store: Arc<dyn CacheStore>,
}

impl DedupCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    fn now_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    /// Record `key` as seen now.
    pub fn store(&self, key: &Fingerprint) {
        self.store.set(key.as_slice(), Self::now_nanos());
    }

    /// True while a stored timestamp for `key` is younger than `ttl`.
    pub fn contains(&self, key: &Fingerprint, ttl: Duration) -> bool {
        match self.store.get(key.as_slice()) {
            Some(at) => at.saturating_add(ttl.as_nanos() as u64) > Self::now_nanos(),
            None => false,
        }
    }
}

/// Moka-backed [`CacheStore`]: the default admission-controlled store for
/// hosts whose consensus layer has no opinion of its own.
pub struct MokaStore {
    cache: Cache<Vec<u8>, u64>,
}

impl MokaStore {
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_entries).build(),
        }
    }
}

impl CacheStore for MokaStore {
    fn get(&self, key: &[u8]) -> Option<u64> {
        self.cache.get(key)
    }

    fn set(&self, key: &[u8], value: u64) {
        self.cache.insert(key.to_vec(), value);
    }
}
