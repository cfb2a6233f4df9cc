//! Short-lived read-through cache with an explicit invalidation contract.
//!
//! The only shared in-memory state between requests. Entries expire after a
//! fixed TTL measured against the injected [`Clock`]; every code path that
//! mutates the underlying record must call [`TtlCache::invalidate`]
//! synchronously before returning, otherwise a later request could observe a
//! superseded session binding or an old expiration date.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Size at which an insert first sweeps out expired entries.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Key → (value, expiry) store.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Return a live entry, if any. Expired entries are treated as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_utc();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    /// Insert or replace an entry, restarting its TTL.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now_utc();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, entry| now < entry.expires_at);
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop an entry. Must be called by every mutator of the cached record.
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Drop every entry whose TTL has elapsed.
    pub fn purge_expired(&self) {
        let now = self.clock.now_utc();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| now < entry.expires_at);
    }

    /// Number of stored entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
