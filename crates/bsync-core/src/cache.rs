//! Small TTL cache driven by caller-supplied clock readings.
//!
//! Time is passed in (Unix milliseconds) so expiry is deterministic in
//! tests and the core stays free of clock reads.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Cached<V> {
    value: V,
    stored_at: u64,
}

#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, Cached<V>>,
    ttl_millis: u64,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_millis: ttl_secs.saturating_mul(1000),
            hits: 0,
            misses: 0,
        }
    }

    /// A fresh copy of the value, or `None` if absent or expired.
    /// Expired entries are dropped on the way out.
    pub fn get(&mut self, key: &K, now: u64) -> Option<V> {
        let fresh = self
            .entries
            .get(key)
            .is_some_and(|c| now.saturating_sub(c.stored_at) < self.ttl_millis);
        if fresh {
            self.hits += 1;
            return self.entries.get(key).map(|c| c.value.clone());
        }
        self.entries.remove(key);
        self.misses += 1;
        None
    }

    pub fn insert(&mut self, key: K, value: V, now: u64) {
        self.entries.insert(
            key,
            Cached {
                value,
                stored_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_millis;
        self.entries
            .retain(|_, c| now.saturating_sub(c.stored_at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
