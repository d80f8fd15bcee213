//! Bounded TTL store
//!
//! `TtlStore` couples an LRU-bounded mapping with absolute wall-time
//! expiry. It is deliberately NOT thread-safe: writes take `&mut
//! self`, and concurrent use goes through one of the sync adapters in
//! [`crate::client::sync`]. Reads use `peek`, never promoting
//! recency, so adapters can serve them under a shared lock; recency
//! is driven by writes.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::wall_now;

/// Capacity-bounded mapping of `key -> (value, expiry_wall_time)`
pub struct TtlStore<K: Hash + Eq, V> {
    entries: LruCache<K, (V, f64)>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlStore<K, V> {
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Current number of entries (stale ones included until purged)
    pub fn usage(&self) -> usize {
        self.entries.len()
    }

    /// Unconditionally store `(value, now + ttl)`, evicting the least
    /// recently written entry when over capacity.
    pub fn put(&mut self, key: K, value: V, ttl: f64) {
        self.entries.put(key, (value, wall_now() + ttl));
    }

    /// Set if absent or stale. Returns true when the value was
    /// installed, false when a non-stale entry was left in place.
    pub fn add(&mut self, key: K, value: V, ttl: f64) -> bool {
        let now = wall_now();
        match self.entries.peek(&key) {
            Some((_, expiry)) if *expiry >= now => false,
            _ => {
                self.entries.put(key, (value, now + ttl));
                true
            }
        }
    }

    /// Remove if present; a missing key is not an error.
    pub fn delete(&mut self, key: &K) {
        self.entries.pop(key);
    }

    /// Force the entry's expiry to now, so a subsequent `get_ttl`
    /// sees a stale entry rather than a miss. Missing key: no-op.
    pub fn expire(&mut self, key: &K) {
        if let Some((key, (value, _))) = self.entries.pop_entry(key) {
            self.entries.put(key, (value, wall_now()));
        }
    }

    /// `(value, remaining_ttl)`; remaining may be negative for stale
    /// entries. `None` when the key is absent.
    pub fn get_ttl(&self, key: &K) -> Option<(V, f64)> {
        self.entries
            .peek(key)
            .map(|(value, expiry)| (value.clone(), expiry - wall_now()))
    }

    /// Value only; stale entries are a miss here. A remaining ttl of
    /// exactly zero is still fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.get_ttl(key) {
            Some((value, remaining)) if remaining >= 0.0 => Some(value),
            _ => None,
        }
    }

    /// Present with remaining ttl strictly greater than `margin`
    pub fn contains(&self, key: &K, margin: f64) -> bool {
        match self.entries.peek(key) {
            Some((_, expiry)) => expiry - wall_now() > margin,
            None => false,
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove entries whose expiry is strictly older than
    /// `now - timeout`.
    ///
    /// The removed values are returned instead of dropped: callers
    /// inside a locked scope hand them upward so destructors run only
    /// after the lock is released (a value destructor re-entering the
    /// cache would otherwise deadlock).
    pub fn purge(&mut self, timeout: f64) -> Vec<V> {
        let threshold = wall_now() - timeout;
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, (_, expiry))| *expiry < threshold)
            .map(|(k, _)| k)
            .cloned()
            .collect();

        let mut retentions = Vec::with_capacity(doomed.len());
        for key in &doomed {
            if let Some((value, _)) = self.entries.pop(key) {
                retentions.push(value);
            }
        }
        retentions
    }
}
