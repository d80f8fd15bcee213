//! Sync adapters over the raw TTL store
//!
//! [`TtlStore`] takes `&mut self` for writes and is never used bare
//! in concurrent code. Two adapters make it a [`CacheClient`]:
//!
//! - [`ReadWriteSyncAdapter`]: reader/writer discipline. `get_ttl`
//!   and `contains` share a read acquire, mutations take the write
//!   lock. Readers do not block readers.
//! - [`SerializeSyncAdapter`]: one mutex around everything. Simpler,
//!   for stores that must never see interleaved reads.
//!
//! Both adapters let `purge` hand its evicted values out of the
//! locked scope before dropping them, so value destructors can never
//! re-enter the adapter while a lock is held.

use std::hash::Hash;

use parking_lot::{Mutex, RwLock};

use crate::error::{CacheError, CacheResult};
use crate::store::TtlStore;

use super::CacheClient;

/// Reader/writer adapter around a [`TtlStore`]
pub struct ReadWriteSyncAdapter<K: Hash + Eq, V> {
    store: RwLock<TtlStore<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ReadWriteSyncAdapter<K, V> {
    /// Wrap a raw store
    pub fn new(store: TtlStore<K, V>) -> Self {
        Self {
            store: RwLock::new(store),
        }
    }
}

impl<K, V> CacheClient<K, V> for ReadWriteSyncAdapter<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn capacity(&self) -> usize {
        self.store.read().capacity()
    }

    fn usage(&self) -> usize {
        self.store.read().usage()
    }

    fn put(&self, key: K, value: V, ttl: f64) {
        self.store.write().put(key, value, ttl);
    }

    fn add(&self, key: K, value: V, ttl: f64) -> bool {
        // The whole check-then-set runs under the write lock, so the
        // stale override cannot lose an update.
        self.store.write().add(key, value, ttl)
    }

    fn delete(&self, key: &K) {
        self.store.write().delete(key);
    }

    fn expire(&self, key: &K) {
        self.store.write().expire(key);
    }

    fn get_ttl(&self, key: &K) -> CacheResult<(V, f64)> {
        self.store.read().get_ttl(key).ok_or(CacheError::Miss)
    }

    fn contains(&self, key: &K, ttl_margin: Option<f64>) -> bool {
        self.store.read().contains(key, ttl_margin.unwrap_or(0.0))
    }

    fn clear(&self) {
        self.store.write().clear();
    }

    fn purge(&self, timeout: f64) {
        // The write guard is released at the end of this statement;
        // the evicted values drop afterwards, outside the lock.
        let retentions = self.store.write().purge(timeout);
        drop(retentions);
    }
}

/// Single-mutex adapter around a [`TtlStore`]
pub struct SerializeSyncAdapter<K: Hash + Eq, V> {
    store: Mutex<TtlStore<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> SerializeSyncAdapter<K, V> {
    /// Wrap a raw store
    pub fn new(store: TtlStore<K, V>) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

impl<K, V> CacheClient<K, V> for SerializeSyncAdapter<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn capacity(&self) -> usize {
        self.store.lock().capacity()
    }

    fn usage(&self) -> usize {
        self.store.lock().usage()
    }

    fn put(&self, key: K, value: V, ttl: f64) {
        self.store.lock().put(key, value, ttl);
    }

    fn add(&self, key: K, value: V, ttl: f64) -> bool {
        self.store.lock().add(key, value, ttl)
    }

    fn delete(&self, key: &K) {
        self.store.lock().delete(key);
    }

    fn expire(&self, key: &K) {
        self.store.lock().expire(key);
    }

    fn get_ttl(&self, key: &K) -> CacheResult<(V, f64)> {
        self.store.lock().get_ttl(key).ok_or(CacheError::Miss)
    }

    fn contains(&self, key: &K, ttl_margin: Option<f64>) -> bool {
        self.store.lock().contains(key, ttl_margin.unwrap_or(0.0))
    }

    fn clear(&self) {
        self.store.lock().clear();
    }

    fn purge(&self, timeout: f64) {
        let retentions = self.store.lock().purge(timeout);
        drop(retentions);
    }
}
