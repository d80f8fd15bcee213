//! Private in-process cache client
//!
//! The raw TTL store is not thread-safe, so construction always hands
//! back a reader/writer-wrapped store. Every client built here is
//! registered in the process-wide weak registry, which is what lets
//! [`crate::store::cache_purge`] and [`crate::store::cache_clear`]
//! sweep all live caches without keeping any of them alive.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use crate::store::registry::{self, RegisteredCache};
use crate::store::TtlStore;

use super::sync::{ReadWriteSyncAdapter, SerializeSyncAdapter};
use super::CacheClient;

/// The in-process client: an RW-adapter-wrapped TTL store
pub type InprocCacheClient<K, V> = ReadWriteSyncAdapter<K, V>;

/// Build a registered in-process cache client with the given
/// capacity.
pub fn inproc_cache_client<K, V>(capacity: usize) -> Arc<InprocCacheClient<K, V>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let client = Arc::new(ReadWriteSyncAdapter::new(TtlStore::new(capacity)));
    registry::register_cache(Arc::downgrade(&client) as Weak<dyn RegisteredCache>);
    client
}

impl<K, V> RegisteredCache for ReadWriteSyncAdapter<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn purge_expired(&self, timeout: f64) {
        self.purge(timeout);
    }

    fn clear_all(&self) {
        self.clear();
    }

    fn stats(&self) -> (usize, usize) {
        (self.capacity(), self.usage())
    }
}

impl<K, V> RegisteredCache for SerializeSyncAdapter<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn purge_expired(&self, timeout: f64) {
        self.purge(timeout);
    }

    fn clear_all(&self) {
        self.clear();
    }

    fn stats(&self) -> (usize, usize) {
        (self.capacity(), self.usage())
    }
}
