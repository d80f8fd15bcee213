//! Cache client contract and storage wrappers
//!
//! Every storage layer in the library (the private in-process store,
//! a shared remote store, namespace-scoped views, sync-wrapped raw
//! stores, write-behind wrappers) implements the one [`CacheClient`]
//! trait, so the coherence layer can hold them as trait objects and
//! compose them freely.
//!
//! Semantics shared by all implementations:
//!
//! - TTLs are fractional wall-clock seconds; a remaining ttl of
//!   exactly zero is fresh, anything below is stale.
//! - `get_ttl` may return stale entries (negative remaining);
//!   `get` maps staleness to [`CacheError::Miss`].
//! - `delete` and `expire` on missing keys are no-ops, never errors.
//! - `wait` is meaningful only on asynchronous clients (`is_async`),
//!   where `put` returns before the value is visible.

use std::time::Duration;

use crate::error::{CacheError, CacheResult};

pub mod deferred;
pub mod inproc;
pub mod namespace;
pub mod sync;

pub use deferred::{AsyncWriteClient, ComputeOutcome, Defer, Deferred};
pub use inproc::{inproc_cache_client, InprocCacheClient};
pub use namespace::{NamespaceMirrorWrapper, NamespaceWrapper, RevisionValue, REVMARK};
pub use sync::{ReadWriteSyncAdapter, SerializeSyncAdapter};

/// Uniform contract of all backing stores.
///
/// Object-safe: the coherence layer holds
/// `Arc<dyn CacheClient<CacheKey, V>>`.
pub trait CacheClient<K, V>: Send + Sync {
    /// Does `put` complete before the value is visible?
    fn is_async(&self) -> bool {
        false
    }

    /// Maximum number of entries the store will hold
    fn capacity(&self) -> usize;

    /// Current number of entries
    fn usage(&self) -> usize;

    /// On asynchronous clients, block until any write pending on
    /// `key` has landed; on synchronous clients, returns immediately.
    fn wait(&self, _key: &K, _timeout: Option<Duration>) {}

    /// Unconditionally store `(value, now + ttl)`
    fn put(&self, key: K, value: V, ttl: f64);

    /// Set if absent or stale, as atomically as the backing store
    /// allows. Returns true when the value was stored.
    fn add(&self, key: K, value: V, ttl: f64) -> bool {
        if !self.contains(&key, None) {
            self.put(key, value, ttl);
            true
        } else {
            false
        }
    }

    /// Remove if present
    fn delete(&self, key: &K);

    /// Make the entry stale without removing it
    fn expire(&self, key: &K);

    /// `(value, remaining_ttl)`; remaining may be negative.
    /// `Err(Miss)` when the key is absent.
    fn get_ttl(&self, key: &K) -> CacheResult<(V, f64)>;

    /// Value only; absent or stale keys are a miss. Callers holding a
    /// default can use `.ok().unwrap_or(default)`.
    fn get(&self, key: &K) -> CacheResult<V> {
        let (value, remaining) = self.get_ttl(key)?;
        if remaining < 0.0 {
            Err(CacheError::Miss)
        } else {
            Ok(value)
        }
    }

    /// Present with remaining ttl strictly greater than `ttl_margin`
    /// (default 0). Provide a margin to check about-to-expire keys.
    fn contains(&self, key: &K, ttl_margin: Option<f64>) -> bool;

    /// Remove everything
    fn clear(&self);

    /// Remove entries stale for longer than `timeout` seconds
    fn purge(&self, timeout: f64);
}
