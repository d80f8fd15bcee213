//! Coherent cache client
//!
//! Wraps an arbitrary cache client and routes its mutations through a
//! [`CoherenceManager`] so peers are notified: `delete` broadcasts a
//! deletion, `clear` broadcasts the CLEAR sentinel, and `put` (in
//! quick-refresh mode) announces `done` once the value has landed.
//!
//! `put_coherently` is the single-flight put: it takes a closure
//! instead of a value and guarantees, best-effort across the cluster,
//! that only one node runs it. On an asynchronous client the deferred
//! computation rides the write-behind worker; on a synchronous client
//! it resolves inline on the calling thread, which then blocks inside
//! the coherence protocol.
//!
//! Plain `put` deliberately skips the computation lock: less
//! overhead, decent consistency, some duplicated effort. Reserve
//! `put_coherently` for the expensive computations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::deferred::{AsyncWriteClient, ComputeOutcome, Defer, Deferred};
use crate::client::CacheClient;
use crate::error::CacheResult;
use crate::key::CacheKey;

use super::defer::CoherentDefer;
use super::manager::{CoherenceManager, CoherentKey, DeletionWaiter};

/// Sink for deferred computations; implemented by asynchronous
/// clients that own a write-behind worker.
pub trait DeferSubmit<V>: Send + Sync {
    /// Enqueue `deferred`; a produced value is stored under
    /// `(key, ttl)` and the deferred is completed afterwards.
    fn submit(&self, key: CacheKey, ttl: f64, deferred: Box<dyn Deferred<V>>);
}

impl<V, C> DeferSubmit<V> for AsyncWriteClient<CacheKey, V, C>
where
    V: Clone + Send + Sync + 'static,
    C: CacheClient<CacheKey, V> + 'static,
{
    fn submit(&self, key: CacheKey, ttl: f64, deferred: Box<dyn Deferred<V>>) {
        self.put_deferred(key, ttl, deferred);
    }
}

/// Client wrapper publishing cache activity on the coherence protocol
pub struct CoherentWrapperClient<V, C> {
    client: Arc<C>,
    manager: Arc<CoherenceManager<V>>,
    timeout: Duration,
    defer_sink: Option<Arc<dyn DeferSubmit<V>>>,
}

impl<V, C> CoherentWrapperClient<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: CacheClient<CacheKey, V> + 'static,
{
    /// Wrap a synchronous client. `put_coherently` will resolve its
    /// deferred inline on the calling thread.
    pub fn new(client: Arc<C>, manager: Arc<CoherenceManager<V>>) -> Self {
        let timeout = manager.protocol_timeout();
        Self {
            client,
            manager,
            timeout,
            defer_sink: None,
        }
    }

    /// Override the coherence protocol timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The wrapped client
    pub fn inner(&self) -> &Arc<C> {
        &self.client
    }

    /// The manager this wrapper publishes through
    pub fn manager(&self) -> &Arc<CoherenceManager<V>> {
        &self.manager
    }

    /// Broadcast-aware delete that hands back the deletion waiter
    /// (a real ack counter in synchronous mode).
    pub fn delete_coherently(&self, key: &CacheKey) -> DeletionWaiter {
        self.client.delete(key);
        self.manager.fire_deletion(CoherentKey::Key(key.clone()))
    }

    /// Enqueue a plain deferred put. In quick-refresh mode a `done`
    /// announcement is composed onto the deferred's completion, so it
    /// fires only after the computed value has landed.
    pub fn put_deferred(&self, key: CacheKey, ttl: f64, defer: Defer<V>) {
        let defer = if self.manager.quick_refresh() {
            let manager = Arc::clone(&self.manager);
            let done_key = key.clone();
            defer.on_complete(move |produced| {
                if produced {
                    manager.fire_done(&[done_key]);
                }
            })
        } else {
            defer
        };
        match &self.defer_sink {
            Some(sink) => sink.submit(key, ttl, Box::new(defer)),
            None => {
                let mut defer = defer;
                if let ComputeOutcome::Value(value) = defer.resolve() {
                    self.client.put(key, value, ttl);
                }
                defer.complete();
            }
        }
    }

    /// Single-flight put: at most one node in the cluster runs
    /// `task`.
    ///
    /// `expired` re-checks the key against the shared cache; when it
    /// flips to false mid-protocol, the computation is abandoned
    /// (somebody else refreshed the value). `wait_time` follows
    /// [`CoherentDefer::with_wait_time`] semantics.
    pub fn put_coherently(
        &self,
        key: CacheKey,
        ttl: f64,
        expired: impl Fn() -> bool + Send + Sync + 'static,
        wait_time: Option<Duration>,
        task: impl FnOnce() -> V + Send + 'static,
    ) -> CacheResult<()> {
        let mut defer = CoherentDefer::new(Arc::clone(&self.manager), key.clone(), expired, task)
            .with_timeout(self.timeout)
            .with_wait_time(wait_time);
        match &self.defer_sink {
            Some(sink) => sink.submit(key, ttl, Box::new(defer)),
            None => {
                // Synchronous client: run the protocol right here.
                let outcome = defer.undefer();
                if let ComputeOutcome::Value(value) = outcome {
                    self.client.put(key, value, ttl);
                }
                defer.done();
            }
        }
        Ok(())
    }
}

impl<V, CI> CoherentWrapperClient<V, AsyncWriteClient<CacheKey, V, CI>>
where
    V: Clone + Send + Sync + 'static,
    CI: CacheClient<CacheKey, V> + 'static,
{
    /// Wrap an asynchronous client; deferred computations ride its
    /// write-behind worker instead of the calling thread.
    pub fn over_async(
        client: Arc<AsyncWriteClient<CacheKey, V, CI>>,
        manager: Arc<CoherenceManager<V>>,
    ) -> Self {
        let timeout = manager.protocol_timeout();
        Self {
            client: Arc::clone(&client),
            manager,
            timeout,
            defer_sink: Some(client as Arc<dyn DeferSubmit<V>>),
        }
    }
}

impl<V, C> CacheClient<CacheKey, V> for CoherentWrapperClient<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: CacheClient<CacheKey, V> + 'static,
{
    fn is_async(&self) -> bool {
        self.client.is_async()
    }

    fn capacity(&self) -> usize {
        self.client.capacity()
    }

    fn usage(&self) -> usize {
        self.client.usage()
    }

    /// Wait for our own pending write, then for the cluster's
    /// computation, within one monotonic deadline.
    fn wait(&self, key: &CacheKey, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.client.wait(key, timeout);
        if self.manager.has_pending(key) {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.manager.wait_done(key, remaining);
        }
    }

    fn put(&self, key: CacheKey, value: V, ttl: f64) {
        self.client.put(key.clone(), value, ttl);
        if self.manager.quick_refresh() {
            self.manager.fire_done(&[key]);
        }
    }

    fn add(&self, key: CacheKey, value: V, ttl: f64) -> bool {
        self.client.add(key, value, ttl)
    }

    fn delete(&self, key: &CacheKey) {
        self.client.delete(key);
        self.manager.fire_deletion(CoherentKey::Key(key.clone()));
    }

    fn expire(&self, key: &CacheKey) {
        self.client.expire(key);
    }

    fn get_ttl(&self, key: &CacheKey) -> CacheResult<(V, f64)> {
        self.client.get_ttl(key)
    }

    fn contains(&self, key: &CacheKey, ttl_margin: Option<f64>) -> bool {
        self.client.contains(key, ttl_margin)
    }

    fn clear(&self) {
        self.client.clear();
        self.manager.fire_deletion(CoherentKey::Clear);
    }

    fn purge(&self, timeout: f64) {
        self.client.purge(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBusHub;
    use crate::client::inproc::inproc_cache_client;
    use crate::coherence::manager::CoherenceConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Node {
        client: CoherentWrapperClient<String, crate::client::InprocCacheClient<CacheKey, String>>,
        private: Arc<crate::client::InprocCacheClient<CacheKey, String>>,
    }

    fn node(hub: &MemoryBusHub, identity: &str, quick_refresh: bool) -> Node {
        let private = inproc_cache_client::<CacheKey, String>(64);
        let shared = inproc_cache_client::<CacheKey, String>(64);
        let manager = Arc::new(
            CoherenceManager::new(
                CoherenceConfig {
                    namespace: "t".to_string(),
                    quick_refresh,
                    ..CoherenceConfig::default()
                },
                private.clone() as Arc<dyn CacheClient<CacheKey, String>>,
                Some(shared as Arc<dyn CacheClient<CacheKey, String>>),
                hub.endpoint(Some(identity)),
            )
            .unwrap(),
        );
        Node {
            client: CoherentWrapperClient::new(private.clone(), manager),
            private,
        }
    }

    fn k(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    #[test]
    fn test_delete_propagates_to_peers() {
        let hub = MemoryBusHub::new();
        let a = node(&hub, "a", false);
        let b = node(&hub, "b", false);
        hub.promote("a");

        b.private.put(k("x"), "v".to_string(), 60.0);
        a.client.delete(&k("x"));
        assert!(!b.private.contains(&k("x"), None));
    }

    #[test]
    fn test_clear_wipes_peer_private_caches() {
        let hub = MemoryBusHub::new();
        let a = node(&hub, "a", false);
        let b = node(&hub, "b", false);
        hub.promote("a");

        b.private.put(k("x"), "v".to_string(), 60.0);
        a.client.clear();
        assert_eq!(b.private.usage(), 0);
    }

    #[test]
    fn test_quick_refresh_put_announces_done() {
        let hub = MemoryBusHub::new();
        let a = node(&hub, "a", true);
        let b = node(&hub, "b", true);
        hub.promote("a");

        let waiter = std::thread::spawn({
            let manager = Arc::clone(b.client.manager());
            move || manager.wait_done(&k("x"), Some(Duration::from_secs(5)))
        });
        std::thread::sleep(Duration::from_millis(50));
        a.client.put(k("x"), "v".to_string(), 60.0);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_put_coherently_inline_on_sync_client() {
        let hub = MemoryBusHub::new();
        let a = node(&hub, "a", false);
        hub.promote("a");

        let runs = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&runs);
        a.client
            .put_coherently(
                k("x"),
                60.0,
                || true,
                Some(Duration::ZERO),
                move || {
                    probe.fetch_add(1, Ordering::SeqCst);
                    "computed".to_string()
                },
            )
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(a.private.get(&k("x")).unwrap(), "computed");
        // The lock was released by done().
        assert!(a.client.manager().pending_txid(&k("x")).is_none());
    }

    #[test]
    fn test_put_coherently_abandons_when_fresh() {
        let hub = MemoryBusHub::new();
        let a = node(&hub, "a", false);
        hub.promote("a");

        let runs = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&runs);
        a.client
            .put_coherently(
                k("x"),
                60.0,
                || false,
                Some(Duration::ZERO),
                move || {
                    probe.fetch_add(1, Ordering::SeqCst);
                    "computed".to_string()
                },
            )
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(a.private.get(&k("x")).is_err());
    }

    #[test]
    fn test_put_coherently_over_async_client() {
        let hub = MemoryBusHub::new();
        let inner = inproc_cache_client::<CacheKey, String>(64);
        let shared = inproc_cache_client::<CacheKey, String>(64);
        let async_client = Arc::new(AsyncWriteClient::new(Arc::clone(&inner)));
        let manager = Arc::new(
            CoherenceManager::new(
                CoherenceConfig {
                    namespace: "t".to_string(),
                    ..CoherenceConfig::default()
                },
                inner.clone() as Arc<dyn CacheClient<CacheKey, String>>,
                Some(shared as Arc<dyn CacheClient<CacheKey, String>>),
                hub.endpoint(Some("a")),
            )
            .unwrap(),
        );
        hub.promote("a");
        let client = CoherentWrapperClient::over_async(Arc::clone(&async_client), manager);
        assert!(client.is_async());

        client
            .put_coherently(k("x"), 60.0, || true, Some(Duration::ZERO), || {
                "computed".to_string()
            })
            .unwrap();
        client.wait(&k("x"), Some(Duration::from_secs(5)));
        assert_eq!(client.get(&k("x")).unwrap(), "computed");
    }

    #[test]
    fn test_put_deferred_quick_refresh_fires_after_landing() {
        let hub = MemoryBusHub::new();
        let inner = inproc_cache_client::<CacheKey, String>(64);
        let shared = inproc_cache_client::<CacheKey, String>(64);
        let async_client = Arc::new(AsyncWriteClient::new(Arc::clone(&inner)));
        let manager = Arc::new(
            CoherenceManager::new(
                CoherenceConfig {
                    namespace: "t".to_string(),
                    quick_refresh: true,
                    ..CoherenceConfig::default()
                },
                inner.clone() as Arc<dyn CacheClient<CacheKey, String>>,
                Some(shared as Arc<dyn CacheClient<CacheKey, String>>),
                hub.endpoint(Some("a")),
            )
            .unwrap(),
        );
        hub.promote("a");
        let client = CoherentWrapperClient::over_async(Arc::clone(&async_client), Arc::clone(&manager));

        let announced = std::thread::spawn({
            let manager = Arc::clone(&manager);
            move || manager.wait_done(&k("x"), Some(Duration::from_secs(5)))
        });
        std::thread::sleep(Duration::from_millis(50));
        client.put_deferred(k("x"), 60.0, Defer::new(|| "v".to_string()));
        client.wait(&k("x"), Some(Duration::from_secs(5)));

        assert!(announced.join().unwrap());
        assert_eq!(inner.get(&k("x")).unwrap(), "v");
    }
}
