//! Namespace-scoped cache views
//!
//! A namespace wrapper rewrites every external key `k` to
//! `(namespace, revision, k)`, letting many sub-clients share one
//! store without collisions. Its `clear` is a logical operation: it
//! bumps the revision (orphaning every decorated key of the old
//! revision) and records the new revision under the well-known
//! [`REVMARK`] sub-key so other processes sharing the store observe
//! the clear. The physical `clear` of a shared store may well be a
//! no-op; the revision bump is the real thing.
//!
//! The revision must be incremented before anything is published:
//! a concurrent read decorating with the old revision can then never
//! observe entries written under the new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheResult;
use crate::key::CacheKey;

use super::CacheClient;

/// Reserved sub-key holding the current revision of a namespace.
/// User keys must not collide with it.
pub const REVMARK: &str = "REVMARK";

/// TTL of the REVMARK entry, in seconds
const REVMARK_TTL: f64 = 3600.0;

/// Values that can carry a namespace revision through the underlying
/// store.
///
/// The revision lives inside the shared cache (under [`REVMARK`]), so
/// the value type must be able to encode one. Implementations exist
/// for the common value shapes; anything serde-ish can add its own.
pub trait RevisionValue: Sized {
    /// Encode a revision number into the value space
    fn encode_revision(revision: u64) -> Self;
    /// Decode a revision number back out, if this value holds one
    fn decode_revision(&self) -> Option<u64>;
}

impl RevisionValue for u64 {
    fn encode_revision(revision: u64) -> Self {
        revision
    }
    fn decode_revision(&self) -> Option<u64> {
        Some(*self)
    }
}

impl RevisionValue for i64 {
    fn encode_revision(revision: u64) -> Self {
        revision as i64
    }
    fn decode_revision(&self) -> Option<u64> {
        u64::try_from(*self).ok()
    }
}

impl RevisionValue for String {
    fn encode_revision(revision: u64) -> Self {
        revision.to_string()
    }
    fn decode_revision(&self) -> Option<u64> {
        self.parse().ok()
    }
}

impl RevisionValue for serde_json::Value {
    fn encode_revision(revision: u64) -> Self {
        serde_json::Value::from(revision)
    }
    fn decode_revision(&self) -> Option<u64> {
        self.as_u64()
    }
}

fn decorate(namespace: &str, revision: u64, key: CacheKey) -> CacheKey {
    CacheKey::Seq(vec![
        CacheKey::Str(namespace.to_string()),
        CacheKey::Int(revision as i64),
        key,
    ])
}

fn revmark_key(namespace: &str) -> CacheKey {
    CacheKey::Seq(vec![
        CacheKey::Str(namespace.to_string()),
        CacheKey::Str(REVMARK.to_string()),
    ])
}

/// Key-mangling wrapper scoping a client to one namespace
pub struct NamespaceWrapper<V, C> {
    namespace: Arc<str>,
    revision: AtomicU64,
    client: Arc<C>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V, C> NamespaceWrapper<V, C>
where
    V: RevisionValue + Clone + Send + Sync,
    C: CacheClient<CacheKey, V>,
{
    /// Scope `client` to `namespace`, recovering the revision from
    /// the REVMARK entry when one is present.
    pub fn new(namespace: &str, client: Arc<C>) -> Self {
        let revision = client
            .get(&revmark_key(namespace))
            .ok()
            .and_then(|v| v.decode_revision())
            .unwrap_or(0);
        Self {
            namespace: Arc::from(namespace),
            revision: AtomicU64::new(revision),
            client,
            _value: std::marker::PhantomData,
        }
    }

    /// The namespace this wrapper scopes to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current logical revision
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn decorated(&self, key: CacheKey) -> CacheKey {
        decorate(&self.namespace, self.revision(), key)
    }
}

impl<V, C> CacheClient<CacheKey, V> for NamespaceWrapper<V, C>
where
    V: RevisionValue + Clone + Send + Sync,
    C: CacheClient<CacheKey, V>,
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

    fn wait(&self, key: &CacheKey, timeout: Option<Duration>) {
        self.client.wait(&self.decorated(key.clone()), timeout);
    }

    fn put(&self, key: CacheKey, value: V, ttl: f64) {
        self.client.put(self.decorated(key), value, ttl);
    }

    fn add(&self, key: CacheKey, value: V, ttl: f64) -> bool {
        self.client.add(self.decorated(key), value, ttl)
    }

    fn delete(&self, key: &CacheKey) {
        self.client.delete(&self.decorated(key.clone()));
    }

    fn expire(&self, key: &CacheKey) {
        self.client.expire(&self.decorated(key.clone()));
    }

    fn get_ttl(&self, key: &CacheKey) -> CacheResult<(V, f64)> {
        self.client.get_ttl(&self.decorated(key.clone()))
    }

    fn contains(&self, key: &CacheKey, ttl_margin: Option<f64>) -> bool {
        self.client.contains(&self.decorated(key.clone()), ttl_margin)
    }

    /// A shared store cannot really be wiped by one tenant, so clear
    /// switches revisions instead: bump, persist under REVMARK, then
    /// attempt the physical clear.
    fn clear(&self) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.client
            .put(revmark_key(&self.namespace), V::encode_revision(revision), REVMARK_TTL);
        self.client.clear();
    }

    fn purge(&self, timeout: f64) {
        self.client.purge(timeout);
    }
}

/// A namespace wrapper that mirrors its namespace and revision from a
/// reference wrapper instead of owning them.
///
/// The mirror tracks revision bumps made through the reference (cache
/// clears) while targeting its own underlying client. Clearing a
/// mirror performs only the physical clear; the revision stays owned
/// by the reference.
pub struct NamespaceMirrorWrapper<V, R, C> {
    reference: Arc<NamespaceWrapper<V, R>>,
    client: Arc<C>,
}

impl<V, R, C> NamespaceMirrorWrapper<V, R, C>
where
    V: RevisionValue + Clone + Send + Sync,
    R: CacheClient<CacheKey, V>,
    C: CacheClient<CacheKey, V>,
{
    /// Mirror `reference`'s namespace state over `client`
    pub fn new(reference: Arc<NamespaceWrapper<V, R>>, client: Arc<C>) -> Self {
        Self { reference, client }
    }

    /// The mirrored namespace
    pub fn namespace(&self) -> &str {
        self.reference.namespace()
    }

    /// The mirrored revision
    pub fn revision(&self) -> u64 {
        self.reference.revision()
    }

    fn decorated(&self, key: CacheKey) -> CacheKey {
        decorate(self.reference.namespace(), self.reference.revision(), key)
    }
}

impl<V, R, C> CacheClient<CacheKey, V> for NamespaceMirrorWrapper<V, R, C>
where
    V: RevisionValue + Clone + Send + Sync,
    R: CacheClient<CacheKey, V>,
    C: CacheClient<CacheKey, V>,
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

    fn wait(&self, key: &CacheKey, timeout: Option<Duration>) {
        self.client.wait(&self.decorated(key.clone()), timeout);
    }

    fn put(&self, key: CacheKey, value: V, ttl: f64) {
        self.client.put(self.decorated(key), value, ttl);
    }

    fn add(&self, key: CacheKey, value: V, ttl: f64) -> bool {
        self.client.add(self.decorated(key), value, ttl)
    }

    fn delete(&self, key: &CacheKey) {
        self.client.delete(&self.decorated(key.clone()));
    }

    fn expire(&self, key: &CacheKey) {
        self.client.expire(&self.decorated(key.clone()));
    }

    fn get_ttl(&self, key: &CacheKey) -> CacheResult<(V, f64)> {
        self.client.get_ttl(&self.decorated(key.clone()))
    }

    fn contains(&self, key: &CacheKey, ttl_margin: Option<f64>) -> bool {
        self.client.contains(&self.decorated(key.clone()), ttl_margin)
    }

    fn clear(&self) {
        self.client.clear();
    }

    fn purge(&self, timeout: f64) {
        self.client.purge(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::inproc::inproc_cache_client;
    use crate::client::sync::ReadWriteSyncAdapter;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    /// A stand-in for a shared back-end store: one tenant's `clear`
    /// cannot wipe it, so the call is a no-op there.
    struct SharedStoreStub<V: Clone + Send + Sync>(Arc<ReadWriteSyncAdapter<CacheKey, V>>);

    impl<V: Clone + Send + Sync> CacheClient<CacheKey, V> for SharedStoreStub<V> {
        fn capacity(&self) -> usize {
            self.0.capacity()
        }
        fn usage(&self) -> usize {
            self.0.usage()
        }
        fn put(&self, key: CacheKey, value: V, ttl: f64) {
            self.0.put(key, value, ttl);
        }
        fn delete(&self, key: &CacheKey) {
            self.0.delete(key);
        }
        fn expire(&self, key: &CacheKey) {
            self.0.expire(key);
        }
        fn get_ttl(&self, key: &CacheKey) -> CacheResult<(V, f64)> {
            self.0.get_ttl(key)
        }
        fn contains(&self, key: &CacheKey, ttl_margin: Option<f64>) -> bool {
            self.0.contains(key, ttl_margin)
        }
        fn clear(&self) {}
        fn purge(&self, timeout: f64) {
            self.0.purge(timeout);
        }
    }

    fn shared_stub<V: Clone + Send + Sync + 'static>() -> Arc<SharedStoreStub<V>> {
        Arc::new(SharedStoreStub(inproc_cache_client::<CacheKey, V>(64)))
    }

    #[test]
    fn test_namespace_isolation() {
        let shared = inproc_cache_client::<CacheKey, String>(64);
        let a = NamespaceWrapper::new("a", Arc::clone(&shared));
        let b = NamespaceWrapper::new("b", Arc::clone(&shared));

        a.put(key("k"), "va".to_string(), 60.0);
        assert_eq!(a.get(&key("k")).unwrap(), "va");
        assert!(b.get(&key("k")).is_err());
    }

    #[test]
    fn test_clear_is_a_revision_bump() {
        let shared = shared_stub::<String>();
        let ns = NamespaceWrapper::new("sessions", Arc::clone(&shared));

        ns.put(key("k"), "v1".to_string(), 60.0);
        assert_eq!(ns.revision(), 0);
        ns.clear();
        assert_eq!(ns.revision(), 1);
        assert!(ns.get(&key("k")).is_err());

        // The old entry is orphaned under its revision-0 decorated
        // key, not rewritten or physically removed.
        let old_decorated =
            CacheKey::Seq(vec![key("sessions"), CacheKey::Int(0), key("k")]);
        let (value, ttl) = shared.get_ttl(&old_decorated).unwrap();
        assert_eq!(value, "v1");
        assert!(ttl <= 60.0);
    }

    #[test]
    fn test_revision_recovered_from_revmark() {
        let shared = shared_stub::<u64>();
        let ns = NamespaceWrapper::<u64, _>::new("ns", Arc::clone(&shared));
        ns.clear();
        ns.clear();
        assert_eq!(ns.revision(), 2);

        let reopened = NamespaceWrapper::<u64, _>::new("ns", Arc::clone(&shared));
        assert_eq!(reopened.revision(), 2);
    }

    #[test]
    fn test_mirror_tracks_reference_revision() {
        let shared = inproc_cache_client::<CacheKey, String>(64);
        let private = inproc_cache_client::<CacheKey, String>(64);
        let reference = Arc::new(NamespaceWrapper::new("ns", Arc::clone(&shared)));
        let mirror = NamespaceMirrorWrapper::new(Arc::clone(&reference), private);

        mirror.put(key("k"), "v".to_string(), 60.0);
        assert_eq!(mirror.get(&key("k")).unwrap(), "v");

        reference.clear();
        assert_eq!(mirror.revision(), reference.revision());
        // New revision, new decorated key: the mirror's old entry is
        // invisible now.
        assert!(mirror.get(&key("k")).is_err());
    }
}
