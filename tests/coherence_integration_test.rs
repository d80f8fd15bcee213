//! Integration tests for the coherence cluster
//!
//! These drive several nodes, each with its own private cache and
//! coherence manager, all sharing one back-end store and one
//! in-process bus, from real threads, and check the cluster-level
//! guarantees: cluster-wide single-flight, out-of-band update
//! detection, deletion propagation, and the staleness contract of
//! `add`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use lattice::{
    inproc_cache_client, CacheClient, CacheKey, CoherenceConfig, CoherenceManager,
    CoherentWrapperClient, InprocCacheClient, MemoryBusHub,
};

type SharedStore = Arc<InprocCacheClient<CacheKey, String>>;

struct Node {
    client: Arc<CoherentWrapperClient<String, InprocCacheClient<CacheKey, String>>>,
    private: SharedStore,
}

fn node(hub: &MemoryBusHub, identity: &str, shared: &SharedStore) -> Node {
    let private = inproc_cache_client::<CacheKey, String>(64);
    let manager = Arc::new(
        CoherenceManager::new(
            CoherenceConfig {
                namespace: "cluster".to_string(),
                protocol_timeout: Duration::from_millis(400),
                ..CoherenceConfig::default()
            },
            private.clone() as Arc<dyn CacheClient<CacheKey, String>>,
            Some(shared.clone() as Arc<dyn CacheClient<CacheKey, String>>),
            hub.endpoint(Some(identity)),
        )
        .unwrap(),
    );
    Node {
        client: Arc::new(CoherentWrapperClient::new(shared.clone(), manager)),
        private,
    }
}

fn k(s: &str) -> CacheKey {
    CacheKey::from(s)
}

#[test]
fn test_cold_single_flight_two_nodes() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    let b = node(&hub, "b", &shared);
    hub.promote("a");

    let invocations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let threads: Vec<_> = [a.client.clone(), b.client.clone()]
        .into_iter()
        .map(|client| {
            let shared = shared.clone();
            let invocations = Arc::clone(&invocations);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let expired_store = shared.clone();
                barrier.wait();
                client
                    .put_coherently(
                        k("hot"),
                        60.0,
                        move || !expired_store.contains(&k("hot"), None),
                        Some(Duration::ZERO),
                        move || {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            "expensive".to_string()
                        },
                    )
                    .unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // Exactly one node ran the computation; both see the value.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(a.client.get(&k("hot")).unwrap(), "expensive");
    assert_eq!(b.client.get(&k("hot")).unwrap(), "expensive");
    // The winner announced done, so nothing is left pending anywhere.
    assert!(a.client.manager().pending_txid(&k("hot")).is_none());
    assert!(b.client.manager().pending_txid(&k("hot")).is_none());
    assert!(a.client.manager().group_pending_entry(&k("hot")).is_none());
}

#[test]
fn test_cold_single_flight_many_nodes() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let nodes: Vec<Node> = (0..4)
        .map(|i| node(&hub, &format!("n{i}"), &shared))
        .collect();
    hub.promote("n0");

    let invocations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(nodes.len()));

    let threads: Vec<_> = nodes
        .iter()
        .map(|n| {
            let client = Arc::clone(&n.client);
            let shared = shared.clone();
            let invocations = Arc::clone(&invocations);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let expired_store = shared.clone();
                client
                    .put_coherently(
                        k("hot"),
                        60.0,
                        move || !expired_store.contains(&k("hot"), None),
                        Some(Duration::ZERO),
                        move || {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            "expensive".to_string()
                        },
                    )
                    .unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    for n in &nodes {
        assert_eq!(n.client.get(&k("hot")).unwrap(), "expensive");
    }
}

#[test]
fn test_out_of_band_update_skips_computation() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    let _b = node(&hub, "b", &shared);
    hub.promote("a");

    // Another node's update already refreshed the shared cache.
    shared.put(k("warm"), "fresh".to_string(), 60.0);

    let invocations = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invocations);
    let expired_store = shared.clone();
    a.client
        .put_coherently(
            k("warm"),
            60.0,
            move || !expired_store.contains(&k("warm"), None),
            Some(Duration::ZERO),
            move || {
                probe.fetch_add(1, Ordering::SeqCst);
                "recomputed".to_string()
            },
        )
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(a.client.get(&k("warm")).unwrap(), "fresh");
    assert!(a.client.manager().pending_txid(&k("warm")).is_none());
}

#[test]
fn test_delete_propagation_across_nodes() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    let b = node(&hub, "b", &shared);
    hub.promote("a");

    b.private.put(k("x"), "cached".to_string(), 60.0);
    shared.put(k("x"), "cached".to_string(), 60.0);

    a.client.delete(&k("x"));
    assert!(!b.private.contains(&k("x"), None));
    assert!(shared.get(&k("x")).is_err());
}

#[test]
fn test_clear_propagates_as_sentinel() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    let b = node(&hub, "b", &shared);
    hub.promote("a");

    b.private.put(k("x"), "one".to_string(), 60.0);
    b.private.put(k("y"), "two".to_string(), 60.0);

    a.client.clear();
    assert_eq!(b.private.usage(), 0);
}

#[test]
fn test_add_staleness_override_end_to_end() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    hub.promote("a");

    // ttl 0: fresh for this very instant, stale a moment later.
    a.client.put(k("s"), "v1".to_string(), 0.0);
    std::thread::sleep(Duration::from_millis(20));

    assert!(a.client.add(k("s"), "v2".to_string(), 60.0));
    assert_eq!(a.client.get(&k("s")).unwrap(), "v2");
}

#[test]
fn test_losers_wait_for_winner_when_asked() {
    let hub = MemoryBusHub::new();
    let shared = inproc_cache_client::<CacheKey, String>(64);
    let a = node(&hub, "a", &shared);
    let b = node(&hub, "b", &shared);
    hub.promote("a");

    let invocations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let threads: Vec<_> = [a.client.clone(), b.client.clone()]
        .into_iter()
        .map(|client| {
            let shared = shared.clone();
            let invocations = Arc::clone(&invocations);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let expired_store = shared.clone();
                barrier.wait();
                client
                    .put_coherently(
                        k("slow"),
                        60.0,
                        move || !expired_store.contains(&k("slow"), None),
                        // Block on the winner instead of abandoning.
                        Some(Duration::from_secs(5)),
                        move || {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            "expensive".to_string()
                        },
                    )
                    .unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(shared.get(&k("slow")).unwrap(), "expensive");
}
