//! Process-wide registry of live caches
//!
//! Every in-process cache client registers itself here at
//! construction so [`cache_purge`] and [`cache_clear`] can sweep all
//! of them without keeping any alive: the registry holds weak
//! references and prunes dead entries whenever it is walked.
//!
//! [`CacheJanitor`] runs the sweep on a background thread; a panic
//! inside a purge is logged and swallowed, never taking the janitor
//! down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

/// Operations the registry can apply to any live cache, whatever its
/// key and value types.
pub trait RegisteredCache: Send + Sync {
    /// Remove entries stale for longer than `timeout` seconds
    fn purge_expired(&self, timeout: f64);
    /// Drop every entry
    fn clear_all(&self);
    /// `(capacity, usage)` snapshot
    fn stats(&self) -> (usize, usize);
}

static CACHES: Lazy<Mutex<Vec<Weak<dyn RegisteredCache>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register a cache. Called by client constructors; the registry
/// keeps only a weak reference.
pub fn register_cache(cache: Weak<dyn RegisteredCache>) {
    CACHES.lock().push(cache);
}

/// Upgrade all live entries, pruning the dead ones in passing.
fn live_caches() -> Vec<Arc<dyn RegisteredCache>> {
    let mut slots = CACHES.lock();
    slots.retain(|w| w.strong_count() > 0);
    slots.iter().filter_map(Weak::upgrade).collect()
}

/// Purge every live cache. The sweep runs outside the registry lock
/// so a slow purge never blocks registration.
pub fn cache_purge(timeout: f64) {
    for cache in live_caches() {
        cache.purge_expired(timeout);
    }
}

/// Clear every live cache (use with moderation).
pub fn cache_clear() {
    for cache in live_caches() {
        cache.clear_all();
    }
}

/// `(capacity, usage)` snapshots of every live cache.
pub fn cache_stats() -> Vec<(usize, usize)> {
    live_caches().iter().map(|c| c.stats()).collect()
}

struct JanitorSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread that periodically purges all registered caches
pub struct CacheJanitor {
    signal: Arc<JanitorSignal>,
    handle: Option<JoinHandle<()>>,
}

impl CacheJanitor {
    /// Start a janitor purging every `sleep_interval`, removing
    /// entries stale for longer than `purge_timeout` seconds.
    pub fn start(sleep_interval: Duration, purge_timeout: f64) -> Self {
        let signal = Arc::new(JanitorSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::Builder::new()
            .name("cache-janitor".to_string())
            .spawn(move || loop {
                {
                    let mut stopped = thread_signal.stopped.lock();
                    if !*stopped {
                        thread_signal.wake.wait_for(&mut stopped, sleep_interval);
                    }
                    if *stopped {
                        return;
                    }
                }
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cache_purge(purge_timeout))) {
                    tracing::error!(?panic, "cache janitor purge panicked");
                }
            })
            .expect("failed to spawn cache janitor thread");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the janitor and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheJanitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct ProbeCache {
        purges: PlMutex<Vec<f64>>,
    }

    impl ProbeCache {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                purges: PlMutex::new(Vec::new()),
            })
        }
    }

    impl RegisteredCache for ProbeCache {
        fn purge_expired(&self, timeout: f64) {
            self.purges.lock().push(timeout);
        }
        fn clear_all(&self) {}
        fn stats(&self) -> (usize, usize) {
            (100, 1)
        }
    }

    // These tests touch the process-wide registry, which other tests
    // in this binary use with real caches; sweeps here use thresholds
    // no real test entry can cross. The destructive sweeps
    // (cache_purge(0), cache_clear) live in their own integration
    // binary.

    #[test]
    fn test_registry_sweeps_live_caches() {
        let probe = ProbeCache::new();
        register_cache(Arc::downgrade(&probe) as Weak<dyn RegisteredCache>);

        cache_purge(86_400.0);

        assert!(probe.purges.lock().contains(&86_400.0));
        assert!(cache_stats().contains(&(100, 1)));
    }

    #[test]
    fn test_registry_drops_dead_entries() {
        let probe = ProbeCache::new();
        register_cache(Arc::downgrade(&probe) as Weak<dyn RegisteredCache>);
        drop(probe);
        // Must not panic nor upgrade anything dead.
        cache_purge(86_400.0);
    }

    #[test]
    fn test_janitor_purges_periodically() {
        let probe = ProbeCache::new();
        register_cache(Arc::downgrade(&probe) as Weak<dyn RegisteredCache>);

        let janitor = CacheJanitor::start(Duration::from_millis(10), 86_400.0);
        std::thread::sleep(Duration::from_millis(60));
        janitor.stop();

        assert!(!probe.purges.lock().is_empty());
    }
}
