//! Deferred values and the write-behind client
//!
//! A [`Defer`] is a value placeholder: a zero-arg closure plus an
//! optional completion hook, resolved later by a worker. The
//! [`AsyncWriteClient`] is that worker's home: it wraps any client
//! and turns writes into queued jobs, making the client `async` in
//! the contract's sense: `put` returns before the value is visible,
//! and [`CacheClient::wait`] blocks until pending writes on a key
//! have landed.
//!
//! The executor works on `(callable, on_complete)` pairs: whoever
//! needs to run code after a value lands (coherence announcements,
//! for one) composes it into the deferred instead of patching the
//! closure.
//!
//! Once enqueued, a write cannot be cancelled; its effect can only be
//! observed via `wait`.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::CacheResult;

use super::CacheClient;

/// What became of a deferred computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome<V> {
    /// The closure ran and produced a value
    Value(V),
    /// Abandoned: the value is already fresh, or someone else is on it
    Skip,
    /// Abandoned because an out-of-band update was detected mid-protocol
    OutOfBand,
}

impl<V> ComputeOutcome<V> {
    /// True when no value was produced
    pub fn is_abandoned(&self) -> bool {
        !matches!(self, ComputeOutcome::Value(_))
    }
}

/// A computation that can be resolved by the write-behind worker
pub trait Deferred<V>: Send {
    /// Run (or abandon) the computation. Called at most once with an
    /// effect; later calls return `Skip`.
    fn resolve(&mut self) -> ComputeOutcome<V>;

    /// Invoked by the executor after the outcome was applied (value
    /// stored, or abandonment decided).
    fn complete(&mut self);
}

/// Plain deferred value: closure + completion hooks
pub struct Defer<V> {
    task: Option<Box<dyn FnOnce() -> V + Send>>,
    on_complete: Vec<Box<dyn FnOnce(bool) + Send>>,
    produced: bool,
}

impl<V> Defer<V> {
    /// Wrap a zero-arg closure
    pub fn new(task: impl FnOnce() -> V + Send + 'static) -> Self {
        Self {
            task: Some(Box::new(task)),
            on_complete: Vec::new(),
            produced: false,
        }
    }

    /// Attach a hook invoked after the outcome is applied; the bool
    /// tells whether a value was actually produced. Hooks compose:
    /// each call adds one, and they run in attachment order.
    pub fn on_complete(mut self, hook: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_complete.push(Box::new(hook));
        self
    }
}

impl<V> Deferred<V> for Defer<V> {
    fn resolve(&mut self) -> ComputeOutcome<V> {
        match self.task.take() {
            Some(task) => {
                self.produced = true;
                ComputeOutcome::Value(task())
            }
            None => ComputeOutcome::Skip,
        }
    }

    fn complete(&mut self) {
        for hook in self.on_complete.drain(..) {
            hook(self.produced);
        }
    }
}

enum WriteJob<K, V> {
    Put { key: K, value: V, ttl: f64 },
    Delete { key: K },
    Expire { key: K },
    Clear,
    Defer { key: K, ttl: f64, value: Box<dyn Deferred<V>> },
    Shutdown,
}

struct PendingWrites<K> {
    counts: Mutex<HashMap<K, usize>>,
    landed: Condvar,
}

impl<K: Hash + Eq + Clone> PendingWrites<K> {
    fn enter(&self, key: &K) {
        *self.counts.lock().entry(key.clone()).or_insert(0) += 1;
    }

    fn leave(&self, key: &K) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(key) {
            *n -= 1;
            if *n == 0 {
                counts.remove(key);
            }
        }
        self.landed.notify_all();
    }
}

/// Write-behind wrapper: turns any client into an asynchronous one
pub struct AsyncWriteClient<K, V, C> {
    client: Arc<C>,
    jobs: Sender<WriteJob<K, V>>,
    pending: Arc<PendingWrites<K>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V, C> AsyncWriteClient<K, V, C>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: CacheClient<K, V> + 'static,
{
    /// Wrap `client`, spawning the write worker.
    pub fn new(client: Arc<C>) -> Self {
        let (jobs, inbox) = channel::unbounded::<WriteJob<K, V>>();
        let pending = Arc::new(PendingWrites {
            counts: Mutex::new(HashMap::new()),
            landed: Condvar::new(),
        });

        let worker_client = Arc::clone(&client);
        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name("cache-write-behind".to_string())
            .spawn(move || {
                while let Ok(job) = inbox.recv() {
                    match job {
                        WriteJob::Put { key, value, ttl } => {
                            worker_client.put(key.clone(), value, ttl);
                            worker_pending.leave(&key);
                        }
                        WriteJob::Delete { key } => {
                            worker_client.delete(&key);
                            worker_pending.leave(&key);
                        }
                        WriteJob::Expire { key } => {
                            worker_client.expire(&key);
                            worker_pending.leave(&key);
                        }
                        WriteJob::Clear => worker_client.clear(),
                        WriteJob::Defer { key, ttl, mut value } => {
                            let outcome =
                                catch_unwind(AssertUnwindSafe(|| value.resolve()));
                            match outcome {
                                Ok(ComputeOutcome::Value(v)) => {
                                    worker_client.put(key.clone(), v, ttl);
                                    value.complete();
                                }
                                Ok(_) => value.complete(),
                                Err(panic) => {
                                    tracing::error!(?panic, "deferred computation panicked");
                                }
                            }
                            worker_pending.leave(&key);
                        }
                        WriteJob::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn write-behind worker");

        Self {
            client,
            jobs,
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a deferred computation for `key`. The worker resolves
    /// it, stores a produced value under `ttl`, and then invokes the
    /// deferred's completion hook.
    pub fn put_deferred(&self, key: K, ttl: f64, value: Box<dyn Deferred<V>>) {
        self.pending.enter(&key);
        if self.jobs.send(WriteJob::Defer { key: key.clone(), ttl, value }).is_err() {
            self.pending.leave(&key);
        }
    }

    /// The wrapped client
    pub fn inner(&self) -> &Arc<C> {
        &self.client
    }
}

impl<K, V, C> CacheClient<K, V> for AsyncWriteClient<K, V, C>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: CacheClient<K, V> + 'static,
{
    fn is_async(&self) -> bool {
        true
    }

    fn capacity(&self) -> usize {
        self.client.capacity()
    }

    fn usage(&self) -> usize {
        self.client.usage()
    }

    fn wait(&self, key: &K, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut counts = self.pending.counts.lock();
        while counts.get(key).copied().unwrap_or(0) > 0 {
            match deadline {
                None => self.pending.landed.wait(&mut counts),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self
                            .pending
                            .landed
                            .wait_until(&mut counts, deadline)
                            .timed_out()
                    {
                        return;
                    }
                }
            }
        }
    }

    fn put(&self, key: K, value: V, ttl: f64) {
        self.pending.enter(&key);
        if self.jobs.send(WriteJob::Put { key: key.clone(), value, ttl }).is_err() {
            self.pending.leave(&key);
        }
    }

    /// Atomic adds bypass the queue: the check-and-set must see the
    /// store, so any write already pending on the key is drained
    /// first.
    fn add(&self, key: K, value: V, ttl: f64) -> bool {
        self.wait(&key, None);
        self.client.add(key, value, ttl)
    }

    fn delete(&self, key: &K) {
        self.pending.enter(key);
        if self.jobs.send(WriteJob::Delete { key: key.clone() }).is_err() {
            self.pending.leave(key);
        }
    }

    fn expire(&self, key: &K) {
        self.pending.enter(key);
        if self.jobs.send(WriteJob::Expire { key: key.clone() }).is_err() {
            self.pending.leave(key);
        }
    }

    fn get_ttl(&self, key: &K) -> CacheResult<(V, f64)> {
        self.client.get_ttl(key)
    }

    fn contains(&self, key: &K, ttl_margin: Option<f64>) -> bool {
        self.client.contains(key, ttl_margin)
    }

    fn clear(&self) {
        let _ = self.jobs.send(WriteJob::Clear);
    }

    fn purge(&self, timeout: f64) {
        self.client.purge(timeout);
    }
}

impl<K, V, C> Drop for AsyncWriteClient<K, V, C> {
    fn drop(&mut self) {
        let _ = self.jobs.send(WriteJob::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
