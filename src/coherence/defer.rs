//! Coherent deferred computation
//!
//! A [`CoherentDefer`] is a deferred value that negotiates with the
//! cluster before running its closure. The `expired` predicate is the
//! only cancellation signal: it is re-polled on every loop entry and
//! inside the protocol, and a computation that already started is
//! never forcibly cancelled.

use std::sync::Arc;
use std::time::Duration;

use crate::client::deferred::{ComputeOutcome, Deferred};
use crate::key::CacheKey;

use super::manager::{CoherenceManager, QueryOutcome};

/// A zero-arg computation bound to a key in a coherence manager
pub struct CoherentDefer<V> {
    manager: Arc<CoherenceManager<V>>,
    key: CacheKey,
    expired: Box<dyn Fn() -> bool + Send + Sync>,
    task: Option<Box<dyn FnOnce() -> V + Send>>,
    timeout: Duration,
    wait_time: Option<Duration>,
    computed: bool,
}

impl<V: Clone + Send + Sync + 'static> CoherentDefer<V> {
    /// Bind `task` to `key` under `manager`.
    ///
    /// `expired` re-checks expiration against the shared cache; when
    /// it flips to false mid-protocol, the computation is abandoned.
    /// The protocol timeout defaults to the bus heartbeat interval;
    /// `wait_time` defaults to zero, meaning "never stall waiting for
    /// another node".
    pub fn new(
        manager: Arc<CoherenceManager<V>>,
        key: CacheKey,
        expired: impl Fn() -> bool + Send + Sync + 'static,
        task: impl FnOnce() -> V + Send + 'static,
    ) -> Self {
        let timeout = manager.heartbeat_timeout();
        Self {
            manager,
            key,
            expired: Box::new(expired),
            task: Some(Box::new(task)),
            timeout,
            wait_time: Some(Duration::ZERO),
            computed: false,
        }
    }

    /// Override the protocol timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to wait for another node's computation before
    /// retrying: `Some(ZERO)` abandons immediately (the default,
    /// keeping deferred workers unstalled), `None` waits without
    /// bound, anything else waits and then loops.
    pub fn with_wait_time(mut self, wait_time: Option<Duration>) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// The key this computation is bound to
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Run the coherence loop and, if this node wins the lock, the
    /// computation itself.
    pub fn undefer(&mut self) -> ComputeOutcome<V> {
        loop {
            if !(self.expired)() {
                // Already fresh somewhere; tiered caches will pull it
                // from the shared store and push it downstream.
                return ComputeOutcome::Skip;
            }
            let outcome =
                self.manager
                    .query_pending(&self.key, &*self.expired, self.timeout, true);
            match outcome {
                QueryOutcome::Vacant => {
                    // Our lock, our turn.
                    self.computed = true;
                    return match self.task.take() {
                        Some(task) => ComputeOutcome::Value(task()),
                        None => ComputeOutcome::Skip,
                    };
                }
                QueryOutcome::OutOfBand if !(self.expired)() => {
                    return ComputeOutcome::OutOfBand;
                }
                _ => match self.wait_time {
                    Some(wait) if wait.is_zero() => return ComputeOutcome::Skip,
                    wait => {
                        if self.manager.wait_done(&self.key, wait) {
                            return ComputeOutcome::Skip;
                        }
                        // Timed out waiting: maybe the holder died.
                        // Loop and renegotiate.
                    }
                },
            }
        }
    }

    /// Called after the produced value landed: announce completion if
    /// this node actually computed.
    pub fn done(&mut self) {
        if self.computed {
            self.computed = false;
            self.manager.mark_done(&self.key);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Deferred<V> for CoherentDefer<V> {
    fn resolve(&mut self) -> ComputeOutcome<V> {
        self.undefer()
    }

    fn complete(&mut self) {
        self.done();
    }
}
