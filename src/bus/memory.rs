//! In-process bus implementation
//!
//! A [`MemoryBusHub`] connects any number of endpoints inside one
//! process: enough to run a whole coherence cluster in a test, or to
//! coordinate caches of several subsystems sharing a process.
//!
//! Delivery is synchronous on the publishing thread, which gives FIFO
//! per source for free; each subscription's handler sits behind its
//! own mutex, which gives the per-subscription serialization the
//! contract requires. The publisher's own endpoint receives its
//! messages like any other.
//!
//! Broker election is explicit: nothing is broker until
//! [`MemoryBusHub::promote`] is called, and promotion dispatches
//! `LeaveBroker` to the outgoing endpoint before `EnterBroker` to the
//! incoming one. Wire listeners up before promoting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};

use super::{BusEvent, BusHandler, BusMessage, CoherenceBus, Dispatch, ListenerToken};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct Subscription {
    id: u64,
    prefix: String,
    event: BusEvent,
    handler: Mutex<BusHandler>,
    dead: AtomicBool,
}

struct EndpointInner {
    identity: String,
    is_broker: AtomicBool,
    subs: Mutex<Vec<Arc<Subscription>>>,
    hub: Weak<HubInner>,
    heartbeat: Duration,
}

struct HubInner {
    endpoints: Mutex<Vec<Arc<EndpointInner>>>,
}

impl EndpointInner {
    fn matching(&self, prefix: &str, event: BusEvent) -> Vec<Arc<Subscription>> {
        self.subs
            .lock()
            .iter()
            .filter(|s| {
                s.event == event
                    && !s.dead.load(Ordering::SeqCst)
                    && prefix.starts_with(s.prefix.as_str())
            })
            .cloned()
            .collect()
    }

    fn remove(&self, id: u64) {
        self.subs.lock().retain(|s| s.id != id);
    }

    /// Run matching handlers outside any table lock so they can
    /// publish and (un)subscribe reentrantly.
    fn dispatch(self: &Arc<Self>, prefix: &str, event: BusEvent, payload: &[u8], origin: Option<&Arc<EndpointInner>>) {
        for sub in self.matching(prefix, event) {
            if sub.dead.load(Ordering::SeqCst) {
                continue;
            }
            let verdict = {
                let mut handler = sub.handler.lock();
                handler(&BusMessage {
                    prefix,
                    event,
                    payload,
                    reply: None,
                })
            };
            match verdict {
                Dispatch::Continue => {}
                Dispatch::Unsubscribe => {
                    sub.dead.store(true, Ordering::SeqCst);
                    self.remove(sub.id);
                }
                Dispatch::Reply(reply) => {
                    // Only the broker may acknowledge; the reply goes
                    // back to the endpoint that published.
                    if self.is_broker.load(Ordering::SeqCst) {
                        if let Some(origin) = origin {
                            origin.dispatch_ack(prefix, payload, &reply);
                        }
                    }
                }
            }
        }
    }

    fn dispatch_ack(self: &Arc<Self>, prefix: &str, request: &[u8], reply: &[u8]) {
        for sub in self.matching(prefix, BusEvent::UpdateAcknowledged) {
            if sub.dead.load(Ordering::SeqCst) {
                continue;
            }
            let verdict = {
                let mut handler = sub.handler.lock();
                handler(&BusMessage {
                    prefix,
                    event: BusEvent::UpdateAcknowledged,
                    payload: request,
                    reply: Some(reply),
                })
            };
            if let Dispatch::Unsubscribe = verdict {
                sub.dead.store(true, Ordering::SeqCst);
                self.remove(sub.id);
            }
        }
    }
}

/// The shared in-process hub
pub struct MemoryBusHub {
    inner: Arc<HubInner>,
    heartbeat: Duration,
}

impl MemoryBusHub {
    /// Create an empty hub with the default 2 s heartbeat interval.
    pub fn new() -> Self {
        Self::with_heartbeat(Duration::from_millis(2000))
    }

    /// Create an empty hub advertising `heartbeat` as its push
    /// timeout (the protocol layer uses it as the default query
    /// timeout).
    pub fn with_heartbeat(heartbeat: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: Mutex::new(Vec::new()),
            }),
            heartbeat,
        }
    }

    /// Attach a new endpoint. `identity` defaults to a fresh UUID.
    pub fn endpoint(&self, identity: Option<&str>) -> Arc<MemoryBus> {
        let inner = Arc::new(EndpointInner {
            identity: identity
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            is_broker: AtomicBool::new(false),
            subs: Mutex::new(Vec::new()),
            hub: Arc::downgrade(&self.inner),
            heartbeat: self.heartbeat,
        });
        self.inner.endpoints.lock().push(Arc::clone(&inner));
        Arc::new(MemoryBus { inner })
    }

    /// Move the broker role to `identity`, dispatching `LeaveBroker`
    /// to the outgoing broker first, then `EnterBroker` to the new
    /// one. No-op when `identity` already holds the role.
    pub fn promote(&self, identity: &str) {
        let endpoints: Vec<Arc<EndpointInner>> = self.inner.endpoints.lock().clone();

        if let Some(old) = endpoints
            .iter()
            .find(|e| e.is_broker.load(Ordering::SeqCst))
        {
            if old.identity == identity {
                return;
            }
            old.is_broker.store(false, Ordering::SeqCst);
            old.dispatch("", BusEvent::LeaveBroker, &[], None);
        }

        if let Some(new) = endpoints.iter().find(|e| e.identity == identity) {
            new.is_broker.store(true, Ordering::SeqCst);
            new.dispatch("", BusEvent::EnterBroker, &[], None);
        }
    }

    /// Identity of the current broker, if any
    pub fn broker_identity(&self) -> Option<String> {
        self.inner
            .endpoints
            .lock()
            .iter()
            .find(|e| e.is_broker.load(Ordering::SeqCst))
            .map(|e| e.identity.clone())
    }
}

impl Default for MemoryBusHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryBusHub`]
pub struct MemoryBus {
    inner: Arc<EndpointInner>,
}

impl CoherenceBus for MemoryBus {
    fn publish(&self, prefix: &str, payload: &[u8]) -> CacheResult<()> {
        let hub = self
            .inner
            .hub
            .upgrade()
            .ok_or_else(|| CacheError::Connection("bus hub is gone".to_string()))?;
        let endpoints: Vec<Arc<EndpointInner>> = hub.endpoints.lock().clone();
        for endpoint in &endpoints {
            endpoint.dispatch(prefix, BusEvent::IncomingUpdate, payload, Some(&self.inner));
        }
        Ok(())
    }

    fn listen(&self, prefix: &str, event: BusEvent, handler: BusHandler) -> ListenerToken {
        let id = NEXT_TOKEN.fetch_add(1, Ordering::SeqCst);
        self.inner.subs.lock().push(Arc::new(Subscription {
            id,
            prefix: prefix.to_string(),
            event,
            handler: Mutex::new(handler),
            dead: AtomicBool::new(false),
        }));
        ListenerToken(id)
    }

    fn unlisten(&self, token: &ListenerToken) {
        let subs = self.inner.subs.lock();
        if let Some(sub) = subs.iter().find(|s| s.id == token.0) {
            sub.dead.store(true, Ordering::SeqCst);
        }
        drop(subs);
        self.inner.remove(token.0);
    }

    fn is_broker(&self) -> bool {
        self.inner.is_broker.load(Ordering::SeqCst)
    }

    fn identity(&self) -> String {
        self.inner.identity.clone()
    }

    fn heartbeat_push_timeout(&self) -> Duration {
        self.inner.heartbeat
    }
}
