//! The coherence protocol engine
//!
//! One manager per (namespace, node). All chatter is namespaced so
//! independent managers can share a bus:
//!
//! - `{ns}|c|del|` / `{ns}|c|delack|`: deletion broadcast and its
//!   acknowledgement (synchronous mode only),
//! - `{ns}|c|pend|`: listener to broker "I am computing these keys",
//! - `{ns}|c|done|{shard}|`: "I finished"; sharded by stable key
//!   hash so waiters can subscribe narrowly,
//! - `{ns}|c|pendq|`: listener to broker "who computes this key? if
//!   nobody, lock it to me",
//! - `{ns}|c|listpendq|`: broker to listeners "resend your pend
//!   state", broadcast on promotion.
//!
//! The broker holds the authoritative `group_pending` table; every
//! node holds its own `pending`. A broker failover loses
//! `group_pending` until `listpendq` answers arrive, costing at most
//! one duplicated computation per in-flight key.
//!
//! Protocol publishes never raise: a bus connection error degrades
//! the operation to its local-table equivalent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus::{
    decode_payload, encode_payload, BusEvent, BusHandler, BusMessage, CoherenceBus, Dispatch,
    ListenerToken, PayloadEncoding,
};
use crate::client::CacheClient;
use crate::codec::SecureCodec;
use crate::error::{CacheError, CacheResult};
use crate::key::{stable_hash, CacheKey, StableHashFn};

/// 31-bit cycling transaction counter mask
const TXID_MASK: u32 = 0x7FFF_FFFF;

/// Outcome of a pending-computation query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Someone is computing; here is how to reach them
    Computing(Vec<String>),
    /// Nobody is computing (and the key was locked to us if we asked)
    Vacant,
    /// The value was refreshed out of band while we were asking
    OutOfBand,
}

/// Key payload of a deletion broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoherentKey {
    /// Delete one key
    Key(CacheKey),
    /// Sentinel: wipe the whole private cache
    Clear,
}

#[derive(Serialize, Deserialize)]
struct DeletionMsg {
    txid: u32,
    key: CoherentKey,
}

#[derive(Serialize, Deserialize)]
struct DelAckMsg {
    txid: u32,
    identity: String,
}

#[derive(Serialize, Deserialize)]
struct PendMsg {
    txid: u32,
    keys: Vec<CacheKey>,
    contact: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PendQueryMsg {
    key: CacheKey,
    txid: Option<u32>,
    contact: Vec<String>,
    lock: bool,
}

/// Broker's answer to a pendq: the holding `(txid, contact)`, if any
#[derive(Serialize, Deserialize)]
struct PendReply(Option<(u32, Vec<String>)>);

/// Manager construction parameters
pub struct CoherenceConfig {
    /// Namespace identifying this manager's chatter on the bus
    pub namespace: String,
    /// Control-payload encoding
    pub encoding: PayloadEncoding,
    /// When true, deletion waiters really wait for peer acks
    pub synchronous: bool,
    /// When true, every put broadcasts a `done` so peers can
    /// short-circuit their own pending computations
    pub quick_refresh: bool,
    /// Default protocol query timeout
    pub protocol_timeout: Duration,
    /// P2P bindhost templates; `{identity}` and `{randport}` are
    /// substituted. The expanded endpoints are advertised after the
    /// bus identity in the contact list.
    pub p2p_bindhosts: Vec<String>,
    /// Stable key hash used to shard `done` subscriptions
    pub stable_hash: StableHashFn,
    /// Integrity codec for P2P value transfer. Required when no
    /// shared cache is configured.
    pub value_codec: Option<SecureCodec>,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            namespace: "cache".to_string(),
            encoding: PayloadEncoding::default(),
            synchronous: false,
            quick_refresh: false,
            protocol_timeout: Duration::from_millis(2000),
            p2p_bindhosts: Vec::new(),
            stable_hash,
            value_codec: None,
        }
    }
}

struct Prefixes {
    del: String,
    delack: String,
    pend: String,
    pendq: String,
    done: String,
    listpendq: String,
}

impl Prefixes {
    fn new(namespace: &str) -> Self {
        Self {
            del: format!("{namespace}|c|del|"),
            delack: format!("{namespace}|c|delack|"),
            pend: format!("{namespace}|c|pend|"),
            pendq: format!("{namespace}|c|pendq|"),
            done: format!("{namespace}|c|done|"),
            listpendq: format!("{namespace}|c|listpendq|"),
        }
    }
}

struct ManagerState<V> {
    bus: Arc<dyn CoherenceBus>,
    private: Arc<dyn CacheClient<CacheKey, V>>,
    shared: Option<Arc<dyn CacheClient<CacheKey, V>>>,
    encoding: PayloadEncoding,
    synchronous: bool,
    quick_refresh: bool,
    protocol_timeout: Duration,
    stable_hash: StableHashFn,
    value_codec: Option<SecureCodec>,
    contact: Vec<String>,
    identity: String,
    txid: AtomicU32,
    /// Own in-flight computations: key -> txid
    pending: DashMap<CacheKey, u32>,
    /// Authoritative cluster table; meaningful only while broker
    group_pending: DashMap<CacheKey, (u32, Vec<String>)>,
    prefixes: Prefixes,
    broker_subs: Mutex<Vec<ListenerToken>>,
}

impl<V: Clone + Send + Sync + 'static> ManagerState<V> {
    fn next_txid(&self) -> u32 {
        self.txid.fetch_add(1, Ordering::Relaxed) & TXID_MASK
    }

    fn publish_encode<T: Serialize>(&self, prefix: &str, value: &T) -> CacheResult<()> {
        let bytes = encode_payload(self.encoding, value)?;
        self.bus.publish(prefix, &bytes)
    }

    fn done_topic(&self, key: &CacheKey) -> String {
        format!("{}{:08x}|", self.prefixes.done, (self.stable_hash)(key))
    }

    /// The purely local half of `query_pending`: consult the tables
    /// this node holds and, when asked, lock the key to ourselves.
    fn query_pending_locally(
        &self,
        key: &CacheKey,
        expired: &dyn Fn() -> bool,
        optimistic_lock: bool,
    ) -> QueryOutcome {
        if let Some(holder) = self.group_pending.get(key) {
            return QueryOutcome::Computing(holder.value().1.clone());
        }
        if self.pending.contains_key(key) {
            return QueryOutcome::Computing(self.contact.clone());
        }
        if !expired() {
            return QueryOutcome::OutOfBand;
        }
        if optimistic_lock {
            // Check-and-set through the entry API: two racing local
            // callers cannot both acquire.
            match self.group_pending.entry(key.clone()) {
                Entry::Occupied(holder) => {
                    return QueryOutcome::Computing(holder.get().1.clone());
                }
                Entry::Vacant(slot) => {
                    let txid = self.next_txid();
                    slot.insert((txid, self.contact.clone()));
                    self.pending.insert(key.clone(), txid);
                }
            }
        }
        QueryOutcome::Vacant
    }

    /// Listener half: ask the broker over the acknowledged-publish
    /// channel.
    fn query_pending_remote(
        &self,
        key: &CacheKey,
        expired: &dyn Fn() -> bool,
        timeout: Duration,
        optimistic_lock: bool,
    ) -> CacheResult<QueryOutcome> {
        let txid = if optimistic_lock {
            Some(self.next_txid())
        } else {
            None
        };
        let request = encode_payload(
            self.encoding,
            &PendQueryMsg {
                key: key.clone(),
                txid,
                contact: self.contact.clone(),
                lock: optimistic_lock,
            },
        )?;

        let slot: Arc<(Mutex<Option<PendReply>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let sink = Arc::clone(&slot);
        let matcher = request.clone();
        // Subscribe the reply waiter before publishing, or a fast
        // broker could answer into the void.
        let token = self.bus.listen(
            "",
            BusEvent::UpdateAcknowledged,
            Box::new(move |msg: &BusMessage<'_>| {
                if msg.payload != matcher.as_slice() {
                    return Dispatch::Continue;
                }
                if let Some(reply) = msg.reply {
                    if let Ok(decoded) = decode_payload::<PendReply>(reply) {
                        *sink.0.lock() = Some(decoded);
                        sink.1.notify_all();
                    }
                }
                Dispatch::Unsubscribe
            }),
        );

        let published = self.bus.publish(&self.prefixes.pendq, &request);
        if let Err(e) = published {
            self.bus.unlisten(&token);
            return Err(e);
        }

        let quarter = timeout / 4;
        let mut reply: Option<PendReply> = None;
        let mut exhausted = true;
        for _ in 0..3 {
            if let Some(r) = wait_reply(&slot, quarter) {
                reply = Some(r);
                exhausted = false;
                break;
            }
            if expired() {
                let _ = self.bus.publish(&self.prefixes.pendq, &request);
            } else {
                exhausted = false;
                break;
            }
        }
        if exhausted && reply.is_none() && expired() {
            // Grace poll: the expiration still holds, give the broker
            // one more quarter.
            reply = wait_reply(&slot, quarter);
        }
        if reply.is_none() {
            // A reply may have landed between the last poll and now.
            reply = slot.0.lock().take();
        }
        self.bus.unlisten(&token);

        let outcome = match reply {
            Some(PendReply(Some((_txid, contact)))) => QueryOutcome::Computing(contact),
            Some(PendReply(None)) if !expired() => QueryOutcome::OutOfBand,
            Some(PendReply(None)) => QueryOutcome::Vacant,
            None if expired() => QueryOutcome::Vacant,
            None => QueryOutcome::OutOfBand,
        };

        if optimistic_lock && outcome == QueryOutcome::Vacant {
            if let Some(txid) = txid {
                // The broker recorded group_pending[key] when it
                // answered null (or never heard us; either way the
                // lock is best-effort ours now).
                self.pending.insert(key.clone(), txid);
            }
        }
        Ok(outcome)
    }

    fn publish_own_pending(&self) {
        let mut by_txid: HashMap<u32, Vec<CacheKey>> = HashMap::new();
        for entry in self.pending.iter() {
            by_txid
                .entry(*entry.value())
                .or_default()
                .push(entry.key().clone());
        }
        for (txid, keys) in by_txid {
            let msg = PendMsg {
                txid,
                keys,
                contact: self.contact.clone(),
            };
            if let Err(e) = self.publish_encode(&self.prefixes.pend, &msg) {
                tracing::debug!(error = %e, "pend republish failed");
            }
        }
    }
}

fn wait_reply(
    slot: &Arc<(Mutex<Option<PendReply>>, Condvar)>,
    timeout: Duration,
) -> Option<PendReply> {
    let deadline = Instant::now() + timeout;
    let mut guard = slot.0.lock();
    loop {
        if let Some(reply) = guard.take() {
            return Some(reply);
        }
        if slot.1.wait_until(&mut guard, deadline).timed_out() {
            return guard.take();
        }
    }
}

fn weak_handler<V, F>(state: &Arc<ManagerState<V>>, f: F) -> BusHandler
where
    V: Clone + Send + Sync + 'static,
    F: Fn(&Arc<ManagerState<V>>, &BusMessage<'_>) -> Dispatch + Send + 'static,
{
    let weak: Weak<ManagerState<V>> = Arc::downgrade(state);
    Box::new(move |msg: &BusMessage<'_>| match weak.upgrade() {
        Some(state) => f(&state, msg),
        // Manager is gone: lazily drop the subscription.
        None => Dispatch::Unsubscribe,
    })
}

fn on_deletion<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    msg: &BusMessage<'_>,
) -> Dispatch {
    let Ok(DeletionMsg { txid, key }) = decode_payload::<DeletionMsg>(msg.payload) else {
        return Dispatch::Continue;
    };
    match key {
        CoherentKey::Key(key) => state.private.delete(&key),
        CoherentKey::Clear => state.private.clear(),
    }
    if state.synchronous {
        let ack = DelAckMsg {
            txid,
            identity: state.identity.clone(),
        };
        if let Err(e) = state.publish_encode(&state.prefixes.delack, &ack) {
            tracing::debug!(error = %e, "delack publish failed");
        }
    }
    Dispatch::Continue
}

fn on_pending<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    msg: &BusMessage<'_>,
) -> Dispatch {
    if state.bus.is_broker() {
        if let Ok(PendMsg { txid, keys, contact }) = decode_payload::<PendMsg>(msg.payload) {
            for key in keys {
                state.group_pending.insert(key, (txid, contact.clone()));
            }
        }
    }
    Dispatch::Continue
}

fn on_done<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    msg: &BusMessage<'_>,
) -> Dispatch {
    if state.bus.is_broker() {
        if let Ok(PendMsg { txid, keys, contact }) = decode_payload::<PendMsg>(msg.payload) {
            let holder = (txid, contact);
            for key in &keys {
                // A done from an abandoned attempt carries a stale
                // (txid, contact) pair and must not clear the entry
                // of the current holder.
                state.group_pending.remove_if(key, |_, held| *held == holder);
            }
        }
    }
    Dispatch::Continue
}

fn on_pending_query<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    msg: &BusMessage<'_>,
) -> Dispatch {
    let Ok(PendQueryMsg { key, txid, contact, lock }) =
        decode_payload::<PendQueryMsg>(msg.payload)
    else {
        return Dispatch::Continue;
    };
    let existing = match state.group_pending.entry(key) {
        Entry::Occupied(holder) => Some(holder.get().clone()),
        Entry::Vacant(slot) => {
            if lock {
                if let Some(txid) = txid {
                    slot.insert((txid, contact));
                }
            }
            None
        }
    };
    match encode_payload(state.encoding, &PendReply(existing)) {
        Ok(reply) => Dispatch::Reply(reply),
        Err(_) => Dispatch::Continue,
    }
}

fn on_listpendq<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    _msg: &BusMessage<'_>,
) -> Dispatch {
    state.publish_own_pending();
    Dispatch::Continue
}

fn on_enter_broker<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    _msg: &BusMessage<'_>,
) -> Dispatch {
    tracing::debug!(identity = %state.identity, "entering broker role");
    install_broker_subs(state);
    // Solicit pend state from every listener to rebuild the table.
    if let Err(e) = state.publish_encode(&state.prefixes.listpendq, &()) {
        tracing::debug!(error = %e, "listpendq broadcast failed");
    }
    Dispatch::Continue
}

fn on_leave_broker<V: Clone + Send + Sync + 'static>(
    state: &Arc<ManagerState<V>>,
    _msg: &BusMessage<'_>,
) -> Dispatch {
    tracing::debug!(identity = %state.identity, "leaving broker role");
    let tokens: Vec<ListenerToken> = state.broker_subs.lock().drain(..).collect();
    for token in &tokens {
        state.bus.unlisten(token);
    }
    Dispatch::Continue
}

fn install_broker_subs<V: Clone + Send + Sync + 'static>(state: &Arc<ManagerState<V>>) {
    let mut subs = state.broker_subs.lock();
    if !subs.is_empty() {
        return;
    }
    subs.push(state.bus.listen(
        &state.prefixes.pend,
        BusEvent::IncomingUpdate,
        weak_handler(state, on_pending),
    ));
    subs.push(state.bus.listen(
        &state.prefixes.done,
        BusEvent::IncomingUpdate,
        weak_handler(state, on_done),
    ));
    subs.push(state.bus.listen(
        &state.prefixes.pendq,
        BusEvent::IncomingUpdate,
        weak_handler(state, on_pending_query),
    ));
}

/// Waiter returned by [`CoherenceManager::fire_deletion`]
///
/// A no-op in asynchronous mode; in synchronous mode it counts
/// matching `delack`s from other nodes.
pub struct DeletionWaiter {
    sync: Option<SyncAckWaiter>,
}

struct SyncAckWaiter {
    bus: Arc<dyn CoherenceBus>,
    token: ListenerToken,
    acks: Arc<(Mutex<usize>, Condvar)>,
}

impl DeletionWaiter {
    fn noop() -> Self {
        Self { sync: None }
    }

    fn synchronous(bus: Arc<dyn CoherenceBus>, delack_prefix: &str, txid: u32, own_identity: String) -> Self {
        let acks: Arc<(Mutex<usize>, Condvar)> = Arc::new((Mutex::new(0), Condvar::new()));
        let sink = Arc::clone(&acks);
        let token = bus.listen(
            delack_prefix,
            BusEvent::IncomingUpdate,
            Box::new(move |msg: &BusMessage<'_>| {
                if let Ok(ack) = decode_payload::<DelAckMsg>(msg.payload) {
                    // Our own endpoint acks its own broadcast too;
                    // only peers count.
                    if ack.txid == txid && ack.identity != own_identity {
                        *sink.0.lock() += 1;
                        sink.1.notify_all();
                    }
                }
                Dispatch::Continue
            }),
        );
        Self {
            sync: Some(SyncAckWaiter { bus, token, acks }),
        }
    }

    /// Wait until at least one peer acknowledged the deletion.
    /// Returns immediately with `true` in asynchronous mode; returns
    /// `false` on timeout. `None` waits without bound.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let Some(sync) = &self.sync else {
            return true;
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = sync.acks.0.lock();
        while *count == 0 {
            match deadline {
                None => sync.acks.1.wait(&mut count),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || sync.acks.1.wait_until(&mut count, deadline).timed_out()
                    {
                        return *count > 0;
                    }
                }
            }
        }
        true
    }

    /// Number of peer acknowledgements observed so far
    pub fn acks(&self) -> usize {
        self.sync.as_ref().map_or(0, |s| *s.acks.0.lock())
    }
}

impl Drop for DeletionWaiter {
    fn drop(&mut self) {
        if let Some(sync) = &self.sync {
            sync.bus.unlisten(&sync.token);
        }
    }
}

/// Protocol engine coordinating the caches of one namespace
pub struct CoherenceManager<V> {
    state: Arc<ManagerState<V>>,
    tokens: Mutex<Vec<ListenerToken>>,
}

impl<V: Clone + Send + Sync + 'static> CoherenceManager<V> {
    /// Create a manager over `bus`.
    ///
    /// `private` is this node's private cache, the target of incoming
    /// deletion broadcasts. `shared` is the optional shared back-end;
    /// without one, a `value_codec` must be configured so values can
    /// travel peer to peer.
    pub fn new(
        config: CoherenceConfig,
        private: Arc<dyn CacheClient<CacheKey, V>>,
        shared: Option<Arc<dyn CacheClient<CacheKey, V>>>,
        bus: Arc<dyn CoherenceBus>,
    ) -> CacheResult<Self> {
        if shared.is_none() && config.value_codec.is_none() {
            return Err(CacheError::Config(
                "a shared cache or a value codec is required".to_string(),
            ));
        }

        let identity = bus.identity();
        let mut contact = vec![identity.clone()];
        let mut rng = rand::thread_rng();
        for template in &config.p2p_bindhosts {
            let randport: u32 = 50_000 + rng.gen_range(0..20_000);
            contact.push(
                template
                    .replace("{identity}", &identity)
                    .replace("{randport}", &randport.to_string()),
            );
        }

        let state = Arc::new(ManagerState {
            bus,
            private,
            shared,
            encoding: config.encoding,
            synchronous: config.synchronous,
            quick_refresh: config.quick_refresh,
            protocol_timeout: config.protocol_timeout,
            stable_hash: config.stable_hash,
            value_codec: config.value_codec,
            contact,
            identity,
            txid: AtomicU32::new(0),
            pending: DashMap::new(),
            group_pending: DashMap::new(),
            prefixes: Prefixes::new(&config.namespace),
            broker_subs: Mutex::new(Vec::new()),
        });

        let mut tokens = Vec::new();
        tokens.push(state.bus.listen(
            &state.prefixes.del,
            BusEvent::IncomingUpdate,
            weak_handler(&state, on_deletion),
        ));
        tokens.push(state.bus.listen(
            &state.prefixes.listpendq,
            BusEvent::IncomingUpdate,
            weak_handler(&state, on_listpendq),
        ));
        tokens.push(
            state
                .bus
                .listen("", BusEvent::EnterBroker, weak_handler(&state, on_enter_broker)),
        );
        tokens.push(
            state
                .bus
                .listen("", BusEvent::LeaveBroker, weak_handler(&state, on_leave_broker)),
        );

        if state.bus.is_broker() {
            // Promoted before we subscribed: catch up now.
            install_broker_subs(&state);
            let _ = state.publish_encode(&state.prefixes.listpendq, &());
        }

        Ok(Self {
            state,
            tokens: Mutex::new(tokens),
        })
    }

    /// Query the cluster about `key`'s pending status.
    ///
    /// `expired` re-confirms that the value actually needs a refresh;
    /// it is re-polled through the protocol to detect out-of-band
    /// updates. With `optimistic_lock`, a [`QueryOutcome::Vacant`]
    /// answer also locked the key to this node.
    pub fn query_pending(
        &self,
        key: &CacheKey,
        expired: &dyn Fn() -> bool,
        timeout: Duration,
        optimistic_lock: bool,
    ) -> QueryOutcome {
        if self.state.bus.is_broker() {
            return self
                .state
                .query_pending_locally(key, expired, optimistic_lock);
        }
        match self
            .state
            .query_pending_remote(key, expired, timeout, optimistic_lock)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(error = %e, "pendq failed; degrading to local query");
                self.state
                    .query_pending_locally(key, expired, optimistic_lock)
            }
        }
    }

    /// Announce that this node finished computing `key`. Pops the
    /// local pending entry; a node that never held one publishes
    /// nothing.
    pub fn mark_done(&self, key: &CacheKey) {
        if let Some((_, txid)) = self.state.pending.remove(key) {
            let msg = PendMsg {
                txid,
                keys: vec![key.clone()],
                contact: self.state.contact.clone(),
            };
            let topic = self.state.done_topic(key);
            if let Err(e) = self.state.publish_encode(&topic, &msg) {
                tracing::debug!(error = %e, "done publish failed");
            }
        }
    }

    /// Quick-refresh announcement: broadcast `done` for keys this
    /// node refreshed without holding a computation lock. The fresh
    /// txid cannot match any broker entry, so it only feeds waiters.
    pub fn fire_done(&self, keys: &[CacheKey]) {
        let txid = self.state.next_txid();
        for key in keys {
            let msg = PendMsg {
                txid,
                keys: vec![key.clone()],
                contact: self.state.contact.clone(),
            };
            let topic = self.state.done_topic(key);
            if let Err(e) = self.state.publish_encode(&topic, &msg) {
                tracing::debug!(error = %e, "done publish failed");
            }
        }
    }

    /// Broadcast a deletion (or the CLEAR sentinel). The returned
    /// waiter is subscribed before the publish, so no ack can be
    /// missed.
    pub fn fire_deletion(&self, key: CoherentKey) -> DeletionWaiter {
        let txid = self.state.next_txid();
        let waiter = if self.state.synchronous {
            DeletionWaiter::synchronous(
                Arc::clone(&self.state.bus),
                &self.state.prefixes.delack,
                txid,
                self.state.identity.clone(),
            )
        } else {
            DeletionWaiter::noop()
        };
        let msg = DeletionMsg { txid, key };
        if let Err(e) = self.state.publish_encode(&self.state.prefixes.del, &msg) {
            tracing::debug!(error = %e, "deletion broadcast failed; peers will expire naturally");
        }
        waiter
    }

    /// Block until some node announces `done` for `key`, or the
    /// timeout elapses. `None` waits without bound. Deadlines are
    /// monotonic.
    pub fn wait_done(&self, key: &CacheKey, timeout: Option<Duration>) -> bool {
        let seen: Arc<(Mutex<bool>, Condvar)> = Arc::new((Mutex::new(false), Condvar::new()));
        let sink = Arc::clone(&seen);
        let wanted = key.clone();
        let token = self.state.bus.listen(
            &self.state.done_topic(key),
            BusEvent::IncomingUpdate,
            Box::new(move |msg: &BusMessage<'_>| {
                if let Ok(done) = decode_payload::<PendMsg>(msg.payload) {
                    // Shard collisions land here too; match the key.
                    if done.keys.contains(&wanted) {
                        *sink.0.lock() = true;
                        sink.1.notify_all();
                        return Dispatch::Unsubscribe;
                    }
                }
                Dispatch::Continue
            }),
        );

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = seen.0.lock();
        while !*done {
            match deadline {
                None => seen.1.wait(&mut done),
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || seen.1.wait_until(&mut done, deadline).timed_out()
                    {
                        break;
                    }
                }
            }
        }
        let result = *done;
        drop(done);
        self.state.bus.unlisten(&token);
        result
    }

    /// True when every `put` should broadcast a `done`
    pub fn quick_refresh(&self) -> bool {
        self.state.quick_refresh
    }

    /// Default protocol timeout for wrappers built on this manager
    pub fn protocol_timeout(&self) -> Duration {
        self.state.protocol_timeout
    }

    /// The bus heartbeat interval; the default deferred-computation
    /// timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        self.state.bus.heartbeat_push_timeout()
    }

    /// Contact list advertised to peers
    pub fn contact(&self) -> &[String] {
        &self.state.contact
    }

    /// The shared back-end cache, when one is configured
    pub fn shared(&self) -> Option<&Arc<dyn CacheClient<CacheKey, V>>> {
        self.state.shared.as_ref()
    }

    /// Codec for peer-to-peer value transfer, when configured
    pub fn value_codec(&self) -> Option<&SecureCodec> {
        self.state.value_codec.as_ref()
    }

    /// Is a computation for `key` in flight, as far as this node
    /// knows? Authoritative on the broker, own-computations-only on a
    /// listener.
    pub fn has_pending(&self, key: &CacheKey) -> bool {
        self.state.pending.contains_key(key) || self.state.group_pending.contains_key(key)
    }

    /// This node's own pending txid for `key`, if any (diagnostics)
    pub fn pending_txid(&self, key: &CacheKey) -> Option<u32> {
        self.state.pending.get(key).map(|e| *e.value())
    }

    /// The broker-side holder of `key`, if any (diagnostics;
    /// meaningful only while this node is broker)
    pub fn group_pending_entry(&self, key: &CacheKey) -> Option<(u32, Vec<String>)> {
        self.state.group_pending.get(key).map(|e| e.value().clone())
    }
}

impl<V> Drop for CoherenceManager<V> {
    fn drop(&mut self) {
        for token in self.tokens.lock().drain(..) {
            self.state.bus.unlisten(&token);
        }
        for token in self.state.broker_subs.lock().drain(..) {
            self.state.bus.unlisten(&token);
        }
    }
}
