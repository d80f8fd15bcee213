//! # LATTICE - Distributed Cache Coordination
//!
//! A distributed, multi-tier cache coordination library. Many
//! processes, each owning a private in-process cache and optionally
//! sharing one logical back-end cache, cooperate through a pub/sub
//! bus so that deletions propagate, at most one peer recomputes a
//! given expensive value at any time (cluster-wide single-flight),
//! and stale-while-revalidate semantics let readers return old values
//! while a fresh one is computed.
//!
//! ## Architecture
//!
//! - `store`: TTL-aware bounded store, cache registry and janitor
//! - `client`: the cache-client contract, sync adapters, namespace
//!   wrappers, deferred values and the write-behind client
//! - `bus`: the pub/sub contract the protocol consumes, plus an
//!   in-process implementation
//! - `coherence`: the protocol engine, coherent deferred computation,
//!   and the coherent client wrapper
//! - `codec`: HMAC-framed codec for peer-to-peer value transfer
//! - `key`: composite bus-travelling cache keys and stable hashing
//! - `error`: the fixed error taxonomy
//!
//! ## Consistency model
//!
//! Best-effort eventual. The protocol optimizes away duplicated work
//! and propagates invalidations, but a lost message never costs more
//! than a duplicated computation or a stale entry aging out on its
//! own. There is no exactly-once delivery, no durability, and no
//! fairness between computing peers.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Storage: TTL store, registry, janitor
pub mod store;

// Cache client contract and wrappers
pub mod client;

// Pub/sub bus contract + in-process implementation
pub mod bus;

// Cluster coherence protocol
pub mod coherence;

// Integrity-checked value codec
pub mod codec;

// Composite keys and stable hashing
pub mod key;

// Error taxonomy
pub mod error;

// Re-export commonly used types
pub use bus::{BusEvent, CoherenceBus, Dispatch, MemoryBus, MemoryBusHub, PayloadEncoding};
pub use client::{
    inproc_cache_client, AsyncWriteClient, CacheClient, ComputeOutcome, Defer, Deferred,
    InprocCacheClient, NamespaceMirrorWrapper, NamespaceWrapper, ReadWriteSyncAdapter,
    SerializeSyncAdapter,
};
pub use codec::{ChecksumAlgorithm, SecureCodec};
pub use coherence::{
    CoherenceConfig, CoherenceManager, CoherentDefer, CoherentKey, CoherentWrapperClient,
    QueryOutcome,
};
pub use error::{CacheError, CacheResult};
pub use key::{stable_hash, CacheKey};
pub use store::{cache_clear, cache_purge, cache_stats, CacheJanitor, TtlStore};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
