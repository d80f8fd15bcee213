//! Cluster cache coherence
//!
//! The protocol layer that turns a set of independent caches into a
//! cooperating cluster:
//!
//! - [`manager::CoherenceManager`] speaks the wire protocol: it owns
//!   the pending-computation tables, answers queries when this node
//!   is the broker, acquires distributed computation locks, announces
//!   completions, and broadcasts deletions.
//! - [`defer::CoherentDefer`] binds one to-be-computed value to a key
//!   and decides at compute time whether to run, skip, or wait.
//! - [`client::CoherentWrapperClient`] wraps any cache client and
//!   routes its mutations through the manager so peers hear about
//!   them, adding `put_coherently`, the cluster-wide single-flight
//!   put.
//!
//! Consistency is best-effort eventual: a lost message costs a
//! duplicated computation or a naturally-expiring stale entry, never
//! lost data.

pub mod client;
pub mod defer;
pub mod manager;

pub use client::{CoherentWrapperClient, DeferSubmit};
pub use defer::CoherentDefer;
pub use manager::{
    CoherenceConfig, CoherenceManager, CoherentKey, DeletionWaiter, QueryOutcome,
};
