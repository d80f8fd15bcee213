//! TTL-aware bounded stores
//!
//! The storage layer of the library: a capacity-bounded mapping of
//! `key -> (value, expiry)` with lazy expiration ([`ttl::TtlStore`])
//! and a process-wide registry of live caches with a background
//! janitor ([`registry`]).
//!
//! ## Clock
//!
//! Expiry is absolute wall time, not a relative duration: every store
//! operation computes "now" through [`wall_now`], which reads
//! `SystemTime` as fractional seconds since the Unix epoch. Keeping a
//! single clock source across `put`, `get_ttl`, `purge` and
//! `contains` is what makes the staleness arithmetic consistent;
//! monotonic clocks are reserved for protocol deadlines elsewhere in
//! the crate.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod registry;
pub mod ttl;

pub use registry::{cache_clear, cache_purge, cache_stats, CacheJanitor, RegisteredCache};
pub use ttl::TtlStore;

/// Current wall-clock time in fractional seconds since the Unix epoch.
///
/// The single clock source for all TTL arithmetic in this crate.
pub fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
