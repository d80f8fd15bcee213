//! Error taxonomy for the cache coordination library
//!
//! A single fixed error enum covers every layer. User-initiated
//! operations surface `Miss` and `Integrity` only; protocol
//! operations swallow `Connection` internally and degrade to local
//! semantics, so those variants are mostly seen by bus implementors.

use thiserror::Error;

/// Library-wide error type
#[derive(Error, Debug)]
pub enum CacheError {
    /// Lookup on an absent (or stale, for value-only reads) key
    #[error("cache miss")]
    Miss,

    /// MAC mismatch while decoding an integrity-checked frame
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The pub/sub bus refused or dropped the connection
    #[error("bus connection error: {0}")]
    Connection(String),

    /// Serialization or framing failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid construction-time configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// True for the miss variant; lets callers treat a miss as an
    /// answer without matching the whole enum.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }
}
