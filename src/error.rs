//! Error types for the file store cache
//!
//! Provides unified error handling using thiserror.

use std::io;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the file store cache.
///
/// The retry wrapper dispatches on the [`CacheError::Busy`] variant: it is
/// the only transient error in the taxonomy, everything else propagates to
/// the caller unmodified.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache file is exclusively locked by another process.
    ///
    /// Transient: absorbed by the retry wrapper and only surfaced as
    /// [`CacheError::Unavailable`] once the retry budget is spent.
    #[error("Cache file is locked by another process")]
    Busy(#[source] io::Error),

    /// The retry budget was exhausted while the file stayed locked.
    #[error("Cache file stayed locked for {waited_ms} ms, which is longer than the settings allow")]
    Unavailable {
        /// Total milliseconds spent waiting between attempts
        waited_ms: u64,
        /// The last contention error observed
        #[source]
        source: io::Error,
    },

    /// The existing cache file holds at least `max_bytes` bytes.
    #[error("Cache file holds {max_bytes} bytes or more, so the `max_bytes` setting MUST be raised")]
    StateTooLarge { max_bytes: usize },

    /// The encoded state would not fit in the configured byte budget.
    ///
    /// Only returned under the `Error` oversize-write policy; the default
    /// policy drops the write silently instead.
    #[error("Encoded cache state is {actual} bytes but `max_bytes` allows only {max_bytes}")]
    WriteTooLarge { actual: usize, max_bytes: usize },

    /// The cache file contents are not valid encoded state.
    #[error("Cache file is not valid cache state: {0}")]
    CorruptState(#[source] serde_json::Error),

    /// A configuration field is unset or out of range.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Sliding expiration was requested, which this cache does not support.
    #[error("Sliding expiration is not supported")]
    SlidingNotSupported,

    /// The requested expiry cannot be represented as a timestamp.
    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    /// A mutating call was made with an empty key.
    #[error("Cache key must not be empty")]
    EmptyKey,

    /// The change watcher could not be installed.
    #[error("Failed to watch the cache file: {0}")]
    Watch(#[from] notify::Error),

    /// Any other I/O failure on the cache file.
    #[error("I/O error on the cache file: {0}")]
    Io(#[from] io::Error),

    /// Internal error (a background task failed unexpectedly).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    // == Transient Check ==
    /// Returns true if the error is expected to resolve itself shortly,
    /// making the operation worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Busy(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the file store cache.
pub type Result<T> = std::result::Result<T, CacheError>;
