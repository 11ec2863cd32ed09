//! Cache State Module
//!
//! Defines the full decoded content of the shared cache file and the codec
//! that moves it to and from bytes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

// == Cache State ==
/// The unit of persisted truth: everything the shared file holds.
///
/// Mutating operations replace the whole state atomically under the file
/// lock; there is no partial-field update at the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    /// Key-value entries
    #[serde(default)]
    pub entries: HashMap<String, String>,
    /// Absolute expiry timestamps (Unix milliseconds, UTC) keyed by entry
    /// key. A key absent from this map never expires.
    #[serde(default)]
    pub expirations: HashMap<String, i64>,
}

impl CacheState {
    // == Constructor ==
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    // == Insert ==
    /// Inserts or overwrites an entry, recording an expiry when given.
    ///
    /// Overwriting a key without an expiry clears any previous expiry, so
    /// the expirations map never outlives its entry.
    pub fn insert(&mut self, key: String, value: String, expires_at: Option<i64>) {
        match expires_at {
            Some(at) => {
                self.expirations.insert(key.clone(), at);
            }
            None => {
                self.expirations.remove(&key);
            }
        }
        self.entries.insert(key, value);
    }

    // == Remove ==
    /// Removes an entry and its expiry, if present.
    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.expirations.remove(key);
    }

    // == Length ==
    /// Returns the number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// == Codec ==
/// Encodes a state to UTF-8 JSON bytes.
///
/// Encoding never truncates; the caller compares the returned length
/// against the configured `max_bytes` budget.
pub fn encode(state: &CacheState, pretty: bool) -> Result<Vec<u8>> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(state)
    } else {
        serde_json::to_vec(state)
    };
    bytes.map_err(CacheError::CorruptState)
}

/// Decodes UTF-8 JSON bytes back to a state.
///
/// Zero bytes yields an empty state rather than an error; that is what a
/// freshly bootstrapped, still-empty file looks like. Anything else that
/// fails to parse is corrupt and is never auto-repaired.
pub fn decode(bytes: &[u8]) -> Result<CacheState> {
    if bytes.is_empty() {
        return Ok(CacheState::new());
    }
    serde_json::from_slice(bytes).map_err(CacheError::CorruptState)
}
