//! Expiration Policy Module
//!
//! Absolute-expiry support for cache entries: deciding whether an entry is
//! live, purging dead entries from a loaded state, and turning caller-facing
//! expiry requests into stored timestamps.
//!
//! Expiry is lazy: expired-but-unpurged entries stay in the persisted file
//! until the next write-triggered purge. Reads never serve an expired value,
//! so the staleness window is invisible to callers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::cache::CacheState;
use crate::error::{CacheError, Result};

// == Expiry Request ==
/// How long a cache entry should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Expire at an absolute UTC instant.
    At(DateTime<Utc>),
    /// Expire this long after the moment the entry is written.
    After(Duration),
    /// Sliding expiration. Not supported; requesting it fails fast before
    /// any I/O happens.
    Sliding(Duration),
}

impl Expiry {
    // == Resolve ==
    /// Converts the request into an absolute Unix-millisecond timestamp.
    ///
    /// # Errors
    /// - [`CacheError::SlidingNotSupported`] for [`Expiry::Sliding`]
    /// - [`CacheError::InvalidExpiry`] if the instant is unrepresentable
    pub fn resolve(self, now: DateTime<Utc>) -> Result<i64> {
        match self {
            Expiry::At(instant) => Ok(instant.timestamp_millis()),
            Expiry::After(duration) => {
                let delta = TimeDelta::from_std(duration).map_err(|_| {
                    CacheError::InvalidExpiry(format!("duration {duration:?} is out of range"))
                })?;
                now.checked_add_signed(delta)
                    .map(|at| at.timestamp_millis())
                    .ok_or_else(|| {
                        CacheError::InvalidExpiry(format!(
                            "now plus {duration:?} overflows the timestamp range"
                        ))
                    })
            }
            Expiry::Sliding(_) => Err(CacheError::SlidingNotSupported),
        }
    }
}

// == Has Expired ==
/// Checks whether a recorded expiry has passed.
///
/// Boundary condition: an entry is expired once the current time reaches
/// the expiry instant, so `expiry == now` is already dead.
pub fn has_expired(expires_at_ms: i64, now: DateTime<Utc>) -> bool {
    expires_at_ms <= now.timestamp_millis()
}

// == Purge Expired ==
/// Removes every entry whose recorded expiry has passed, from both the
/// entries and the expirations maps, in place.
///
/// Returns the number of entries removed.
pub fn purge_expired(state: &mut CacheState, now: DateTime<Utc>) -> usize {
    let dead_keys: Vec<String> = state
        .expirations
        .iter()
        .filter(|(_, &at)| has_expired(at, now))
        .map(|(key, _)| key.clone())
        .collect();

    for key in &dead_keys {
        state.entries.remove(key);
        state.expirations.remove(key);
    }
    dead_keys.len()
}

// == Lookup Live ==
/// Returns the value for `key` only if it is present and not expired.
///
/// Does not mutate the state; purging is a separate, write-side step.
pub fn lookup_live<'a>(state: &'a CacheState, key: &str, now: DateTime<Utc>) -> Option<&'a str> {
    let value = state.entries.get(key)?;
    if let Some(&expires_at) = state.expirations.get(key) {
        if has_expired(expires_at, now) {
            return None;
        }
    }
    Some(value)
}

// == Live Entries ==
/// Returns a copy of every non-expired entry.
pub fn live_entries(state: &CacheState, now: DateTime<Utc>) -> HashMap<String, String> {
    state
        .entries
        .iter()
        .filter(|(key, _)| match state.expirations.get(*key) {
            Some(&at) => !has_expired(at, now),
            None => true,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
