//! Cache Store Module
//!
//! The public handle over the file-backed cache engine. Reads are served
//! from the process-local mirror, reloading it under the retry wrapper when
//! it is stale; every mutation runs a locked file transaction and pushes its
//! result straight back into the mirror.
//!
//! Sync and async variants share one implementation of each operation: the
//! async side pushes the blocking critical section onto tokio's blocking
//! pool and suspends during retry delays, so the file lock is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task;

use crate::cache::expiry::{self, Expiry};
use crate::cache::mirror::CacheRuntime;
use crate::cache::state::CacheState;
use crate::cache::{retry, transaction};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == File Store Cache ==
/// A handle on the shared cache file.
///
/// Handles are cheap to clone; every handle for the same file path shares
/// the one process-wide [`CacheRuntime`] (mirror + watcher).
#[derive(Clone)]
pub struct FileStoreCache {
    runtime: Arc<CacheRuntime>,
}

impl FileStoreCache {
    // == Constructors ==
    /// Opens the cache described by `config`, initializing (or joining) the
    /// process-wide runtime.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Ok(Self {
            runtime: CacheRuntime::init(config)?,
        })
    }

    /// Wraps an already-initialized runtime.
    pub fn with_runtime(runtime: Arc<CacheRuntime>) -> Self {
        Self { runtime }
    }

    /// The runtime shared by every handle on this file.
    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    fn config(&self) -> &CacheConfig {
        self.runtime.config()
    }

    // == Get ==
    /// Retrieves a value by key, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.reload_if_stale()?;
        Ok(self.lookup(key))
    }

    /// Async variant of [`FileStoreCache::get`].
    pub async fn get_async(&self, key: &str) -> Result<Option<String>> {
        self.reload_if_stale_async().await?;
        Ok(self.lookup(key))
    }

    // == Set ==
    /// Stores a key-value pair, optionally with an absolute expiry.
    ///
    /// Arguments are validated before any I/O: an empty key and a sliding
    /// expiry both fail fast.
    pub fn set(&self, key: &str, value: &str, expiry: Option<Expiry>) -> Result<()> {
        let mutation = set_one_mutation(key, value, expiry)?;
        self.apply(false, mutation)
    }

    /// Async variant of [`FileStoreCache::set`].
    pub async fn set_async(&self, key: &str, value: &str, expiry: Option<Expiry>) -> Result<()> {
        let mutation = set_one_mutation(key, value, expiry)?;
        self.apply_async(false, mutation).await
    }

    // == Set Many ==
    /// Stores a batch of key-value pairs in a single transaction, all
    /// sharing the same optional expiry.
    pub fn set_many(&self, entries: &[(String, String)], expiry: Option<Expiry>) -> Result<()> {
        let mutation = set_many_mutation(entries, expiry)?;
        self.apply(false, mutation)
    }

    /// Async variant of [`FileStoreCache::set_many`].
    pub async fn set_many_async(
        &self,
        entries: &[(String, String)],
        expiry: Option<Expiry>,
    ) -> Result<()> {
        let mutation = set_many_mutation(entries, expiry)?;
        self.apply_async(false, mutation).await
    }

    // == Remove ==
    /// Removes an entry and its expiry, if present. Removing an absent key
    /// is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mutation = remove_mutation(key)?;
        self.apply(false, mutation)
    }

    /// Async variant of [`FileStoreCache::remove`].
    pub async fn remove_async(&self, key: &str) -> Result<()> {
        let mutation = remove_mutation(key)?;
        self.apply_async(false, mutation).await
    }

    // == Clear All ==
    /// Replaces the whole cache content: everything stored is discarded and
    /// the optional replacement entries are written in its place.
    pub fn clear_all(&self, replacement: Option<&[(String, String)]>) -> Result<()> {
        let mutation = clear_all_mutation(replacement)?;
        self.apply(true, mutation)
    }

    /// Async variant of [`FileStoreCache::clear_all`].
    pub async fn clear_all_async(&self, replacement: Option<&[(String, String)]>) -> Result<()> {
        let mutation = clear_all_mutation(replacement)?;
        self.apply_async(true, mutation).await
    }

    // == Get All Key Values ==
    /// Returns every live (non-expired) entry.
    pub fn get_all_key_values(&self) -> Result<HashMap<String, String>> {
        self.reload_if_stale()?;
        Ok(self
            .runtime
            .mirror()
            .read(|state| expiry::live_entries(state, Utc::now())))
    }

    /// Async variant of [`FileStoreCache::get_all_key_values`].
    pub async fn get_all_key_values_async(&self) -> Result<HashMap<String, String>> {
        self.reload_if_stale_async().await?;
        Ok(self
            .runtime
            .mirror()
            .read(|state| expiry::live_entries(state, Utc::now())))
    }

    // == Refresh ==
    /// Forces the mirror to catch up with the file if it is stale, without
    /// reading any key.
    pub fn refresh(&self) -> Result<()> {
        self.reload_if_stale()
    }

    /// Async variant of [`FileStoreCache::refresh`].
    pub async fn refresh_async(&self) -> Result<()> {
        self.reload_if_stale_async().await
    }

    //-----------------------------------------------------------------
    // private plumbing

    fn lookup(&self, key: &str) -> Option<String> {
        self.runtime
            .mirror()
            .read(|state| expiry::lookup_live(state, key, Utc::now()).map(str::to_string))
    }

    // == Reload ==
    /// Read-through: when the mirror is stale, load the file (under the
    /// retry wrapper, since the load takes the exclusive lock) and install
    /// the result.
    fn reload_if_stale(&self) -> Result<()> {
        if !self.runtime.mirror().is_stale() {
            return Ok(());
        }
        let state = retry::with_retry(self.config(), || transaction::load(self.config()))?;
        self.runtime.mirror().install(state);
        Ok(())
    }

    async fn reload_if_stale_async(&self) -> Result<()> {
        if !self.runtime.mirror().is_stale() {
            return Ok(());
        }
        let state = retry::with_retry_async(self.config(), || {
            let runtime = self.runtime.clone();
            async move { run_blocking(move || transaction::load(runtime.config())).await }
        })
        .await?;
        self.runtime.mirror().install(state);
        Ok(())
    }

    // == Apply ==
    /// Runs a mutation through the locked file transaction and keeps the
    /// mirror convergent: a persisted state is installed directly
    /// (pre-empting the watcher), a silently dropped oversize write marks
    /// the mirror stale so the next read re-syncs with the untouched file.
    fn apply(&self, reset: bool, mutation: Mutation) -> Result<()> {
        let outcome = retry::with_retry(self.config(), || {
            transaction::transact(self.config(), reset, |state| mutation(state))
        })?;
        self.finish_write(outcome);
        Ok(())
    }

    async fn apply_async(&self, reset: bool, mutation: Mutation) -> Result<()> {
        let outcome = retry::with_retry_async(self.config(), || {
            let runtime = self.runtime.clone();
            let mutation = mutation.clone();
            async move {
                run_blocking(move || {
                    transaction::transact(runtime.config(), reset, |state| mutation(state))
                })
                .await
            }
        })
        .await?;
        self.finish_write(outcome);
        Ok(())
    }

    fn finish_write(&self, outcome: Option<CacheState>) {
        match outcome {
            Some(state) => self.runtime.mirror().install(state),
            None => self.runtime.mirror().mark_stale(),
        }
    }
}

// == Mutations ==
/// A state mutation, shareable across retry attempts and runnable on the
/// blocking pool.
type Mutation = Arc<dyn Fn(&mut CacheState) + Send + Sync>;

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::EmptyKey);
    }
    Ok(())
}

/// Resolves the optional expiry request now, before any I/O, so a sliding
/// request fails fast.
fn resolve_expiry(expiry: Option<Expiry>) -> Result<Option<i64>> {
    expiry.map(|e| e.resolve(Utc::now())).transpose()
}

fn set_one_mutation(key: &str, value: &str, expiry: Option<Expiry>) -> Result<Mutation> {
    validate_key(key)?;
    let expires_at = resolve_expiry(expiry)?;
    let key = key.to_string();
    let value = value.to_string();
    Ok(Arc::new(move |state: &mut CacheState| {
        state.insert(key.clone(), value.clone(), expires_at)
    }))
}

fn set_many_mutation(entries: &[(String, String)], expiry: Option<Expiry>) -> Result<Mutation> {
    for (key, _) in entries {
        validate_key(key)?;
    }
    let expires_at = resolve_expiry(expiry)?;
    let entries = entries.to_vec();
    Ok(Arc::new(move |state: &mut CacheState| {
        for (key, value) in &entries {
            state.insert(key.clone(), value.clone(), expires_at);
        }
    }))
}

fn remove_mutation(key: &str) -> Result<Mutation> {
    validate_key(key)?;
    let key = key.to_string();
    Ok(Arc::new(move |state: &mut CacheState| state.remove(&key)))
}

fn clear_all_mutation(replacement: Option<&[(String, String)]>) -> Result<Mutation> {
    let replacement = replacement.map(<[(String, String)]>::to_vec);
    if let Some(entries) = &replacement {
        for (key, _) in entries {
            validate_key(key)?;
        }
    }
    Ok(Arc::new(move |state: &mut CacheState| {
        if let Some(entries) = &replacement {
            for (key, value) in entries {
                state.insert(key.clone(), value.clone(), None);
            }
        }
    }))
}

// == Blocking Bridge ==
/// Runs blocking file I/O on tokio's blocking pool, flattening the join
/// error into the cache error taxonomy.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Internal(format!("Blocking cache task failed: {e}")))?
}
