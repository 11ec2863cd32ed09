//! Local Mirror Module
//!
//! Each process keeps one in-memory mirror of the last-loaded cache state so
//! reads can be served without taking the file lock on every call. A
//! filesystem watcher on the cache file's last-write time marks the mirror
//! stale; the next read then reloads from the file. Writes push their own
//! result straight into the mirror, pre-empting the watcher.
//!
//! The watcher and the mirror are inherently process-scoped resources, so
//! they live in a single [`CacheRuntime`] obtained through a process-global
//! registry keyed by the resolved cache file path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, trace, warn};

use crate::cache::state::CacheState;
use crate::cache::{retry, transaction};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Local Mirror ==
/// Process-wide cached copy of the last-loaded [`CacheState`] plus a
/// staleness flag.
///
/// Starts out stale so the first read is forced to load real content.
#[derive(Debug)]
pub(crate) struct LocalMirror {
    state: RwLock<CacheState>,
    stale: AtomicBool,
}

impl LocalMirror {
    // == Constructor ==
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(CacheState::new()),
            stale: AtomicBool::new(true),
        }
    }

    // == Staleness ==
    /// True when the mirror must be reloaded from the file before serving
    /// the next read.
    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Marks the mirror stale. Called by the watcher when the file's
    /// last-write time changes, and at process startup.
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    // == Install ==
    /// Replaces the cached state wholesale and marks the mirror fresh.
    ///
    /// Called with the result of a successful load or of this process's own
    /// write transaction.
    pub(crate) fn install(&self, new_state: CacheState) {
        *self.state.write().expect("mirror lock poisoned") = new_state;
        self.stale.store(false, Ordering::Release);
    }

    // == Read ==
    /// Serves a read against the cached state.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        f(&self.state.read().expect("mirror lock poisoned"))
    }
}

// == File Watcher ==
/// Keeps the notify watcher alive for the lifetime of the runtime.
struct FileWatcher {
    _watcher: RecommendedWatcher,
}

/// Watches the cache file's directory and marks the mirror stale whenever
/// the cache file itself changes.
///
/// The watcher also sees this process's own writes land on disk, which can
/// re-stale the mirror right after a write installed its result; the next
/// read then performs one redundant reload. That is accepted inefficiency,
/// never an error.
fn watch_cache_file(config: &CacheConfig, mirror: Arc<LocalMirror>) -> Result<FileWatcher> {
    let file_name = config.cache_file_name();
    let mut watcher = notify::recommended_watcher(move |outcome: notify::Result<Event>| {
        match outcome {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
                ) {
                    return;
                }
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| *n == *file_name.as_str()).unwrap_or(false));
                if ours {
                    trace!("Cache file changed on disk, marking mirror stale");
                    mirror.mark_stale();
                }
            }
            Err(error) => {
                // A dropped event could hide a remote write, so assume the
                // worst and force a reload.
                warn!(%error, "Cache file watcher error, marking mirror stale");
                mirror.mark_stale();
            }
        }
    })?;
    watcher.watch(config.directory(), RecursiveMode::NonRecursive)?;
    Ok(FileWatcher { _watcher: watcher })
}

// == Cache Runtime ==
/// The process-wide cache context: configuration, resolved file path, the
/// local mirror and the change watcher.
///
/// Every handle pointing at the same file shares one runtime. The registry
/// rejects a second runtime for a *different* path, because the mirror and
/// watcher are process singletons, not per-handle state; set
/// `allow_path_change` to override this for serially-run tests.
pub struct CacheRuntime {
    config: CacheConfig,
    file_path: PathBuf,
    mirror: Arc<LocalMirror>,
    _watcher: FileWatcher,
}

/// Registry slot holding the one active runtime for this process.
static ACTIVE_RUNTIME: OnceLock<Mutex<Option<Arc<CacheRuntime>>>> = OnceLock::new();

fn registry() -> &'static Mutex<Option<Arc<CacheRuntime>>> {
    ACTIVE_RUNTIME.get_or_init(|| Mutex::new(None))
}

impl CacheRuntime {
    // == Init ==
    /// Initializes (or joins) the process-wide cache runtime.
    ///
    /// Validates the configuration, bootstraps the cache file (racing safely
    /// against other processes doing the same), starts the change watcher
    /// and registers the runtime. Calling `init` again with the same
    /// resolved path returns the existing runtime; a different path is a
    /// configuration error unless `allow_path_change` is set, in which case
    /// the previous runtime is replaced.
    pub fn init(config: CacheConfig) -> Result<Arc<CacheRuntime>> {
        config.validate()?;
        let file_path = resolve_file_path(&config);

        let mut slot = registry().lock().expect("runtime registry poisoned");
        if let Some(existing) = slot.as_ref() {
            if existing.file_path == file_path {
                return Ok(existing.clone());
            }
            if !config.allow_path_change {
                return Err(CacheError::Config(format!(
                    "The cache runtime is already bound to `{}`; a second file path is not \
                     allowed unless `allow_path_change` is set",
                    existing.file_path.display()
                )));
            }
            info!(
                old = %existing.file_path.display(),
                new = %file_path.display(),
                "Replacing the process cache runtime"
            );
        }

        // First process wins; losers back off and observe the winner's file
        retry::with_retry(&config, || transaction::ensure_cache_file(&config))?;

        // The mirror starts stale so the first operation loads real content
        let mirror = Arc::new(LocalMirror::new());
        let watcher = watch_cache_file(&config, mirror.clone())?;

        let runtime = Arc::new(CacheRuntime {
            config,
            file_path,
            mirror,
            _watcher: watcher,
        });
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    // == Teardown ==
    /// Releases this runtime's registry slot so a later `init` can bind a
    /// fresh one. Existing handles keep working against the old runtime.
    pub fn teardown(self: &Arc<Self>) {
        let mut slot = registry().lock().expect("runtime registry poisoned");
        if let Some(active) = slot.as_ref() {
            if Arc::ptr_eq(active, self) {
                *slot = None;
            }
        }
    }

    // == Accessors ==
    /// The configuration this runtime was initialized with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The resolved path of the shared cache file.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub(crate) fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }
}

// == Path Resolution ==
/// Canonicalizes the directory part so two spellings of the same location
/// land on the same registry key. The file itself may not exist yet.
fn resolve_file_path(config: &CacheConfig) -> PathBuf {
    let directory = std::fs::canonicalize(config.directory())
        .unwrap_or_else(|_| config.directory().to_path_buf());
    directory.join(config.cache_file_name())
}
