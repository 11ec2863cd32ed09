//! Locked File Transaction Module
//!
//! All mutation paths funnel through [`transact`]: open the shared file with
//! an exclusive lock, read and decode the current state, apply the caller's
//! mutation, re-encode and write back, all inside one critical section. The
//! OS-level lock is the mutual-exclusion primitive standing in for a lock
//! manager, so concurrent writers across processes are strictly serialized.
//!
//! Also hosts [`load`] (the read path used by stale-mirror reloads) and
//! [`ensure_cache_file`] (the race-safe one-time bootstrap).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::cache::expiry;
use crate::cache::state::{self, CacheState};
use crate::config::{CacheConfig, OversizeWritePolicy};
use crate::error::{CacheError, Result};

// == Locked Cache File ==
/// An open cache file holding the exclusive, non-shared lock.
///
/// While a `LockedCacheFile` exists, no other process can enter the critical
/// section; they observe a transient busy condition instead, which the retry
/// wrapper absorbs. The lock is released on every exit path, including
/// panics, through `Drop`.
pub(crate) struct LockedCacheFile {
    file: File,
}

impl LockedCacheFile {
    // == Open ==
    /// Opens the cache file and takes the exclusive lock, non-blocking.
    ///
    /// A lock held elsewhere surfaces as [`CacheError::Busy`].
    pub(crate) fn open(path: &Path, write: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .map_err(|e| match e.kind() {
                // Sharing violations surface as permission errors on some
                // platforms; treat them like lock contention.
                io::ErrorKind::PermissionDenied => CacheError::Busy(e),
                _ => CacheError::Io(e),
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CacheError::Busy(e)),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    // == Capped Read ==
    /// Reads the whole file, but never more than `max_bytes`.
    ///
    /// A file that fills the read budget means the budget is too small for
    /// the stored state, which is a configuration error the caller must fix
    /// by raising `max_bytes`.
    fn read_capped(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let read = (&self.file).take(max_bytes as u64).read_to_end(&mut buffer)?;
        if read >= max_bytes {
            return Err(CacheError::StateTooLarge { max_bytes });
        }
        Ok(buffer)
    }

    // == Replacing Write ==
    /// Truncates the file to zero and writes the new bytes from offset zero.
    fn write_replacing(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for LockedCacheFile {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// == Transact ==
/// Runs one read-decode-mutate-encode-write critical section.
///
/// When `reset` is set the stored state is discarded and the mutation starts
/// from empty (the file is not read first). Expired entries are purged from
/// the loaded state before the mutation runs, so every write also compacts.
///
/// Returns `Some(state)` with the newly persisted state for the caller to
/// push into the local mirror, or `None` when an oversized encoding was
/// dropped under [`OversizeWritePolicy::DropSilently`]; in that case the
/// file is untouched and the caller should mark the mirror stale instead.
pub(crate) fn transact<M>(config: &CacheConfig, reset: bool, mutate: M) -> Result<Option<CacheState>>
where
    M: FnOnce(&mut CacheState),
{
    let path = config.cache_file_path();
    let mut locked = LockedCacheFile::open(&path, true)?;

    let mut cache_state = if reset {
        CacheState::new()
    } else {
        let bytes = locked.read_capped(config.max_bytes)?;
        let mut decoded = state::decode(&bytes)?;
        let purged = expiry::purge_expired(&mut decoded, Utc::now());
        if purged > 0 {
            debug!(purged, "Purged expired entries during write");
        }
        decoded
    };

    mutate(&mut cache_state);

    let bytes = state::encode(&cache_state, config.pretty_json)?;
    if bytes.len() >= config.max_bytes {
        // Never persist a state the read budget could not load back. The
        // stored file stays exactly as it was; only the attempted mutation
        // is lost.
        return match config.oversize_write {
            OversizeWritePolicy::DropSilently => {
                warn!(
                    attempted = bytes.len(),
                    max_bytes = config.max_bytes,
                    "Encoded cache state exceeds `max_bytes`; dropping the write"
                );
                Ok(None)
            }
            OversizeWritePolicy::Error => Err(CacheError::WriteTooLarge {
                actual: bytes.len(),
                max_bytes: config.max_bytes,
            }),
        };
    }

    locked.write_replacing(&bytes)?;
    Ok(Some(cache_state))
}

// == Load ==
/// Reads and decodes the current state under the exclusive lock.
///
/// Used by stale-mirror reloads. Does not purge or write; expired entries
/// are filtered at lookup time and compacted by the next write.
pub(crate) fn load(config: &CacheConfig) -> Result<CacheState> {
    let path = config.cache_file_path();
    let mut locked = LockedCacheFile::open(&path, false)?;
    let bytes = locked.read_capped(config.max_bytes)?;
    state::decode(&bytes)
}

// == Bootstrap ==
/// Creates the cache file holding an encoded empty state, unless it already
/// exists.
///
/// Uses create-new semantics, never create-or-truncate: when two processes
/// race, exactly one creates the file and the loser simply observes the
/// winner's. Transient creation failures are reported as busy so the retry
/// wrapper can absorb them.
pub(crate) fn ensure_cache_file(config: &CacheConfig) -> Result<()> {
    let path = config.cache_file_path();
    let bytes = state::encode(&CacheState::new(), config.pretty_json)?;

    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(&bytes)?;
            file.flush()?;
            info!(path = %path.display(), "Created new cache file");
            Ok(())
        }
        // Another process won the creation race; its file is the truth.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(CacheError::Busy(e)),
        Err(e) => Err(CacheError::Io(e)),
    }
}
