//! File Store Cache - a file-backed key/value cache shared across processes
//!
//! A lightweight substitute for a networked distributed cache when every
//! process shares one machine: the cache lives in a single JSON file, an
//! OS-level exclusive lock serializes writers across processes, and each
//! process serves reads from an in-memory mirror kept convergent by a
//! filesystem watcher on the file's last-write time.

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheRuntime, CacheState, Expiry, FileStoreCache};
pub use config::{CacheConfig, OversizeWritePolicy};
pub use error::{CacheError, Result};
