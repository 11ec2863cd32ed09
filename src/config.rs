//! Configuration Module
//!
//! Holds the immutable-after-startup settings for the shared cache file:
//! where it lives, how big it may grow, and how contention retries behave.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

// == Oversize Write Policy ==
/// What happens when an encoded state would exceed the `max_bytes` budget.
///
/// Either way the file on disk is left untouched; the policy only decides
/// what the caller observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OversizeWritePolicy {
    /// Abort the write and report success; the attempted mutation is lost.
    #[default]
    DropSilently,
    /// Abort the write and return a size-exceeded error.
    Error,
}

// == Cache Config ==
/// Settings for one shared cache file.
///
/// Built once at startup and handed to the cache runtime; the engine never
/// mutates it afterwards.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory containing the cache file
    pub directory: PathBuf,
    /// First part of the cache file name (no extension)
    pub first_part_of_file_name: String,
    /// Second part of the cache file name, typically the deployment
    /// environment, so different environments sharing a disk don't collide
    pub second_part_of_file_name: String,
    /// Maximum bytes the encoded cache file may hold
    pub max_bytes: usize,
    /// Number of retries after a contention failure
    pub max_retries: u32,
    /// Delay between contention retries (keep it small)
    pub retry_delay: Duration,
    /// Pretty-print the JSON state (easier to inspect, slightly larger)
    pub pretty_json: bool,
    /// Behavior when an encoded state would exceed `max_bytes`
    pub oversize_write: OversizeWritePolicy,
    /// Allow re-initializing the process runtime with a different file path.
    /// Only useful for serially-run tests; the mirror and watcher are
    /// process-wide, so two live paths cannot coexist.
    pub allow_path_change: bool,
}

// == Default Values ==
pub const DEFAULT_FIRST_PART: &str = "FileStoreCacheFile";
pub const DEFAULT_SECOND_PART: &str = "Local";
pub const DEFAULT_MAX_BYTES: usize = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 20;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

impl CacheConfig {
    // == Constructor ==
    /// Creates a configuration for a cache file in the given directory,
    /// with every other setting at its default.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            first_part_of_file_name: DEFAULT_FIRST_PART.to_string(),
            second_part_of_file_name: DEFAULT_SECOND_PART.to_string(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            pretty_json: true,
            oversize_write: OversizeWritePolicy::default(),
            allow_path_change: false,
        }
    }

    // == From Environment ==
    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `FILESTORE_CACHE_DIR` - cache file directory (default: OS temp dir)
    /// - `FILESTORE_CACHE_NAME` - first part of the file name
    /// - `FILESTORE_CACHE_ENV` - second part of the file name
    /// - `FILESTORE_CACHE_MAX_BYTES` - byte budget (default: 10000)
    /// - `FILESTORE_CACHE_RETRIES` - retry count (default: 20)
    /// - `FILESTORE_CACHE_RETRY_DELAY_MS` - retry delay (default: 10)
    pub fn from_env() -> Self {
        let directory = env::var("FILESTORE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());

        let mut config = Self::new(directory);
        if let Ok(name) = env::var("FILESTORE_CACHE_NAME") {
            config.first_part_of_file_name = name;
        }
        if let Ok(suffix) = env::var("FILESTORE_CACHE_ENV") {
            config.second_part_of_file_name = suffix;
        }
        if let Some(max_bytes) = parse_env("FILESTORE_CACHE_MAX_BYTES") {
            config.max_bytes = max_bytes;
        }
        if let Some(retries) = parse_env("FILESTORE_CACHE_RETRIES") {
            config.max_retries = retries;
        }
        if let Some(delay_ms) = parse_env::<u64>("FILESTORE_CACHE_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(delay_ms);
        }
        config
    }

    // == Validation ==
    /// Checks the configuration before any file I/O happens.
    ///
    /// Fails fast with a message naming the offending setting; configuration
    /// errors are never retried.
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(CacheError::Config(
                "`directory` must be set to the directory holding the cache file".to_string(),
            ));
        }
        if self.first_part_of_file_name.is_empty() {
            return Err(CacheError::Config(
                "`first_part_of_file_name` must not be empty".to_string(),
            ));
        }
        if self.second_part_of_file_name.is_empty() {
            return Err(CacheError::Config(
                "`second_part_of_file_name` must not be empty".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(CacheError::Config(
                "`max_bytes` must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    // == File Name ==
    /// Returns the cache file name: `{first}.{second}.json`.
    pub fn cache_file_name(&self) -> String {
        format!(
            "{}.{}.json",
            self.first_part_of_file_name, self.second_part_of_file_name
        )
    }

    // == File Path ==
    /// Returns the full path to the cache file.
    pub fn cache_file_path(&self) -> PathBuf {
        self.directory.join(self.cache_file_name())
    }

    // == Directory ==
    /// Returns the directory the watcher observes.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

// == Helpers ==
fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::new("/tmp/cache-test");
        assert_eq!(config.max_bytes, 10_000);
        assert_eq!(config.max_retries, 20);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert!(config.pretty_json);
        assert_eq!(config.oversize_write, OversizeWritePolicy::DropSilently);
        assert!(!config.allow_path_change);
    }

    #[test]
    fn test_cache_file_name_format() {
        let mut config = CacheConfig::new("/tmp/cache-test");
        config.first_part_of_file_name = "SharedCache".to_string();
        config.second_part_of_file_name = "Staging".to_string();

        assert_eq!(config.cache_file_name(), "SharedCache.Staging.json");
        assert_eq!(
            config.cache_file_path(),
            PathBuf::from("/tmp/cache-test/SharedCache.Staging.json")
        );
    }

    #[test]
    fn test_validate_ok_with_defaults() {
        let config = CacheConfig::new("/tmp/cache-test");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_directory() {
        let config = CacheConfig::new("");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("`directory`"));
    }

    #[test]
    fn test_validate_rejects_empty_name_parts() {
        let mut config = CacheConfig::new("/tmp/cache-test");
        config.first_part_of_file_name = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("`first_part_of_file_name`"));

        let mut config = CacheConfig::new("/tmp/cache-test");
        config.second_part_of_file_name = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("`second_part_of_file_name`"));
    }

    #[test]
    fn test_validate_rejects_zero_byte_budget() {
        let mut config = CacheConfig::new("/tmp/cache-test");
        config.max_bytes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("`max_bytes`"));
    }
}
