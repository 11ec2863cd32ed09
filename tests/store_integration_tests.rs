//! Integration Tests for the File Store Cache
//!
//! Exercises the public API end to end: scenario chains, write
//! serialization under contention, convergence after external writes, and
//! the oversize-write safety valve.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;

use filestore_cache::{
    CacheConfig, CacheError, Expiry, FileStoreCache, OversizeWritePolicy,
};

// == Helper Functions ==

fn test_config(dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::new(dir.path());
    config.retry_delay = Duration::from_millis(2);
    config.max_retries = 200;
    config.allow_path_change = true;
    config
}

fn open_cache(dir: &TempDir) -> FileStoreCache {
    FileStoreCache::open(test_config(dir)).unwrap()
}

/// Polls `check` until it returns true or the timeout passes.
fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

// == Scenario Tests ==

#[test]
#[serial]
fn test_full_scenario_chain() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = open_cache(&dir);

    cache.set("k", "v", None)?;
    assert_eq!(cache.get("k")?, Some("v".to_string()));

    cache.remove("k")?;
    assert_eq!(cache.get("k")?, None);

    cache.set_many(
        &[
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ],
        None,
    )?;
    let all = cache.get_all_key_values()?;
    let expected: HashMap<String, String> = [
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "2".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(all, expected);

    cache.clear_all(None)?;
    assert!(cache.get_all_key_values()?.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_values_survive_reload_from_file() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cache = open_cache(&dir);

    cache.set("persisted", "value", None)?;

    // A second handle joins the same runtime and reads through the file
    let other = open_cache(&dir);
    other.refresh()?;
    assert_eq!(other.get("persisted")?, Some("value".to_string()));
    Ok(())
}

// == Expiry Boundary Tests ==

#[test]
#[serial]
fn test_past_and_present_expiries_are_dead_on_arrival() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    cache
        .set("past", "x", Some(Expiry::At(chrono::Utc::now() - chrono::TimeDelta::seconds(5))))
        .unwrap();
    cache.set("now", "y", Some(Expiry::At(chrono::Utc::now()))).unwrap();

    assert_eq!(cache.get("past").unwrap(), None);
    assert_eq!(cache.get("now").unwrap(), None);
}

#[test]
#[serial]
fn test_future_expiry_lapses() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    cache
        .set("short", "lived", Some(Expiry::After(Duration::from_millis(120))))
        .unwrap();
    assert_eq!(cache.get("short").unwrap(), Some("lived".to_string()));

    assert!(eventually(Duration::from_secs(2), || {
        cache.get("short").unwrap().is_none()
    }));
}

// == Mutual Exclusion ==

#[test]
#[serial]
fn test_concurrent_writers_lose_no_updates() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let writers = 8;

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let cache = cache.clone();
            thread::spawn(move || {
                cache
                    .set(&format!("key{i}"), &format!("value{i}"), None)
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every transaction re-read the file under the lock, so no write
    // clobbered another even though they all raced
    cache.refresh().unwrap();
    let all = cache.get_all_key_values().unwrap();
    assert_eq!(all.len(), writers);
    for i in 0..writers {
        assert_eq!(all.get(&format!("key{i}")), Some(&format!("value{i}")));
    }
}

#[test]
#[serial]
fn test_concurrent_batch_and_single_writers() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    let batch_writer = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache
                .set_many(
                    &(0..10)
                        .map(|i| (format!("batch{i}"), i.to_string()))
                        .collect::<Vec<_>>(),
                    None,
                )
                .unwrap();
        })
    };
    let single_writer = {
        let cache = cache.clone();
        thread::spawn(move || {
            for i in 0..10 {
                cache.set(&format!("single{i}"), "x", None).unwrap();
            }
        })
    };
    batch_writer.join().unwrap();
    single_writer.join().unwrap();

    cache.refresh().unwrap();
    assert_eq!(cache.get_all_key_values().unwrap().len(), 20);
}

// == Stale Mirror Convergence ==

#[test]
#[serial]
fn test_external_write_becomes_visible() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    cache.set("shared", "ours", None).unwrap();

    // Another process rewrites the cache file behind our back
    std::fs::write(
        test_config(&dir).cache_file_path(),
        br#"{"entries":{"shared":"theirs"},"expirations":{}}"#,
    )
    .unwrap();

    // Once the watcher fires, reads serve the externally written value
    assert!(
        eventually(Duration::from_secs(5), || {
            cache.get("shared").ok().flatten() == Some("theirs".to_string())
        }),
        "Read should converge on the external write"
    );
}

#[test]
#[serial]
fn test_corrupt_external_write_surfaces_as_error() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    cache.set("k", "v", None).unwrap();
    std::fs::write(test_config(&dir).cache_file_path(), b"** not json **").unwrap();

    // After the watcher marks the mirror stale, the reload reports the
    // corruption instead of silently inventing an answer
    assert!(eventually(Duration::from_secs(5), || {
        matches!(cache.get("k"), Err(CacheError::CorruptState(_)))
    }));
}

// == Bootstrap ==

#[test]
#[serial]
fn test_racing_initializers_create_one_usable_file() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || FileStoreCache::open(config).map(|_| ()))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let cache = open_cache(&dir);
    assert!(cache.runtime().file_path().exists());
    assert!(cache.get_all_key_values().unwrap().is_empty());
}

#[test]
#[serial]
fn test_reopening_does_not_truncate_existing_content() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open_cache(&dir);
        cache.set("durable", "yes", None).unwrap();
    }

    // A later startup must observe the winner's file, never recreate it
    let cache = open_cache(&dir);
    cache.refresh().unwrap();
    assert_eq!(cache.get("durable").unwrap(), Some("yes".to_string()));
}

// == Oversize Write Safety ==

#[test]
#[serial]
fn test_oversize_write_never_corrupts_the_file() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_bytes = 400;
    let cache = FileStoreCache::open(config.clone()).unwrap();

    cache.set("small", "fits", None).unwrap();
    let before = std::fs::read(config.cache_file_path()).unwrap();

    // Default policy: dropped silently, caller sees success
    cache.set("huge", &"z".repeat(1_000), None).unwrap();

    let after = std::fs::read(config.cache_file_path()).unwrap();
    assert_eq!(before, after, "File must be untouched by the dropped write");
    assert_eq!(cache.get("small").unwrap(), Some("fits".to_string()));
    assert_eq!(cache.get("huge").unwrap(), None);
}

#[test]
#[serial]
fn test_oversize_write_error_policy_reports_sizes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_bytes = 400;
    config.oversize_write = OversizeWritePolicy::Error;
    let cache = FileStoreCache::open(config.clone()).unwrap();

    let result = cache.set("huge", &"z".repeat(1_000), None);
    match result {
        Err(CacheError::WriteTooLarge { actual, max_bytes }) => {
            assert!(actual > max_bytes);
            assert_eq!(max_bytes, 400);
        }
        other => panic!("Expected WriteTooLarge, got {other:?}"),
    }

    // The file still decodes cleanly
    assert!(cache.get_all_key_values().unwrap().is_empty());
}

// == Async Surface ==

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_async_scenario_chain() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    cache.set_async("k", "v", None).await.unwrap();
    assert_eq!(cache.get_async("k").await.unwrap(), Some("v".to_string()));

    cache
        .set_many_async(
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(cache.get_all_key_values_async().await.unwrap().len(), 3);

    cache.remove_async("k").await.unwrap();
    assert_eq!(cache.get_async("k").await.unwrap(), None);

    cache.clear_all_async(None).await.unwrap();
    assert!(cache.get_all_key_values_async().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_async_concurrent_writers_lose_no_updates() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let writers = 8;

    let tasks: Vec<_> = (0..writers)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .set_async(&format!("key{i}"), &format!("value{i}"), None)
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    cache.refresh_async().await.unwrap();
    assert_eq!(cache.get_all_key_values_async().await.unwrap().len(), writers);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_async_sliding_expiry_rejected_before_io() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);

    let result = cache
        .set_async("k", "v", Some(Expiry::Sliding(Duration::from_secs(1))))
        .await;
    assert!(matches!(result, Err(CacheError::SlidingNotSupported)));
}
