//! Retry-on-Contention Module
//!
//! The only retry policy in the engine: run a file operation, and when it
//! reports the transient "another process holds the lock" condition, sleep a
//! fixed delay and try again, up to the configured attempt count.
//!
//! The delay is deliberately linear with no jitter so the worst-case latency
//! stays predictable: `max_retries * retry_delay`. Non-transient errors pass
//! through on the first occurrence.

use std::future::Future;
use std::thread;

use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Waited Time ==
/// Total time spent sleeping once the retry budget is exhausted.
fn budget_ms(config: &CacheConfig) -> u64 {
    u64::from(config.max_retries) * config.retry_delay.as_millis() as u64
}

// == Sync Retry ==
/// Runs `action`, retrying on [`CacheError::Busy`] with a fixed delay.
///
/// Once `max_retries` sleeps have been spent and the file is still locked,
/// returns [`CacheError::Unavailable`] wrapping the last contention error.
/// Every other error propagates immediately without a retry.
pub(crate) fn with_retry<T, F>(config: &CacheConfig, mut action: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut tries: u32 = 0;
    loop {
        match action() {
            Err(CacheError::Busy(source)) => {
                if tries >= config.max_retries {
                    return Err(CacheError::Unavailable {
                        waited_ms: budget_ms(config),
                        source,
                    });
                }
                tries += 1;
                debug!(
                    attempt = tries,
                    max = config.max_retries,
                    "Cache file busy, retrying after {:?}",
                    config.retry_delay
                );
                thread::sleep(config.retry_delay);
            }
            other => return other,
        }
    }
}

// == Async Retry ==
/// Async variant of [`with_retry`] with identical semantics.
///
/// Suspends on the retry delay instead of blocking the thread; the action
/// itself is expected to push blocking file I/O onto the blocking pool.
pub(crate) async fn with_retry_async<T, F, Fut>(config: &CacheConfig, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries: u32 = 0;
    loop {
        match action().await {
            Err(CacheError::Busy(source)) => {
                if tries >= config.max_retries {
                    return Err(CacheError::Unavailable {
                        waited_ms: budget_ms(config),
                        source,
                    });
                }
                tries += 1;
                debug!(
                    attempt = tries,
                    max = config.max_retries,
                    "Cache file busy, retrying after {:?}",
                    config.retry_delay
                );
                tokio::time::sleep(config.retry_delay).await;
            }
            other => return other,
        }
    }
}
