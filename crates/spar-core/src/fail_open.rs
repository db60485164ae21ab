//! Fail-open utilities for graceful degradation
//!
//! For infrastructure operations that must never take the pipeline down with
//! them: heartbeats, opportunistic kicks, audio cleanup. A failure is logged
//! and swallowed.
//!
//! DO NOT use fail-open for:
//! - Stage execution (business logic)
//! - The atomic claim (correctness)
//! - Event appends (clients would wait forever)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open.
///
/// Logs via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use spar_core::fail_open::fail_open;
/// use spar_core::Result;
///
/// async fn record_heartbeat() -> Result<()> {
///     // store write that might be down
///     Ok(())
/// }
///
/// async fn example() {
///     let result = fail_open("heartbeat", || record_heartbeat()).await;
///     // None if the heartbeat write failed, Some(()) otherwise
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`] but retries with linear backoff (`100ms * attempt`)
/// before giving up. Suited to transient store hiccups.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_retries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_retries {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) => {
                if attempt == max_retries {
                    warn!(
                        "{} failed after {} retries (fail-open): {}",
                        operation_name, max_retries, e
                    );
                    return None;
                }
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                let delay_ms = 100 * attempt as u64;
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SparError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("heartbeat", || async { Ok::<_, SparError>(7) }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_failure() {
        let result = fail_open("heartbeat", || async {
            Err::<u32, _>(SparError::Store("store offline".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retries_stop_on_first_success() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "kick",
            || {
                attempts += 1;
                async move {
                    if attempts < 2 {
                        Err(SparError::Store("transient".to_string()))
                    } else {
                        Ok(attempts)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result, Some(2));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_none() {
        let mut attempts = 0;
        let result = fail_open_with_retries(
            "kick",
            || {
                attempts += 1;
                async move { Err::<u32, _>(SparError::Store("persistent".to_string())) }
            },
            3,
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(attempts, 3);
    }
}
