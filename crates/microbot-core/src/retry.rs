//! Retry policy for transient BLE failures.
//!
//! A single policy shape is shared across the write, read, and
//! notify-subscribe paths: retry a bounded number of times on a
//! configured set of remote GATT error codes (and optionally on
//! timeout), sleeping a fixed delay between attempts and pausing the
//! transport's cool-down lock before every attempt. This generalizes
//! the exponential-backoff retry helper the rest of this lineage uses
//! for BLE operations down to the fixed-delay, fixed-attempt policy the
//! microbot protocol actually calls for.
//!
//! # Example
//!
//! ```
//! use microbot_core::retry::{RetryPolicy, with_retry};
//! use microbot_core::Error;
//!
//! # async fn run() -> Result<(), Error> {
//! let policy = RetryPolicy::default();
//! let attempts = std::sync::atomic::AtomicU32::new(0);
//! let result = with_retry(&policy, "write", || async {
//!     if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
//!         Err(Error::RemoteError(0x81))
//!     } else {
//!         Ok(())
//!     }
//! })
//! .await;
//! assert!(result.is_ok());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;

/// Configuration for the BLE retry helper.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Sleep between attempts after a retryable failure.
    pub fail_delay: Duration,
    /// Cool-down applied to the transport lock before each attempt.
    pub delayed_unlock: Duration,
    /// Remote GATT error codes that are retried.
    pub retry_on_remote_codes: HashSet<u16>,
    /// Whether a timeout is retried.
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            fail_delay: Duration::from_secs(3),
            delayed_unlock: Duration::from_millis(500),
            retry_on_remote_codes: HashSet::from([
                microbot_types::uuid::REMOTE_ERROR_WRONG_STATE,
            ]),
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// The shared default policy, reused by the write, read, and
    /// notify-subscribe presets below. Exposed as a named constructor
    /// so future tuning of one path does not silently affect the
    /// others.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the characteristic-write path.
    pub fn for_write() -> Self {
        Self::default()
    }

    /// Preset for the characteristic-read path.
    pub fn for_read() -> Self {
        Self::default()
    }

    /// Preset for the notify-subscribe path. Also retries on timeout,
    /// since a subscribe request can silently go unacknowledged.
    pub fn for_subscribe() -> Self {
        Self {
            retry_on_timeout: true,
            ..Self::default()
        }
    }

    /// Whether `error` should trigger a retry under this policy.
    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::RemoteError(code) => self.retry_on_remote_codes.contains(code),
            Error::Timeout { .. } => self.retry_on_timeout,
            _ => false,
        }
    }
}

/// Run `operation` under `policy`, retrying on the errors the policy
/// marks retryable. `name` is used only for logging.
///
/// This helper only governs the retry loop's attempt count and
/// inter-attempt sleep; it does not touch the transport. Callers that
/// want the `delayed_unlock` cooldown to actually throttle the wire
/// must acquire the transport's cool-down lock inside `operation`
/// around each attempt, the way [`crate::connection::Connection`]'s
/// write/read/subscribe paths do.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts && policy.is_retryable(&err) => {
                warn!(
                    operation = name,
                    attempt,
                    max_attempts = policy.attempts,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(policy.fail_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy_matches_spec_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.fail_delay, Duration::from_secs(3));
        assert_eq!(policy.delayed_unlock, Duration::from_millis(500));
        assert!(policy.retry_on_remote_codes.contains(&0x81));
        assert!(!policy.retry_on_timeout);
    }

    #[test]
    fn is_retryable_only_for_configured_codes() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&Error::RemoteError(0x81)));
        assert!(!policy.is_retryable(&Error::RemoteError(0x03)));
        assert!(!policy.is_retryable(&Error::NotConnected));
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            fail_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result = with_retry(&policy, "test_op", || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::RemoteError(0x81))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_propagates_non_retryable_error_immediately() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), Error> = with_retry(&policy, "test_op", || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::RemoteError(0x03))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_exhausts_attempts_and_returns_last_error() {
        let policy = RetryPolicy {
            attempts: 3,
            fail_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), Error> = with_retry(&policy, "test_op", || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::RemoteError(0x81))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
