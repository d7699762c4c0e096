//! Bounded polling for state transitions
//!
//! Lifecycle operations wait for the platform to converge (VM running, IP
//! assigned, instance replaced, VM gone). Waiting is bounded by attempt count
//! rather than wall-clock time or cancellation: after the last attempt the
//! caller gets a [`Error::Timeout`] carrying the last error the check saw.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace};

use crate::Error;

/// Default number of polling attempts
pub const DEFAULT_POLL_ATTEMPTS: u32 = 24;

/// Default delay between polling attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How often and how long to poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum number of checks before giving up
    pub attempts: u32,
    /// Delay between consecutive checks
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollConfig {
    /// Poll without sleeping between attempts (tests)
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            interval: Duration::ZERO,
        }
    }
}

/// Poll until a condition is met or the attempts run out.
///
/// `check_fn` returns `Ok(true)` when the condition holds and `Ok(false)` to
/// keep polling. Errors from the check are not fatal: they are remembered and
/// reported in the timeout error if the condition never holds.
pub async fn poll_until<F, Fut>(
    config: &PollConfig,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let operation = operation.into();
    let mut last_error: Option<String> = None;

    debug!(operation = %operation, attempts = config.attempts, "Waiting");

    for attempt in 1..=config.attempts {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!(operation = %operation, attempt, "Condition not yet met");
            }
            Err(e) => {
                trace!(operation = %operation, attempt, error = %e, "Polling check failed");
                last_error = Some(e.to_string());
            }
        }

        if attempt < config.attempts && !config.interval.is_zero() {
            tokio::time::sleep(config.interval).await;
        }
    }

    Err(Error::timeout(operation, config.attempts, last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn default_matches_two_minutes() {
        let config = PollConfig::default();
        assert_eq!(config.attempts, 24);
        assert_eq!(config.interval * config.attempts, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn returns_once_condition_holds() {
        let calls = Cell::new(0);
        let result = poll_until(&PollConfig::immediate(5), "ready", || {
            calls.set(calls.get() + 1);
            let done = calls.get() == 3;
            async move { Ok(done) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_with_last_error() {
        let calls = Cell::new(0);
        let result = poll_until(&PollConfig::immediate(4), "machine removed", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n % 2 == 0 {
                    Err(Error::internal(format!("failure {n}")))
                } else {
                    Ok(false)
                }
            }
        })
        .await;

        assert_eq!(calls.get(), 4);
        match result {
            Err(Error::Timeout {
                operation,
                attempts,
                last_error,
            }) => {
                assert_eq!(operation, "machine removed");
                assert_eq!(attempts, 4);
                assert!(last_error.unwrap().contains("failure 4"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_times_out_without_checking() {
        let calls = Cell::new(0);
        let result = poll_until(&PollConfig::immediate(0), "ip", || {
            calls.set(calls.get() + 1);
            async { Ok(true) }
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(calls.get(), 0);
    }
}
