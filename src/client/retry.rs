//! Retry policy shared by connect, send, consume and presence
//!
//! A policy is an optional attempt ceiling plus a delay schedule. Callers count
//! failures and ask [`RetryPolicy::decide`] what to do next, or hand the whole
//! loop to [`retry`].

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay schedule between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `step * failures`, capped at `max`
    Linear { step: Duration, max: Duration },
}

/// What a caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// `max_attempts` counts every attempt including the first. `None` retries forever.
    pub fn new(max_attempts: Option<u32>, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(Some(max_attempts), Backoff::Fixed(delay))
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay to wait after the given number of consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear { step, max } => step.saturating_mul(failures).min(*max),
        }
    }

    /// Decide the next step after `failures` consecutive failed attempts
    pub fn decide(&self, failures: u32) -> RetryDecision {
        match self.max_attempts {
            Some(max) if failures >= max => RetryDecision::GiveUp,
            _ => RetryDecision::Retry {
                attempt: failures.saturating_add(1),
                delay: self.delay_for(failures),
            },
        }
    }
}

/// Why [`retry`] stopped without a result
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate marked as not retryable
    Fatal { attempts: u32, error: E },
    /// Every allowed attempt failed; carries the last error
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or the policy gives up
///
/// The operation receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !is_retryable(&error) => {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                });
            }
            Err(error) => match policy.decide(attempt) {
                RetryDecision::Retry {
                    attempt: next,
                    delay,
                } => {
                    debug!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "Retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::GiveUp => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        error,
                    });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(7), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_backoff_caps() {
        let policy = RetryPolicy::new(
            Some(10),
            Backoff::Linear {
                step: Duration::from_secs(1),
                max: Duration::from_secs(15),
            },
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(15), Duration::from_secs(15));
        assert_eq!(policy.delay_for(40), Duration::from_secs(15));
    }

    #[test]
    fn test_decide_respects_ceiling() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_unlimited_policy_never_gives_up() {
        let policy = RetryPolicy::new(None, Backoff::Fixed(Duration::from_millis(1)));
        assert!(matches!(policy.decide(u32::MAX - 1), RetryDecision::Retry { .. }));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result: Result<u32, RetryError<String>> = retry(
            &policy,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("failure {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let result: Result<(), RetryError<String>> = retry(
            &policy,
            |attempt| async move { Err(format!("failure {attempt}")) },
            |_| true,
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                error: "failure 2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<(), RetryError<String>> = retry(
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad credentials".to_string()) }
            },
            |error| !error.contains("credentials"),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
    }
}
