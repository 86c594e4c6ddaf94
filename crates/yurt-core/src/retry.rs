//! Bounded retry with a fixed delay.
//!
//! Used around hypervisor and container-runtime calls that fail transiently
//! right after a VM boots.

use crate::spinner::sleep_for;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` runs the operation exactly once.
    pub retries: u32,
    /// Delay between two attempts.
    pub wait: Duration,
    /// Render the progress indicator while waiting.
    pub show_indicator: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            wait: Duration::from_secs(3),
            show_indicator: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and delay.
    pub fn new(retries: u32, wait: Duration) -> Self {
        Self {
            retries,
            wait,
            ..Default::default()
        }
    }

    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Toggle the progress indicator during waits.
    pub fn with_indicator(mut self, show: bool) -> Self {
        self.show_indicator = show;
        self
    }
}

/// Run `op` until it succeeds or `policy.retries` retries are used up.
///
/// The operation is invoked at most `retries + 1` times. When every attempt
/// fails, the error of the final attempt is returned unchanged.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(policy, op, |_| true).await
}

/// Like [`retry`], but an error for which `should_retry` is false is
/// returned at once without waiting.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut remaining = policy.retries;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if remaining > 0 && should_retry(&e) => {
                tracing::debug!(attempt, remaining, error = %e, "Attempt failed, retrying");
                remaining -= 1;
                attempt += 1;
                sleep_for(policy.wait, policy.show_indicator).await;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::debug!(attempts = attempt, error = %e, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
