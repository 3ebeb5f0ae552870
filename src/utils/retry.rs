//! Bounded retry with exponential backoff
//!
//! Shared by the agent's pull loop, its push loop and the RPC client.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry/backoff parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 3_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff before attempt `attempt + 1` (1-based `attempt`)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);
        // up to 20% jitter downwards so lanes do not retry in lockstep
        let jitter = (capped as f64 * 0.2 * rand::random::<f64>()) as u64;
        Duration::from_millis(capped - jitter)
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// Returns the last error once `max_attempts` calls have failed.
    pub async fn retry<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", label, attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= attempts => {
                    warn!("{} failed after {} attempts: {}", label, attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {} (retrying in {}ms)",
                        label,
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(5)).base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(300)).base_delay(Duration::from_millis(100));
        assert!(policy.delay_for(1) <= Duration::from_millis(100));
        assert!(policy.delay_for(1) >= Duration::from_millis(80));
        assert!(policy.delay_for(8) <= Duration::from_millis(300));
        assert!(policy.delay_for(40) <= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transient_failure_is_invisible() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<&str, String> = fast_policy(5)
            .retry("flaky", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection refused".to_string())
                } else {
                    Ok("path")
                }
            })
            .await;

        assert_eq!(result, Ok("path"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = fast_policy(3)
            .retry("down", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {n}"))
            })
            .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = tokio_test::block_on(fast_policy(0).retry("once", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("nope")
        }));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
