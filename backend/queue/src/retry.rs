//! Exponential backoff with jitter, shared by broker connection attempts,
//! requeue pacing, and record-store write retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Multiplier applied to each subsequent wait.
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Spread each delay by ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed). Zero for attempt 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        let delay_ms = if self.jitter {
            let spread = delay_ms / 4;
            if spread > 0 {
                let offset = rand::rng().random_range(0..=spread * 2);
                (delay_ms - spread) + offset
            } else {
                delay_ms
            }
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or the attempts are used up, sleeping
    /// between failures. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempt) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(what, attempt, error = %err, "Retry policy exhausted");
                    return Err(err);
                }
            }
        }
    }
}
