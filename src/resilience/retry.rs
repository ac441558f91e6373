//! Retry controller with exponential backoff and jitter
//!
//! Applied around each call the circuit breaker admits. Terminal error
//! classifications fail fast after a single attempt; rate-limited
//! responses wait the server-suggested hint instead of the computed
//! backoff.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;

/// Executes operations under the configured retry policy
#[derive(Debug, Clone)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, fails terminally, or attempts are
    /// exhausted. `max_attempts` overrides the configured bound when the
    /// caller supplied per-request constraints.
    pub async fn run<V, F>(&self, max_attempts: Option<u32>, mut op: F) -> Result<V>
    where
        F: FnMut() -> BoxFuture<'static, Result<V>>,
    {
        let max_attempts = max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    // Terminal and capacity failures surface immediately
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    log::warn!(
                        "retries exhausted after {} attempts: {}",
                        attempt,
                        e
                    );
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = match e.retry_after() {
                        Some(hint) => hint,
                        None => self.backoff_delay(attempt),
                    };
                    log::debug!(
                        "attempt {} failed ({}), retrying after {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// min(base * 2^(attempt-1), cap) plus additive random jitter
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let scaled = base_ms.saturating_mul(1u64 << exponent);
        let capped = scaled.min(self.config.max_delay.as_millis() as u64);

        let jitter_range = (capped as f64 * self.config.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}
