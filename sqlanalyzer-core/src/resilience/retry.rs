//! Retry policy with exponential backoff for transient failures.

use crate::Result;
use crate::error::SqlAnalyzerError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff retry policy.
///
/// Only errors whose [`SqlAnalyzerError::is_transient`] returns true are
/// retried; everything else propagates on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay unit doubled on every retry
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for a single delay
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_millis")]
    pub max_delay: Duration,
    /// Spread each delay by up to 25 % in either direction
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the policy.
    ///
    /// # Errors
    /// Returns `Configuration` when the cap is below the base delay.
    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(SqlAnalyzerError::configuration(
                "retry max_delay must not be smaller than base_delay",
            ));
        }
        Ok(())
    }

    /// Delay before retry `retry` (1-based): `base_delay * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        if self.jitter && !delay.is_zero() {
            let spread: f64 = rand::rng().random_range(-0.25..=0.25);
            return delay.mul_f64(1.0 + spread);
        }
        delay
    }

    /// Runs `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// # Errors
    /// Returns the last error produced by `op`.
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None, op).await
    }

    /// Like [`execute`](Self::execute), but aborts with `Cancelled` when
    /// `token` fires, including while sleeping between attempts.
    ///
    /// # Errors
    /// Returns `Cancelled`, or the last error produced by `op`.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        operation: &str,
        token: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(token), op).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        token: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0u32;
        loop {
            let outcome = tokio::select! {
                biased;
                () = super::cancelled(token) => return Err(SqlAnalyzerError::cancelled(operation)),
                outcome = op() => outcome,
            };

            match outcome {
                Ok(value) => {
                    if retry > 0 {
                        debug!(operation, retries = retry, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        attempt = retry,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = super::cancelled(token) => return Err(SqlAnalyzerError::cancelled(operation)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
