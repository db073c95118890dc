//! Retry, circuit breaking, and their composition.
//!
//! # Module Structure
//! - `retry`: exponential backoff for transient errors
//! - `circuit_breaker`: atomic per-target breaker with state-change events
//! - `registry`: lazily created breakers keyed by target name
//!
//! [`execute_resilient`] nests the retry loop inside the breaker, so one
//! exhausted retry sequence counts as a single breaker failure.

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStatistics, CircuitState,
    CircuitStateChange,
};
pub use registry::{CircuitBreakerRegistry, RegistryStatistics};
pub use retry::RetryPolicy;

use crate::Result;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs `op` with `retry` inside `breaker`.
///
/// # Errors
/// Returns `CircuitOpen` when the breaker rejects the call, otherwise the
/// last error of the retry sequence.
pub async fn execute_resilient<T, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    breaker.execute(|| retry.execute(operation, op)).await
}

/// Resolves when `token` is cancelled; never resolves without a token.
pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
