//! Per-target circuit breaker.
//!
//! State lives in atomics (0 Closed, 1 Open, 2 HalfOpen) so the hot path
//! never locks; only the open timestamp and last error message sit behind a
//! lock. State changes are published on a `broadcast` channel.

use crate::Result;
use crate::error::SqlAnalyzerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{info, warn};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the open duration elapses
    Open,
    /// One probe call decides between Closed and Open
    HalfOpen,
}

impl CircuitState {
    const fn from_u8(value: u8) -> Self {
        match value {
            CLOSED => Self::Closed,
            OPEN => Self::Open,
            _ => Self::HalfOpen,
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    #[serde(rename = "open_duration_secs", with = "crate::config::duration_secs")]
    pub open_duration: Duration,
    /// Log state transitions
    pub enable_logging: bool,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            enable_logging: true,
        }
    }
}

impl CircuitBreakerOptions {
    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the open duration.
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    /// Returns `Configuration` when the threshold or duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(SqlAnalyzerError::configuration(
                "circuit breaker failure_threshold must be greater than 0",
            ));
        }
        if self.open_duration.is_zero() {
            return Err(SqlAnalyzerError::configuration(
                "circuit breaker open_duration must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStateChange {
    /// Breaker name
    pub name: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// When the transition happened
    pub at: DateTime<Utc>,
    /// Error that caused the transition, if any
    pub reason: Option<String>,
}

/// Counters for one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Every call, including rejected ones
    pub total_calls: u64,
    /// Calls that succeeded
    pub successful_calls: u64,
    /// Calls that failed
    pub failed_calls: u64,
    /// Calls rejected while open
    pub rejected_calls: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the breaker was created
    pub created_at: DateTime<Utc>,
    /// Last manual reset
    pub last_reset: Option<DateTime<Utc>>,
    /// Last time the circuit opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Message of the last recorded failure
    pub last_error: Option<String>,
}

impl CircuitBreakerStatistics {
    /// Successful calls as a percentage of all calls, 0 when idle.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.successful_calls as f64 / self.total_calls as f64 * 100.0;
        rate
    }
}

#[derive(Debug, Default)]
struct OpenWindow {
    opened_at: Option<DateTime<Utc>>,
    opened_instant: Option<Instant>,
    last_error: Option<String>,
    last_reset: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one named target.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    probe_in_flight: AtomicBool,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    window: RwLock<OpenWindow>,
    created_at: DateTime<Utc>,
    events: broadcast::Sender<CircuitStateChange>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// # Errors
    /// Returns `Configuration` when the options are invalid.
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Result<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            name: name.into(),
            options,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            window: RwLock::new(OpenWindow::default()),
            created_at: Utc::now(),
            events,
        })
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options in effect.
    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChange> {
        self.events.subscribe()
    }

    /// Runs `op` through the breaker.
    ///
    /// Cancelled operations release the probe slot without counting as a
    /// success or a failure.
    ///
    /// # Errors
    /// Returns `CircuitOpen` without calling `op` while the circuit is open,
    /// otherwise whatever `op` returns.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        let probe = self.acquire_permit().await?;

        match op().await {
            Ok(value) => {
                self.on_success(probe).await;
                Ok(value)
            }
            Err(err) if err.is_cancelled() => {
                if probe {
                    self.probe_in_flight.store(false, Ordering::SeqCst);
                }
                Err(err)
            }
            Err(err) => {
                self.on_failure(probe, &err).await;
                Err(err)
            }
        }
    }

    /// Forces the breaker closed and clears the failure streak.
    pub async fn reset(&self) {
        let previous = {
            let mut window = self.window.write().await;
            window.opened_instant = None;
            window.last_reset = Some(Utc::now());
            self.state.swap(CLOSED, Ordering::SeqCst)
        };
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        if previous != CLOSED {
            self.publish(CircuitState::from_u8(previous), CircuitState::Closed, None);
        }
    }

    /// Snapshot of the counters.
    pub async fn statistics(&self) -> CircuitBreakerStatistics {
        let window = self.window.read().await;
        CircuitBreakerStatistics {
            name: self.name.clone(),
            state: self.state(),
            total_calls: self.total.load(Ordering::Relaxed),
            successful_calls: self.successful.load(Ordering::Relaxed),
            failed_calls: self.failed.load(Ordering::Relaxed),
            rejected_calls: self.rejected.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            created_at: self.created_at,
            last_reset: window.last_reset,
            opened_at: window.opened_at,
            last_error: window.last_error.clone(),
        }
    }

    /// Returns whether this call is the half-open probe.
    async fn acquire_permit(&self) -> Result<bool> {
        match self.state() {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let (opened_at, elapsed) = {
                    let window = self.window.read().await;
                    (
                        window.opened_at,
                        window.opened_instant.map(|t| t.elapsed()),
                    )
                };
                match elapsed {
                    Some(elapsed) if elapsed >= self.options.open_duration => {
                        if self
                            .state
                            .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            self.probe_in_flight.store(true, Ordering::SeqCst);
                            self.publish(CircuitState::Open, CircuitState::HalfOpen, None);
                            return Ok(true);
                        }
                        Err(self.reject(opened_at, Duration::ZERO))
                    }
                    elapsed => {
                        let remaining = self
                            .options
                            .open_duration
                            .saturating_sub(elapsed.unwrap_or_default());
                        Err(self.reject(opened_at, remaining))
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(true);
                }
                let opened_at = self.window.read().await.opened_at;
                Err(self.reject(opened_at, Duration::ZERO))
            }
        }
    }

    fn reject(&self, opened_at: Option<DateTime<Utc>>, retry_after: Duration) -> SqlAnalyzerError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        SqlAnalyzerError::CircuitOpen {
            name: self.name.clone(),
            opened_at: opened_at.unwrap_or_else(Utc::now),
            retry_after,
        }
    }

    /// Only the half-open probe may close the circuit; a success that was
    /// admitted while closed just clears the failure streak.
    async fn on_success(&self, probe: bool) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !probe {
            return;
        }

        let closed = {
            let mut window = self.window.write().await;
            let closed = self
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            if closed {
                window.opened_instant = None;
            }
            closed
        };
        self.probe_in_flight.store(false, Ordering::SeqCst);

        if closed {
            if self.options.enable_logging {
                info!(breaker = %self.name, "Circuit breaker closed");
            }
            self.publish(CircuitState::HalfOpen, CircuitState::Closed, None);
        }
    }

    /// The open timestamp is written under the window lock before the state
    /// flips to open, so a reader that sees `Open` always finds this trip's
    /// instant.
    async fn on_failure(&self, probe: bool, err: &SqlAnalyzerError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let message = err.to_string();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        let tripped_from = {
            let mut window = self.window.write().await;
            window.last_error = Some(message.clone());

            let (expected, from) = if probe {
                (HALF_OPEN, CircuitState::HalfOpen)
            } else {
                (CLOSED, CircuitState::Closed)
            };
            let should_trip = probe || failures >= self.options.failure_threshold;
            let tripped = should_trip
                && self
                    .state
                    .compare_exchange(expected, OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            if tripped {
                window.opened_at = Some(Utc::now());
                window.opened_instant = Some(Instant::now());
            }
            tripped.then_some(from)
        };
        if probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }

        if let Some(from) = tripped_from {
            if self.options.enable_logging {
                warn!(
                    breaker = %self.name,
                    consecutive_failures = failures,
                    open_secs = self.options.open_duration.as_secs(),
                    error = %message,
                    "Circuit breaker opened"
                );
            }
            self.publish(from, CircuitState::Open, Some(message));
        }
    }

    fn publish(&self, from: CircuitState, to: CircuitState, reason: Option<String>) {
        // No subscribers is fine
        let _ = self.events.send(CircuitStateChange {
            name: self.name.clone(),
            from,
            to,
            at: Utc::now(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineKind;
    use std::sync::Arc;

    fn failure() -> SqlAnalyzerError {
        SqlAnalyzerError::Backend {
            engine: EngineKind::Postgres,
            code: Some("08006".to_string()),
            transient: true,
            message: "connection failure".to_string(),
        }
    }

    fn breaker(threshold: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "orders-db",
            CircuitBreakerOptions::default()
                .with_failure_threshold(threshold)
                .with_open_duration(Duration::from_secs(open_secs)),
        )
        .unwrap()
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(failure()) }).await
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_rejects() {
        let cb = breaker(3, 30);
        for _ in 0..3 {
            assert!(!fail(&cb).await.unwrap_err().is_circuit_open());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let mut invoked = false;
        let err = cb
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(!invoked);
        match err {
            SqlAnalyzerError::CircuitOpen { retry_after, .. } => {
                assert!(retry_after <= Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        let stats = cb.statistics().await;
        assert_eq!(stats.rejected_calls, 1);
        assert_eq!(stats.failed_calls, 3);
        assert_eq!(stats.total_calls, 4);
        assert!(stats.last_error.unwrap().contains("connection failure"));
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let cb = breaker(3, 30);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        cb.execute(|| async { Ok(()) }).await.unwrap();
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.statistics().await.consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let cb = breaker(1, 10);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 10);
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(11)).await;

        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);
        // Timer restarted
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let cb = Arc::new(breaker(1, 10));
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(11)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async move {
                    wait.await.ok();
                    Ok(())
                })
                .await
        });
        for _ in 0..10 {
            if cb.state() == CircuitState::HalfOpen {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = cb.execute(|| async { Ok(()) }).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        release.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_in_flight_success_does_not_close_open_circuit() {
        let cb = Arc::new(breaker(2, 30));

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let (admitted_tx, admitted) = tokio::sync::oneshot::channel::<()>();
        let slow_cb = Arc::clone(&cb);
        let slow = tokio::spawn(async move {
            slow_cb
                .execute(|| async move {
                    admitted_tx.send(()).ok();
                    wait.await.ok();
                    Ok(())
                })
                .await
        });
        admitted.await.unwrap();

        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrip_uses_fresh_open_window() {
        let cb = breaker(1, 10);
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Well past the first window; the second trip must start its own
        tokio::time::advance(Duration::from_secs(60)).await;
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(fail(&cb).await.unwrap_err().is_circuit_open());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_and_events() {
        let cb = breaker(1, 30);
        let mut events = cb.subscribe();

        fail(&cb).await.ok();
        let opened = events.recv().await.unwrap();
        assert_eq!((opened.from, opened.to), (CircuitState::Closed, CircuitState::Open));
        assert!(opened.reason.is_some());

        cb.reset().await;
        let closed = events.recv().await.unwrap();
        assert_eq!(closed.to, CircuitState::Closed);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.statistics().await.last_reset.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_calls_do_not_count() {
        let cb = breaker(1, 30);
        let result = cb
            .execute(|| async { Err::<(), _>(SqlAnalyzerError::cancelled("scan")) })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.statistics().await.failed_calls, 0);
    }

    #[test]
    fn test_invalid_options() {
        let zero = CircuitBreakerOptions::default().with_failure_threshold(0);
        assert!(CircuitBreaker::new("x", zero).is_err());
        let instant = CircuitBreakerOptions::default().with_open_duration(Duration::ZERO);
        assert!(instant.validate().is_err());
    }

    #[test]
    fn test_success_rate() {
        let stats = CircuitBreakerStatistics {
            name: "x".to_string(),
            state: CircuitState::Closed,
            total_calls: 4,
            successful_calls: 3,
            failed_calls: 1,
            rejected_calls: 0,
            consecutive_failures: 0,
            created_at: Utc::now(),
            last_reset: None,
            opened_at: None,
            last_error: None,
        };
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
    }
}
