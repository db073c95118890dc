//! Adaptive timeouts derived from database size, workload, and history.
//!
//! Every result is a whole number of seconds. The calculator keeps a bounded
//! execution history per operation name; everything else is pure arithmetic
//! over the inputs.

use crate::Result;
use crate::error::SqlAnalyzerError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Timeout used when nothing is known about the database.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_HISTORY: usize = 100;
const ANALYSIS_CAP_SECS: u64 = 300;
const DYNAMIC_MIN_SECS: u64 = 30;
const DYNAMIC_MAX_SECS: u64 = 600;

/// Bounds and scaling for size-based timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOptions {
    /// Lower bound
    #[serde(rename = "min_timeout_secs", with = "crate::config::duration_secs")]
    pub min_timeout: Duration,
    /// Upper bound
    #[serde(rename = "max_timeout_secs", with = "crate::config::duration_secs")]
    pub max_timeout: Duration,
    /// Seconds added per megabyte; `0` switches to 10 s per gigabyte
    pub base_factor: f64,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(600),
            base_factor: 0.01,
        }
    }
}

impl TimeoutOptions {
    /// Sets the bounds.
    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    /// Sets the per-megabyte factor.
    pub fn with_base_factor(mut self, base_factor: f64) -> Self {
        self.base_factor = base_factor;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    /// Returns `Configuration` when the bounds are inverted or the factor is
    /// negative or not finite.
    pub fn validate(&self) -> Result<()> {
        if self.min_timeout > self.max_timeout {
            return Err(SqlAnalyzerError::configuration(format!(
                "min_timeout ({}s) exceeds max_timeout ({}s)",
                self.min_timeout.as_secs(),
                self.max_timeout.as_secs()
            )));
        }
        if !self.base_factor.is_finite() || self.base_factor < 0.0 {
            return Err(SqlAnalyzerError::configuration(
                "base_factor must be a non-negative number",
            ));
        }
        Ok(())
    }

    fn clamp(&self, seconds: u64) -> Duration {
        Duration::from_secs(seconds.clamp(self.min_timeout.as_secs(), self.max_timeout.as_secs()))
    }
}

/// Inputs for [`TimeoutCalculator::calculate_analysis_timeout`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWorkload {
    pub size_mb: f64,
    pub table_count: u64,
    pub total_object_count: u64,
    pub has_complex_queries: bool,
    pub estimated_row_count: u64,
}

/// Inputs for [`TimeoutCalculator::dynamic_timeout`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicTimeoutContext {
    /// Operation name, for logging
    pub operation: String,
    pub size_mb: f64,
    pub object_count: u64,
    pub network_latency_ms: u64,
    /// CPU usage in `[0, 1]`; other values leave the timeout unchanged
    pub cpu_usage: f64,
    /// Past execution times of the same operation
    pub history: Vec<Duration>,
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    size_mb: f64,
    elapsed: Duration,
}

/// Size-based timeout, truncated to whole seconds and clamped to the bounds.
///
/// Non-positive sizes yield [`DEFAULT_TIMEOUT`] clamped to the bounds.
pub fn calculate_timeout(size_mb: f64, options: &TimeoutOptions) -> Duration {
    if size_mb.is_nan() || size_mb <= 0.0 {
        return options.clamp(DEFAULT_TIMEOUT.as_secs());
    }
    let base = DEFAULT_TIMEOUT.as_secs_f64();
    let seconds = if options.base_factor > 0.0 {
        base + size_mb * options.base_factor
    } else {
        base + (size_mb / 1024.0) * 10.0
    };
    options.clamp(whole_seconds(seconds))
}

/// Adds one second per 50 ms of round-trip latency.
pub fn adjust_for_network_latency(base: Duration, latency_ms: u64) -> Duration {
    base.saturating_add(Duration::from_secs(latency_ms / 50))
}

/// Shortens the timeout under heavy load and lengthens it when idle.
///
/// Above 70 % CPU the timeout shrinks by a fifth; below 30 % it grows by a
/// fifth. Values outside `[0, 1]` are ignored.
pub fn adjust_for_system_load(base: Duration, cpu_usage: f64) -> Duration {
    if !(0.0..=1.0).contains(&cpu_usage) {
        return base;
    }
    let seconds = base.as_secs_f64();
    if cpu_usage > 0.7 {
        Duration::from_secs(whole_seconds(seconds * 0.8))
    } else if cpu_usage < 0.3 {
        Duration::from_secs(whole_seconds(seconds * 1.2))
    } else {
        base
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_seconds(seconds: f64) -> u64 {
    // Saturating float-to-int cast; the epsilon absorbs binary rounding
    // such as 30.0 * 1.2 = 35.99999
    (seconds + 1e-9).max(0.0) as u64
}

#[allow(clippy::cast_precision_loss)]
fn log10_floor(count: u64) -> u64 {
    whole_seconds((count as f64).log10())
}

/// Computes timeouts and learns from recorded execution times.
#[derive(Debug, Default)]
pub struct TimeoutCalculator {
    options: TimeoutOptions,
    history: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
}

impl TimeoutCalculator {
    /// Creates a calculator.
    ///
    /// # Errors
    /// Returns `Configuration` when `options` are invalid.
    pub fn new(options: TimeoutOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            history: RwLock::new(HashMap::new()),
        })
    }

    /// Options in effect.
    pub fn options(&self) -> &TimeoutOptions {
        &self.options
    }

    /// [`calculate_timeout`] with this calculator's options.
    pub fn calculate_timeout(&self, size_mb: f64) -> Duration {
        calculate_timeout(size_mb, &self.options)
    }

    /// Timeout for a full analysis run, capped at five minutes.
    pub fn calculate_analysis_timeout(&self, workload: &AnalysisWorkload) -> Duration {
        let mut seconds = self.calculate_timeout(workload.size_mb).as_secs();
        if workload.total_object_count > 100 {
            seconds = seconds.saturating_add(log10_floor(workload.total_object_count) * 5);
        }
        if workload.has_complex_queries {
            seconds = seconds.saturating_add(20);
        }
        Duration::from_secs(seconds.min(ANALYSIS_CAP_SECS))
    }

    /// Records how long `operation` took against a database of `size_mb`.
    ///
    /// Only the most recent 100 samples per operation are kept.
    pub fn record_execution_time(&self, operation: &str, size_mb: f64, elapsed: Duration) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let samples = history.entry(operation.to_string()).or_default();
        samples.push_back(ExecutionRecord {
            size_mb,
            elapsed,
        });
        while samples.len() > MAX_HISTORY {
            samples.pop_front();
        }
    }

    /// Number of samples held for `operation`.
    pub fn history_len(&self, operation: &str) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .map_or(0, VecDeque::len)
    }

    /// 95th percentile of similar-sized past runs plus 20 %, or the
    /// size-based timeout when no run is within 20 % of `size_mb`.
    pub fn suggested_timeout(&self, operation: &str, size_mb: f64) -> Duration {
        let mut similar: Vec<Duration> = {
            let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
            history
                .get(operation)
                .map(|samples| {
                    samples
                        .iter()
                        .filter(|s| (s.size_mb - size_mb).abs() < size_mb * 0.2)
                        .map(|s| s.elapsed)
                        .collect()
                })
                .unwrap_or_default()
        };

        if similar.is_empty() {
            return self.calculate_timeout(size_mb);
        }

        similar.sort_unstable();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = ((similar.len() as f64 * 0.95) as usize).min(similar.len() - 1);
        let p95 = similar[index].as_secs_f64();
        let suggested = Duration::from_secs(whole_seconds(p95 * 1.2));
        debug!(
            operation = operation,
            samples = similar.len(),
            suggested_secs = suggested.as_secs(),
            "Suggested timeout from history"
        );
        suggested
    }

    /// Combines size, history, latency, load, and object count, clamped to
    /// `[30 s, 600 s]`.
    pub fn dynamic_timeout(&self, context: &DynamicTimeoutContext) -> Duration {
        let mut timeout = self.calculate_timeout(context.size_mb);

        if let Some(slowest) = context.history.iter().max() {
            let buffered = Duration::from_secs(whole_seconds(slowest.as_secs_f64() * 1.3));
            timeout = timeout.max(buffered);
        }
        timeout = adjust_for_network_latency(timeout, context.network_latency_ms);
        timeout = adjust_for_system_load(timeout, context.cpu_usage);

        let mut seconds = timeout.as_secs();
        if context.object_count > 1000 {
            #[allow(clippy::cast_precision_loss)]
            let extra = whole_seconds((context.object_count as f64).log10() * 10.0);
            seconds = seconds.saturating_add(extra);
        }
        let seconds = seconds.clamp(DYNAMIC_MIN_SECS, DYNAMIC_MAX_SECS);
        debug!(
            operation = %context.operation,
            timeout_secs = seconds,
            "Computed dynamic timeout"
        );
        Duration::from_secs(seconds)
    }
}
