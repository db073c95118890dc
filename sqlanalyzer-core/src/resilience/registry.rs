//! Named circuit breakers, created lazily per target.

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStatistics, CircuitState,
};
use crate::Result;
use crate::error::SqlAnalyzerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Aggregate view over every breaker in a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    /// Breakers created so far
    pub total_circuit_breakers: usize,
    /// Breakers currently open
    pub open_circuits: usize,
    /// Breakers currently half-open
    pub half_open_circuits: usize,
    /// Calls across all breakers
    pub total_calls: u64,
    /// Successful calls across all breakers
    pub total_successful_calls: u64,
    /// Failed calls across all breakers
    pub total_failed_calls: u64,
    /// Rejected calls across all breakers
    pub total_rejected_calls: u64,
    /// Per-target statistics keyed by the name used at creation
    pub services: BTreeMap<String, CircuitBreakerStatistics>,
}

impl RegistryStatistics {
    /// Overall success rate in percent, 0 when idle.
    pub fn overall_success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.total_successful_calls as f64 / self.total_calls as f64 * 100.0;
        rate
    }
}

/// Case-insensitive map of target name to breaker.
///
/// The options passed on first creation win; later calls with different
/// options get the existing breaker.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_options: CircuitBreakerOptions,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers default to `default_options`.
    ///
    /// # Errors
    /// Returns `Configuration` when the options are invalid.
    pub fn new(default_options: CircuitBreakerOptions) -> Result<Self> {
        default_options.validate()?;
        Ok(Self {
            default_options,
            breakers: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the breaker for `name`, creating it on first use.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a blank name and `Configuration` for
    /// invalid options.
    pub async fn get_or_create(
        &self,
        name: &str,
        options: Option<CircuitBreakerOptions>,
    ) -> Result<Arc<CircuitBreaker>> {
        let key = registry_key(name)?;
        if let Some(existing) = self.breakers.read().await.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let mut breakers = self.breakers.write().await;
        if let Some(existing) = breakers.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let breaker = Arc::new(CircuitBreaker::new(
            name.trim(),
            options.unwrap_or_else(|| self.default_options.clone()),
        )?);
        debug!(breaker = %name.trim(), "Created circuit breaker");
        breakers.insert(key, Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Existing breaker for `name`, if any.
    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let key = registry_key(name).ok()?;
        self.breakers.read().await.get(&key).cloned()
    }

    /// Resets every breaker.
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Aggregated statistics.
    pub async fn statistics(&self) -> RegistryStatistics {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut stats = RegistryStatistics {
            total_circuit_breakers: breakers.len(),
            ..RegistryStatistics::default()
        };

        for breaker in breakers {
            let snapshot = breaker.statistics().await;
            stats.total_calls += snapshot.total_calls;
            stats.total_successful_calls += snapshot.successful_calls;
            stats.total_failed_calls += snapshot.failed_calls;
            stats.total_rejected_calls += snapshot.rejected_calls;
            match snapshot.state {
                CircuitState::Open => stats.open_circuits += 1,
                CircuitState::HalfOpen => stats.half_open_circuits += 1,
                CircuitState::Closed => {}
            }
            stats.services.insert(snapshot.name.clone(), snapshot);
        }
        stats
    }
}

fn registry_key(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SqlAnalyzerError::invalid_input(
            "circuit breaker name cannot be empty",
        ));
    }
    Ok(trimmed.to_lowercase())
}
