//! Aggregate configuration and duration serialization helpers.
//!
//! Every component keeps its own options struct with defaults and a
//! `validate()`; [`CoreConfig`] bundles them for loading from one JSON
//! document. Durations are written as numbers under field names that carry
//! the unit (`*_secs`, `*_ms`).

use crate::Result;
use crate::cache::CacheConfig;
use crate::connection::ConnectionOptions;
use crate::error::SqlAnalyzerError;
use crate::optimizer::QueryOptimizationOptions;
use crate::pool::PoolSettings;
use crate::resilience::{CircuitBreakerOptions, RetryPolicy};
use crate::timeout::TimeoutOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Configuration for every core component.
///
/// Missing sections and fields take their defaults.
///
/// # Example
/// ```rust
/// use sqlanalyzer_core::config::CoreConfig;
///
/// let config = CoreConfig::from_json_str(r#"{ "retry": { "max_retries": 5 } }"#).unwrap();
/// assert_eq!(config.retry.max_retries, 5);
/// assert_eq!(config.pool.max_pool_size, 100);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub connection: ConnectionOptions,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerOptions,
    pub pool: PoolSettings,
    pub timeout: TimeoutOptions,
    pub cache: CacheConfig,
    pub optimizer: QueryOptimizationOptions,
}

impl CoreConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// Returns `Serialization` for malformed JSON and `Configuration` when a
    /// section fails validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SqlAnalyzerError::serialization("parsing configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    /// Returns `Io` when the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SqlAnalyzerError::Io {
            context: format!("reading configuration file {}", path.display()),
            source,
        })?;
        let config = Self::from_json_str(&contents)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first section error, prefixed with the section name.
    pub fn validate(&self) -> Result<()> {
        let sections: [(&str, Result<()>); 6] = [
            ("connection", self.connection.validate()),
            ("retry", self.retry.validate()),
            ("circuit_breaker", self.circuit_breaker.validate()),
            ("pool", self.pool.validate()),
            ("timeout", self.timeout.validate()),
            ("cache", self.cache.validate()),
        ];
        for (section, outcome) in sections {
            outcome.map_err(|e| {
                let detail = match e {
                    SqlAnalyzerError::Configuration { message } => message,
                    other => other.to_string(),
                };
                SqlAnalyzerError::configuration(format!("{}: {}", section, detail))
            })?;
        }
        Ok(())
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SqlAnalyzerError::serialization("encoding configuration", e))
    }
}

fn duration_from_secs_f64<E: serde::de::Error>(secs: f64) -> std::result::Result<std::time::Duration, E> {
    std::time::Duration::try_from_secs_f64(secs)
        .map_err(|_| E::custom(format!("invalid duration: {} seconds", secs)))
}

/// `Duration` as a number of seconds; fractional values are accepted.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        super::duration_from_secs_f64(f64::deserialize(deserializer)?)
    }
}

/// `Option<Duration>` as seconds or `null`.
pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::duration_secs::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(super::duration_from_secs_f64)
            .transpose()
    }
}

/// `Duration` as whole milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
