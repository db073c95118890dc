//! Driver-side pool settings carried inside connection strings.

use crate::Result;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use crate::security::{ConnectionKeys, normalize_key};
use serde::{Deserialize, Serialize};

/// Pool sizing and lifetime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections kept open at minimum
    pub min_pool_size: u32,
    /// Upper bound on pooled connections
    pub max_pool_size: u32,
    /// Connect timeout in seconds
    pub connection_timeout_secs: u32,
    /// Connection lifetime in seconds, 0 for unlimited
    pub connection_lifetime_secs: u32,
    /// Whether pooling is enabled at all
    pub pooling_enabled: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: 100,
            connection_timeout_secs: 30,
            connection_lifetime_secs: 0,
            pooling_enabled: true,
        }
    }
}

/// Connection string key names one engine's driver reads pool settings from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolKeyNames {
    /// Minimum pool size key
    pub min: &'static str,
    /// Maximum pool size key
    pub max: &'static str,
    /// Connect timeout key
    pub timeout: &'static str,
    /// Pooling switch key
    pub pooling: &'static str,
    /// Lifetime key, written only when the lifetime is set
    pub lifetime: &'static str,
}

impl PoolKeyNames {
    /// Key names for `engine`.
    pub const fn for_engine(engine: EngineKind) -> Self {
        match engine {
            EngineKind::SqlServer => Self {
                min: "Min Pool Size",
                max: "Max Pool Size",
                timeout: "Connect Timeout",
                pooling: "Pooling",
                lifetime: "Load Balance Timeout",
            },
            EngineKind::Postgres => Self {
                min: "MinPoolSize",
                max: "MaxPoolSize",
                timeout: "Timeout",
                pooling: "Pooling",
                lifetime: "Connection Idle Lifetime",
            },
            EngineKind::MySql => Self {
                min: "MinimumPoolSize",
                max: "MaximumPoolSize",
                timeout: "ConnectionTimeout",
                pooling: "Pooling",
                lifetime: "ConnectionLifeTime",
            },
        }
    }
}

impl PoolSettings {
    /// Sets the pool bounds.
    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    /// Sets the connect timeout in seconds.
    pub fn with_connection_timeout(mut self, seconds: u32) -> Self {
        self.connection_timeout_secs = seconds;
        self
    }

    /// Sets the connection lifetime in seconds.
    pub fn with_connection_lifetime(mut self, seconds: u32) -> Self {
        self.connection_lifetime_secs = seconds;
        self
    }

    /// Enables or disables pooling.
    pub fn with_pooling(mut self, enabled: bool) -> Self {
        self.pooling_enabled = enabled;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns `Configuration` when the maximum is zero or below the minimum.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(SqlAnalyzerError::configuration(
                "max_pool_size must be greater than 0",
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(SqlAnalyzerError::configuration(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }

    /// Reads pool settings back out of a connection string, falling back to
    /// defaults for absent or malformed values.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the connection string cannot be parsed.
    pub fn from_connection_string(connection_string: &str, engine: EngineKind) -> Result<Self> {
        let parsed = ConnectionKeys::parse(connection_string)
            .map_err(|e| SqlAnalyzerError::invalid_input(e.to_string()))?;
        let names = PoolKeyNames::for_engine(engine);
        let lookup = |name: &str| {
            let wanted = canonical(name);
            parsed
                .iter()
                .find(|(key, _)| canonical(key) == wanted)
                .map(|(_, value)| value)
        };
        let number = |name: &str, default: u32| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };

        let defaults = Self::default();
        Ok(Self {
            min_pool_size: number(names.min, defaults.min_pool_size),
            max_pool_size: number(names.max, defaults.max_pool_size),
            connection_timeout_secs: number(names.timeout, defaults.connection_timeout_secs),
            connection_lifetime_secs: number(names.lifetime, defaults.connection_lifetime_secs),
            pooling_enabled: lookup(names.pooling).map_or(defaults.pooling_enabled, |v| {
                matches!(v.trim().to_lowercase().as_str(), "true" | "yes" | "1")
            }),
        })
    }

    fn assignments(&self, engine: EngineKind) -> Vec<(&'static str, String)> {
        let names = PoolKeyNames::for_engine(engine);
        let mut pairs = vec![
            (names.min, self.min_pool_size.to_string()),
            (names.max, self.max_pool_size.to_string()),
            (names.timeout, self.connection_timeout_secs.to_string()),
            (
                names.pooling,
                if self.pooling_enabled { "True" } else { "False" }.to_string(),
            ),
        ];
        if self.connection_lifetime_secs > 0 {
            pairs.push((names.lifetime, self.connection_lifetime_secs.to_string()));
        }
        pairs
    }
}

/// Key identity used when matching: synonyms folded, spaces ignored.
fn canonical(key: &str) -> String {
    normalize_key(key).replace(' ', "")
}

/// Writes `settings` into a connection string using `engine`'s key names.
///
/// Existing keys are matched case-insensitively (and through their
/// synonyms) and replaced in place; missing keys are appended. Every other
/// key is left untouched. URL-form strings get the keys as query pairs.
///
/// # Errors
/// Returns `InvalidInput` for an empty or unparseable connection string.
pub fn configure_pool(
    connection_string: &str,
    settings: &PoolSettings,
    engine: EngineKind,
) -> Result<String> {
    let trimmed = connection_string.trim();
    if trimmed.is_empty() {
        return Err(SqlAnalyzerError::invalid_input(
            "Connection string cannot be null or empty",
        ));
    }

    let assignments = settings.assignments(engine);
    if trimmed.contains("://") {
        return configure_url(trimmed, &assignments);
    }

    let mut parts: Vec<String> = trimmed
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    for (key, value) in assignments {
        let wanted = canonical(key);
        let existing = parts.iter_mut().find(|part| {
            part.split_once('=')
                .is_some_and(|(k, _)| canonical(k) == wanted)
        });
        match existing {
            Some(part) => {
                let current_key = part
                    .split_once('=')
                    .map_or(key, |(k, _)| k.trim())
                    .to_string();
                *part = format!("{}={}", current_key, value);
            }
            None => parts.push(format!("{}={}", key, value)),
        }
    }
    Ok(parts.join(";"))
}

fn configure_url(connection_string: &str, assignments: &[(&'static str, String)]) -> Result<String> {
    let mut parsed = url::Url::parse(connection_string)
        .map_err(|e| SqlAnalyzerError::invalid_input(format!("invalid connection URL: {}", e)))?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    for (key, value) in assignments {
        let wanted = canonical(key);
        match pairs.iter_mut().find(|(k, _)| canonical(k) == wanted) {
            Some(pair) => pair.1.clone_from(value),
            None => pairs.push(((*key).to_string(), value.clone())),
        }
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_server_keys_replace_in_place() {
        let configured = configure_pool(
            "Server=db;Database=Sales;max pool size=10;User Id=app;Password=p@ss;",
            &PoolSettings::default().with_pool_size(5, 50).with_connection_lifetime(120),
            EngineKind::SqlServer,
        )
        .unwrap();

        assert_eq!(
            configured,
            "Server=db;Database=Sales;max pool size=50;User Id=app;Password=p@ss;\
             Min Pool Size=5;Connect Timeout=30;Pooling=True;Load Balance Timeout=120"
        );
    }

    #[test]
    fn test_postgres_timeout_synonym_is_replaced() {
        let configured = configure_pool(
            "Host=pg;Database=app;Timeout=5",
            &PoolSettings::default().with_pooling(false),
            EngineKind::Postgres,
        )
        .unwrap();

        assert!(configured.contains("Timeout=30"));
        assert!(!configured.contains("Timeout=5"));
        assert!(configured.contains("Pooling=False"));
        assert!(configured.contains("MaxPoolSize=100"));
        assert!(!configured.contains("Connection Idle Lifetime"));
    }

    #[test]
    fn test_mysql_keys() {
        let configured = configure_pool(
            "Server=db;Database=shop;Uid=u;Pwd=p",
            &PoolSettings::default().with_connection_lifetime(300),
            EngineKind::MySql,
        )
        .unwrap();
        assert!(configured.ends_with(
            "MinimumPoolSize=0;MaximumPoolSize=100;ConnectionTimeout=30;Pooling=True;ConnectionLifeTime=300"
        ));
    }

    #[test]
    fn test_url_form_gets_query_pairs() {
        let configured = configure_pool(
            "postgres://app:secret@pg:5432/app?sslmode=require&maxpoolsize=3",
            &PoolSettings::default(),
            EngineKind::Postgres,
        )
        .unwrap();
        assert!(configured.starts_with("postgres://app:secret@pg:5432/app?sslmode=require"));
        assert!(configured.contains("maxpoolsize=100"));
        assert!(configured.contains("Pooling=True"));
    }

    #[test]
    fn test_round_trip_through_connection_string() {
        let settings = PoolSettings::default()
            .with_pool_size(2, 20)
            .with_connection_timeout(15)
            .with_connection_lifetime(600)
            .with_pooling(false);
        for engine in EngineKind::ALL {
            let configured = configure_pool("Server=db;Database=x", &settings, engine).unwrap();
            let read_back = PoolSettings::from_connection_string(&configured, engine).unwrap();
            assert_eq!(read_back, settings, "{engine}");
        }
    }

    #[test]
    fn test_from_connection_string_defaults() {
        let settings =
            PoolSettings::from_connection_string("Server=db;Max Pool Size=abc", EngineKind::SqlServer)
                .unwrap();
        assert_eq!(settings, PoolSettings::default());
    }

    #[test]
    fn test_validate() {
        assert!(PoolSettings::default().validate().is_ok());
        assert!(PoolSettings::default().with_pool_size(5, 0).validate().is_err());
        assert!(PoolSettings::default().with_pool_size(10, 5).validate().is_err());
        assert!(configure_pool(" ", &PoolSettings::default(), EngineKind::MySql).is_err());
    }
}
