//! Per-connection timeouts.

use crate::Result;
use crate::error::SqlAnalyzerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts applied by every [`ConnectionHandle`](super::ConnectionHandle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Upper bound for a single statement or batch
    #[serde(rename = "command_timeout_secs", with = "crate::config::duration_secs")]
    pub command_timeout: Duration,
    /// Upper bound for establishing a connection, unless the connection
    /// string carries its own `Connect Timeout`
    #[serde(rename = "connect_timeout_secs", with = "crate::config::duration_secs")]
    pub connect_timeout: Duration,
    /// Time allowed for the rollback and close that follow a cancellation
    #[serde(rename = "cleanup_timeout_ms", with = "crate::config::duration_millis")]
    pub cleanup_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionOptions {
    /// Sets the command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    /// Returns `Configuration` when a timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout.is_zero() {
            return Err(SqlAnalyzerError::configuration(
                "command_timeout must be greater than 0",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(SqlAnalyzerError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.command_timeout, Duration::from_secs(300));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert!(options.validate().is_ok());
        assert!(
            options
                .with_command_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_json_shape() {
        let parsed: ConnectionOptions =
            serde_json::from_str(r#"{"command_timeout_secs": 45}"#).unwrap();
        assert_eq!(parsed.command_timeout, Duration::from_secs(45));
        assert_eq!(parsed.connect_timeout, Duration::from_secs(30));
    }
}
