//! Shared domain types used across the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported relational engines.
///
/// Closed set: every per-engine behavior is selected with an exhaustive
/// `match` on this enum, so adding an engine is a compile-time checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Microsoft SQL Server (TDS)
    SqlServer,
    /// PostgreSQL
    Postgres,
    /// MySQL and MySQL-compatible servers
    MySql,
}

impl EngineKind {
    /// All supported engines in detection-independent order.
    pub const ALL: [Self; 3] = [Self::SqlServer, Self::Postgres, Self::MySql];

    /// Human-readable engine name.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::SqlServer => "SQL Server",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
        }
    }

    /// Stable lowercase identifier, as used in serialized output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SqlServer => "sqlserver",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Default TCP port.
    pub const fn default_port(self) -> u16 {
        match self {
            Self::SqlServer => 1433,
            Self::Postgres => 5432,
            Self::MySql => 3306,
        }
    }

    /// Schema assumed when an object name carries no schema part.
    ///
    /// MySQL has no schema layer separate from the database, so callers fall
    /// back to the database name.
    pub const fn default_schema(self) -> Option<&'static str> {
        match self {
            Self::SqlServer => Some("dbo"),
            Self::Postgres => Some("public"),
            Self::MySql => None,
        }
    }

    /// Maximum number of bind parameters a single statement may carry.
    pub const fn max_parameters(self) -> usize {
        match self {
            Self::SqlServer => 2100,
            Self::Postgres | Self::MySql => 65535,
        }
    }

    /// Cargo feature that compiles in the native driver for this engine.
    pub const fn feature_name(self) -> &'static str {
        match self {
            Self::SqlServer => "mssql",
            Self::Postgres => "postgresql",
            Self::MySql => "mysql",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for EngineKind {
    type Err = crate::error::SqlAnalyzerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlserver" | "sql-server" | "mssql" | "tsql" => Ok(Self::SqlServer),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(crate::error::SqlAnalyzerError::invalid_input(format!(
                "unknown database engine '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_from_str() {
        assert_eq!("mssql".parse::<EngineKind>().ok(), Some(EngineKind::SqlServer));
        assert_eq!("PostgreSQL".parse::<EngineKind>().ok(), Some(EngineKind::Postgres));
        assert_eq!(" MariaDB ".parse::<EngineKind>().ok(), Some(EngineKind::MySql));
        assert!("oracle".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_engine_serde_lowercase() {
        let json = serde_json::to_string(&EngineKind::SqlServer).unwrap();
        assert_eq!(json, "\"sqlserver\"");
        let parsed: EngineKind = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(parsed, EngineKind::MySql);
    }

    #[test]
    fn test_engine_facts() {
        assert_eq!(EngineKind::SqlServer.default_schema(), Some("dbo"));
        assert_eq!(EngineKind::MySql.default_schema(), None);
        assert_eq!(EngineKind::Postgres.default_port(), 5432);
        assert!(EngineKind::SqlServer.max_parameters() < EngineKind::MySql.max_parameters());
    }
}
