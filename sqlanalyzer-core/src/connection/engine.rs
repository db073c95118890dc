//! Per-engine dispatch table.
//!
//! Everything that differs between engines and is not a native driver call
//! lives in one static [`EngineDriver`] per [`EngineKind`]: connection string
//! parsing, transient error classification, smoke/version/size queries,
//! transaction statements and placeholder style.

use super::descriptor::ConnectParams;
use super::params::QueryParam;
use super::result::QueryResult;
use crate::Result;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use crate::security::ConnectionKeys;
use regex::Regex;
use std::sync::OnceLock;

/// One to three dot-separated identifiers, each bare or `[bracketed]`.
#[allow(clippy::expect_used)]
fn routine_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\[[^\]]+\]|[A-Za-z_][A-Za-z0-9_$#]*)(\.(\[[^\]]+\]|[A-Za-z_][A-Za-z0-9_$#]*)){0,2}$")
            .expect("Invalid routine name pattern")
    })
}

/// How positional bind parameters are spelled in SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` (PostgreSQL)
    Dollar,
    /// `?` repeated in order (MySQL)
    Question,
    /// `@P1, @P2, ...` (SQL Server via TDS RPC)
    AtP,
}

/// How `LIMIT`/`OFFSET` style pagination is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// `OFFSET n ROWS FETCH NEXT m ROWS ONLY`, requires `ORDER BY`
    OffsetFetch,
    /// `LIMIT m OFFSET n`
    LimitOffset,
    /// `LIMIT n, m`
    LimitComma,
}

/// Static description of one engine.
#[derive(Debug)]
pub struct EngineDriver {
    /// Engine this row describes
    pub kind: EngineKind,
    /// Placeholder spelling for bound parameters
    pub placeholder: PlaceholderStyle,
    /// Pagination dialect
    pub pagination: PaginationStyle,
    /// Cheapest round trip proving the connection is usable
    pub test_query: &'static str,
    /// Query whose first row is rendered by [`EngineDriver::format_version`]
    pub version_query: &'static str,
    /// Query returning database size in megabytes as its only value
    pub size_query: &'static str,
    /// Statement opening a transaction
    pub begin_statement: &'static str,
    /// Statement committing the active transaction
    pub commit_statement: &'static str,
    /// Statement rolling back the active transaction
    pub rollback_statement: &'static str,
    /// Driver error codes that are worth retrying
    pub transient_codes: &'static [&'static str],
    format_version: fn(&QueryResult) -> String,
}

static SQL_SERVER: EngineDriver = EngineDriver {
    kind: EngineKind::SqlServer,
    placeholder: PlaceholderStyle::AtP,
    pagination: PaginationStyle::OffsetFetch,
    test_query: "SELECT 1",
    version_query: "SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128)) AS version, \
                    CAST(SERVERPROPERTY('ProductLevel') AS NVARCHAR(128)) AS level, \
                    CAST(SERVERPROPERTY('Edition') AS NVARCHAR(128)) AS edition",
    size_query: "SELECT CAST(COALESCE(SUM(CAST(size AS BIGINT)), 0) * 8.0 / 1024 AS FLOAT) AS size_mb \
                 FROM sys.database_files WHERE type_desc = 'ROWS'",
    begin_statement: "BEGIN TRANSACTION",
    commit_statement: "COMMIT TRANSACTION",
    rollback_statement: "ROLLBACK TRANSACTION",
    transient_codes: &[
        "49918", "49919", "49920", "4060", "40143", "233", "64", "20", "0", "-2",
    ],
    format_version: format_sql_server_version,
};

static POSTGRES: EngineDriver = EngineDriver {
    kind: EngineKind::Postgres,
    placeholder: PlaceholderStyle::Dollar,
    pagination: PaginationStyle::LimitOffset,
    test_query: "SELECT 1",
    version_query: "SELECT version() AS version",
    size_query: "SELECT pg_database_size(current_database())::float8 / 1024 / 1024 AS size_mb",
    begin_statement: "BEGIN",
    commit_statement: "COMMIT",
    rollback_statement: "ROLLBACK",
    transient_codes: &[
        "08000", "08003", "08006", "08001", "08004", "40001", "40P01", "53000", "53100", "53200",
        "53300", "57P03", "58000", "58030", "55P03", "55006", "55000", "57014",
    ],
    format_version: format_postgres_version,
};

static MYSQL: EngineDriver = EngineDriver {
    kind: EngineKind::MySql,
    placeholder: PlaceholderStyle::Question,
    pagination: PaginationStyle::LimitComma,
    test_query: "SELECT 1",
    version_query: "SELECT VERSION() AS version, @@version_comment AS comment",
    size_query: "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) / 1024 / 1024 AS DOUBLE) \
                 AS size_mb FROM information_schema.tables WHERE table_schema = DATABASE()",
    begin_statement: "START TRANSACTION",
    commit_statement: "COMMIT",
    rollback_statement: "ROLLBACK",
    transient_codes: &[
        "1040", "1042", "1043", "1053", "1077", "1152", "1153", "1154", "1155", "1156", "1157",
        "1158", "1159", "1160", "1161", "1205", "1213", "2002", "2003", "2006", "2013",
    ],
    format_version: format_mysql_version,
};

/// Returns the dispatch row for an engine.
pub fn driver(kind: EngineKind) -> &'static EngineDriver {
    match kind {
        EngineKind::SqlServer => &SQL_SERVER,
        EngineKind::Postgres => &POSTGRES,
        EngineKind::MySql => &MYSQL,
    }
}

impl EngineDriver {
    /// Classifies a driver error by code and message.
    ///
    /// Any message mentioning a timeout is transient regardless of code.
    pub fn is_transient(&self, code: Option<&str>, message: &str) -> bool {
        let lowered = message.to_lowercase();
        if lowered.contains("timeout") || lowered.contains("timed out") {
            return true;
        }
        code.is_some_and(|code| self.transient_codes.iter().any(|c| c.eq_ignore_ascii_case(code)))
    }

    /// Builds native connect parameters from a parsed connection string.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the port is not a number.
    pub fn parse(
        &self,
        parsed: &ConnectionKeys,
        default_connect_timeout: std::time::Duration,
    ) -> Result<ConnectParams> {
        ConnectParams::from_keys(self.kind, parsed, default_connect_timeout)
    }

    /// Statement invoking a stored routine with `params` in order.
    ///
    /// SQL Server uses `EXEC`, MySQL `CALL`, and PostgreSQL selects from the
    /// function so its result set comes back as rows.
    ///
    /// # Errors
    /// Returns `InvalidInput` when `name` is not a dotted identifier.
    pub fn procedure_call(&self, name: &str, params: &[QueryParam]) -> Result<String> {
        let name = name.trim();
        if !routine_name_pattern().is_match(name) {
            return Err(SqlAnalyzerError::invalid_input(format!(
                "'{}' is not a valid procedure name",
                name
            )));
        }

        let args = params
            .iter()
            .map(|p| format!("@{}", p.name))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(match self.kind {
            EngineKind::SqlServer if args.is_empty() => format!("EXEC {}", name),
            EngineKind::SqlServer => format!("EXEC {} {}", name, args),
            EngineKind::MySql => format!("CALL {}({})", name, args),
            EngineKind::Postgres => format!("SELECT * FROM {}({})", name, args),
        })
    }

    /// Renders the first row of [`EngineDriver::version_query`].
    pub fn format_version(&self, result: &QueryResult) -> String {
        (self.format_version)(result)
    }
}

fn format_sql_server_version(result: &QueryResult) -> String {
    let Some(row) = result.rows.first() else {
        return "SQL Server (unknown version)".to_string();
    };
    format!(
        "SQL Server {} {} - {}",
        row.get_string("version").unwrap_or_default(),
        row.get_string("level").unwrap_or_default(),
        row.get_string("edition").unwrap_or_default()
    )
}

fn format_postgres_version(result: &QueryResult) -> String {
    result
        .rows
        .first()
        .and_then(|row| row.get_string("version"))
        .unwrap_or_else(|| "PostgreSQL (unknown version)".to_string())
}

fn format_mysql_version(result: &QueryResult) -> String {
    let Some(row) = result.rows.first() else {
        return "MySQL (unknown version)".to_string();
    };
    format!(
        "MySQL {} - {}",
        row.get_string("version").unwrap_or_default(),
        row.get_string("comment").unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::result::QueryRow;
    use serde_json::json;

    #[test]
    fn test_driver_rows_match_engine() {
        for kind in EngineKind::ALL {
            assert_eq!(driver(kind).kind, kind);
        }
        assert_eq!(driver(EngineKind::Postgres).placeholder, PlaceholderStyle::Dollar);
        assert_eq!(driver(EngineKind::MySql).pagination, PaginationStyle::LimitComma);
    }

    #[test]
    fn test_transient_codes() {
        let pg = driver(EngineKind::Postgres);
        assert!(pg.is_transient(Some("40P01"), "deadlock detected"));
        assert!(pg.is_transient(Some("40p01"), "deadlock detected"));
        assert!(!pg.is_transient(Some("42601"), "syntax error at or near"));

        let mysql = driver(EngineKind::MySql);
        assert!(mysql.is_transient(Some("1213"), "Deadlock found"));
        assert!(mysql.is_transient(Some("1157"), "net error"));
        assert!(!mysql.is_transient(Some("1045"), "Access denied for user"));
        assert!(!mysql.is_transient(Some("1044"), "Access denied for user"));

        let mssql = driver(EngineKind::SqlServer);
        assert!(mssql.is_transient(Some("40143"), "service error"));
        assert!(!mssql.is_transient(Some("18456"), "Login failed"));
    }

    #[test]
    fn test_timeout_message_is_transient() {
        let mssql = driver(EngineKind::SqlServer);
        assert!(mssql.is_transient(None, "Execution Timeout Expired"));
        assert!(mssql.is_transient(Some("18456"), "connection timed out"));
    }

    #[test]
    fn test_procedure_call_per_engine() {
        let params = [QueryParam::new("region", "EU"), QueryParam::new("@year", 2024)];

        assert_eq!(
            driver(EngineKind::SqlServer).procedure_call("dbo.GetSales", &params).unwrap(),
            "EXEC dbo.GetSales @region, @year"
        );
        assert_eq!(
            driver(EngineKind::SqlServer).procedure_call("[dbo].[Ping]", &[]).unwrap(),
            "EXEC [dbo].[Ping]"
        );
        assert_eq!(
            driver(EngineKind::MySql).procedure_call("get_sales", &params).unwrap(),
            "CALL get_sales(@region, @year)"
        );
        assert_eq!(
            driver(EngineKind::Postgres).procedure_call("public.get_sales", &[]).unwrap(),
            "SELECT * FROM public.get_sales()"
        );
    }

    #[test]
    fn test_procedure_name_is_validated() {
        let mssql = driver(EngineKind::SqlServer);
        for bad in ["", "1proc", "dbo.proc; DROP TABLE x", "a.b.c.d", "proc()"] {
            assert!(
                matches!(mssql.procedure_call(bad, &[]), Err(SqlAnalyzerError::InvalidInput { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_version_formatting() {
        let mut row = serde_json::Map::new();
        row.insert("version".to_string(), json!("16.0.1000.6"));
        row.insert("level".to_string(), json!("RTM"));
        row.insert("edition".to_string(), json!("Developer Edition (64-bit)"));
        let result = QueryResult {
            columns: vec!["version".into(), "level".into(), "edition".into()],
            rows: vec![QueryRow::from(row)],
        };

        assert_eq!(
            driver(EngineKind::SqlServer).format_version(&result),
            "SQL Server 16.0.1000.6 RTM - Developer Edition (64-bit)"
        );
        assert_eq!(
            driver(EngineKind::MySql).format_version(&QueryResult::default()),
            "MySQL (unknown version)"
        );
    }
}
