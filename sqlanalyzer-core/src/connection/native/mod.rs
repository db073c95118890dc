//! Native driver connections, one closed enum variant per compiled-in engine.
//!
//! # Module Structure
//! - `postgres`: sqlx `PgConnection` (feature `postgresql`)
//! - `mysql`: sqlx `MySqlConnection` (feature `mysql`)
//! - `mssql`: tiberius TDS client over tokio TCP (feature `mssql`)
//!
//! Driver errors are classified here, at the boundary, into
//! [`SqlAnalyzerError::Backend`] or [`SqlAnalyzerError::Connection`] so the
//! rest of the crate only ever sees `is_transient()`.

use super::descriptor::ConnectParams;
use super::engine::driver;
use super::params::{QueryParam, bind_parameters, split_statements};
use super::result::QueryResult;
use crate::Result;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;

#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgresql")]
mod postgres;

/// An open native connection.
pub(crate) enum NativeConnection {
    #[cfg(feature = "postgresql")]
    Postgres(sqlx::PgConnection),
    #[cfg(feature = "mysql")]
    MySql(sqlx::MySqlConnection),
    #[cfg(feature = "mssql")]
    SqlServer(Box<mssql::TdsClient>),
}

fn driver_not_compiled(engine: EngineKind) -> SqlAnalyzerError {
    SqlAnalyzerError::unsupported_feature(
        format!(
            "{} driver (compile with --features {})",
            engine.display_name(),
            engine.feature_name()
        ),
        engine.display_name(),
    )
}

impl NativeConnection {
    /// Opens a connection, bounded by the connect timeout in `params`.
    pub(crate) async fn connect(engine: EngineKind, params: &ConnectParams) -> Result<Self> {
        let timeout = params.connect_timeout;
        match tokio::time::timeout(timeout, Self::connect_engine(engine, params)).await {
            Ok(result) => result,
            Err(_) => Err(SqlAnalyzerError::Timeout {
                operation: format!("connect to {} at {}:{}", engine, params.host, params.port),
                after: timeout,
            }),
        }
    }

    async fn connect_engine(engine: EngineKind, params: &ConnectParams) -> Result<Self> {
        match engine {
            #[cfg(feature = "postgresql")]
            EngineKind::Postgres => postgres::connect(params).await.map(Self::Postgres),
            #[cfg(not(feature = "postgresql"))]
            EngineKind::Postgres => Err(driver_not_compiled(engine)),

            #[cfg(feature = "mysql")]
            EngineKind::MySql => mysql::connect(params).await.map(Self::MySql),
            #[cfg(not(feature = "mysql"))]
            EngineKind::MySql => Err(driver_not_compiled(engine)),

            #[cfg(feature = "mssql")]
            EngineKind::SqlServer => mssql::connect(params)
                .await
                .map(|client| Self::SqlServer(Box::new(client))),
            #[cfg(not(feature = "mssql"))]
            EngineKind::SqlServer => Err(driver_not_compiled(engine)),
        }
    }

    /// Engine behind this connection.
    pub(crate) fn engine(&self) -> EngineKind {
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(_) => EngineKind::Postgres,
            #[cfg(feature = "mysql")]
            Self::MySql(_) => EngineKind::MySql,
            #[cfg(feature = "mssql")]
            Self::SqlServer(_) => EngineKind::SqlServer,
        }
    }

    /// Runs one statement and returns its rows.
    pub(crate) async fn query(&mut self, sql: &str, params: &[QueryParam]) -> Result<QueryResult> {
        let bound = bind_parameters(sql, params, driver(self.engine()).placeholder);
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(conn) => postgres::fetch(conn, &bound.sql, &bound.values).await,
            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::fetch(conn, &bound.sql, &bound.values).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::fetch(client, &bound.sql, &bound.values).await,
        }
    }

    /// Runs a batch and returns one result per result set.
    ///
    /// SQL Server streams every result set of the batch natively; the sqlx
    /// engines run each top-level statement in turn.
    pub(crate) async fn query_multiple(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<QueryResult>> {
        let style = driver(self.engine()).placeholder;
        match self {
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => {
                let bound = bind_parameters(sql, params, style);
                mssql::fetch_all_results(client, &bound.sql, &bound.values).await
            }
            #[allow(unreachable_patterns)]
            _ => {
                let mut results = Vec::new();
                for statement in split_statements(sql) {
                    let bound = bind_parameters(&statement, params, style);
                    results.push(self.fetch_bound(&bound.sql, &bound.values).await?);
                }
                Ok(results)
            }
        }
    }

    async fn fetch_bound(
        &mut self,
        sql: &str,
        values: &[super::params::ParamValue],
    ) -> Result<QueryResult> {
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(conn) => postgres::fetch(conn, sql, values).await,
            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::fetch(conn, sql, values).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::fetch(client, sql, values).await,
        }
    }

    /// Runs one statement and returns the number of affected rows.
    pub(crate) async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64> {
        let bound = bind_parameters(sql, params, driver(self.engine()).placeholder);
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(conn) => postgres::execute(conn, &bound.sql, &bound.values).await,
            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::execute(conn, &bound.sql, &bound.values).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::execute(client, &bound.sql, &bound.values).await,
        }
    }

    /// Sends unparameterized text such as transaction control statements.
    pub(crate) async fn execute_raw(&mut self, sql: &str) -> Result<()> {
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(conn) => postgres::execute_raw(conn, sql).await,
            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::execute_raw(conn, sql).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::execute_raw(client, sql).await,
        }
    }

    /// Closes the connection gracefully.
    pub(crate) async fn close(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgresql")]
            Self::Postgres(conn) => postgres::close(conn).await,
            #[cfg(feature = "mysql")]
            Self::MySql(conn) => mysql::close(conn).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::close(*client).await,
        }
    }
}

/// Error code and transient flag for an sqlx error.
#[cfg(any(feature = "postgresql", feature = "mysql"))]
fn classify_sqlx(engine: EngineKind, err: &sqlx::Error) -> (Option<String>, bool) {
    let table = driver(engine);
    match err {
        sqlx::Error::Database(db_err) => {
            let code = sqlx_database_code(engine, db_err.as_ref());
            let transient = table.is_transient(code.as_deref(), db_err.message());
            (code, transient)
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => (None, true),
        other => (None, table.is_transient(None, &other.to_string())),
    }
}

/// MySQL reports its numeric error (1205, 1213, ...) separately from the
/// SQLSTATE; every other engine uses the SQLSTATE.
#[cfg(any(feature = "postgresql", feature = "mysql"))]
fn sqlx_database_code(
    engine: EngineKind,
    db_err: &(dyn sqlx::error::DatabaseError + 'static),
) -> Option<String> {
    #[cfg(feature = "mysql")]
    if engine == EngineKind::MySql
        && let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
    {
        return Some(mysql_err.number().to_string());
    }
    let _ = engine;
    db_err.code().map(|c| c.into_owned())
}

/// Converts an sqlx statement error into a classified backend error.
#[cfg(any(feature = "postgresql", feature = "mysql"))]
pub(super) fn sqlx_error(engine: EngineKind, err: sqlx::Error) -> SqlAnalyzerError {
    let (code, transient) = classify_sqlx(engine, &err);
    let message = match &err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        other => other.to_string(),
    };
    SqlAnalyzerError::Backend {
        engine,
        code,
        transient,
        message,
    }
}

/// Converts an sqlx connect error into a connection error without credentials.
#[cfg(any(feature = "postgresql", feature = "mysql"))]
pub(super) fn sqlx_connect_error(
    engine: EngineKind,
    params: &ConnectParams,
    err: sqlx::Error,
) -> SqlAnalyzerError {
    let (_, transient) = classify_sqlx(engine, &err);
    SqlAnalyzerError::connection_failed(
        format!(
            "could not connect to {} at {}:{}",
            engine, params.host, params.port
        ),
        transient,
        err,
    )
}

/// Renders binary column data as a `0x`-prefixed hex string.
pub(super) fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// JSON number from a float, `Null` for NaN and infinities.
pub(super) fn float_value(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x00, 0xab, 0x10]), "0x00ab10");
        assert_eq!(hex_string(&[]), "0x");
    }

    #[test]
    fn test_float_value() {
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
        assert_eq!(float_value(f64::NAN), serde_json::Value::Null);
    }

    #[cfg(feature = "postgresql")]
    #[test]
    fn test_io_errors_are_transient() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let classified = sqlx_error(EngineKind::Postgres, err);
        assert!(classified.is_transient());
    }

    #[cfg(feature = "postgresql")]
    #[test]
    fn test_pool_timeout_is_transient_and_config_errors_are_not() {
        assert!(sqlx_error(EngineKind::Postgres, sqlx::Error::PoolTimedOut).is_transient());
        assert!(!sqlx_error(EngineKind::Postgres, sqlx::Error::RowNotFound).is_transient());
    }
}
