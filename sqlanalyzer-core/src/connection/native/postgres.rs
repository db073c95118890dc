//! PostgreSQL over sqlx.

use super::{float_value, sqlx_connect_error, sqlx_error};
use crate::Result;
use crate::connection::descriptor::ConnectParams;
use crate::connection::params::ParamValue;
use crate::connection::result::QueryResult;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection, Postgres, Row};

pub(super) async fn connect(params: &ConnectParams) -> Result<PgConnection> {
    let mut options = PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .application_name("sqlanalyzer");

    if let Some(user) = &params.user {
        options = options.username(user);
    }
    if !params.password.is_empty() {
        options = options.password(params.password.as_str());
    }
    if let Some(database) = &params.database {
        options = options.database(database);
    }
    if let Some(mode) = params.extra.get("sslmode") {
        let mode = mode.to_lowercase().parse::<PgSslMode>().map_err(|_| {
            SqlAnalyzerError::invalid_input(format!("unsupported PostgreSQL sslmode '{}'", mode))
        })?;
        options = options.ssl_mode(mode);
    }

    tracing::debug!(host = %params.host, port = params.port, "Connecting to PostgreSQL");
    PgConnection::connect_with(&options)
        .await
        .map_err(|e| sqlx_connect_error(EngineKind::Postgres, params, e))
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ParamValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ParamValue::Null => query.bind(None::<String>),
        ParamValue::Bool(b) => query.bind(*b),
        ParamValue::Int(i) => query.bind(*i),
        ParamValue::Float(f) => query.bind(*f),
        ParamValue::Text(s) => query.bind(s.clone()),
    }
}

pub(super) async fn fetch(
    conn: &mut PgConnection,
    sql: &str,
    values: &[ParamValue],
) -> Result<QueryResult> {
    let query = values.iter().fold(sqlx::query(sql), bind);
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| sqlx_error(EngineKind::Postgres, e))?;
    Ok(to_result(&rows))
}

pub(super) async fn execute(conn: &mut PgConnection, sql: &str, values: &[ParamValue]) -> Result<u64> {
    let query = values.iter().fold(sqlx::query(sql), bind);
    let done = query
        .execute(&mut *conn)
        .await
        .map_err(|e| sqlx_error(EngineKind::Postgres, e))?;
    Ok(done.rows_affected())
}

pub(super) async fn execute_raw(conn: &mut PgConnection, sql: &str) -> Result<()> {
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql))
        .await
        .map_err(|e| sqlx_error(EngineKind::Postgres, e))?;
    Ok(())
}

pub(super) async fn close(conn: PgConnection) -> Result<()> {
    conn.close()
        .await
        .map_err(|e| sqlx_error(EngineKind::Postgres, e))
}

fn to_result(rows: &[PgRow]) -> QueryResult {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_string()).collect()
    });
    let values = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| extract_column_value(row, i)).collect())
        .collect();
    QueryResult::from_positional(columns, values)
}

/// Decodes one column by probing compatible Rust types in order.
///
/// `NUMERIC` has no lossless mapping without extra sqlx features; metadata
/// queries cast such columns to `float8` or `bigint`.
fn extract_column_value(row: &PgRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, float_value);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return v.map_or(Value::Null, |f| float_value(f64::from(f)));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Value::Null, Value::Bool);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return v.map_or(Value::Null, |t| Value::String(t.to_rfc3339()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v.map_or(Value::Null, |t| Value::String(t.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v.map_or(Value::Null, |d| Value::String(d.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(index) {
        return v.map_or(Value::Null, |u| Value::String(u.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, |b| Value::String(super::hex_string(&b)));
    }

    Value::Null
}
