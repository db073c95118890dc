//! MySQL over sqlx.

use super::{float_value, hex_string, sqlx_connect_error, sqlx_error};
use crate::Result;
use crate::connection::descriptor::ConnectParams;
use crate::connection::params::ParamValue;
use crate::connection::result::QueryResult;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection, MySql, Row};

fn ssl_mode(value: &str) -> Result<MySqlSslMode> {
    match value.to_lowercase().as_str() {
        "none" | "disabled" | "false" => Ok(MySqlSslMode::Disabled),
        "preferred" => Ok(MySqlSslMode::Preferred),
        "required" | "true" => Ok(MySqlSslMode::Required),
        "verifyca" | "verify_ca" | "verify-ca" => Ok(MySqlSslMode::VerifyCa),
        "verifyfull" | "verify_identity" | "verify-full" => Ok(MySqlSslMode::VerifyIdentity),
        other => Err(SqlAnalyzerError::invalid_input(format!(
            "unsupported MySQL sslmode '{}'",
            other
        ))),
    }
}

pub(super) async fn connect(params: &ConnectParams) -> Result<MySqlConnection> {
    let mut options = MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port);

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
        options = options.ssl_mode(ssl_mode(mode)?);
    }

    tracing::debug!(host = %params.host, port = params.port, "Connecting to MySQL");
    MySqlConnection::connect_with(&options)
        .await
        .map_err(|e| sqlx_connect_error(EngineKind::MySql, params, e))
}

fn bind<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &ParamValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        ParamValue::Null => query.bind(None::<String>),
        ParamValue::Bool(b) => query.bind(*b),
        ParamValue::Int(i) => query.bind(*i),
        ParamValue::Float(f) => query.bind(*f),
        ParamValue::Text(s) => query.bind(s.clone()),
    }
}

pub(super) async fn fetch(
    conn: &mut MySqlConnection,
    sql: &str,
    values: &[ParamValue],
) -> Result<QueryResult> {
    let query = values.iter().fold(sqlx::query(sql), bind);
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| sqlx_error(EngineKind::MySql, e))?;
    Ok(to_result(&rows))
}

pub(super) async fn execute(
    conn: &mut MySqlConnection,
    sql: &str,
    values: &[ParamValue],
) -> Result<u64> {
    let query = values.iter().fold(sqlx::query(sql), bind);
    let done = query
        .execute(&mut *conn)
        .await
        .map_err(|e| sqlx_error(EngineKind::MySql, e))?;
    Ok(done.rows_affected())
}

pub(super) async fn execute_raw(conn: &mut MySqlConnection, sql: &str) -> Result<()> {
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql))
        .await
        .map_err(|e| sqlx_error(EngineKind::MySql, e))?;
    Ok(())
}

pub(super) async fn close(conn: MySqlConnection) -> Result<()> {
    conn.close().await.map_err(|e| sqlx_error(EngineKind::MySql, e))
}

fn to_result(rows: &[MySqlRow]) -> QueryResult {
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
/// `information_schema` counters are `BIGINT UNSIGNED`, hence the `u64`
/// probe; `DECIMAL` aggregates are cast to `DOUBLE` by the callers.
fn extract_column_value(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<i8>, _>(index) {
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
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v.map_or(Value::Null, |t| Value::String(t.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v.map_or(Value::Null, |d| Value::String(d.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, |b| Value::String(hex_string(&b)));
    }

    Value::Null
}
