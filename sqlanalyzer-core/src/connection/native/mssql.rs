//! SQL Server over tiberius (TDS) on a tokio TCP stream.

use super::{float_value, hex_string};
use crate::Result;
use crate::connection::descriptor::ConnectParams;
use crate::connection::engine::driver;
use crate::connection::params::ParamValue;
use crate::connection::result::QueryResult;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use serde_json::Value;
use std::borrow::Cow;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// TDS client type used by the connection enum.
pub(crate) type TdsClient = Client<Compat<TcpStream>>;

impl ToSql for ParamValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Self::Null => ColumnData::String(None),
            Self::Bool(b) => ColumnData::Bit(Some(*b)),
            Self::Int(i) => ColumnData::I64(Some(*i)),
            Self::Float(f) => ColumnData::F64(Some(*f)),
            Self::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

fn param_refs(values: &[ParamValue]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}

fn classify(err: &tiberius::error::Error) -> (Option<String>, bool) {
    use tiberius::error::Error;

    let table = driver(EngineKind::SqlServer);
    match err {
        Error::Server(token) => {
            let code = token.code().to_string();
            let transient = table.is_transient(Some(&code), token.message());
            (Some(code), transient)
        }
        Error::Io { .. } | Error::Routing { .. } => (None, true),
        other => (None, table.is_transient(None, &other.to_string())),
    }
}

fn backend_error(err: tiberius::error::Error) -> SqlAnalyzerError {
    let (code, transient) = classify(&err);
    let message = match &err {
        tiberius::error::Error::Server(token) => token.message().to_string(),
        other => other.to_string(),
    };
    SqlAnalyzerError::Backend {
        engine: EngineKind::SqlServer,
        code,
        transient,
        message,
    }
}

fn connect_error(params: &ConnectParams, err: tiberius::error::Error) -> SqlAnalyzerError {
    let (_, transient) = classify(&err);
    SqlAnalyzerError::connection_failed(
        format!("could not connect to SQL Server at {}:{}", params.host, params.port),
        transient,
        err,
    )
}

fn io_connect_error(params: &ConnectParams, err: std::io::Error) -> SqlAnalyzerError {
    SqlAnalyzerError::connection_failed(
        format!("could not reach SQL Server at {}:{}", params.host, params.port),
        true,
        err,
    )
}

async fn open_stream(config: &Config, params: &ConnectParams) -> Result<Compat<TcpStream>> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| io_connect_error(params, e))?;
    tcp.set_nodelay(true)
        .map_err(|e| io_connect_error(params, e))?;
    Ok(tcp.compat_write())
}

pub(super) async fn connect(params: &ConnectParams) -> Result<TdsClient> {
    if params.integrated_security {
        return Err(SqlAnalyzerError::unsupported_feature(
            "Integrated Security",
            "SQL Server over TCP (use SQL authentication)",
        ));
    }

    let mut config = Config::new();
    config.host(&params.host);
    config.port(params.port);
    config.application_name("sqlanalyzer");
    if let Some(database) = &params.database {
        config.database(database);
    }
    config.authentication(AuthMethod::sql_server(
        params.user.as_deref().unwrap_or_default(),
        params.password.as_str(),
    ));
    if params.trust_server_certificate {
        config.trust_cert();
    }
    if params
        .extra
        .get("encrypt")
        .is_some_and(|v| matches!(v.to_lowercase().as_str(), "false" | "no" | "optional"))
    {
        config.encryption(EncryptionLevel::Off);
    }

    tracing::debug!(host = %params.host, port = params.port, "Connecting to SQL Server");
    let stream = open_stream(&config, params).await?;
    match Client::connect(config.clone(), stream).await {
        Ok(client) => Ok(client),
        // Azure SQL gateways redirect the login to the node hosting the database
        Err(tiberius::error::Error::Routing { host, port }) => {
            tracing::debug!(host = %host, port = port, "SQL Server login redirected");
            config.host(&host);
            config.port(port);
            let stream = open_stream(&config, params).await?;
            Client::connect(config, stream)
                .await
                .map_err(|e| connect_error(params, e))
        }
        Err(e) => Err(connect_error(params, e)),
    }
}

pub(super) async fn fetch(
    client: &mut TdsClient,
    sql: &str,
    values: &[ParamValue],
) -> Result<QueryResult> {
    let refs = param_refs(values);
    let rows = client
        .query(sql, &refs)
        .await
        .map_err(backend_error)?
        .into_first_result()
        .await
        .map_err(backend_error)?;
    Ok(to_result(&rows))
}

pub(super) async fn fetch_all_results(
    client: &mut TdsClient,
    sql: &str,
    values: &[ParamValue],
) -> Result<Vec<QueryResult>> {
    let refs = param_refs(values);
    let result_sets = client
        .query(sql, &refs)
        .await
        .map_err(backend_error)?
        .into_results()
        .await
        .map_err(backend_error)?;
    Ok(result_sets.iter().map(|rows| to_result(rows)).collect())
}

pub(super) async fn execute(client: &mut TdsClient, sql: &str, values: &[ParamValue]) -> Result<u64> {
    let refs = param_refs(values);
    let done = client.execute(sql, &refs).await.map_err(backend_error)?;
    Ok(done.total())
}

/// Sends a plain SQL batch; transaction control must not run inside
/// `sp_executesql`, which checks the transaction count on exit.
pub(super) async fn execute_raw(client: &mut TdsClient, sql: &str) -> Result<()> {
    client
        .simple_query(sql)
        .await
        .map_err(backend_error)?
        .into_results()
        .await
        .map_err(backend_error)?;
    Ok(())
}

pub(super) async fn close(client: TdsClient) -> Result<()> {
    client.close().await.map_err(backend_error)
}

fn to_result(rows: &[Row]) -> QueryResult {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_string()).collect()
    });
    let values = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| extract_column_value(row, i)).collect())
        .collect();
    QueryResult::from_positional(columns, values)
}

/// Decodes one column. `BIT` is probed before the integers so it stays a
/// boolean, and `DECIMAL`/`NUMERIC` are scaled into a float.
fn extract_column_value(row: &Row, index: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<bool, _>(index) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(index) {
        return Value::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(index) {
        return Value::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(index) {
        return Value::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(index) {
        return Value::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(index) {
        return float_value(f64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(index) {
        return float_value(v);
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::numeric::Numeric, _>(index) {
        #[allow(clippy::cast_precision_loss)]
        let scaled = v.value() as f64 / 10f64.powi(i32::from(v.scale()));
        return float_value(scaled);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(index) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::Uuid, _>(index) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(index) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(index) {
        return Value::String(v.to_rfc3339());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(index) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(index) {
        return Value::String(hex_string(v));
    }

    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_to_sql() {
        assert!(matches!(ParamValue::Int(5).to_sql(), ColumnData::I64(Some(5))));
        assert!(matches!(ParamValue::Bool(true).to_sql(), ColumnData::Bit(Some(true))));
        assert!(matches!(ParamValue::Null.to_sql(), ColumnData::String(None)));
        match ParamValue::Text("dbo".into()).to_sql() {
            ColumnData::String(Some(s)) => assert_eq!(s, "dbo"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_io_errors_are_transient() {
        let err = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset".to_string(),
        };
        assert!(backend_error(err).is_transient());
    }
}
