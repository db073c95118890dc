//! Immutable description of a connection target.
//!
//! # Security
//! - The raw connection string is held in a `Zeroizing` container and never
//!   printed; `Debug` and `Display` show the redacted form only
//! - [`ConnectParams`] keeps the password in `Zeroizing<String>`

use crate::error::{SqlAnalyzerError, redact_connection_string};
use crate::models::EngineKind;
use crate::security::{ConnectionKeys, keys};
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Native connect parameters derived from a connection string.
#[derive(Clone)]
pub struct ConnectParams {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Database to connect to
    pub database: Option<String>,
    /// Login name
    pub user: Option<String>,
    /// Login password, zeroed on drop
    pub password: Zeroizing<String>,
    /// Windows / SSPI authentication requested
    pub integrated_security: bool,
    /// Skip server certificate validation
    pub trust_server_certificate: bool,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Remaining keys not consumed above, lowercased
    pub extra: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"****")
            .field("integrated_security", &self.integrated_security)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

const CONSUMED_KEYS: &[&str] = &[
    keys::SERVER,
    keys::PORT,
    keys::DATABASE,
    keys::USER_ID,
    keys::PASSWORD,
    keys::INTEGRATED_SECURITY,
    keys::TRUST_SERVER_CERTIFICATE,
    keys::CONNECT_TIMEOUT,
];

/// Splits SQL Server style `tcp:host,port` and `host:port` server values.
fn split_server(server: &str) -> (String, Option<&str>) {
    let server = server
        .strip_prefix("tcp:")
        .or_else(|| server.strip_prefix("TCP:"))
        .unwrap_or(server);

    if let Some((host, port)) = server.split_once(',') {
        return (host.trim().to_string(), Some(port.trim()));
    }
    // A single colon is host:port; more than one is an IPv6 literal
    if server.matches(':').count() == 1
        && let Some((host, port)) = server.split_once(':')
    {
        return (host.trim().to_string(), Some(port.trim()));
    }
    (server.trim().to_string(), None)
}

fn parse_port(value: &str) -> Result<u16> {
    value.parse::<u16>().map_err(|_| {
        SqlAnalyzerError::invalid_input(format!("port '{}' is not a valid TCP port", value))
    })
}

impl ConnectParams {
    /// Builds parameters for `engine` from a normalized key map.
    ///
    /// # Errors
    /// Returns `InvalidInput` when a port or timeout value is not numeric.
    pub fn from_keys(
        engine: EngineKind,
        parsed: &ConnectionKeys,
        default_connect_timeout: Duration,
    ) -> Result<Self> {
        let (host, inline_port) = parsed
            .get_non_empty(keys::SERVER)
            .map_or_else(|| ("localhost".to_string(), None), split_server);

        let port = match parsed.get_non_empty(keys::PORT).or(inline_port) {
            Some(value) => parse_port(value)?,
            None => engine.default_port(),
        };

        let connect_timeout = match parsed.get_non_empty(keys::CONNECT_TIMEOUT) {
            Some(value) => {
                let seconds = value.parse::<u64>().map_err(|_| {
                    SqlAnalyzerError::invalid_input(format!(
                        "connect timeout '{}' is not a number of seconds",
                        value
                    ))
                })?;
                Duration::from_secs(seconds.max(1))
            }
            None => default_connect_timeout,
        };

        let extra = parsed
            .iter()
            .filter(|(key, _)| !CONSUMED_KEYS.contains(key))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        Ok(Self {
            host,
            port,
            database: parsed.get_non_empty(keys::DATABASE).map(str::to_string),
            user: parsed.get_non_empty(keys::USER_ID).map(str::to_string),
            password: Zeroizing::new(parsed.get(keys::PASSWORD).unwrap_or_default().to_string()),
            integrated_security: parsed.is_enabled(keys::INTEGRATED_SECURITY),
            trust_server_certificate: parsed.is_enabled(keys::TRUST_SERVER_CERTIFICATE),
            connect_timeout,
            extra,
        })
    }
}

/// Connection target: engine, server, database and the secret-bearing raw
/// string, fixed at construction.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    raw: Zeroizing<String>,
    engine: EngineKind,
    server: String,
    database: Option<String>,
    keys: ConnectionKeys,
}

impl ConnectionDescriptor {
    /// Parses a connection string for a known engine.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the string is empty or unparseable.
    pub fn new(connection_string: &str, engine: EngineKind) -> Result<Self> {
        let parsed = ConnectionKeys::parse(connection_string)
            .map_err(|e| SqlAnalyzerError::invalid_input(e.to_string()))?;

        let server = parsed
            .get_non_empty(keys::SERVER)
            .map_or_else(|| "localhost".to_string(), |s| split_server(s).0);
        let database = parsed.get_non_empty(keys::DATABASE).map(str::to_string);

        Ok(Self {
            raw: Zeroizing::new(connection_string.to_string()),
            engine,
            server,
            database,
            keys: parsed,
        })
    }

    /// Engine this target speaks.
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Server host name.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Database name, if the connection string names one.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Connection string with the password masked.
    pub fn redacted(&self) -> String {
        redact_connection_string(&self.raw)
    }

    /// Native connect parameters.
    ///
    /// # Errors
    /// Returns `InvalidInput` for malformed port or timeout values.
    pub fn connect_params(&self, default_connect_timeout: Duration) -> Result<ConnectParams> {
        super::engine::driver(self.engine).parse(&self.keys, default_connect_timeout)
    }

    /// Raw connection string, for pool keying only.
    pub(crate) fn raw(&self) -> &str {
        &self.raw
    }

    /// Schema findings fall back to when an object name has none.
    ///
    /// MySQL has no schema layer, so the database name stands in.
    pub fn default_schema(&self) -> Option<String> {
        self.engine
            .default_schema()
            .map(str::to_string)
            .or_else(|| self.database.clone())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("engine", &self.engine)
            .field("server", &self.server)
            .field("database", &self.database)
            .field("connection_string", &self.redacted())
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.engine, self.server)?;
        if let Some(database) = &self.database {
            write!(f, "/{}", database)?;
        }
        Ok(())
    }
}
