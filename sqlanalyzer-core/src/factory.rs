//! Connection factory with validation and engine detection.
//!
//! [`ConnectionFactory::create_connection`] validates the connection string,
//! logs every warning, detects the engine through a pluggable
//! [`EngineDetector`], and hands back an unopened [`ConnectionHandle`]. The
//! factory never guesses: an undecidable string is `AmbiguousEngine`.

use crate::Result;
use crate::connection::{ConnectionDescriptor, ConnectionHandle, ConnectionOptions};
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use crate::resilience::RetryPolicy;
use crate::security::{ConnectionStringValidator, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Decides which engine a connection string targets.
pub trait EngineDetector: Send + Sync {
    /// Detects the engine.
    ///
    /// # Errors
    /// Returns `AmbiguousEngine` when the string does not identify one.
    fn detect(&self, connection_string: &str) -> Result<EngineKind>;
}

/// Ordered substring rules over the lowercased connection string.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEngineDetector;

const POSTGRES_SCHEMES: &[&str] = &["postgres://", "postgresql://"];
const MYSQL_SCHEMES: &[&str] = &["mysql://", "mariadb://"];
const SQL_SERVER_SCHEMES: &[&str] = &["mssql://", "sqlserver://"];

const MYSQL_MARKERS: &[&str] = &[
    "port=3306",
    "mysql",
    "sslmode=none",
    "allowuservariables=",
    "allowpublickeyretrieval=",
];

const SQL_SERVER_MARKERS: &[&str] = &[
    "integrated security=",
    "trusted_connection=",
    "trustservercertificate=",
    "trust server certificate=",
    "multipleactiveresultsets=",
    "multiple active result sets=",
    "data source=",
    "initial catalog=",
];

const MYSQL_USER_KEYS: &[&str] = &["uid=", "user=", "pwd=", "password="];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

impl EngineDetector for DefaultEngineDetector {
    fn detect(&self, connection_string: &str) -> Result<EngineKind> {
        let lowered = connection_string.trim().to_lowercase();

        let detected = if POSTGRES_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
            Some(EngineKind::Postgres)
        } else if MYSQL_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
            Some(EngineKind::MySql)
        } else if SQL_SERVER_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
            Some(EngineKind::SqlServer)
        } else if (lowered.contains("host=") && !lowered.contains("port=3306"))
            || lowered.contains("port=5432")
            || lowered.contains("postgres")
        {
            Some(EngineKind::Postgres)
        } else if contains_any(&lowered, MYSQL_MARKERS) {
            Some(EngineKind::MySql)
        } else if contains_any(&lowered, SQL_SERVER_MARKERS) {
            Some(EngineKind::SqlServer)
        } else if lowered.contains("server=") && lowered.contains("database=") {
            if lowered.contains("user id=") {
                Some(EngineKind::SqlServer)
            } else if contains_any(&lowered, MYSQL_USER_KEYS) {
                Some(EngineKind::MySql)
            } else {
                None
            }
        } else {
            None
        };

        match detected {
            Some(engine) => {
                debug!(engine = %engine, "Detected database engine");
                Ok(engine)
            }
            None => Err(SqlAnalyzerError::AmbiguousEngine),
        }
    }
}

/// A connection created by a factory and not yet disposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedConnection {
    /// Handle id
    pub id: Uuid,
    /// Engine of the target
    pub engine: EngineKind,
    /// `engine server/database`, no credentials
    pub target: String,
    /// When the handle was created
    pub created_at: DateTime<Utc>,
}

struct Tracked {
    info: TrackedConnection,
    lifetime: CancellationToken,
}

/// Creates connection handles and disposes them all on [`dispose`](Self::dispose).
pub struct ConnectionFactory {
    detector: Arc<dyn EngineDetector>,
    options: ConnectionOptions,
    retry: RetryPolicy,
    lifetime: CancellationToken,
    tracked: Mutex<Vec<Tracked>>,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("options", &self.options)
            .field("retry", &self.retry)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new(ConnectionOptions::default(), RetryPolicy::default())
    }
}

impl ConnectionFactory {
    /// Creates a factory using the default detector.
    pub fn new(options: ConnectionOptions, retry: RetryPolicy) -> Self {
        Self {
            detector: Arc::new(DefaultEngineDetector),
            options,
            retry,
            lifetime: CancellationToken::new(),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the engine detector.
    pub fn with_detector(mut self, detector: Arc<dyn EngineDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Options applied to every handle.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Retry policy applied to every handle.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Detects the engine with this factory's detector.
    ///
    /// # Errors
    /// Returns `AmbiguousEngine` when the string does not identify one.
    pub fn detect_engine(&self, connection_string: &str) -> Result<EngineKind> {
        self.detector.detect(connection_string)
    }

    /// Validates, detects the engine, and creates an unopened handle.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty string, `Validation` when the
    /// string fails validation, `AmbiguousEngine`, or `InvalidState` once the
    /// factory is disposed.
    pub fn create_connection(&self, connection_string: &str) -> Result<ConnectionHandle> {
        self.ensure_active()?;
        require_non_empty(connection_string)?;

        let detected = self.detector.detect(connection_string);
        let validation =
            ConnectionStringValidator::validate_for(connection_string, detected.as_ref().ok().copied());
        check_validation(&validation)?;

        let engine = detected.inspect_err(|_| {
            warn!("Unable to determine database engine from connection string");
        })?;
        self.build(connection_string, engine)
    }

    /// Like [`create_connection`](Self::create_connection) with a known
    /// engine; detection is skipped.
    ///
    /// # Errors
    /// As [`create_connection`](Self::create_connection), minus
    /// `AmbiguousEngine`.
    pub fn create_connection_with_engine(
        &self,
        connection_string: &str,
        engine: EngineKind,
    ) -> Result<ConnectionHandle> {
        self.ensure_active()?;
        require_non_empty(connection_string)?;

        let validation = ConnectionStringValidator::validate_for(connection_string, Some(engine));
        check_validation(&validation)?;
        self.build(connection_string, engine)
    }

    /// Connections created by this factory that are not yet disposed.
    pub fn tracked_connections(&self) -> Vec<TrackedConnection> {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.retain(|t| !t.lifetime.is_cancelled());
        tracked.iter().map(|t| t.info.clone()).collect()
    }

    /// Disposes every tracked connection and refuses new ones.
    ///
    /// Handles observe disposal on their next call and release their native
    /// connection then.
    pub fn dispose(&self) {
        if self.lifetime.is_cancelled() {
            return;
        }
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(connections = tracked.len(), "Disposing connection factory");
        self.lifetime.cancel();
        tracked.clear();
    }

    /// True after [`dispose`](Self::dispose).
    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SqlAnalyzerError::invalid_state(
                "Connection factory has been disposed",
            ));
        }
        Ok(())
    }

    fn build(&self, connection_string: &str, engine: EngineKind) -> Result<ConnectionHandle> {
        let descriptor = ConnectionDescriptor::new(connection_string, engine)?;
        let lifetime = self.lifetime.child_token();
        let handle = ConnectionHandle::new(descriptor, self.options.clone(), self.retry.clone())
            .with_lifetime(lifetime.clone());

        info!(engine = %engine, "Creating {} connection", engine);
        debug!(
            connection_id = %handle.id(),
            target = %handle.descriptor(),
            "Created connection"
        );

        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.retain(|t| !t.lifetime.is_cancelled());
        tracked.push(Tracked {
            info: TrackedConnection {
                id: handle.id(),
                engine,
                target: handle.descriptor().to_string(),
                created_at: handle.created_at(),
            },
            lifetime,
        });
        Ok(handle)
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

fn require_non_empty(connection_string: &str) -> Result<()> {
    if connection_string.trim().is_empty() {
        return Err(SqlAnalyzerError::invalid_input(
            "Connection string cannot be null or empty",
        ));
    }
    Ok(())
}

/// Fails on validation errors; logs warnings and the security level.
fn check_validation(validation: &ValidationResult) -> Result<()> {
    if !validation.is_valid {
        return Err(SqlAnalyzerError::Validation {
            errors: validation.error_messages(),
        });
    }
    for issue in &validation.warnings {
        warn!(code = %issue.code, "Connection string warning: {}", issue.message);
    }
    info!(
        security_level = ?validation.security_level,
        authentication = ?validation.authentication_type,
        "Connection string security level: {:?}",
        validation.security_level
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use proptest::prelude::*;

    fn detect(s: &str) -> Result<EngineKind> {
        DefaultEngineDetector.detect(s)
    }

    #[test]
    fn test_detect_sql_server() {
        for s in [
            "Server=localhost;Database=TestDB;User Id=sa;Password=Test123!;",
            "Data Source=server;Initial Catalog=db;User ID=user;Password=pass;",
            "Server=db;Database=x;Integrated Security=SSPI",
            "mssql://sa:pw@db01:1433/sales",
            "sqlserver://db01/sales",
        ] {
            assert_eq!(detect(s).unwrap(), EngineKind::SqlServer, "{s}");
        }
    }

    #[test]
    fn test_detect_postgres() {
        for s in [
            "Host=localhost;Database=testdb;Username=postgres;Password=Test123!;",
            "Server=server;Port=5432;Database=db;User Id=user;Password=pass;",
            "postgresql://app:pw@pg01/app",
            "postgres://pg01/app",
        ] {
            assert_eq!(detect(s).unwrap(), EngineKind::Postgres, "{s}");
        }
    }

    #[test]
    fn test_detect_mysql() {
        for s in [
            "Server=localhost;Database=testdb;User=root;Password=Test123!;",
            "Server=server;Port=3306;Database=db;Uid=user;Pwd=pass;",
            "Host=db;Port=3306;Database=shop;Uid=app;Pwd=x",
            "Server=db;Database=shop;SslMode=None",
            "mysql://root:pw@localhost/shop",
            "mariadb://localhost/shop",
        ] {
            assert_eq!(detect(s).unwrap(), EngineKind::MySql, "{s}");
        }
    }

    #[test]
    fn test_detect_ambiguous() {
        for s in ["Server=db;Database=x", "Server=db", "foo=bar", "Database=x;Password=p"] {
            assert!(
                matches!(detect(s), Err(SqlAnalyzerError::AmbiguousEngine)),
                "{s}"
            );
        }
    }

    #[test]
    fn test_create_connection_detects_engine() {
        let factory = ConnectionFactory::default();
        let conn = factory
            .create_connection("Host=pg01;Database=app;Username=app;Password=Zq8!wT3#pLm")
            .unwrap();

        assert_eq!(conn.engine(), EngineKind::Postgres);
        assert_eq!(conn.state(), ConnectionState::Created);
        assert_eq!(conn.descriptor().server(), "pg01");
    }

    #[test]
    fn test_create_connection_rejects_bad_input() {
        let factory = ConnectionFactory::default();

        assert!(matches!(
            factory.create_connection("   "),
            Err(SqlAnalyzerError::InvalidInput { .. })
        ));
        assert!(matches!(
            factory.create_connection("just some text"),
            Err(SqlAnalyzerError::Validation { .. })
        ));
        assert!(matches!(
            factory.create_connection("Server=db;Database=x"),
            Err(SqlAnalyzerError::AmbiguousEngine)
        ));
    }

    #[test]
    fn test_explicit_engine_bypasses_detection() {
        let factory = ConnectionFactory::default();
        let conn = factory
            .create_connection_with_engine("Server=db;Database=x", EngineKind::MySql)
            .unwrap();
        assert_eq!(conn.engine(), EngineKind::MySql);
    }

    #[test]
    fn test_custom_detector() {
        struct AlwaysMySql;
        impl EngineDetector for AlwaysMySql {
            fn detect(&self, _: &str) -> Result<EngineKind> {
                Ok(EngineKind::MySql)
            }
        }

        let factory = ConnectionFactory::default().with_detector(Arc::new(AlwaysMySql));
        let conn = factory.create_connection("Server=db;Database=x").unwrap();
        assert_eq!(conn.engine(), EngineKind::MySql);
    }

    #[tokio::test]
    async fn test_dispose_disposes_tracked_connections() {
        let factory = ConnectionFactory::default();
        let mut first = factory
            .create_connection("Server=db;Database=a;User Id=app;Password=Zq8!wT3#pLm")
            .unwrap();
        let mut second = factory
            .create_connection("Server=db;Database=b;User Id=app;Password=Zq8!wT3#pLm")
            .unwrap();
        assert_eq!(factory.tracked_connections().len(), 2);

        second.dispose().await;
        assert_eq!(factory.tracked_connections().len(), 1);
        assert_eq!(first.state(), ConnectionState::Created);

        factory.dispose();
        assert!(factory.tracked_connections().is_empty());
        assert_eq!(first.state(), ConnectionState::Disposed);
        assert!(matches!(
            first.open().await,
            Err(SqlAnalyzerError::InvalidState { .. })
        ));
        assert!(matches!(
            factory.create_connection("Host=pg;Database=x"),
            Err(SqlAnalyzerError::InvalidState { .. })
        ));
    }

    proptest! {
        #[test]
        fn detection_ignores_case(upper in proptest::bool::ANY) {
            let s = "Data Source=db;Initial Catalog=sales;User ID=app;Password=x";
            let input = if upper { s.to_uppercase() } else { s.to_lowercase() };
            prop_assert_eq!(detect(&input).unwrap(), EngineKind::SqlServer);
        }

        #[test]
        fn detection_never_panics(input in ".{0,120}") {
            let _ = detect(&input);
        }

        #[test]
        fn detected_engine_matches_explicit_engine(
            engine in prop_oneof![
                Just(EngineKind::SqlServer),
                Just(EngineKind::Postgres),
                Just(EngineKind::MySql),
            ],
            host in "[a-z][a-z0-9]{0,10}",
            database in "[a-z][a-z0-9_]{0,10}",
        ) {
            for name in [&host, &database] {
                prop_assume!(!name.contains("postgres") && !name.contains("mysql"));
            }
            let connection_string = marked_connection_string(engine, &host, &database);
            let factory = ConnectionFactory::default();

            let detected = factory.create_connection(&connection_string).unwrap();
            let explicit = factory
                .create_connection_with_engine(&connection_string, engine)
                .unwrap();

            prop_assert_eq!(detected.engine(), engine);
            prop_assert_eq!(explicit.engine(), engine);
            prop_assert_eq!(detected.descriptor().server(), explicit.descriptor().server());
            prop_assert_eq!(detected.descriptor().database(), explicit.descriptor().database());
            prop_assert_eq!(detected.descriptor().server(), host.as_str());
            prop_assert_eq!(detected.descriptor().database(), Some(database.as_str()));
            prop_assert_eq!(
                detected.descriptor().default_schema(),
                explicit.descriptor().default_schema()
            );
        }
    }

    /// Connection string carrying the detection marker for `engine`.
    fn marked_connection_string(engine: EngineKind, host: &str, database: &str) -> String {
        match engine {
            EngineKind::SqlServer => format!(
                "Data Source={host};Initial Catalog={database};User ID=app;Password=Zq8!wT3#pLm"
            ),
            EngineKind::Postgres => format!(
                "Host={host};Port=5432;Database={database};Username=app;Password=Zq8!wT3#pLm"
            ),
            EngineKind::MySql => format!(
                "Server={host};Port=3306;Database={database};Uid=app;Pwd=Zq8!wT3#pLm"
            ),
        }
    }
}
