//! Resilient multi-engine database access core for SQL Analyzer.
//!
//! The crate opens connections to SQL Server, PostgreSQL and MySQL through
//! one [`ConnectionHandle`] abstraction and layers the operational pieces on
//! top of it: retries and circuit breakers, connection pooling, adaptive
//! timeouts, a query cache, dialect-aware query rewriting, and an analyzer
//! framework that turns schema metadata into findings.
//!
//! # Security Guarantees
//! - Passwords never appear in logs, error messages, or `Debug` output
//! - Parsed passwords are held in zeroizing buffers
//! - Connection strings are validated before any connection is attempted
//!
//! # Feature Flags
//! - `postgresql`: PostgreSQL driver (sqlx)
//! - `mysql`: MySQL driver (sqlx)
//! - `mssql`: SQL Server driver (tiberius)
//!
//! An engine whose feature is compiled out fails with `UnsupportedFeature`
//! when a connection to it is opened.

#[cfg(not(any(feature = "postgresql", feature = "mysql", feature = "mssql")))]
compile_error!("at least one of the `postgresql`, `mysql` or `mssql` features must be enabled");

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod pool;
pub mod resilience;
pub mod security;
pub mod timeout;

// Re-export commonly used types
pub use analyzer::{AnalysisResult, Finding, Severity, TableInfo, analyze_tables, run_analysis};
pub use cache::{CacheEntryOptions, QueryCache};
pub use config::CoreConfig;
pub use connection::{ConnectionHandle, ConnectionOptions, QueryParam, QueryResult};
pub use error::{Result, SqlAnalyzerError, redact_connection_string};
pub use factory::{ConnectionFactory, DefaultEngineDetector, EngineDetector};
pub use models::EngineKind;
pub use optimizer::QueryOptimizer;
pub use pool::{ConnectionPoolManager, PoolSettings};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, RetryPolicy};
pub use security::{ConnectionStringValidator, ValidationResult};
pub use timeout::{TimeoutCalculator, TimeoutOptions};
