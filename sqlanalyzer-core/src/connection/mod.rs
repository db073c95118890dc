//! Engine-neutral connection handle over the native drivers.
//!
//! A [`ConnectionHandle`] owns at most one native connection and at most one
//! transaction. Every operation takes `&mut self`, so a handle is never
//! shared between tasks; pooling hands out whole handles instead.
//!
//! # Lifecycle
//! `Created -> Open -> Closed`, and from any state to `Disposed`. A disposed
//! handle fails fast with `InvalidState`. Handles created by a
//! [`ConnectionFactory`](crate::factory::ConnectionFactory) are also disposed
//! when the factory is.
//!
//! # Cancellation and timeouts
//! Statements are bounded by [`ConnectionOptions::command_timeout`] and by an
//! optional [`CancellationToken`]. A cancelled or timed-out statement leaves
//! the wire protocol mid-stream, so the handle rolls back what it can, closes
//! the native connection, and reports the error. The handle can be reopened.
//!
//! # Module Structure
//! - `descriptor`: connection target and native connect parameters
//! - `engine`: static per-engine dispatch table
//! - `params`: named parameters and per-engine placeholder rewriting
//! - `result`: rows and typed accessors
//! - `native`: the closed enum of compiled-in drivers

mod descriptor;
mod engine;
mod native;
mod options;
mod params;
mod result;

pub use descriptor::{ConnectParams, ConnectionDescriptor};
pub use engine::{EngineDriver, PaginationStyle, PlaceholderStyle, driver};
pub use options::ConnectionOptions;
pub use params::{BoundQuery, ParamValue, QueryParam, bind_parameters, split_statements};
pub use result::{QueryResult, QueryRow};

use crate::Result;
use crate::error::SqlAnalyzerError;
use crate::models::EngineKind;
use crate::resilience::RetryPolicy;
use chrono::{DateTime, Utc};
use native::NativeConnection;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never opened
    Created,
    /// Native connection established
    Open,
    /// Closed; may be reopened
    Closed,
    /// Terminal
    Disposed,
}

/// Outcome of the most recent transaction on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Begun and not yet finished
    Active,
    /// Committed
    Committed,
    /// Rolled back, explicitly or by close, dispose or cancellation
    RolledBack,
}

/// Token identifying a transaction begun on a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle {
    /// Unique transaction id
    pub id: Uuid,
    /// When the transaction began
    pub started_at: DateTime<Utc>,
}

/// Cancellation sources and deadline for one operation.
///
/// Owned copies, so the guarded future may borrow the native connection.
#[derive(Clone)]
struct OperationGuard {
    lifetime: CancellationToken,
    cancellation: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl OperationGuard {
    async fn run<T>(&self, operation: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let bounded = async {
            match self.timeout {
                Some(after) => match tokio::time::timeout(after, work).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SqlAnalyzerError::Timeout {
                        operation: operation.to_string(),
                        after,
                    }),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            () = self.lifetime.cancelled() => Err(SqlAnalyzerError::cancelled(operation)),
            () = crate::resilience::cancelled(self.cancellation.as_ref()) => {
                Err(SqlAnalyzerError::cancelled(operation))
            }
            outcome = bounded => outcome,
        }
    }
}

/// An exclusively owned database connection.
pub struct ConnectionHandle {
    id: Uuid,
    descriptor: ConnectionDescriptor,
    options: ConnectionOptions,
    retry: RetryPolicy,
    state: ConnectionState,
    native: Option<NativeConnection>,
    transaction: Option<TransactionHandle>,
    last_transaction: Option<TransactionState>,
    lifetime: CancellationToken,
    cancellation: Option<CancellationToken>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Creates an unopened handle.
    pub fn new(
        descriptor: ConnectionDescriptor,
        options: ConnectionOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            options,
            retry,
            state: ConnectionState::Created,
            native: None,
            transaction: None,
            last_transaction: None,
            lifetime: CancellationToken::new(),
            cancellation: None,
            created_at: Utc::now(),
        }
    }

    /// Ties the handle to an owner; cancelling `lifetime` disposes it.
    pub(crate) fn with_lifetime(mut self, lifetime: CancellationToken) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Attaches a cancellation token observed by every later operation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Replaces or removes the attached cancellation token.
    pub fn set_cancellation(&mut self, token: Option<CancellationToken>) {
        self.cancellation = token;
    }

    /// Unique handle id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Engine of the target.
    pub fn engine(&self) -> EngineKind {
        self.descriptor.engine()
    }

    /// Connection target.
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Options in effect.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current lifecycle state. Reports `Disposed` once the owning factory
    /// has been disposed.
    pub fn state(&self) -> ConnectionState {
        if self.lifetime.is_cancelled() {
            return ConnectionState::Disposed;
        }
        self.state
    }

    /// True while the native connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Active transaction, if any.
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    /// `Active` during a transaction, otherwise the outcome of the last one.
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.last_transaction
    }

    /// When the handle was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Opens the native connection through the retry policy.
    ///
    /// # Errors
    /// Returns `InvalidState` after disposal, `Cancelled`, or the last
    /// connection error once retries are exhausted.
    pub async fn open(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        let engine = self.engine();
        let params = self
            .descriptor
            .connect_params(self.options.connect_timeout)?;
        let guard = self.guard(None);
        let retry = self.retry.clone();
        let connecting = retry.execute("open connection", || NativeConnection::connect(engine, &params));

        let native = match guard.run("open connection", connecting).await {
            Ok(native) => native,
            Err(err) => {
                if self.lifetime.is_cancelled() {
                    self.state = ConnectionState::Disposed;
                }
                return Err(err);
            }
        };

        self.native = Some(native);
        self.state = ConnectionState::Open;
        info!(
            connection_id = %self.id,
            engine = %engine,
            target = %self.descriptor,
            "Connection opened"
        );
        Ok(())
    }

    /// Rolls back any active transaction and closes the native connection.
    ///
    /// A no-op unless the handle is open.
    ///
    /// # Errors
    /// Returns `InvalidState` after disposal.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        self.shutdown().await;
        self.state = ConnectionState::Closed;
        debug!(connection_id = %self.id, "Connection closed");
        Ok(())
    }

    /// Releases everything and marks the handle unusable.
    ///
    /// Rolls back an active transaction and closes the native connection
    /// first; a factory stops tracking the handle afterwards.
    pub async fn dispose(&mut self) {
        if self.state == ConnectionState::Disposed {
            return;
        }
        self.shutdown().await;
        self.state = ConnectionState::Disposed;
        self.lifetime.cancel();
        debug!(connection_id = %self.id, "Connection disposed");
    }

    /// Begins a transaction.
    ///
    /// # Errors
    /// Returns `InvalidState` when the handle is not open or a transaction is
    /// already active, otherwise any driver error.
    pub async fn begin_transaction(&mut self) -> Result<TransactionHandle> {
        self.ensure_usable()?;
        if self.state != ConnectionState::Open {
            return Err(SqlAnalyzerError::invalid_state(
                "Connection must be open to begin a transaction",
            ));
        }
        if self.transaction.is_some() {
            return Err(SqlAnalyzerError::invalid_state(
                "A transaction is already in progress",
            ));
        }

        let statement = driver(self.engine()).begin_statement;
        self.run_raw("begin transaction", statement).await?;

        let handle = TransactionHandle {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        self.transaction = Some(handle.clone());
        self.last_transaction = Some(TransactionState::Active);
        debug!(connection_id = %self.id, transaction_id = %handle.id, "Transaction started");
        Ok(handle)
    }

    /// Commits the active transaction.
    ///
    /// On failure the transaction stays active so the caller can roll back.
    ///
    /// # Errors
    /// Returns `InvalidState` when no transaction is active.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let Some(transaction) = self.transaction.clone() else {
            return Err(SqlAnalyzerError::invalid_state(
                "No active transaction to commit",
            ));
        };

        let statement = driver(self.engine()).commit_statement;
        self.run_raw("commit transaction", statement).await?;
        self.transaction = None;
        self.last_transaction = Some(TransactionState::Committed);
        debug!(connection_id = %self.id, transaction_id = %transaction.id, "Transaction committed");
        Ok(())
    }

    /// Rolls back the active transaction.
    ///
    /// # Errors
    /// Returns `InvalidState` when no transaction is active.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let Some(transaction) = self.transaction.clone() else {
            return Err(SqlAnalyzerError::invalid_state(
                "No active transaction to roll back",
            ));
        };

        let statement = driver(self.engine()).rollback_statement;
        let outcome = self.run_raw("rollback transaction", statement).await;
        // The server discards the transaction either way
        self.transaction = None;
        self.last_transaction = Some(TransactionState::RolledBack);
        debug!(connection_id = %self.id, transaction_id = %transaction.id, "Transaction rolled back");
        outcome
    }

    /// First column of the first row, `Null` when there are no rows.
    ///
    /// # Errors
    /// Returns `InvalidState` when not open, `Timeout`, `Cancelled`, or a
    /// driver error.
    pub async fn execute_scalar(
        &mut self,
        query: &str,
        params: &[QueryParam],
    ) -> Result<serde_json::Value> {
        Ok(self.execute_query(query, params).await?.scalar())
    }

    /// Runs a query and returns all rows.
    ///
    /// # Errors
    /// Returns `InvalidState` when not open, `Timeout`, `Cancelled`, or a
    /// driver error.
    pub async fn execute_query(&mut self, query: &str, params: &[QueryParam]) -> Result<QueryResult> {
        let guard = self.ready_guard()?;
        let native = self.native_mut()?;
        let outcome = guard.run("execute query", native.query(query, params)).await;
        self.settle(outcome).await
    }

    /// Runs a batch and returns one result per result set.
    ///
    /// # Errors
    /// Returns `InvalidState` when not open, `Timeout`, `Cancelled`, or a
    /// driver error.
    pub async fn execute_multiple(
        &mut self,
        query: &str,
        params: &[QueryParam],
    ) -> Result<Vec<QueryResult>> {
        let guard = self.ready_guard()?;
        let native = self.native_mut()?;
        let outcome = guard
            .run("execute batch", native.query_multiple(query, params))
            .await;
        self.settle(outcome).await
    }

    /// Runs a statement and returns the number of affected rows.
    ///
    /// # Errors
    /// Returns `InvalidState` when not open, `Timeout`, `Cancelled`, or a
    /// driver error.
    pub async fn execute_non_query(&mut self, query: &str, params: &[QueryParam]) -> Result<u64> {
        let guard = self.ready_guard()?;
        let native = self.native_mut()?;
        let outcome = guard
            .run("execute statement", native.execute(query, params))
            .await;
        self.settle(outcome).await
    }

    /// Calls a stored routine, passing `params` positionally.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a malformed routine name, otherwise as
    /// [`execute_query`](Self::execute_query).
    pub async fn execute_stored_procedure(
        &mut self,
        name: &str,
        params: &[QueryParam],
    ) -> Result<QueryResult> {
        let statement = driver(self.engine()).procedure_call(name, params)?;
        debug!(connection_id = %self.id, procedure = name.trim(), "Calling stored procedure");
        self.execute_query(&statement, params).await
    }

    /// Opens the connection if needed and runs the engine smoke query.
    ///
    /// Connection and query failures are reported as `Ok(false)`.
    ///
    /// # Errors
    /// Returns `InvalidState` after disposal and `Cancelled` on cancellation.
    pub async fn test_connection(&mut self) -> Result<bool> {
        let outcome = match self.open().await {
            Ok(()) => {
                let test_query = driver(self.engine()).test_query;
                self.execute_scalar(test_query, &[]).await.map(|_| ())
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(_) => Ok(true),
            Err(err @ (SqlAnalyzerError::InvalidState { .. } | SqlAnalyzerError::Cancelled { .. })) => {
                Err(err)
            }
            Err(err) => {
                warn!(
                    connection_id = %self.id,
                    target = %self.descriptor,
                    error = %err,
                    "Connection test failed"
                );
                Ok(false)
            }
        }
    }

    /// Human-readable server version.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query).
    pub async fn get_version(&mut self) -> Result<String> {
        let engine = driver(self.engine());
        let result = self.execute_query(engine.version_query, &[]).await?;
        Ok(engine.format_version(&result))
    }

    /// Database size in megabytes.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query).
    pub async fn get_size_mb(&mut self) -> Result<f64> {
        let result = self
            .execute_query(driver(self.engine()).size_query, &[])
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get_f64("size_mb"))
            .unwrap_or(0.0))
    }

    fn ensure_usable(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disposed && self.lifetime.is_cancelled() {
            // Owner is gone; drop the socket without further round trips
            self.native = None;
            if self.transaction.take().is_some() {
                self.last_transaction = Some(TransactionState::RolledBack);
            }
            self.state = ConnectionState::Disposed;
        }
        if self.state == ConnectionState::Disposed {
            return Err(SqlAnalyzerError::invalid_state(
                "Connection has been disposed",
            ));
        }
        Ok(())
    }

    fn ready_guard(&mut self) -> Result<OperationGuard> {
        self.ensure_usable()?;
        if self.state != ConnectionState::Open {
            return Err(SqlAnalyzerError::invalid_state("Connection is not open"));
        }
        Ok(self.guard(Some(self.options.command_timeout)))
    }

    fn guard(&self, timeout: Option<Duration>) -> OperationGuard {
        OperationGuard {
            lifetime: self.lifetime.clone(),
            cancellation: self.cancellation.clone(),
            timeout,
        }
    }

    fn native_mut(&mut self) -> Result<&mut NativeConnection> {
        self.native
            .as_mut()
            .ok_or_else(|| SqlAnalyzerError::invalid_state("Connection is not open"))
    }

    async fn run_raw(&mut self, operation: &'static str, statement: &str) -> Result<()> {
        let guard = self.ready_guard()?;
        let native = self.native_mut()?;
        let outcome = guard.run(operation, native.execute_raw(statement)).await;
        self.settle(outcome).await
    }

    /// Tears the connection down after a cancellation or timeout.
    async fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(err) = &outcome
            && matches!(
                err,
                SqlAnalyzerError::Cancelled { .. } | SqlAnalyzerError::Timeout { .. }
            )
        {
            warn!(connection_id = %self.id, error = %err, "Operation aborted, closing connection");
            self.shutdown().await;
            self.state = if self.lifetime.is_cancelled() {
                ConnectionState::Disposed
            } else {
                ConnectionState::Closed
            };
        }
        outcome
    }

    /// Best-effort rollback and close, each bounded by the cleanup timeout.
    async fn shutdown(&mut self) {
        let grace = self.options.cleanup_timeout;
        let Some(mut native) = self.native.take() else {
            self.transaction = None;
            return;
        };

        if let Some(transaction) = self.transaction.take() {
            let statement = driver(native.engine()).rollback_statement;
            match tokio::time::timeout(grace, native.execute_raw(statement)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(transaction_id = %transaction.id, error = %err, "Rollback during close failed");
                }
                Err(_) => warn!(transaction_id = %transaction.id, "Rollback during close timed out"),
            }
            self.last_transaction = Some(TransactionState::RolledBack);
        }

        match tokio::time::timeout(grace, native.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(connection_id = %self.id, error = %err, "Close reported an error"),
            Err(_) => debug!(connection_id = %self.id, "Close timed out, dropping socket"),
        }
    }
}
