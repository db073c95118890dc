//! Connection pooling over factory-created handles.
//!
//! Pools are keyed by engine and a fingerprint of the connection string, so
//! two strings that differ only in credentials or options get separate
//! pools. Each pool keeps idle [`ConnectionHandle`]s; [`acquire`] hands one
//! out wrapped in a [`PooledConnection`] and [`release`] parks it again.
//! Statistics come from the manager's own bookkeeping, not from the drivers.
//!
//! [`acquire`]: ConnectionPoolManager::acquire
//! [`release`]: ConnectionPoolManager::release

mod settings;

pub use settings::{PoolKeyNames, PoolSettings, configure_pool};

use crate::Result;
use crate::connection::{ConnectionHandle, driver};
use crate::error::{SqlAnalyzerError, redact_connection_string};
use crate::factory::ConnectionFactory;
use crate::models::EngineKind;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    engine: EngineKind,
    fingerprint: u64,
}

impl PoolKey {
    fn new(connection_string: &str, engine: EngineKind) -> Self {
        let mut hasher = DefaultHasher::new();
        connection_string.trim().hash(&mut hasher);
        Self {
            engine,
            fingerprint: hasher.finish(),
        }
    }
}

struct Pool {
    redacted: String,
    engine: EngineKind,
    idle: Mutex<Vec<ConnectionHandle>>,
    active: AtomicUsize,
    created: AtomicU64,
    disposed: AtomicU64,
    last_accessed: StdMutex<DateTime<Utc>>,
}

impl Pool {
    fn new(connection_string: &str, engine: EngineKind) -> Self {
        Self {
            redacted: redact_connection_string(connection_string),
            engine,
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
            last_accessed: StdMutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self
            .last_accessed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn last_accessed(&self) -> DateTime<Utc> {
        *self
            .last_accessed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispose_all(&self, mut handles: Vec<ConnectionHandle>) {
        let count = handles.len() as u64;
        for handle in &mut handles {
            handle.dispose().await;
        }
        self.disposed.fetch_add(count, Ordering::Relaxed);
    }

    async fn drain(&self) -> usize {
        let handles = std::mem::take(&mut *self.idle.lock().await);
        let count = handles.len();
        self.dispose_all(handles).await;
        count
    }
}

/// Keeps the pool's active count accurate even when a pooled connection is
/// dropped instead of released.
struct ActiveGuard {
    pool: Arc<Pool>,
}

impl ActiveGuard {
    fn new(pool: Arc<Pool>) -> Self {
        pool.active.fetch_add(1, Ordering::Relaxed);
        Self { pool }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A connection checked out of a pool.
///
/// Dereferences to the underlying [`ConnectionHandle`]. Hand it back with
/// [`ConnectionPoolManager::release`]; dropping it closes the connection
/// instead of returning it.
pub struct PooledConnection {
    handle: ConnectionHandle,
    guard: ActiveGuard,
}

impl PooledConnection {
    /// Engine of the pool the connection came from.
    pub fn pool_engine(&self) -> EngineKind {
        self.guard.pool.engine
    }

    /// Detaches the handle from the pool.
    pub fn into_inner(self) -> ConnectionHandle {
        self.handle
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = ConnectionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.handle
    }
}

/// Outcome of [`ConnectionPoolManager::warm_pool`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupReport {
    /// Connections requested
    pub requested: usize,
    /// Connections opened and tested
    pub succeeded: usize,
    /// Connections that failed to open or test
    pub failed: usize,
    /// One message per failure
    pub errors: Vec<String>,
}

/// Snapshot of one pool's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    /// Connection string with the password masked
    pub connection_string: String,
    pub engine: EngineKind,
    /// Connections currently checked out
    pub active: usize,
    /// Idle connections ready for reuse
    pub available: usize,
    /// `active + available`
    pub total: usize,
    /// Connections opened for this pool
    pub created: u64,
    /// Connections closed by this pool
    pub disposed: u64,
    /// Last acquire, release or warm-up; `None` when the pool does not exist
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
    /// Probes that succeeded
    pub successful: u32,
    /// Probes that failed
    pub failed: u32,
}

/// Per-target pools of idle connections.
pub struct ConnectionPoolManager {
    factory: Arc<ConnectionFactory>,
    settings: PoolSettings,
    pools: RwLock<HashMap<PoolKey, Arc<Pool>>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("settings", &self.settings)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionPoolManager {
    /// Creates a manager with default [`PoolSettings`].
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self {
            factory,
            settings: PoolSettings::default(),
            pools: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Replaces the pool settings.
    ///
    /// # Errors
    /// Returns `Configuration` when the settings are invalid.
    pub fn with_settings(mut self, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    /// Settings in effect.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Checks out an idle connection or opens a new one.
    ///
    /// Idle handles that were closed underneath the pool, or still hold a
    /// transaction, are disposed and skipped.
    ///
    /// # Errors
    /// Returns `InvalidState` after [`shutdown`](Self::shutdown), or any
    /// validation or connection error from opening a new handle.
    pub async fn acquire(
        &self,
        connection_string: &str,
        engine: EngineKind,
    ) -> Result<PooledConnection> {
        self.ensure_running()?;
        let pool = self.pool_for(connection_string, engine).await;
        pool.touch();

        loop {
            let candidate = pool.idle.lock().await.pop();
            let Some(mut handle) = candidate else {
                break;
            };
            if handle.is_open() && handle.transaction().is_none() {
                debug!(connection_id = %handle.id(), "Reusing pooled connection");
                return Ok(PooledConnection {
                    handle,
                    guard: ActiveGuard::new(pool),
                });
            }
            handle.dispose().await;
            pool.disposed.fetch_add(1, Ordering::Relaxed);
        }

        let handle = self.factory.create_connection_with_engine(connection_string, engine)?;
        let handle = open_tested(handle).await?;
        pool.created.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = %handle.id(), engine = %engine, "Opened pooled connection");
        Ok(PooledConnection {
            handle,
            guard: ActiveGuard::new(pool),
        })
    }

    /// Returns a connection to its pool.
    ///
    /// The connection is disposed instead when it is no longer open, still
    /// holds a transaction, the pool is full, or the manager is shut down.
    pub async fn release(&self, connection: PooledConnection) {
        let PooledConnection { mut handle, guard } = connection;
        let pool = Arc::clone(&guard.pool);
        drop(guard);
        pool.touch();

        if !self.shutdown.load(Ordering::Acquire)
            && handle.is_open()
            && handle.transaction().is_none()
        {
            handle.set_cancellation(None);
            let mut idle = pool.idle.lock().await;
            if idle.len() + pool.active.load(Ordering::Relaxed) < self.max_pool_size() {
                idle.push(handle);
                return;
            }
        }

        debug!(connection_id = %handle.id(), "Disposing released connection");
        handle.dispose().await;
        pool.disposed.fetch_add(1, Ordering::Relaxed);
    }

    /// Opens `size` connections concurrently and parks the ones that pass the
    /// engine smoke query.
    ///
    /// Partial failure is reported, not returned. Connections beyond
    /// `max_pool_size` are closed again.
    ///
    /// # Errors
    /// Returns `InvalidInput` or `Validation` for an unusable connection
    /// string and `InvalidState` after shutdown.
    pub async fn warm_pool(
        &self,
        connection_string: &str,
        engine: EngineKind,
        size: usize,
    ) -> Result<WarmupReport> {
        self.warm(connection_string, engine, size, None).await
    }

    /// Like [`warm_pool`](Self::warm_pool), observing `token`.
    ///
    /// # Errors
    /// Returns `Cancelled` when `token` fires; connections opened so far are
    /// closed first.
    pub async fn warm_pool_cancellable(
        &self,
        connection_string: &str,
        engine: EngineKind,
        size: usize,
        token: &CancellationToken,
    ) -> Result<WarmupReport> {
        self.warm(connection_string, engine, size, Some(token)).await
    }

    /// Bookkeeping for one pool. A pool that was never used reports zeros.
    pub async fn pool_statistics(&self, connection_string: &str, engine: EngineKind) -> PoolStatistics {
        let key = PoolKey::new(connection_string, engine);
        let pool = self.pools.read().await.get(&key).cloned();
        match pool {
            Some(pool) => {
                let available = pool.idle.lock().await.len();
                let active = pool.active.load(Ordering::Relaxed);
                PoolStatistics {
                    connection_string: pool.redacted.clone(),
                    engine: pool.engine,
                    active,
                    available,
                    total: active + available,
                    created: pool.created.load(Ordering::Relaxed),
                    disposed: pool.disposed.load(Ordering::Relaxed),
                    last_accessed: Some(pool.last_accessed()),
                }
            }
            None => PoolStatistics {
                connection_string: redact_connection_string(connection_string),
                engine,
                active: 0,
                available: 0,
                total: 0,
                created: 0,
                disposed: 0,
                last_accessed: None,
            },
        }
    }

    /// Disposes a pool's idle connections and forgets its statistics.
    ///
    /// Returns the number of connections disposed. Connections checked out
    /// at the time are disposed when released.
    pub async fn clear_pool(&self, connection_string: &str, engine: EngineKind) -> usize {
        let key = PoolKey::new(connection_string, engine);
        let removed = self.pools.write().await.remove(&key);
        let Some(pool) = removed else {
            return 0;
        };
        let cleared = pool.drain().await;
        info!(
            engine = %engine,
            target = %pool.redacted,
            cleared = cleared,
            "Cleared connection pool"
        );
        cleared
    }

    /// Writes `settings` into the connection string for `engine`.
    ///
    /// # Errors
    /// As [`configure_pool`](settings::configure_pool).
    pub fn configure_pool(
        &self,
        connection_string: &str,
        settings: &PoolSettings,
        engine: EngineKind,
    ) -> Result<String> {
        settings.validate()?;
        let configured = configure_pool(connection_string, settings, engine)?;
        debug!(
            engine = %engine,
            min = settings.min_pool_size,
            max = settings.max_pool_size,
            "Configured pool settings"
        );
        Ok(configured)
    }

    /// Opens a fresh connection, runs the smoke query, and times it.
    pub async fn monitor_pool_health(&self, connection_string: &str, engine: EngineKind) -> PoolHealth {
        let started = Instant::now();
        let outcome = match self
            .factory
            .create_connection_with_engine(connection_string, engine)
        {
            Ok(handle) => open_tested(handle).await,
            Err(err) => Err(err),
        };
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = match outcome {
            Ok(mut handle) => {
                handle.dispose().await;
                Ok(())
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => PoolHealth {
                healthy: true,
                message: format!("{} connection healthy", engine.display_name()),
                checked_at: Utc::now(),
                response_time_ms,
                successful: 1,
                failed: 0,
            },
            Err(err) => {
                warn!(
                    engine = %engine,
                    target = %redact_connection_string(connection_string),
                    error = %err,
                    "Pool health check failed"
                );
                PoolHealth {
                    healthy: false,
                    message: err.to_string(),
                    checked_at: Utc::now(),
                    response_time_ms,
                    successful: 0,
                    failed: 1,
                }
            }
        }
    }

    /// Disposes every idle connection and refuses further use.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<Arc<Pool>> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        let mut disposed = 0;
        for pool in &pools {
            disposed += pool.drain().await;
        }
        info!(pools = pools.len(), disposed = disposed, "Connection pool manager shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SqlAnalyzerError::invalid_state(
                "Connection pool manager has been shut down",
            ));
        }
        Ok(())
    }

    fn max_pool_size(&self) -> usize {
        usize::try_from(self.settings.max_pool_size).unwrap_or(usize::MAX)
    }

    async fn pool_for(&self, connection_string: &str, engine: EngineKind) -> Arc<Pool> {
        let key = PoolKey::new(connection_string, engine);
        if let Some(pool) = self.pools.read().await.get(&key) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().await;
        Arc::clone(
            pools
                .entry(key)
                .or_insert_with(|| Arc::new(Pool::new(connection_string, engine))),
        )
    }

    async fn warm(
        &self,
        connection_string: &str,
        engine: EngineKind,
        size: usize,
        token: Option<&CancellationToken>,
    ) -> Result<WarmupReport> {
        self.ensure_running()?;
        let mut report = WarmupReport {
            requested: size,
            ..WarmupReport::default()
        };
        if size == 0 {
            return Ok(report);
        }

        let handles = (0..size)
            .map(|_| {
                self.factory
                    .create_connection_with_engine(connection_string, engine)
                    .map(|handle| match token {
                        Some(token) => handle.with_cancellation(token.clone()),
                        None => handle,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = self.pool_for(connection_string, engine).await;
        pool.touch();
        info!(engine = %engine, target = %pool.redacted, size = size, "Warming connection pool");

        let mut opened = Vec::with_capacity(size);
        for outcome in join_all(handles.into_iter().map(open_tested)).await {
            match outcome {
                Ok(handle) => opened.push(handle),
                Err(err) => report.errors.push(err.to_string()),
            }
        }
        report.succeeded = opened.len();
        report.failed = report.errors.len();

        if token.is_some_and(CancellationToken::is_cancelled) {
            warn!(engine = %engine, opened = opened.len(), "Pool warm-up cancelled");
            for handle in &mut opened {
                handle.dispose().await;
            }
            return Err(SqlAnalyzerError::cancelled("warm connection pool"));
        }

        pool.created.fetch_add(opened.len() as u64, Ordering::Relaxed);
        let surplus = {
            let mut idle = pool.idle.lock().await;
            let room = self
                .max_pool_size()
                .saturating_sub(idle.len() + pool.active.load(Ordering::Relaxed));
            let keep = opened.len().min(room);
            let surplus = opened.split_off(keep);
            for mut handle in opened {
                handle.set_cancellation(None);
                idle.push(handle);
            }
            surplus
        };
        if !surplus.is_empty() {
            debug!(surplus = surplus.len(), "Pool full; closing surplus connections");
            pool.dispose_all(surplus).await;
        }

        info!(
            engine = %engine,
            requested = report.requested,
            succeeded = report.succeeded,
            failed = report.failed,
            "Connection pool warmed"
        );
        Ok(report)
    }
}

/// Opens `handle` and runs the engine smoke query; disposes it on failure.
async fn open_tested(mut handle: ConnectionHandle) -> Result<ConnectionHandle> {
    let test_query = driver(handle.engine()).test_query;
    let outcome = match handle.open().await {
        Ok(()) => handle.execute_scalar(test_query, &[]).await.map(|_| ()),
        Err(err) => Err(err),
    };
    match outcome {
        Ok(()) => Ok(handle),
        Err(err) => {
            handle.dispose().await;
            Err(err)
        }
    }
}
