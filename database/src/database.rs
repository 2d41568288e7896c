//! # Relational Database Handle
//!
//! The single shared SQL client handle of the process, built on an SQLx
//! `AnyPool` so the same code runs against PostgreSQL in deployment and
//! SQLite locally. Every data operation goes through the [`QueryTimer`].

use futures_util::future::BoxFuture;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::query::{Query, QueryScalar};
use sqlx::{Any, AnyPool, Execute, FromRow, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DatabaseResult};
use crate::instrumentation::{Operation, QueryTimer};

/// Resource kind of the relational handle
pub const DATABASE_RESOURCE: &str = "database";

/// Shared relational database client handle
pub struct DatabaseHandle {
    pool: AnyPool,
    timer: QueryTimer,
    connected: AtomicBool,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("size", &self.pool.size())
            .finish()
    }
}

impl DatabaseHandle {
    /// Build the handle without touching the network
    ///
    /// Fails only when the URL cannot be parsed; the first connection is
    /// established by [`DatabaseHandle::connect`] or by the first operation.
    /// The pool spawns its maintenance task here, so a Tokio runtime must be
    /// running.
    #[instrument(skip(config, timer), fields(max_connections = config.max_connections))]
    pub fn open(config: &DatabaseConfig, timer: QueryTimer) -> DatabaseResult<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_lazy(&config.database_url)
            .map_err(|e| {
                DatabaseError::Configuration(format!("invalid database url: {}", e))
            })?;

        debug!("Database handle created");

        Ok(Self {
            pool,
            timer,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        })
    }

    /// Establish a connection now rather than on first use
    #[instrument(skip(self))]
    pub async fn connect(&self) -> DatabaseResult<()> {
        if self.is_closed() {
            return Err(DatabaseError::Connection(
                "database handle has been closed".to_string(),
            ));
        }

        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        drop(conn);

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.pool.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the handle
    ///
    /// Returns `true` for the call that actually closed it. Concurrent callers
    /// wait for the in-flight close to finish and then return `false`.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> DatabaseResult<bool> {
        let _guard = self.close_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!("Database handle already closed");
            return Ok(false);
        }

        self.pool.close().await;
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);

        info!("Successfully disconnected from database");
        Ok(true)
    }

    /// Check database health
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.execute(Operation::new("health", "check"), sqlx::query("SELECT 1"))
            .await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run a statement that returns no rows
    pub async fn execute<'q>(
        &self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<AnyQueryResult> {
        debug!(sql = query.sql(), "{}", op);
        Ok(self.timer.intercept(op, query.execute(&self.pool)).await?)
    }

    pub async fn fetch_one<'q>(
        &self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<AnyRow> {
        debug!(sql = query.sql(), "{}", op);
        Ok(self.timer.intercept(op, query.fetch_one(&self.pool)).await?)
    }

    pub async fn fetch_optional<'q>(
        &self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<Option<AnyRow>> {
        debug!(sql = query.sql(), "{}", op);
        Ok(self
            .timer
            .intercept(op, query.fetch_optional(&self.pool))
            .await?)
    }

    pub async fn fetch_all<'q>(
        &self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<Vec<AnyRow>> {
        debug!(sql = query.sql(), "{}", op);
        Ok(self.timer.intercept(op, query.fetch_all(&self.pool)).await?)
    }

    /// Fetch the first column of the first row
    pub async fn fetch_scalar<'q, O>(
        &self,
        op: Operation<'_>,
        query: QueryScalar<'q, Any, O, AnyArguments<'q>>,
    ) -> DatabaseResult<O>
    where
        O: Send + Unpin,
        (O,): Send + Unpin + for<'r> FromRow<'r, AnyRow>,
    {
        debug!(sql = query.sql(), "{}", op);
        Ok(self.timer.intercept(op, query.fetch_one(&self.pool)).await?)
    }

    /// Run `f` inside a single transaction
    ///
    /// Commits when `f` returns `Ok`. When it returns `Err` everything done
    /// through the scope is rolled back and that error is returned as is.
    #[instrument(skip(self, f))]
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope) -> BoxFuture<'s, Result<T, E>>,
        E: From<DatabaseError>,
    {
        debug!("Starting database transaction");

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("failed to begin: {}", e)))?;
        let mut scope = TransactionScope {
            tx,
            timer: self.timer.clone(),
        };

        match f(&mut scope).await {
            Ok(value) => {
                scope.tx.commit().await.map_err(|e| {
                    DatabaseError::Transaction(format!("failed to commit: {}", e))
                })?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = scope.tx.rollback().await {
                    // The connection is discarded with the transaction, so the
                    // server still never commits these writes.
                    warn!("Rollback failed: {}", e);
                } else {
                    debug!("Transaction rolled back");
                }
                Err(err)
            }
        }
    }

    /// Get connection pool size
    pub fn pool_size(&self) -> u32 {
        self.pool.size()
    }

    /// Get number of idle connections
    pub fn idle_connections(&self) -> u32 {
        self.pool.num_idle() as u32
    }
}

/// Data-access capability handed to a transaction callback
///
/// Carries the same instrumented operations as [`DatabaseHandle`], applied in
/// call order to one transaction. Lifecycle operations are not available here.
pub struct TransactionScope {
    tx: Transaction<'static, Any>,
    timer: QueryTimer,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope").finish_non_exhaustive()
    }
}

impl TransactionScope {
    pub async fn execute<'q>(
        &mut self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<AnyQueryResult> {
        debug!(sql = query.sql(), "{} (tx)", op);
        Ok(self.timer.intercept(op, query.execute(&mut *self.tx)).await?)
    }

    pub async fn fetch_one<'q>(
        &mut self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<AnyRow> {
        debug!(sql = query.sql(), "{} (tx)", op);
        Ok(self.timer.intercept(op, query.fetch_one(&mut *self.tx)).await?)
    }

    pub async fn fetch_optional<'q>(
        &mut self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<Option<AnyRow>> {
        debug!(sql = query.sql(), "{} (tx)", op);
        Ok(self
            .timer
            .intercept(op, query.fetch_optional(&mut *self.tx))
            .await?)
    }

    pub async fn fetch_all<'q>(
        &mut self,
        op: Operation<'_>,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> DatabaseResult<Vec<AnyRow>> {
        debug!(sql = query.sql(), "{} (tx)", op);
        Ok(self.timer.intercept(op, query.fetch_all(&mut *self.tx)).await?)
    }

    pub async fn fetch_scalar<'q, O>(
        &mut self,
        op: Operation<'_>,
        query: QueryScalar<'q, Any, O, AnyArguments<'q>>,
    ) -> DatabaseResult<O>
    where
        O: Send + Unpin,
        (O,): Send + Unpin + for<'r> FromRow<'r, AnyRow>,
    {
        debug!(sql = query.sql(), "{} (tx)", op);
        Ok(self.timer.intercept(op, query.fetch_one(&mut *self.tx)).await?)
    }
}
