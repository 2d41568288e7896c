//! # Connection Manager
//!
//! Owns the process-wide [`DatabaseHandle`]. The handle is created once, on
//! first use, and shared by every caller. With
//! [`RetentionPolicy::cache_handle_across_reloads`] set, creation goes through
//! the [`ProcessRegistry`] so a manager rebuilt during a development reload
//! reuses the existing handle. With [`RetentionPolicy::eager_connect`] set,
//! [`ConnectionManager::startup`] connects immediately and logs the outcome.
//!
//! The manager never listens for process signals itself; the entry point
//! calls [`ConnectionManager::shutdown`] from its own hook.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use futures_util::future::BoxFuture;

use crate::config::{DatabaseConfig, RetentionPolicy};
use crate::database::{DatabaseHandle, TransactionScope, DATABASE_RESOURCE};
use crate::error::{DatabaseError, DatabaseResult};
use crate::instrumentation::{QueryTimer, TimingObserver, TracingObserver};
use crate::registry::ProcessRegistry;

/// Lifecycle owner of the relational database handle
pub struct ConnectionManager {
    config: DatabaseConfig,
    policy: RetentionPolicy,
    registry: Arc<ProcessRegistry>,
    observer: Arc<dyn TimingObserver>,
    handle: OnceCell<Arc<DatabaseHandle>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("handle", &self.handle.get())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager; no handle exists until [`ConnectionManager::get_handle`]
    pub fn new(
        config: DatabaseConfig,
        policy: RetentionPolicy,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let observer = Arc::new(TracingObserver::new(config.query_log_level));
        Self {
            config,
            policy,
            registry,
            observer,
            handle: OnceCell::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Replace the default tracing observer for timing records
    pub fn with_observer(mut self, observer: Arc<dyn TimingObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// The shared handle, created on first call
    ///
    /// Repeated calls return the same `Arc`. Creating the handle spawns the
    /// pool's maintenance task, so this runs on a Tokio runtime.
    pub async fn get_handle(&self) -> DatabaseResult<Arc<DatabaseHandle>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(shut_down_error());
        }

        let handle = self
            .handle
            .get_or_try_init(|| self.create_handle())
            .map(Arc::clone)?;

        self.release_if_shut_down(handle).await
    }

    /// A shutdown that ran while the handle was being created may have found
    /// the cell empty; close the handle here so it is not left open.
    async fn release_if_shut_down(
        &self,
        handle: Arc<DatabaseHandle>,
    ) -> DatabaseResult<Arc<DatabaseHandle>> {
        if !self.shut_down.load(Ordering::SeqCst) {
            return Ok(handle);
        }

        if handle.disconnect().await? {
            debug!("Closed database handle created during shutdown");
        }
        self.forget_registered(&handle);
        Err(shut_down_error())
    }

    fn forget_registered(&self, handle: &Arc<DatabaseHandle>) {
        if !self.policy.cache_handle_across_reloads {
            return;
        }
        if let Some(registered) = self.registry.get::<DatabaseHandle>(DATABASE_RESOURCE) {
            if Arc::ptr_eq(&registered, handle) {
                self.registry.remove(DATABASE_RESOURCE);
            }
        }
    }

    fn create_handle(&self) -> DatabaseResult<Arc<DatabaseHandle>> {
        let open = || {
            let timer = QueryTimer::new(DATABASE_RESOURCE, Arc::clone(&self.observer));
            DatabaseHandle::open(&self.config, timer).map(Arc::new)
        };

        if self.policy.cache_handle_across_reloads {
            self.registry.get_or_try_insert_with(DATABASE_RESOURCE, open)
        } else {
            open()
        }
    }

    /// Start-up hook run once by the entry point
    ///
    /// With eager connect enabled the connection is established now. A failure
    /// is logged and not returned; the first operation that needs the
    /// database will surface it.
    #[instrument(skip(self))]
    pub async fn startup(&self) {
        if !self.policy.eager_connect {
            debug!("Deferring database connection until first use");
            return;
        }

        let handle = match self.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to connect to database: {}", e);
                return;
            }
        };

        match handle.connect().await {
            Ok(()) => info!("Successfully connected to database"),
            Err(e) => error!("Failed to connect to database: {}", e),
        }
    }

    /// Run `f` atomically against the shared handle
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope) -> BoxFuture<'s, Result<T, E>>,
        E: From<DatabaseError>,
    {
        let handle = self.get_handle().await?;
        handle.transaction(f).await
    }

    /// Close the handle
    ///
    /// Safe to call any number of times; only the first call closes anything
    /// and later calls wait for it to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> DatabaseResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);

        let Some(handle) = self.handle.get() else {
            debug!("No database handle was created, nothing to close");
            return Ok(());
        };

        handle.disconnect().await.map_err(|e| {
            error!("Error disconnecting from database: {}", e);
            DatabaseError::Shutdown(e.to_string())
        })?;

        self.forget_registered(handle);
        Ok(())
    }
}

fn shut_down_error() -> DatabaseError {
    DatabaseError::Connection("connection manager has been shut down".to_string())
}
