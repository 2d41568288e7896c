//! # Cache Client
//!
//! Typed get/set/clear over the shared key-value handle. Values travel as
//! JSON strings. A missing or expired key reads back as `None`; a payload
//! that no longer decodes is reported as [`CacheError::Read`] so callers can
//! tell "never set" from "corrupt".

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::config::{CacheConfig, RetentionPolicy};
use crate::error::{CacheError, CacheResult};
use crate::registry::ProcessRegistry;
use crate::store::{KeyValueStore, MemoryStore, RedisStore, MAX_TTL_SECONDS};

/// Resource kind of the cache handle
pub const CACHE_RESOURCE: &str = "cache";

/// Shared key-value client handle
pub struct CacheHandle {
    store: Arc<dyn KeyValueStore>,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CacheHandle {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Connect if not already connected
    pub async fn ensure_connected(&self) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::Unavailable(
                "cache handle has been closed".to_string(),
            ));
        }
        if self.store.is_connected() {
            return Ok(());
        }

        // Connection failures are logged by the store itself.
        self.store.connect().await
    }

    /// Close the handle; returns `true` for the call that actually closed it
    pub async fn close(&self) -> CacheResult<bool> {
        let _guard = self.close_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        self.store.close().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(true)
    }
}

/// Lifecycle owner of the cache handle plus the typed cache operations
pub struct CacheClient {
    config: CacheConfig,
    policy: RetentionPolicy,
    registry: Arc<ProcessRegistry>,
    store: Option<Arc<dyn KeyValueStore>>,
    handle: OnceCell<Arc<CacheHandle>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("policy", &self.policy)
            .field("handle", &self.handle.get())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl CacheClient {
    /// Create a client whose store is built from `config` on first use
    pub fn new(config: CacheConfig, policy: RetentionPolicy, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            policy,
            registry,
            store: None,
            handle: OnceCell::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a client over an already constructed store
    pub fn with_store(
        store: Arc<dyn KeyValueStore>,
        policy: RetentionPolicy,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::new(CacheConfig::default(), policy, registry)
        }
    }

    fn build_store(&self) -> CacheResult<Arc<dyn KeyValueStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        if self.config.is_in_memory() {
            debug!("Using in-process cache store");
            return Ok(Arc::new(MemoryStore::new()));
        }
        Ok(Arc::new(RedisStore::open(&self.config.redis_url)?))
    }

    fn create_handle(&self) -> CacheResult<Arc<CacheHandle>> {
        let open = || self.build_store().map(|store| Arc::new(CacheHandle::new(store)));

        if self.policy.cache_handle_across_reloads {
            self.registry.get_or_try_insert_with(CACHE_RESOURCE, open)
        } else {
            open()
        }
    }

    /// The shared handle, connected before it is returned
    pub async fn get_handle(&self) -> CacheResult<Arc<CacheHandle>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(shut_down_error());
        }

        let handle = self
            .handle
            .get_or_try_init(|| self.create_handle())
            .map(Arc::clone)?;
        let handle = self.release_if_shut_down(handle).await?;
        handle.ensure_connected().await?;
        Ok(handle)
    }

    /// Close a handle created while a concurrent shutdown found none
    async fn release_if_shut_down(
        &self,
        handle: Arc<CacheHandle>,
    ) -> CacheResult<Arc<CacheHandle>> {
        if !self.shut_down.load(Ordering::SeqCst) {
            return Ok(handle);
        }

        if handle.close().await? {
            debug!("Closed cache handle created during shutdown");
        }
        self.forget_registered(&handle);
        Err(shut_down_error())
    }

    fn forget_registered(&self, handle: &Arc<CacheHandle>) {
        if !self.policy.cache_handle_across_reloads {
            return;
        }
        if let Some(registered) = self.registry.get::<CacheHandle>(CACHE_RESOURCE) {
            if Arc::ptr_eq(&registered, handle) {
                self.registry.remove(CACHE_RESOURCE);
            }
        }
    }

    /// Start-up hook; connects right away when eager connect is enabled
    #[instrument(skip(self))]
    pub async fn startup(&self) {
        if !self.policy.eager_connect {
            debug!("Deferring cache connection until first use");
            return;
        }

        match self.get_handle().await {
            Ok(_) => info!("Successfully connected to cache"),
            Err(e) => error!("Failed to connect to cache: {}", e),
        }
    }

    /// Serialize `value` and store it under `key`
    ///
    /// A `ttl_seconds` of `None` or `Some(0)` means the entry never expires.
    /// Longer TTLs than [`MAX_TTL_SECONDS`] are capped to it.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set_cache<T>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(value).map_err(|source| CacheError::Write {
            key: key.to_string(),
            source,
        })?;

        let handle = self.get_handle().await?;
        match ttl_seconds {
            Some(seconds) if seconds > 0 => {
                let seconds = seconds.min(MAX_TTL_SECONDS);
                handle.store().set_with_expiry(key, payload, seconds).await?;
                debug!("Set key {} with TTL: {}s", key, seconds);
            }
            _ => {
                handle.store().set(key, payload).await?;
                debug!("Set key {} without TTL", key);
            }
        }

        Ok(())
    }

    /// Read and decode the value under `key`; `None` when absent or expired
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_cache<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let handle = self.get_handle().await?;

        match handle.store().get(key).await? {
            Some(payload) => {
                let value = serde_json::from_slice(&payload).map_err(|source| {
                    CacheError::Read {
                        key: key.to_string(),
                        source,
                    }
                })?;
                debug!("Cache hit for key: {}", key);
                Ok(Some(value))
            }
            None => {
                debug!("Cache miss for key: {}", key);
                Ok(None)
            }
        }
    }

    /// Remove `key`; a missing key is not an error
    #[instrument(skip(self), fields(key = %key))]
    pub async fn clear_cache(&self, key: &str) -> CacheResult<()> {
        let handle = self.get_handle().await?;
        handle.store().delete(key).await
    }

    /// Round-trip to the store
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> CacheResult<()> {
        let handle = self.get_handle().await?;
        handle.store().ping().await?;
        debug!("Cache health check passed");
        Ok(())
    }

    /// Close the handle; repeated calls are no-ops
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);

        let Some(handle) = self.handle.get() else {
            debug!("No cache handle was created, nothing to close");
            return Ok(());
        };

        if handle.close().await? {
            info!("Successfully disconnected from cache");
        }

        self.forget_registered(handle);
        Ok(())
    }
}

fn shut_down_error() -> CacheError {
    CacheError::Unavailable("cache client has been shut down".to_string())
}
