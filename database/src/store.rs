//! # Key-Value Stores
//!
//! The cache client talks to its backing store through [`KeyValueStore`].
//! [`RedisStore`] is the networked implementation; [`MemoryStore`] keeps
//! everything in process and is selected with a `memory://` URL.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::error::{is_connection_level, CacheError, CacheResult};

/// Longest expiry handed to a store
///
/// Redis rejects an expiry whose millisecond deadline does not fit in an
/// `i64`; half that range leaves room for the server clock.
pub const MAX_TTL_SECONDS: u64 = (i64::MAX as u64 / 1000) / 2;

/// Operations the cache client needs from a key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Open the connection; a no-op when already connected
    async fn connect(&self) -> CacheResult<()>;

    fn is_connected(&self) -> bool;

    /// Raw payload stored under `key`, `None` when absent or expired
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` with no expiry, replacing any previous entry
    async fn set(&self, key: &str, value: String) -> CacheResult<()>;

    /// Store `value` so that it expires after `seconds`, capped at [`MAX_TTL_SECONDS`]
    async fn set_with_expiry(&self, key: &str, value: String, seconds: u64) -> CacheResult<()>;

    /// Remove `key`; succeeds when the key does not exist
    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn ping(&self) -> CacheResult<()>;

    /// Close the connection
    async fn close(&self) -> CacheResult<()>;
}

/// Redis-backed store multiplexing every caller over one connection manager
pub struct RedisStore {
    client: Client,
    manager: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build the client without connecting
    pub fn open(redis_url: &str) -> CacheResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Configuration(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            manager: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    async fn connection(&self) -> CacheResult<ConnectionManager> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| CacheError::Unavailable("redis client is not connected".to_string()))
    }

    /// Connection-level failures are logged here; they never abort the process
    fn on_error(&self, err: RedisError) -> CacheError {
        if is_connection_level(&err) {
            error!("Redis Client Error: {}", err);
            self.connected.store(false, Ordering::SeqCst);
        }
        CacheError::from(err)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    #[instrument(skip(self))]
    async fn connect(&self) -> CacheResult<()> {
        let mut manager = self.manager.write().await;
        if manager.is_some() && self.is_connected() {
            return Ok(());
        }

        let connection = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| self.on_error(e))?;
        *manager = Some(connection);
        self.connected.store(true, Ordering::SeqCst);

        info!("Redis connection established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(|e| self.on_error(e))
    }

    async fn set(&self, key: &str, value: String) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        conn.set(key, value).await.map_err(|e| self.on_error(e))
    }

    async fn set_with_expiry(&self, key: &str, value: String, seconds: u64) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        conn.set_ex(key, value, seconds.min(MAX_TTL_SECONDS))
            .await
            .map_err(|e| self.on_error(e))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let deleted: u32 = conn.del(key).await.map_err(|e| self.on_error(e))?;
        debug!("Deleted {} key(s) from cache", deleted);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Unavailable(format!(
                "unexpected PING reply: {}",
                pong
            )))
        }
    }

    async fn close(&self) -> CacheResult<()> {
        // Dropping the last clone of the manager closes the socket.
        let previous = self.manager.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if previous.is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process store
///
/// Expiry follows the tokio clock, so a paused test runtime can advance
/// simulated time past a TTL.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    connected: AtomicBool,
    reachable: AtomicBool,
    closes: AtomicUsize,
    failing_closes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            failing_closes: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Store a payload verbatim, bypassing serialization
    pub fn insert_raw(&self, key: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.entries.insert(
            key.into(),
            MemoryEntry {
                payload: payload.into(),
                expires_at: None,
            },
        );
    }

    /// Make the next `times` calls to `close` fail and leave the store connected
    pub fn fail_next_closes(&self, times: usize) {
        self.failing_closes.store(times, Ordering::SeqCst);
    }

    /// Number of times the connection was closed
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> CacheResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory store unreachable".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory store is not connected".to_string()));
        }
        Ok(())
    }

    fn write(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                payload: value.into_bytes(),
                // A deadline past the clock's range never arrives.
                expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn connect(&self) -> CacheResult<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            error!("Redis Client Error: memory store unreachable");
            return Err(CacheError::Unavailable("memory store unreachable".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(self.entries.get(key).map(|entry| entry.payload.clone()))
    }

    async fn set(&self, key: &str, value: String) -> CacheResult<()> {
        self.write(key, value, None)
    }

    async fn set_with_expiry(&self, key: &str, value: String, seconds: u64) -> CacheResult<()> {
        self.write(key, value, Some(Duration::from_secs(seconds.min(MAX_TTL_SECONDS))))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_available()
    }

    async fn close(&self) -> CacheResult<()> {
        let failing = self
            .failing_closes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CacheError::Unavailable("memory store failed to close".to_string()));
        }

        self.connected.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
