//! # Layer Configuration
//!
//! Configuration for the database handle, the cache client and the runtime
//! retention policy. Everything is resolved once from the environment at
//! start-up; components only ever see the resolved structs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default PostgreSQL target when `DATABASE_URL` is unset
pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/app";

/// Default cache target when `REDIS_URL` is unset
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Runtime mode the process was started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMode {
    Production,
    Development,
}

impl RuntimeMode {
    /// Anything other than `production` is treated as development
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("production") => RuntimeMode::Production,
            _ => RuntimeMode::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeMode::Production)
    }
}

/// What differs between runtime modes, decided in one place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Establish the connection at start-up instead of on first use
    pub eager_connect: bool,
    /// Keep handles in the process registry so re-initialization reuses them
    pub cache_handle_across_reloads: bool,
}

impl RetentionPolicy {
    pub fn for_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::Production => Self {
                eager_connect: true,
                cache_handle_across_reloads: false,
            },
            RuntimeMode::Development => Self {
                eager_connect: false,
                cache_handle_across_reloads: true,
            },
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::for_mode(RuntimeMode::Development)
    }
}

/// Level at which per-operation timing records are logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLogLevel {
    Off,
    Debug,
    Info,
}

impl QueryLogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Some(QueryLogLevel::Off),
            "debug" => Some(QueryLogLevel::Debug),
            "info" => Some(QueryLogLevel::Info),
            _ => None,
        }
    }
}

impl Default for QueryLogLevel {
    fn default() -> Self {
        QueryLogLevel::Info
    }
}

/// Database configuration for the relational handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Maximum number of connections the client may multiplex over
    pub max_connections: u32,
    /// Minimum number of idle connections kept open
    pub min_connections: u32,
    /// Connection acquisition timeout
    pub acquire_timeout: Duration,
    /// Connection idle timeout, `None` keeps idle connections forever
    pub idle_timeout: Option<Duration>,
    /// Timing log level for every data operation
    pub query_log_level: QueryLogLevel,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            query_log_level: QueryLogLevel::default(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Store URL; `memory://` selects the in-process store
    pub redis_url: String,
}

impl CacheConfig {
    pub fn is_in_memory(&self) -> bool {
        self.redis_url.starts_with("memory://")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

/// Raw environment variables recognized by the layer
#[derive(Debug, Default, Deserialize)]
struct EnvSettings {
    environment: Option<String>,
    node_env: Option<String>,
    database_url: Option<String>,
    redis_url: Option<String>,
    query_log_level: Option<String>,
    db_max_connections: Option<u32>,
    db_min_connections: Option<u32>,
}

/// Master configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub mode: RuntimeMode,
    pub retention: RetentionPolicy,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self::with_mode(RuntimeMode::Development)
    }
}

impl LayerConfig {
    pub fn with_mode(mode: RuntimeMode) -> Self {
        Self {
            mode,
            retention: RetentionPolicy::for_mode(mode),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Load configuration from process environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_settings(envy::from_env::<EnvSettings>()?)
    }

    /// Load configuration from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::from_settings(envy::from_iter::<_, EnvSettings>(vars)?)
    }

    fn from_settings(settings: EnvSettings) -> anyhow::Result<Self> {
        let mode_value = settings.environment.or(settings.node_env);
        let mut config = Self::with_mode(RuntimeMode::parse(mode_value.as_deref()));

        if let Some(url) = settings.database_url {
            config.database.database_url = url;
        }
        if let Some(url) = settings.redis_url {
            config.cache.redis_url = url;
        }
        if let Some(level) = settings.query_log_level {
            config.database.query_log_level = QueryLogLevel::parse(&level)
                .ok_or_else(|| anyhow::anyhow!("Unknown QUERY_LOG_LEVEL: {}", level))?;
        }
        if let Some(max) = settings.db_max_connections {
            config.database.max_connections = max;
        }
        if let Some(min) = settings.db_min_connections {
            config.database.min_connections = min;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.database_url.is_empty() {
            return Err(anyhow::anyhow!("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections must be at least 1"));
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(anyhow::anyhow!(
                "Max connections must be >= min connections"
            ));
        }

        if self.cache.redis_url.is_empty() {
            return Err(anyhow::anyhow!("Redis URL cannot be empty"));
        }

        Ok(())
    }
}
