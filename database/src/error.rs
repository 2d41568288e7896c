//! Error types
//!
//! Errors raised by the database handle and the cache client. Cache misses are
//! not errors; they surface as `Ok(None)` from [`crate::CacheClient::get_cache`].

use thiserror::Error;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Whether the error came from the transport rather than from the statement itself
    pub fn is_connection_error(&self) -> bool {
        match self {
            DatabaseError::Connection(_) => true,
            DatabaseError::Sql(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Cache-related errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// The value could not be serialized before writing
    #[error("Cache write error for key {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored payload exists but does not decode to the requested type
    #[error("Cache read error for key {key}: corrupt entry: {source}")]
    Read {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The underlying store could not be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but answered with an error
    #[error("Cache store error: {0}")]
    Store(#[source] redis::RedisError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if is_connection_level(&err) {
            CacheError::Unavailable(err.to_string())
        } else {
            CacheError::Store(err)
        }
    }
}

/// Transport failures, as opposed to replies the server sent back
pub(crate) fn is_connection_level(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
}

/// Process registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource kind {kind} is registered with a handle other than {expected}")]
    KindMismatch {
        kind: &'static str,
        expected: &'static str,
    },
}

impl From<RegistryError> for DatabaseError {
    fn from(err: RegistryError) -> Self {
        DatabaseError::Configuration(err.to_string())
    }
}

impl From<RegistryError> for CacheError {
    fn from(err: RegistryError) -> Self {
        CacheError::Configuration(err.to_string())
    }
}

/// Type alias for database results
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Type alias for cache results
pub type CacheResult<T> = Result<T, CacheError>;
