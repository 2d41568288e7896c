//! # Resource Lifecycle Layer
//!
//! Process-wide handles for a relational database (SQLx) and a key-value cache
//! (Redis), with transactional execution, per-operation timing and explicit,
//! idempotent shutdown.
//!
//! ## Initialization order
//!
//! 1. Resolve a [`LayerConfig`] once (usually [`LayerConfig::from_env`]).
//! 2. Obtain the [`ProcessRegistry`] ([`ProcessRegistry::global`] in a binary).
//! 3. Build a [`ConnectionManager`] and a [`CacheClient`] from both and call
//!    their `startup` hooks.
//! 4. On exit or signal, the entry point calls `shutdown` on each.

pub mod cache;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod instrumentation;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use cache::*;
pub use config::*;
pub use connection::*;
pub use database::*;
pub use error::*;
pub use instrumentation::*;
pub use registry::*;
pub use store::*;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
