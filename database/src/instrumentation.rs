//! # Operation Timing
//!
//! Every data operation issued through a [`crate::DatabaseHandle`] or a
//! [`crate::TransactionScope`] runs inside [`QueryTimer::intercept`], which
//! measures wall-clock time around the call and hands a [`TimingRecord`] to a
//! [`TimingObserver`]. The wrapped result is returned untouched.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueryLogLevel;

/// Identifies a data operation as `model.action`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation<'a> {
    pub model: &'a str,
    pub action: &'a str,
}

impl<'a> Operation<'a> {
    pub const fn new(model: &'a str, action: &'a str) -> Self {
        Self { model, action }
    }
}

impl std::fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.model, self.action)
    }
}

/// Timing of a single data operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub resource: String,
    pub model: String,
    pub action: String,
    pub elapsed_ms: u64,
    pub succeeded: bool,
}

/// Receives timing records
///
/// A failing observer is logged and otherwise ignored; it never replaces the
/// outcome of the operation it measured.
pub trait TimingObserver: Send + Sync {
    fn on_timing(&self, record: &TimingRecord) -> anyhow::Result<()>;
}

/// Default observer: structured log line plus a duration histogram
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    level: QueryLogLevel,
}

impl TracingObserver {
    pub fn new(level: QueryLogLevel) -> Self {
        Self { level }
    }
}

impl TimingObserver for TracingObserver {
    fn on_timing(&self, record: &TimingRecord) -> anyhow::Result<()> {
        match self.level {
            QueryLogLevel::Off => {}
            QueryLogLevel::Debug => debug!(
                resource = %record.resource,
                model = %record.model,
                action = %record.action,
                elapsed_ms = record.elapsed_ms,
                succeeded = record.succeeded,
                "Query {}.{} took {}ms",
                record.model,
                record.action,
                record.elapsed_ms
            ),
            QueryLogLevel::Info => info!(
                resource = %record.resource,
                model = %record.model,
                action = %record.action,
                elapsed_ms = record.elapsed_ms,
                succeeded = record.succeeded,
                "Query {}.{} took {}ms",
                record.model,
                record.action,
                record.elapsed_ms
            ),
        }

        metrics::histogram!(
            "db_operation_duration_ms",
            record.elapsed_ms as f64,
            "resource" => record.resource.clone(),
            "model" => record.model.clone(),
            "action" => record.action.clone()
        );

        Ok(())
    }
}

/// Timing interceptor shared by a handle and the transaction scopes it opens
#[derive(Clone)]
pub struct QueryTimer {
    resource: &'static str,
    observer: Arc<dyn TimingObserver>,
}

impl std::fmt::Debug for QueryTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTimer")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl QueryTimer {
    pub fn new(resource: &'static str, observer: Arc<dyn TimingObserver>) -> Self {
        Self { resource, observer }
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    /// Await `operation`, record how long it took, and return its result as is
    pub async fn intercept<T, E, Fut>(&self, op: Operation<'_>, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = operation.await;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = TimingRecord {
            resource: self.resource.to_string(),
            model: op.model.to_string(),
            action: op.action.to_string(),
            elapsed_ms,
            succeeded: result.is_ok(),
        };
        if let Err(e) = self.observer.on_timing(&record) {
            warn!("Failed to record timing for {}: {}", op, e);
        }

        result
    }
}

/// Observer that keeps every record in memory
#[derive(Debug, Default)]
pub struct CollectingObserver {
    records: std::sync::Mutex<Vec<TimingRecord>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl TimingObserver for CollectingObserver {
    fn on_timing(&self, record: &TimingRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("timing buffer poisoned"))?
            .push(record.clone());
        Ok(())
    }
}
