//! Lifeline - resource lifecycle entry point
//!
//! Resolves configuration, brings up the shared database and cache handles,
//! and owns the process-level shutdown hook for both.

use anyhow::Result;
use clap::Parser;
use lifeline_database::{CacheClient, ConnectionManager, LayerConfig, ProcessRegistry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run start-up checks and exit instead of waiting for a signal
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_tracing(&args.log_level)?;

    info!("Starting lifeline v{}", env!("CARGO_PKG_VERSION"));

    let config = LayerConfig::from_env()?;
    info!(
        "Runtime mode: {:?} (eager connect: {}, reuse across reloads: {})",
        config.mode, config.retention.eager_connect, config.retention.cache_handle_across_reloads
    );

    let registry = ProcessRegistry::global();
    let database = ConnectionManager::new(
        config.database.clone(),
        config.retention,
        Arc::clone(&registry),
    );
    let cache = CacheClient::new(config.cache.clone(), config.retention, registry);

    database.startup().await;
    cache.startup().await;

    if args.once {
        report_health(&database, &cache).await;
    } else {
        wait_for_shutdown_signal().await;
    }

    if let Err(e) = cleanup(&database, &cache).await {
        error!("Shutdown incomplete: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let level_filter = match log_level.to_lowercase().as_str() {
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(EnvFilter::from_default_env().add_directive(level_filter.into()));

    tracing_subscriber::registry().with(stdout_layer).try_init()?;

    Ok(())
}

async fn report_health(database: &ConnectionManager, cache: &CacheClient) {
    match database.get_handle().await {
        Ok(handle) => match handle.health_check().await {
            Ok(()) => info!("Database health check passed"),
            Err(e) => warn!("Database health check failed: {}", e),
        },
        Err(e) => warn!("Database handle unavailable: {}", e),
    }

    match cache.health_check().await {
        Ok(()) => info!("Cache health check passed"),
        Err(e) => warn!("Cache health check failed: {}", e),
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received shutdown signal (Ctrl+C)"),
        _ = terminate => info!("Received shutdown signal (SIGTERM)"),
    }
}

/// Close both handles
///
/// Both are attempted even when the first fails; any failure is returned and
/// `main` turns it into exit status 1.
async fn cleanup(database: &ConnectionManager, cache: &CacheClient) -> Result<()> {
    info!("Shutting down...");

    let mut failures = Vec::new();
    if let Err(e) = database.shutdown().await {
        error!("Error disconnecting from database: {}", e);
        failures.push("database");
    }
    if let Err(e) = cache.shutdown().await {
        error!("Error disconnecting from cache: {}", e);
        failures.push("cache");
    }

    if !failures.is_empty() {
        anyhow::bail!("failed to close: {}", failures.join(", "));
    }

    info!("Shut down gracefully");
    Ok(())
}
