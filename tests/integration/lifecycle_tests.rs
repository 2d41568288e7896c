//! End-to-end lifecycle tests against SQLite and the in-process cache store

use lifeline_database::{
    CacheClient, ConnectionManager, DatabaseError, LayerConfig, Operation, ProcessRegistry,
    RuntimeMode,
};
use std::sync::Arc;

fn vars(mode: &str) -> Vec<(String, String)> {
    vec![
        ("ENVIRONMENT".to_string(), mode.to_string()),
        ("DATABASE_URL".to_string(), "sqlite::memory:".to_string()),
        ("DB_MAX_CONNECTIONS".to_string(), "1".to_string()),
        ("REDIS_URL".to_string(), "memory://".to_string()),
        ("QUERY_LOG_LEVEL".to_string(), "debug".to_string()),
    ]
}

fn build(config: &LayerConfig, registry: &Arc<ProcessRegistry>) -> (ConnectionManager, CacheClient) {
    let database = ConnectionManager::new(
        config.database.clone(),
        config.retention,
        Arc::clone(registry),
    );
    let cache = CacheClient::new(config.cache.clone(), config.retention, Arc::clone(registry));
    (database, cache)
}

async fn count_accounts(database: &ConnectionManager) -> i64 {
    database
        .get_handle()
        .await
        .unwrap()
        .fetch_scalar(
            Operation::new("Account", "count"),
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts"),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_development_reload_reuses_both_handles() {
    let config = LayerConfig::from_vars(vars("development")).unwrap();
    assert_eq!(config.mode, RuntimeMode::Development);
    let registry = Arc::new(ProcessRegistry::new());

    let (db_a, cache_a) = build(&config, &registry);
    let (db_b, cache_b) = build(&config, &registry);

    let handle_a = db_a.get_handle().await.unwrap();
    let handle_b = db_b.get_handle().await.unwrap();
    assert!(Arc::ptr_eq(&handle_a, &handle_b));

    let cache_handle_a = cache_a.get_handle().await.unwrap();
    let cache_handle_b = cache_b.get_handle().await.unwrap();
    assert!(Arc::ptr_eq(&cache_handle_a, &cache_handle_b));

    cache_a.set_cache("greeting", &"hello", None).await.unwrap();
    assert_eq!(
        cache_b.get_cache::<String>("greeting").await.unwrap(),
        Some("hello".to_string())
    );
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_production_startup_connects_eagerly() {
    let config = LayerConfig::from_vars(vars("production")).unwrap();
    assert!(config.retention.eager_connect);
    let registry = Arc::new(ProcessRegistry::new());

    let (database, cache) = build(&config, &registry);
    database.startup().await;
    cache.startup().await;

    assert!(database.get_handle().await.unwrap().is_connected());
    assert!(cache.get_handle().await.unwrap().is_connected());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_throwing_transaction_leaves_no_trace() {
    let config = LayerConfig::from_vars(vars("development")).unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let (database, _cache) = build(&config, &registry);

    database
        .get_handle()
        .await
        .unwrap()
        .execute(
            Operation::new("Account", "createTable"),
            sqlx::query("CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL)"),
        )
        .await
        .unwrap();

    #[derive(Debug)]
    enum TransferError {
        Database(DatabaseError),
        InsufficientFunds,
    }

    impl From<DatabaseError> for TransferError {
        fn from(err: DatabaseError) -> Self {
            TransferError::Database(err)
        }
    }

    let result: Result<(), TransferError> = database
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.execute(
                    Operation::new("Account", "create"),
                    sqlx::query("INSERT INTO accounts (owner, balance) VALUES ($1, $2)")
                        .bind("Ann")
                        .bind(10_i64),
                )
                .await?;
                tx.execute(
                    Operation::new("Account", "create"),
                    sqlx::query("INSERT INTO accounts (owner, balance) VALUES ($1, $2)")
                        .bind("Bob")
                        .bind(0_i64),
                )
                .await?;
                Err(TransferError::InsufficientFunds)
            })
        })
        .await;

    assert!(matches!(result, Err(TransferError::InsufficientFunds)));
    assert_eq!(count_accounts(&database).await, 0);

    let committed: Result<(), TransferError> = database
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.execute(
                    Operation::new("Account", "create"),
                    sqlx::query("INSERT INTO accounts (owner, balance) VALUES ($1, $2)")
                        .bind("Ann")
                        .bind(10_i64),
                )
                .await?;
                Ok(())
            })
        })
        .await;

    assert!(committed.is_ok());
    assert_eq!(count_accounts(&database).await, 1);
}

#[tokio::test]
async fn test_statement_error_inside_transaction_propagates() {
    let config = LayerConfig::from_vars(vars("production")).unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let (database, _cache) = build(&config, &registry);

    let result: Result<(), DatabaseError> = database
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.execute(
                    Operation::new("Ghost", "create"),
                    sqlx::query("INSERT INTO ghosts (name) VALUES ('boo')"),
                )
                .await?;
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(DatabaseError::Sql(_))));
}

#[tokio::test]
async fn test_duplicate_shutdown_is_harmless() {
    let config = LayerConfig::from_vars(vars("development")).unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let (database, cache) = build(&config, &registry);

    let db_handle = database.get_handle().await.unwrap();
    let cache_handle = cache.get_handle().await.unwrap();

    let (first, second) = tokio::join!(database.shutdown(), database.shutdown());
    first.unwrap();
    second.unwrap();
    cache.shutdown().await.unwrap();
    cache.shutdown().await.unwrap();

    assert!(db_handle.is_closed());
    assert!(cache_handle.is_closed());
    assert!(registry.is_empty());
}
