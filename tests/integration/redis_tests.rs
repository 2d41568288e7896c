//! Integration tests using testcontainers for Redis connectivity

use lifeline_database::{CacheClient, CacheConfig, ProcessRegistry, RetentionPolicy, RuntimeMode};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, GenericImage};

fn redis_client(port: u16) -> CacheClient {
    CacheClient::new(
        CacheConfig {
            redis_url: format!("redis://127.0.0.1:{}", port),
        },
        RetentionPolicy::for_mode(RuntimeMode::Production),
        Arc::new(ProcessRegistry::new()),
    )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_set_get_clear() {
    let docker = Cli::default();
    let redis_image = GenericImage::new("redis", "7")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_exposed_port(6379);
    let node = docker.run(redis_image);

    let cache = redis_client(node.get_host_port_ipv4(6379));
    cache.health_check().await.unwrap();

    cache
        .set_cache("portfolio:BTC", &vec!["1.5", "75000.00"], None)
        .await
        .unwrap();
    assert_eq!(
        cache.get_cache::<Vec<String>>("portfolio:BTC").await.unwrap(),
        Some(vec!["1.5".to_string(), "75000.00".to_string()])
    );

    cache.clear_cache("portfolio:BTC").await.unwrap();
    cache.clear_cache("portfolio:BTC").await.unwrap();
    assert_eq!(cache.get_cache::<Vec<String>>("portfolio:BTC").await.unwrap(), None);

    cache.shutdown().await.unwrap();
    cache.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_ttl_expiry() {
    let docker = Cli::default();
    let redis_image = GenericImage::new("redis", "7")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_exposed_port(6379);
    let node = docker.run(redis_image);

    let cache = redis_client(node.get_host_port_ipv4(6379));
    cache.set_cache("user:1", &"Ann", Some(1)).await.unwrap();
    assert_eq!(
        cache.get_cache::<String>("user:1").await.unwrap(),
        Some("Ann".to_string())
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(cache.get_cache::<String>("user:1").await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_redis_is_reported_not_fatal() {
    let cache = redis_client(1);
    assert!(cache.get_cache::<String>("k").await.is_err());
}
