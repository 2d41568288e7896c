//! Cache behaviour through the public client API

use lifeline_database::{
    CacheClient, CacheError, KeyValueStore, MemoryStore, ProcessRegistry, RetentionPolicy,
    RuntimeMode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    tags: Vec<String>,
    age: Option<u8>,
}

fn client() -> (CacheClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = CacheClient::with_store(
        store.clone(),
        RetentionPolicy::for_mode(RuntimeMode::Development),
        Arc::new(ProcessRegistry::new()),
    );
    (client, store)
}

#[tokio::test]
async fn test_round_trip_preserves_values() {
    let (cache, _) = client();

    let profile = Profile {
        name: "Ann".to_string(),
        tags: vec!["admin".to_string(), "beta".to_string()],
        age: None,
    };
    cache.set_cache("profile:ann", &profile, None).await.unwrap();
    assert_eq!(
        cache.get_cache::<Profile>("profile:ann").await.unwrap(),
        Some(profile)
    );

    let document = json!({ "nested": { "list": [1, 2.5, "three", null] }, "ok": true });
    cache.set_cache("doc", &document, None).await.unwrap();
    assert_eq!(
        cache.get_cache::<serde_json::Value>("doc").await.unwrap(),
        Some(document)
    );

    cache.set_cache("empty", &"", None).await.unwrap();
    assert_eq!(
        cache.get_cache::<String>("empty").await.unwrap(),
        Some(String::new())
    );
}

#[tokio::test(start_paused = true)]
async fn test_expiry_boundary() {
    let (cache, _) = client();
    cache.set_cache("user:1", &json!({ "name": "Ann" }), Some(60)).await.unwrap();

    tokio::time::advance(Duration::from_millis(59_900)).await;
    assert_eq!(
        cache.get_cache::<serde_json::Value>("user:1").await.unwrap(),
        Some(json!({ "name": "Ann" }))
    );

    tokio::time::advance(Duration::from_millis(1_100)).await;
    assert_eq!(cache.get_cache::<serde_json::Value>("user:1").await.unwrap(), None);
}

#[tokio::test]
async fn test_absent_and_corrupt_are_distinct() {
    let (cache, store) = client();
    store.connect().await.unwrap();
    store.insert_raw("broken", vec![0xff, 0xfe]);

    assert!(cache.get_cache::<Profile>("never-set").await.unwrap().is_none());
    assert!(matches!(
        cache.get_cache::<Profile>("broken").await,
        Err(CacheError::Read { .. })
    ));
}

#[tokio::test]
async fn test_clear_then_read() {
    let (cache, _) = client();
    cache.set_cache("session", &"token", None).await.unwrap();
    cache.clear_cache("session").await.unwrap();
    cache.clear_cache("session").await.unwrap();
    assert_eq!(cache.get_cache::<String>("session").await.unwrap(), None);
}

#[tokio::test]
async fn test_reconnects_after_outage() {
    let (cache, store) = client();
    cache.set_cache("k", &1, None).await.unwrap();

    store.set_reachable(false);
    assert!(matches!(
        cache.get_cache::<i32>("k").await,
        Err(CacheError::Unavailable(_))
    ));

    store.set_reachable(true);
    assert_eq!(cache.get_cache::<i32>("k").await.unwrap(), Some(1));
}
