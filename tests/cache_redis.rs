//! Redis cache integration tests.
//!
//! Run with: cargo test --test cache_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::sync::Arc;
use std::time::Duration;

use classbus::cache::redis::RedisCache;
use classbus::cache::{cache_key, Cache, CacheExt};
use classbus::model::{ClassRequest, ClassResponse};
use classbus::service::ClassService;
use classbus::storage::memory::InMemoryClassRepository;

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        uuid::Uuid::new_v4().to_string().replace("-", "")[..8].to_string()
    )
}

async fn connect() -> RedisCache {
    println!("Connecting to: {}", redis_uri());
    RedisCache::connect(&redis_uri())
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_get_set_delete() {
    println!("=== Redis Cache Basic Operations ===");
    let cache = connect().await;
    let key = cache_key(&test_prefix(), 1);

    assert_eq!(cache.get(&key).await.unwrap(), None);

    cache.set(&key, "hello").await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("hello"));
    assert!(cache.exists(&key).await.unwrap());

    assert!(cache.delete(&key).await.unwrap());
    assert!(!cache.delete(&key).await.unwrap());
    assert!(!cache.exists(&key).await.unwrap());

    println!("=== All Redis basic tests PASSED ===");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_ttl_and_expire() {
    println!("=== Redis Cache TTL ===");
    let cache = connect().await;
    let prefix = test_prefix();
    let short = cache_key(&prefix, "short");
    let later = cache_key(&prefix, "later");

    cache
        .set_with_ttl(&short, "gone soon", Duration::from_millis(200))
        .await
        .unwrap();
    cache.set(&later, "stays").await.unwrap();
    assert!(cache.expire(&later, Duration::from_millis(200)).await.unwrap());
    assert!(!cache
        .expire(&cache_key(&prefix, "missing"), Duration::from_secs(1))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(cache.get(&short).await.unwrap(), None);
    assert_eq!(cache.get(&later).await.unwrap(), None);

    println!("=== All Redis TTL tests PASSED ===");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_delete_pattern() {
    println!("=== Redis Cache Pattern Delete ===");
    let cache = connect().await;
    let prefix = test_prefix();
    let other = test_prefix();

    for id in 0..25 {
        cache.set(&cache_key(&prefix, id), "v").await.unwrap();
    }
    cache.set(&cache_key(&other, 1), "keep").await.unwrap();

    let removed = cache.delete_pattern(&format!("{}:*", prefix)).await.unwrap();

    assert_eq!(removed, 25);
    assert!(!cache.exists(&cache_key(&prefix, 3)).await.unwrap());
    assert!(cache.exists(&cache_key(&other, 1)).await.unwrap());
    cache.delete_pattern(&format!("{}:*", other)).await.unwrap();

    println!("=== All Redis pattern tests PASSED ===");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_backs_cache_aside_reads() {
    println!("=== Redis Cache-Aside Read Path ===");
    let cache = Arc::new(connect().await);
    let namespace = test_prefix();
    let service = ClassService::without_notifications(
        Arc::new(InMemoryClassRepository::new()),
        cache.clone(),
    )
    .with_namespace(namespace.clone());

    let created = service.create(ClassRequest::new("Geometry")).await.unwrap();

    let cached: Option<ClassResponse> = cache
        .get_json(&cache_key(&namespace, created.id))
        .await
        .unwrap();
    assert_eq!(cached, Some(created.clone()));
    assert_eq!(service.get_by_id(created.id).await.unwrap(), created);

    service.delete(created.id).await.unwrap();
    assert!(!cache.exists(&cache_key(&namespace, created.id)).await.unwrap());

    println!("=== All Redis cache-aside tests PASSED ===");
}
