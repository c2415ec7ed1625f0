//! Redis metrics store against a real server.
//!
//! These tests start Redis with testcontainers and need Docker. Set
//! `POS_GATEWAY_TEST_REDIS_URL` to run them against an existing server instead.

use std::time::Duration;

use pos_gateway::store::{MetricsStore, RedisMetricsStore};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use uuid::Uuid;

/// Keeps the container alive for as long as the store is used.
struct TestRedis {
    store: RedisMetricsStore,
    _container: Option<ContainerAsync<Redis>>,
}

async fn start_redis() -> anyhow::Result<TestRedis> {
    if let Some(url) = std::env::var("POS_GATEWAY_TEST_REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
    {
        let store = RedisMetricsStore::connect(&url).await?;
        return Ok(TestRedis {
            store,
            _container: None,
        });
    }

    let container = Redis::default().start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(REDIS_PORT).await?;
    let store = RedisMetricsStore::connect(&format!("redis://{host}:{port}")).await?;
    Ok(TestRedis {
        store,
        _container: Some(container),
    })
}

fn scoped(name: &str) -> String {
    format!("gateway-test:{}:{name}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker or POS_GATEWAY_TEST_REDIS_URL"]
async fn incr_with_ttl_seeds_the_window_once() -> anyhow::Result<()> {
    let redis = start_redis().await?;
    let store = &redis.store;
    let key = scoped("rate:second");
    let window = Duration::from_secs(30);

    assert_eq!(store.incr_with_ttl(&key, window).await?, 1);
    let first_ttl = store.ttl(&key).await?.expect("window has an expiry");
    assert!(first_ttl <= window && first_ttl > Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(store.incr_with_ttl(&key, window).await?, 2);
    assert_eq!(store.incr_with_ttl(&key, window).await?, 3);

    // Later increments never extend the window.
    let later_ttl = store.ttl(&key).await?.expect("still expiring");
    assert!(later_ttl < first_ttl, "{later_ttl:?} >= {first_ttl:?}");
    assert_eq!(store.get(&key).await?.as_deref(), Some("3"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker or POS_GATEWAY_TEST_REDIS_URL"]
async fn counters_expire_with_their_window() -> anyhow::Result<()> {
    let redis = start_redis().await?;
    let store = &redis.store;
    let key = scoped("rate:short");

    assert_eq!(store.incr_with_ttl(&key, Duration::from_millis(200)).await?, 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get(&key).await?, None);
    assert_eq!(store.incr_with_ttl(&key, Duration::from_millis(200)).await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker or POS_GATEWAY_TEST_REDIS_URL"]
async fn values_sets_and_pattern_deletes() -> anyhow::Result<()> {
    let redis = start_redis().await?;
    let store = &redis.store;
    let prefix = scoped("pair");

    store.set(&format!("{prefix}:plain"), "v1").await?;
    store
        .set_with_ttl(&format!("{prefix}:cached"), "v2", Duration::from_secs(60))
        .await?;
    assert_eq!(store.get(&format!("{prefix}:plain")).await?.as_deref(), Some("v1"));
    assert_eq!(store.ttl(&format!("{prefix}:plain")).await?, None);
    assert!(store.ttl(&format!("{prefix}:cached")).await?.is_some());

    let members = format!("{prefix}:members");
    store.set_add(&members, "square").await?;
    store.set_add(&members, "clover").await?;
    store.set_add(&members, "square").await?;
    assert_eq!(store.set_members(&members).await?, vec!["clover", "square"]);
    store.set_remove(&members, "square").await?;
    assert_eq!(store.set_members(&members).await?, vec!["clover"]);

    let found = store.keys_matching(&format!("{prefix}:*")).await?;
    assert_eq!(found.len(), 3);
    assert_eq!(store.delete(&found).await?, 3);
    assert!(store.keys_matching(&format!("{prefix}:*")).await?.is_empty());
    assert_eq!(store.delete(&[]).await?, 0);
    Ok(())
}
