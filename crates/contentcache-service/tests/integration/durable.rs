use std::sync::Arc;
use std::time::Duration;

use contentcache_service::caching::FsDurableStore;
use contentcache_service::config::Config;
use contentcache_service::utils::clock::ManualClock;
use contentcache_service::{ContentCache, FetchOptions};
use contentcache_test as test;
use serde_json::{Value, json};

use crate::FetchCounter;

const TTL: Duration = Duration::from_secs(60);

fn open(dir: &test::TempDir, clock: &ManualClock) -> ContentCache {
    let durable = FsDurableStore::open(dir.path().join("store"), dir.path().join("tmp")).unwrap();
    ContentCache::builder()
        .durable(Arc::new(durable))
        .clock(Arc::new(clock.clone()))
        .build()
}

#[tokio::test]
async fn test_survives_restart() {
    test::setup();
    let dir = test::tempdir();
    let clock = ManualClock::new(0);
    let fetches = FetchCounter::new();

    let cache = open(&dir, &clock);
    let fetched: Value = cache
        .fetch_with_cache(
            "content_1",
            TTL,
            fetches.returning(json!({"title": "hello"}), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, json!({"title": "hello"}));
    drop(cache);

    let cache = open(&dir, &clock);
    let fetched: Value = cache
        .fetch_with_cache(
            "content_1",
            TTL,
            fetches.returning(json!({"title": "changed"}), Duration::ZERO),
            FetchOptions::skip_refresh(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, json!({"title": "hello"}));
    assert_eq!(fetches.calls(), 1);
}

#[tokio::test]
async fn test_expired_after_restart() {
    test::setup();
    let dir = test::tempdir();
    let clock = ManualClock::new(0);

    let cache = open(&dir, &clock);
    cache.set("content_1", &1, TTL).unwrap();
    drop(cache);

    clock.advance(Duration::from_secs(61));
    let cache = open(&dir, &clock);
    assert_eq!(cache.get::<u32>("content_1"), None);

    let stats = cache.sweep_now().await;
    assert_eq!(stats.removed_durable, 1);
    assert!(std::fs::read_dir(dir.path().join("store")).unwrap().next().is_none());
}

#[tokio::test]
async fn test_prefix_invalidation_after_restart() {
    test::setup();
    let dir = test::tempdir();
    let clock = ManualClock::new(0);

    let cache = open(&dir, &clock);
    cache.set("list_content_a", &[1], TTL).unwrap();
    cache.set("list_content_b", &[2], TTL).unwrap();
    cache.set("content_1", &1, TTL).unwrap();
    drop(cache);

    let cache = open(&dir, &clock);
    assert_eq!(cache.invalidate_prefix("list_content_"), 2);
    assert_eq!(cache.get::<Vec<u32>>("list_content_a"), None);
    assert_eq!(cache.get::<u32>("content_1"), Some(1));
}

#[tokio::test]
async fn test_from_config_sweeps() {
    tokio::time::pause();
    test::setup();
    let dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(dir.path().to_owned()),
        ..Default::default()
    };
    config.caches.sweep_interval = Duration::from_secs(1);
    let cache = ContentCache::from_config(&config).unwrap();

    cache.set("short", &1, Duration::from_millis(1)).unwrap();
    cache.set("long", &2, TTL).unwrap();
    // the system clock is not paused, give the entry time to expire
    std::thread::sleep(Duration::from_millis(5));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    // swept entries are gone from both tiers, so a dry run finds nothing left to remove
    assert_eq!(cache.store().sweep_expired_with(true).removed(), 0);
    assert_eq!(cache.get::<u32>("long"), Some(2));

    cache.shutdown();
}
