use std::time::Duration;

use contentcache_service::FetchOptions;
use contentcache_service::caching::NetworkStatus;
use tokio::time::Instant;

use crate::{FetchCounter, setup_cache};

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_hit_returns_immediately_and_refreshes() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    let start = Instant::now();
    let fetched = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::from_secs(1)),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(t.cache.is_in_flight("k"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fetches.calls(), 1);
    assert!(!t.cache.is_in_flight("k"));
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_refresh_extends_ttl() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    t.clock.advance(Duration::from_secs(50));
    let fetched: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");
    tokio::time::sleep(Duration::from_millis(10)).await;

    t.clock.advance(Duration::from_secs(50));
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_only_one_refresh_per_key() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    for _ in 0..5 {
        let fetched: String = t
            .cache
            .fetch_with_cache(
                "k",
                TTL,
                fetches.returning("v2".to_owned(), Duration::from_secs(1)),
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(fetched, "v1");
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fetches.calls(), 1);
}

#[tokio::test]
async fn test_skip_refresh() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    let fetched: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::ZERO),
            FetchOptions::skip_refresh(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");
    assert!(!t.cache.is_in_flight("k"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetches.calls(), 0);
}

#[tokio::test]
async fn test_no_refresh_while_offline() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    t.network.set_online(false);
    assert!(!t.cache.network().is_online());

    let fetched: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetches.calls(), 0);
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_refresh_errors_are_swallowed() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    let fetched: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.failing("boom", Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetches.calls(), 1);
    assert!(!t.cache.is_in_flight("k"));
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_foreground_fetch_waits_for_refresh() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    // starts a refresh taking 100ms
    let _: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::from_millis(100)),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    // bypassing the cache still does not fetch concurrently with the refresh
    let fetched: String = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v3".to_owned(), Duration::ZERO),
            FetchOptions::no_cache(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v2");
    assert_eq!(fetches.calls(), 1);
}
