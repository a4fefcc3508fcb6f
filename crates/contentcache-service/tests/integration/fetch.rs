use std::time::Duration;

use contentcache_service::FetchOptions;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::{FetchCounter, setup_cache};

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_expiry_and_refetch() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();

    t.cache.set("k", "v1", TTL).unwrap();
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v1"));

    t.clock.advance(Duration::from_secs(61));
    assert_eq!(t.cache.get::<String>("k"), None);

    let fetched = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v2");
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v2"));
    assert_eq!(fetches.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_fetches_are_coalesced() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();

    let fetch = |value: &str| {
        t.cache.fetch_with_cache(
            "k",
            TTL,
            fetches.returning(value.to_owned(), Duration::from_millis(100)),
            FetchOptions::default(),
        )
    };
    let (first, second) = futures::join!(fetch("first"), fetch("second"));

    assert_eq!(first.unwrap(), "first");
    assert_eq!(second.unwrap(), "first");
    assert_eq!(fetches.calls(), 1);
    assert!(!t.cache.is_in_flight("k"));
}

#[tokio::test]
async fn test_many_concurrent_fetches() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();

    let results = futures::future::join_all((0..16).map(|i| {
        t.cache.fetch_with_cache(
            "k",
            TTL,
            fetches.returning(i, Duration::from_millis(100)),
            FetchOptions::default(),
        )
    }))
    .await;

    for result in results {
        assert_eq!(result.unwrap(), 0);
    }
    assert_eq!(fetches.calls(), 1);
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();

    let err = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.failing::<String>("boom", Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, "boom");
    assert_eq!(t.cache.get::<String>("k"), None);
    assert!(!t.cache.is_in_flight("k"));
    assert!(t.durable.is_empty());

    let fetched = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v1".to_owned(), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "v1");
    assert_eq!(fetches.calls(), 2);
}

#[tokio::test]
async fn test_waiter_fetches_after_failed_fetch() {
    tokio::time::pause();
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();

    let failing = t.cache.fetch_with_cache(
        "k",
        TTL,
        fetches.failing::<String>("boom", Duration::from_millis(100)),
        FetchOptions::default(),
    );
    let waiting = t.cache.fetch_with_cache(
        "k",
        TTL,
        fetches.returning("v1".to_owned(), Duration::from_millis(100)),
        FetchOptions::default(),
    );
    let (failed, fetched) = futures::join!(failing, waiting);

    assert_eq!(failed.unwrap_err(), "boom");
    assert_eq!(fetched.unwrap(), "v1");
    assert_eq!(fetches.calls(), 2);
}

#[tokio::test]
async fn test_wait_timeout_falls_back_to_fetch() {
    tokio::time::pause();
    let t = setup_cache(|config| config.wait_timeout = Duration::from_millis(500));
    let fetches = FetchCounter::new();

    let slow = t.cache.fetch_with_cache(
        "k",
        TTL,
        fetches.returning("slow".to_owned(), Duration::from_secs(2)),
        FetchOptions::default(),
    );
    let impatient = async {
        let start = Instant::now();
        let result = t
            .cache
            .fetch_with_cache(
                "k",
                TTL,
                fetches.returning("fast".to_owned(), Duration::ZERO),
                FetchOptions::default(),
            )
            .await;
        (result, start.elapsed())
    };
    let (slow, (fast, waited)) = futures::join!(slow, impatient);

    assert_eq!(slow.unwrap(), "slow");
    assert_eq!(fast.unwrap(), "fast");
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_secs(2));
    assert_eq!(fetches.calls(), 2);
    // the last write wins
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("slow"));
}

#[tokio::test]
async fn test_no_cache_bypasses_hits() {
    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    t.cache.set("k", "v1", TTL).unwrap();

    let fetched = t
        .cache
        .fetch_with_cache(
            "k",
            TTL,
            fetches.returning("v2".to_owned(), Duration::ZERO),
            FetchOptions::no_cache(),
        )
        .await
        .unwrap();

    assert_eq!(fetched, "v2");
    assert_eq!(fetches.calls(), 1);
    assert_eq!(t.cache.get::<String>("k").as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_prefix_invalidation() {
    let t = setup_cache(|_| ());
    t.cache.set("list_a", &json!([1, 2]), TTL).unwrap();
    t.cache.set("list_b", &json!([3]), TTL).unwrap();
    t.cache.set("content_1", &json!({"id": 1}), TTL).unwrap();

    assert_eq!(t.cache.invalidate_prefix("list_"), 2);

    assert_eq!(t.cache.get::<Vec<u32>>("list_a"), None);
    assert_eq!(t.cache.get::<Vec<u32>>("list_b"), None);
    assert_eq!(
        t.cache.get::<serde_json::Value>("content_1"),
        Some(json!({"id": 1}))
    );
}

#[tokio::test]
async fn test_invalidate_and_clear() {
    let t = setup_cache(|_| ());
    t.cache.set("a", &1, TTL).unwrap();
    t.cache.set("b", &2, TTL).unwrap();

    t.cache.invalidate("a");
    assert_eq!(t.cache.get::<u32>("a"), None);
    assert_eq!(t.cache.get::<u32>("b"), Some(2));

    t.cache.clear();
    assert_eq!(t.cache.get::<u32>("b"), None);
    assert!(t.durable.is_empty());
}

#[tokio::test]
async fn test_typed_values() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Content {
        id: u64,
        title: String,
    }

    let t = setup_cache(|_| ());
    let fetches = FetchCounter::new();
    let content = Content {
        id: 1,
        title: "hello".into(),
    };

    let fetched = t
        .cache
        .fetch_with_cache(
            "content_1",
            TTL,
            fetches.returning(content.clone(), Duration::ZERO),
            FetchOptions::skip_refresh(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, content);
    assert_eq!(t.cache.get::<Content>("content_1"), Some(content));

    // a value of the wrong shape is a miss
    let fetched = t
        .cache
        .fetch_with_cache(
            "content_1",
            TTL,
            fetches.returning("not content".to_owned(), Duration::ZERO),
            FetchOptions::skip_refresh(),
        )
        .await
        .unwrap();
    assert_eq!(fetched, "not content");
    assert_eq!(fetches.calls(), 2);
}

#[tokio::test]
async fn test_sweep_now() {
    let t = setup_cache(|_| ());
    t.cache.set("short", &1, Duration::from_secs(10)).unwrap();
    t.cache.set("long", &2, TTL).unwrap();
    t.clock.advance(Duration::from_secs(10));

    let stats = t.cache.sweep_now().await;
    assert_eq!(stats.removed(), 2);
    assert_eq!(stats.retained, 2);
    assert_eq!(t.durable.len(), 1);
}
