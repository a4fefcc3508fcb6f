use std::sync::Arc;

use contentcache_service::caching::{DurableStore, MemoryDurableStore, OnlineFlag};
use contentcache_service::config::CacheConfig;
use contentcache_service::utils::clock::ManualClock;
use contentcache_service::ContentCache;
use contentcache_test as test;

pub use test::FetchCounter;

/// A cache under test, together with the handles to control it.
pub struct TestCache {
    pub cache: ContentCache,
    pub clock: ManualClock,
    pub network: OnlineFlag,
    pub durable: Arc<MemoryDurableStore>,
}

/// Setup tests and create a cache with an in-memory durable tier.
///
/// The cache uses a [`ManualClock`] starting at `0`, so entries only expire when the test
/// advances the clock. The expiry sweeper is not started. The `update_config` closure can
/// modify the default configuration before the cache is created.
pub fn setup_cache(update_config: impl FnOnce(&mut CacheConfig)) -> TestCache {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);

    let clock = ManualClock::new(0);
    let network = OnlineFlag::default();
    let durable = Arc::new(MemoryDurableStore::new());

    let cache = ContentCache::builder()
        .config(config)
        .clock(Arc::new(clock.clone()))
        .network(Arc::new(network.clone()))
        .durable(durable.clone() as Arc<dyn DurableStore>)
        .build();

    TestCache {
        cache,
        clock,
        network,
        durable,
    }
}
