use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::config::{CacheConfig, Config};
use crate::utils::clock::{Clock, SystemClock};

use super::coordinator::Entry;
use super::sweeper::sweep;
use super::{
    CacheStore, DurableStore, ExpirySweeper, FsDurableStore, NetworkStatus, OnlineFlag,
    RefreshScheduler, RequestCoordinator, SweepStats,
};

/// Per-call switches for [`ContentCache::fetch_with_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Whether to consult the cache before fetching. The result is stored either way.
    pub use_cache: bool,
    /// Whether to skip the background refresh on a cache hit.
    pub skip_refresh: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            skip_refresh: false,
        }
    }
}

impl FetchOptions {
    /// Bypasses the cache for reading, but still stores the fetched value.
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    /// Serves cache hits without refreshing them in the background.
    pub fn skip_refresh() -> Self {
        Self {
            skip_refresh: true,
            ..Self::default()
        }
    }
}

/// A content cache with request coalescing and stale-while-revalidate.
///
/// This ties together the [`CacheStore`], [`RequestCoordinator`], [`RefreshScheduler`] and
/// [`ExpirySweeper`]. It is meant to be created once at startup and shared, and torn down
/// with [`shutdown`](Self::shutdown).
pub struct ContentCache {
    store: Arc<CacheStore>,
    coordinator: RequestCoordinator,
    refresher: RefreshScheduler,
    sweeper: Mutex<Option<ExpirySweeper>>,
    default_ttl: Duration,
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .field("refresher", &self.refresher)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl ContentCache {
    pub fn builder() -> ContentCacheBuilder {
        ContentCacheBuilder::default()
    }

    /// Creates the cache as configured and starts the expiry sweeper.
    ///
    /// Without a `cache_dir`, the durable tier is disabled. Must be called from within a
    /// tokio runtime.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut builder = Self::builder().config(config.caches.clone()).sweeper(true);

        let durable = FsDurableStore::from_config(config).with_context(|| {
            let cache_dir = config.cache_dir.as_deref().unwrap_or(Path::new(""));
            format!("failed to open cache directory {}", cache_dir.display())
        })?;
        if let Some(durable) = durable {
            builder = builder.durable(Arc::new(durable));
        }

        Ok(builder.build())
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<dyn NetworkStatus> {
        self.refresher.network()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached value for `key`, or fetches it.
    ///
    /// On a cache hit, the cached value is returned right away, and unless
    /// [`skip_refresh`](FetchOptions::skip_refresh) is set, the entry is refreshed in the
    /// background. On a miss, `fetcher` is called and its value stored for `ttl`. Concurrent
    /// calls for the same key share a single fetch.
    ///
    /// Errors of `fetcher` are returned as is and nothing is cached. Errors of a background
    /// refresh are only logged.
    pub async fn fetch_with_cache<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1);

        if options.use_cache {
            if let Some(value) = self.get(key) {
                if !options.skip_refresh {
                    self.refresher.maybe_refresh(key, ttl, move || fetch_value(fetcher));
                }
                return Ok(value);
            }
            metric!(counter("caches.miss") += 1);
        }

        let deadline = Instant::now() + self.coordinator.wait_timeout();
        loop {
            let budget = deadline.saturating_duration_since(Instant::now());
            match self.coordinator.enter(key, budget).await {
                Entry::Owner(guard) => {
                    // The value is stored before the guard releases any waiters.
                    let result = self.fetch_and_store(key, ttl, fetcher).await;
                    drop(guard);
                    return result;
                }
                Entry::Settled => {
                    metric!(counter("caches.coalesced") += 1);
                    if let Some(value) = self.get(key) {
                        return Ok(value);
                    }
                    // The other fetch failed, contend for the key ourselves.
                }
                Entry::TimedOut => {
                    metric!(counter("caches.wait_timeout") += 1);
                    tracing::debug!(key, "Timed out waiting for in-flight fetch");
                    return self.fetch_and_store(key, ttl, fetcher).await;
                }
            }
        }
    }

    /// Like [`fetch_with_cache`](Self::fetch_with_cache) with the default TTL and options.
    pub async fn fetch<T, E, F, Fut>(&self, key: &str, fetcher: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fetch_with_cache(key, self.default_ttl, fetcher, FetchOptions::default())
            .await
    }

    async fn fetch_and_store<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<T, E>
    where
        T: Serialize,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        metric!(counter("caches.fetch") += 1);
        let start = Instant::now();
        let result = fetcher().await;
        metric!(timer("caches.fetch.duration") = start.elapsed());

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                metric!(counter("caches.fetch.error") += 1);
                tracing::debug!(key, error = %err, "Fetching cache entry failed");
                return Err(err);
            }
        };

        if let Err(err) = self.set(key, &value, ttl) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                key,
                "Failed to serialize fetched value"
            );
        }
        Ok(value)
    }

    /// Returns the valid cached value for `key`.
    ///
    /// A cached value that does not deserialize into `T` is treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key)?;
        match T::deserialize(value.as_ref()) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key,
                    "Cached value has an unexpected shape"
                );
                None
            }
        }
    }

    /// Stores `value` under `key` for `ttl`.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.store.set(key, Arc::new(value), ttl);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        self.store.delete(key);
    }

    /// Removes every entry whose key starts with `prefix`, returning how many were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.store.delete_by_prefix(prefix)
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Removes all expired entries right away.
    pub async fn sweep_now(&self) -> SweepStats {
        sweep(Arc::clone(&self.store)).await
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.coordinator.is_in_flight(key)
    }

    /// Stops the expiry sweeper.
    ///
    /// The cache stays usable afterwards, expired entries are just no longer swept. Background
    /// refreshes that are already running complete on their own.
    pub fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut sweeper) = sweeper {
            sweeper.shutdown();
        }
    }
}

/// Adapts a typed fetcher into one producing the JSON stored in the cache.
async fn fetch_value<T, E, F, Fut>(fetcher: F) -> Result<serde_json::Value, String>
where
    T: Serialize,
    E: fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let value = fetcher().await.map_err(|err| err.to_string())?;
    serde_json::to_value(value).map_err(|err| err.to_string())
}

/// Assembles a [`ContentCache`] from its parts.
#[derive(Debug, Default)]
pub struct ContentCacheBuilder {
    config: CacheConfig,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Option<Arc<dyn Clock>>,
    network: Option<Arc<dyn NetworkStatus>>,
    sweeper: bool,
}

impl ContentCacheBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables the durable tier.
    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkStatus>) -> Self {
        self.network = Some(network);
        self
    }

    /// Whether to start the periodic expiry sweeper. Requires a tokio runtime when building.
    pub fn sweeper(mut self, enabled: bool) -> Self {
        self.sweeper = enabled;
        self
    }

    pub fn build(self) -> ContentCache {
        let Self {
            config,
            durable,
            clock,
            network,
            sweeper,
        } = self;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let network = network.unwrap_or_else(|| Arc::new(OnlineFlag::default()));

        let store = Arc::new(CacheStore::new(durable, config.namespace, clock));
        let coordinator = RequestCoordinator::new(config.wait_timeout);
        let refresher = RefreshScheduler::new(
            Arc::clone(&store),
            coordinator.clone(),
            network,
            config.max_background_refreshes,
        );
        let sweeper =
            sweeper.then(|| ExpirySweeper::start(Arc::clone(&store), config.sweep_interval));

        tracing::debug!(
            durable = store.has_durable_tier(),
            sweeper = sweeper.is_some(),
            "Created content cache"
        );

        ContentCache {
            store,
            coordinator,
            refresher,
            sweeper: Mutex::new(sweeper),
            default_ttl: config.default_ttl,
        }
    }
}
