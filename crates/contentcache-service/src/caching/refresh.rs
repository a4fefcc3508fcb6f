use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use serde_json::Value;

use crate::utils::defer::defer;

use super::{CacheStore, RequestCoordinator};

/// Reports whether the network is currently reachable.
pub trait NetworkStatus: fmt::Debug + Send + Sync {
    fn is_online(&self) -> bool;
}

/// A [`NetworkStatus`] backed by a shared flag.
///
/// Whoever observes connectivity changes flips the flag, clones observe the change. Starts
/// out online.
#[derive(Debug, Clone)]
pub struct OnlineFlag(Arc<AtomicBool>);

impl OnlineFlag {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }
}

impl Default for OnlineFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus for OnlineFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Launcher for detached background work.
///
/// Tasks run on the current tokio runtime with their own sentry hub. Their errors are
/// logged and counted, nobody ever awaits them.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundTasks;

impl BackgroundTasks {
    pub fn spawn<F, E>(self, name: &'static str, key: String, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let task = async move {
            let transaction = sentry::start_transaction(sentry::TransactionContext::new(
                name,
                "background_task",
            ));
            sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

            if let Err(err) = task.await {
                metric!(counter("caches.refresh.error") += 1, "task" => name);
                tracing::warn!(key, task = name, error = %err, "Background task failed");
                transaction.set_status(sentry::protocol::SpanStatus::UnknownError);
            }

            transaction.finish();
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Re-fetches entries in the background when they are served from the cache.
///
/// This implements stale-while-revalidate: callers get the cached value right away, and a
/// fresh value replaces it once the background fetch completes. At most one fetch per key is
/// in flight, shared with foreground fetches through the [`RequestCoordinator`].
pub struct RefreshScheduler {
    store: Arc<CacheStore>,
    coordinator: RequestCoordinator,
    network: Arc<dyn NetworkStatus>,
    tasks: BackgroundTasks,
    /// Remaining number of refreshes allowed to run concurrently.
    available: Arc<AtomicIsize>,
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("network", &self.network)
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<CacheStore>,
        coordinator: RequestCoordinator,
        network: Arc<dyn NetworkStatus>,
        max_background_refreshes: isize,
    ) -> Self {
        Self {
            store,
            coordinator,
            network,
            tasks: BackgroundTasks,
            available: Arc::new(AtomicIsize::new(max_background_refreshes.max(1))),
        }
    }

    pub fn network(&self) -> &Arc<dyn NetworkStatus> {
        &self.network
    }

    /// Starts a background refresh of `key` if possible.
    ///
    /// Nothing happens while offline, while a fetch for `key` is already in flight, or when
    /// too many refreshes are running already. On success, the fresh value is stored for
    /// `ttl`. Failures are logged and the cached value stays in place.
    ///
    /// Returns whether a refresh was started.
    pub fn maybe_refresh<F, Fut, E>(&self, key: &str, ttl: Duration, fetch: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if !self.network.is_online() {
            tracing::trace!(key, "Skipping refresh while offline");
            return false;
        }

        let Some(guard) = self.coordinator.try_acquire(key) else {
            return false;
        };

        // We count down towards zero, and if we reach or surpass it, we will stop here.
        if self.available.fetch_sub(1, Ordering::Relaxed) <= 0 {
            self.available.fetch_add(1, Ordering::Relaxed);
            metric!(counter("caches.refresh.limit_hit") += 1);
            return false;
        }
        let done = {
            let available = Arc::clone(&self.available);
            defer(move || {
                available.fetch_add(1, Ordering::Relaxed);
            })
        };

        tracing::trace!(key, "Spawning background refresh");
        metric!(counter("caches.refresh.spawned") += 1);

        let store = Arc::clone(&self.store);
        let key = key.to_owned();
        let task = {
            let key = key.clone();
            async move {
                let _guard = guard;
                let _done = done;

                let value = fetch().await?;
                store.set(&key, Arc::new(value), ttl);
                Ok::<_, E>(())
            }
        };
        self.tasks.spawn("refresh", key, task);

        true
    }
}
