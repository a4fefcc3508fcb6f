use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{CacheStore, SweepStats};

/// Periodically removes expired entries from a [`CacheStore`].
///
/// The sweep itself walks the durable tier, so it runs on the blocking thread pool. Failures
/// are logged and never reach anyone. The timer stops on [`shutdown`](Self::shutdown), or
/// when the sweeper is dropped.
#[derive(Debug)]
pub struct ExpirySweeper {
    store: Arc<CacheStore>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Starts sweeping `store` every `interval`.
    ///
    /// The first sweep happens one full interval after starting. Must be called from within
    /// a tokio runtime.
    pub fn start(store: Arc<CacheStore>, interval: Duration) -> Self {
        let handle = tokio::spawn(sweep_loop(Arc::clone(&store), interval));
        tracing::debug!(interval = ?interval, "Started expiry sweeper");

        Self {
            store,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Runs a sweep right away, outside of the regular schedule.
    pub async fn sweep_now(&self) -> SweepStats {
        sweep(Arc::clone(&self.store)).await
    }

    /// Stops the timer. A sweep that is currently running on the blocking pool completes.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("Stopped expiry sweeper");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sweep_loop(store: Arc<CacheStore>, period: Duration) {
    // `interval_at` as a plain `interval` would tick immediately.
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        sweep(Arc::clone(&store)).await;
    }
}

pub(super) async fn sweep(store: Arc<CacheStore>) -> SweepStats {
    let start = tokio::time::Instant::now();
    let result = tokio::task::spawn_blocking(move || store.sweep_expired()).await;
    metric!(timer("caches.sweep.duration") = start.elapsed());

    match result {
        Ok(stats) => {
            tracing::info!(
                removed = stats.removed(),
                retained = stats.retained,
                failed = stats.failed,
                "Swept expired cache entries"
            );
            stats
        }
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "Expiry sweep failed");
            SweepStats::default()
        }
    }
}
