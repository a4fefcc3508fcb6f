use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// Tracks which keys currently have a fetch in flight.
///
/// At most one [`FetchGuard`] exists per key at any time. Marking a key as in flight is a
/// compare-and-set under a lock, so two callers can never both believe they own a key.
///
/// Every in-flight key has a `watch` channel attached. Nothing is ever sent on it: the
/// channel is closed when the owning guard is dropped, which wakes up all waiters at once.
/// Clones share the same state.
#[derive(Clone)]
pub struct RequestCoordinator {
    in_flight: InFlight,
    wait_timeout: Duration,
}

impl fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.in_flight.try_lock().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("RequestCoordinator")
            .field("in flight", &in_flight)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

/// Outcome of [`RequestCoordinator::run_exclusive`].
#[derive(Debug, PartialEq, Eq)]
pub enum Exclusive<T> {
    /// No other fetch was in flight, the future was run to completion by this caller.
    Ran(T),
    /// Another caller's fetch for the same key has settled while we were waiting.
    ///
    /// The caller should consult the cache again instead of fetching.
    Settled,
    /// Another caller's fetch did not settle within the wait budget.
    ///
    /// The caller should fall back to fetching on its own.
    TimedOut,
}

/// Marks a key as in flight for as long as it is alive.
///
/// Dropping the guard clears the mark and wakes up all waiters. This happens no matter how
/// the fetch ends: success, error, panic, or the fetching future being dropped.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct FetchGuard {
    key: String,
    in_flight: InFlight,
    _done: watch::Sender<()>,
}

impl fmt::Debug for FetchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchGuard").field("key", &self.key).finish()
    }
}

impl FetchGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        // The sender is dropped right after this, once the key is already gone from the map.
        lock(&self.in_flight).remove(&self.key);
    }
}

/// Outcome of [`RequestCoordinator::enter`].
#[derive(Debug)]
pub enum Entry {
    /// The key was free and is now marked as in flight by the contained guard.
    Owner(FetchGuard),
    /// Another fetch for the key was in flight and has settled while waiting.
    Settled,
    /// Another fetch for the key was in flight and did not settle within the wait budget.
    TimedOut,
}

enum Acquired {
    Owner(FetchGuard),
    Waiter(watch::Receiver<()>),
}

impl RequestCoordinator {
    /// Creates a coordinator whose waiters give up after `wait_timeout`.
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            in_flight: Default::default(),
            wait_timeout,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Returns whether a fetch for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Marks `key` as in flight, unless it already is.
    pub fn try_acquire(&self, key: &str) -> Option<FetchGuard> {
        match self.acquire(key) {
            Acquired::Owner(guard) => Some(guard),
            Acquired::Waiter(_) => None,
        }
    }

    fn acquire(&self, key: &str) -> Acquired {
        let mut in_flight = lock(&self.in_flight);
        if let Some(receiver) = in_flight.get(key) {
            return Acquired::Waiter(receiver.clone());
        }

        let (sender, receiver) = watch::channel(());
        in_flight.insert(key.to_owned(), receiver);
        Acquired::Owner(FetchGuard {
            key: key.to_owned(),
            in_flight: Arc::clone(&self.in_flight),
            _done: sender,
        })
    }

    /// Marks `key` as in flight, or waits for the current fetch of `key` to settle.
    ///
    /// The compare-and-set happens on the first poll, before any suspension point. Waiting
    /// is bounded by `wait_timeout`.
    pub async fn enter(&self, key: &str, wait_timeout: Duration) -> Entry {
        let mut receiver = match self.acquire(key) {
            Acquired::Owner(guard) => return Entry::Owner(guard),
            Acquired::Waiter(receiver) => receiver,
        };

        tracing::trace!(key, "Waiting for in-flight fetch");
        // Nothing is ever sent, so `changed` only returns once the sender is gone.
        match tokio::time::timeout(wait_timeout, receiver.changed()).await {
            Ok(_) => Entry::Settled,
            Err(_) => Entry::TimedOut,
        }
    }

    /// Runs `fetch` unless a fetch for `key` is already in flight.
    ///
    /// The key is cleared once `fetch` completes. If another fetch is already in flight, this
    /// waits for it to settle instead, for at most the configured wait timeout.
    pub async fn run_exclusive<F>(&self, key: &str, fetch: F) -> Exclusive<F::Output>
    where
        F: Future,
    {
        match self.enter(key, self.wait_timeout).await {
            Entry::Owner(guard) => {
                let output = fetch.await;
                drop(guard);
                Exclusive::Ran(output)
            }
            Entry::Settled => Exclusive::Settled,
            Entry::TimedOut => Exclusive::TimedOut,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
