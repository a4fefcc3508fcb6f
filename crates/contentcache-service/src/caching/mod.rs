//! # Content caching infrastructure
//!
//! This module caches the results of slow fetches, typically JSON payloads of remote APIs, and
//! makes sure concurrent callers do not fetch the same thing twice.
//!
//! ## Cache Layers
//!
//! The cache consists of two tiers:
//!
//! - A volatile in-memory tier, which is fast and lost on restart.
//! - An optional durable tier behind the [`DurableStore`] trait, which survives restarts. The
//!   [`FsDurableStore`] keeps one file per entry below the configured `cache_dir`.
//!
//! Every entry is stored together with its expiry timestamp. An entry is valid strictly before
//! it expires, expired entries are treated as missing on read and removed by the periodic
//! [`ExpirySweeper`].
//!
//! A request through [`ContentCache::fetch_with_cache`] goes through the following steps:
//! - First, it looks into the volatile tier.
//! - On miss, it looks into the durable tier, promoting valid entries to the volatile tier.
//! - On hit, the value is returned right away, and a refresh is started in the background
//!   (stale-while-revalidate), unless disabled for this request.
//! - On miss, the [`RequestCoordinator`] makes sure only one fetch per key is in flight. Other
//!   callers wait for that fetch to settle and read its result from the cache. Should the wait
//!   take too long, they fall back to fetching on their own.
//! - The fetched value is written to both tiers.
//!
//! Failures of the durable tier are never visible to callers. They are logged, and treated as a
//! cache miss. Corrupt durable records are removed right away.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the volatile tier.
//! - `caches.durable.hit`: Accesses served by the durable tier.
//! - `caches.miss`: Accesses served by neither tier.
//! - `caches.fetch`: Actual fetches being run.
//! - `caches.coalesced`: Callers that waited for the fetch of another caller.
//! - `caches.wait_timeout`: Callers that gave up waiting and fetched on their own.
//! - `caches.refresh.spawned`: Background refreshes.
//!
//! ### Configuration
//!
//! The durable tier is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir)
//! option. [`CacheConfig`](crate::config::CacheConfig) holds the default time-to-live, the
//! sweep interval, the wait timeout and the limit of concurrent background refreshes.

mod cache_error;
mod coordinator;
mod durable;
mod envelope;
mod facade;
mod refresh;
mod store;
mod sweeper;

pub use cache_error::CacheError;
pub use coordinator::{Entry, Exclusive, FetchGuard, RequestCoordinator};
pub use durable::{DurableStore, FsDurableStore, KeyScan, MemoryDurableStore, clear_tmp};
pub use envelope::CacheEnvelope;
pub use facade::{ContentCache, ContentCacheBuilder, FetchOptions};
pub use refresh::{BackgroundTasks, NetworkStatus, OnlineFlag, RefreshScheduler};
pub use store::{CacheStore, SweepStats};
pub use sweeper::ExpirySweeper;
