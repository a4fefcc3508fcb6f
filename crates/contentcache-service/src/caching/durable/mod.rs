//! The durable cache tier.
//!
//! A durable store is a plain persistent key-value store. It knows nothing about expiry or
//! the envelope format, that is the job of [`CacheStore`](super::CacheStore).

use std::fmt;
use std::io;

mod fs;
mod memory;

pub use fs::{FsDurableStore, clear_tmp};
pub use memory::MemoryDurableStore;

/// A persistent key to bytes store that survives process restarts.
pub trait DurableStore: fmt::Debug + Send + Sync {
    /// Reads the record stored under `key`.
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Stores `record` under `key`, replacing any previous record.
    fn set(&self, key: &str, record: &[u8]) -> io::Result<()>;

    /// Removes the record stored under `key`.
    ///
    /// Removing a key that does not exist is not an error.
    fn remove(&self, key: &str) -> io::Result<()>;

    /// Removes the record stored under `key` if `predicate` holds for its current contents.
    ///
    /// A record written concurrently is only removed if the predicate also holds for it.
    /// Returns `None` if there is no record, otherwise whether it was removed.
    fn remove_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> io::Result<Option<bool>>;

    /// Lists every key currently stored.
    ///
    /// Parts of the store that cannot be listed are skipped and counted, the scan carries on
    /// with the rest. An error means nothing could be listed at all.
    fn keys(&self) -> io::Result<KeyScan>;
}

/// The keys found by [`DurableStore::keys`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyScan {
    pub keys: Vec<String>,
    /// Directories or entries that could not be listed. Their keys are missing from `keys`.
    pub failed: usize,
}
