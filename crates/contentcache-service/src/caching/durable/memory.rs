use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DurableStore, KeyScan};

/// A [`DurableStore`] that keeps everything in memory.
///
/// Nothing is actually persisted. This is meant for tests, and for embedding the cache
/// somewhere that brings its own persistence. Reads and writes can be made to fail on
/// purpose to exercise error handling.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    unlisted_prefix: Mutex<Option<String>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `get` and `keys` call fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent `set` and `remove` call fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes `keys` skip and count every key starting with `prefix`, like a directory that
    /// cannot be listed.
    pub fn fail_listing(&self, prefix: Option<&str>) {
        *self
            .unlisted_prefix
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = prefix.map(str::to_owned);
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(flag: &AtomicBool) -> io::Result<()> {
        if flag.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected durable store failure"));
        }
        Ok(())
    }
}

impl DurableStore for MemoryDurableStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Self::check(&self.fail_reads)?;
        Ok(self.records().get(key).cloned())
    }

    fn set(&self, key: &str, record: &[u8]) -> io::Result<()> {
        Self::check(&self.fail_writes)?;
        self.records().insert(key.to_owned(), record.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        Self::check(&self.fail_writes)?;
        self.records().remove(key);
        Ok(())
    }

    fn remove_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> io::Result<Option<bool>> {
        Self::check(&self.fail_writes)?;
        let mut records = self.records();
        let Some(record) = records.get(key) else {
            return Ok(None);
        };
        let remove = predicate(record);
        if remove {
            records.remove(key);
        }
        Ok(Some(remove))
    }

    fn keys(&self) -> io::Result<KeyScan> {
        Self::check(&self.fail_reads)?;
        let unlisted = self
            .unlisted_prefix
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut scan = KeyScan::default();
        for key in self.records().keys() {
            match &unlisted {
                Some(prefix) if key.starts_with(prefix.as_str()) => scan.failed += 1,
                _ => scan.keys.push(key.clone()),
            }
        }
        Ok(scan)
    }
}
