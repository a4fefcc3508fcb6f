use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use serde_json::Value;

use crate::utils::clock::{Clock, Timestamp, expires_at};

use super::cache_error::log_durable_error;
use super::{CacheEnvelope, CacheError, DurableStore, KeyScan};

type VolatileTier = moka::sync::Cache<String, CacheEnvelope>;

/// The two-tier cache store.
///
/// A volatile in-memory map sits in front of an optional [`DurableStore`]. Reads go through
/// the volatile tier first and fall back to the durable tier, promoting valid durable entries.
/// Writes go to both tiers, with the volatile tier being authoritative for the lifetime of
/// the process: a failed durable write is logged and otherwise ignored.
///
/// Durable keys are prefixed with a namespace, so the durable store can be shared with
/// unrelated data. Only keys within the namespace are ever touched.
pub struct CacheStore {
    volatile: VolatileTier,
    durable: Option<Arc<dyn DurableStore>>,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("volatile items", &self.volatile.entry_count())
            .field("durable", &self.durable)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Counters of a single sweep over both tiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired volatile entries.
    pub removed_volatile: usize,
    /// Expired or corrupt durable records.
    pub removed_durable: usize,
    /// Entries across both tiers that are still valid.
    pub retained: usize,
    /// Durable records that could not be inspected or removed.
    pub failed: usize,
}

impl SweepStats {
    pub fn removed(&self) -> usize {
        self.removed_volatile + self.removed_durable
    }
}

impl CacheStore {
    pub fn new(
        durable: Option<Arc<dyn DurableStore>>,
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            volatile: VolatileTier::builder().name("contentcache").build(),
            durable,
            namespace: namespace.into(),
            clock,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    /// Looks up a valid entry.
    ///
    /// Returns `None` for missing and expired entries. Failures to read the durable tier are
    /// logged and reported as a miss, corrupt durable records are deleted.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.get_envelope(key).map(|envelope| envelope.value)
    }

    /// Like [`get`](Self::get), but returns the whole envelope.
    pub fn get_envelope(&self, key: &str) -> Option<CacheEnvelope> {
        let now = self.now();

        if let Some(envelope) = self.volatile.get(key) {
            if envelope.is_valid(now) {
                metric!(counter("caches.memory.hit") += 1);
                return Some(envelope);
            }
            self.volatile.invalidate(key);
        }

        let envelope = self.read_durable(key)?;
        if !envelope.is_valid(now) {
            return None;
        }

        metric!(counter("caches.durable.hit") += 1);
        tracing::trace!(key, "Promoting durable entry");
        let promoted = envelope.clone();
        self.volatile
            .entry_by_ref(key)
            .and_compute_with(|entry| match entry {
                // a concurrent `set` got there first
                Some(entry) if entry.value().is_valid(now) => Op::Nop,
                _ => Op::Put(promoted),
            });

        // A concurrent `delete` may have removed the record after it was read above. It
        // removes the durable record before the volatile entry, so checking the durable tier
        // again guarantees the promoted copy does not outlive the record.
        if self.read_durable(key).as_ref() != Some(&envelope) {
            self.volatile
                .entry_by_ref(key)
                .and_compute_with(|entry| match entry {
                    Some(entry) if entry.value() == &envelope => Op::Remove,
                    _ => Op::Nop,
                });
        }

        Some(envelope)
    }

    fn read_durable(&self, key: &str) -> Option<CacheEnvelope> {
        let durable = self.durable.as_ref()?;
        let durable_key = self.durable_key(key);

        let result = durable
            .get(&durable_key)
            .map_err(CacheError::from)
            .and_then(|raw| raw.map(|raw| CacheEnvelope::from_record(&raw)).transpose());

        match result {
            Ok(envelope) => envelope,
            Err(err) => {
                log_durable_error(&err, key, "get");
                if is_corrupt(&err) {
                    metric!(counter("caches.durable.corrupt") += 1);
                    if let Err(err) = durable.remove(&durable_key) {
                        log_durable_error(&err.into(), key, "remove");
                    }
                }
                None
            }
        }
    }

    /// Stores `value` for `ttl` in both tiers.
    pub fn set(&self, key: &str, value: Arc<Value>, ttl: Duration) {
        let envelope = CacheEnvelope::new(value, expires_at(self.now(), ttl));

        if let Some(durable) = &self.durable {
            let result = envelope
                .to_record()
                .and_then(|record| Ok(durable.set(&self.durable_key(key), &record)?));
            if let Err(err) = result {
                log_durable_error(&err, key, "set");
            }
        }

        self.volatile.insert(key.to_owned(), envelope);
    }

    /// Removes `key` from both tiers.
    ///
    /// The durable record goes first, see [`get_envelope`](Self::get_envelope).
    pub fn delete(&self, key: &str) {
        if let Some(durable) = &self.durable {
            if let Err(err) = durable.remove(&self.durable_key(key)) {
                log_durable_error(&err.into(), key, "remove");
            }
        }
        self.volatile.invalidate(key);
    }

    /// Removes every key starting with `prefix` from both tiers.
    ///
    /// Returns the number of distinct keys that were removed.
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = HashSet::new();

        for (key, _) in self.volatile.iter() {
            if key.starts_with(prefix) {
                self.volatile.invalidate(key.as_str());
                removed.insert(String::clone(&key));
            }
        }

        let scan = self.durable_keys();
        if scan.failed > 0 {
            tracing::warn!(
                prefix,
                failed = scan.failed,
                "Some durable records could not be listed for invalidation"
            );
        }
        for key in scan.keys {
            if key.starts_with(prefix) {
                self.delete(&key);
                removed.insert(key);
            }
        }

        metric!(counter("caches.invalidate.prefix") += removed.len() as i64);
        tracing::debug!(prefix, removed = removed.len(), "Invalidated cache entries by prefix");
        removed.len()
    }

    /// Removes every entry of this cache from both tiers.
    pub fn clear(&self) {
        self.delete_by_prefix("");
        self.volatile.invalidate_all();
    }

    /// Lists all cache keys (without namespace) in the durable tier.
    ///
    /// A scan that fails as a whole is reported as a single failure.
    fn durable_keys(&self) -> KeyScan {
        let Some(durable) = &self.durable else {
            return KeyScan::default();
        };
        match durable.keys() {
            Ok(scan) => KeyScan {
                keys: scan
                    .keys
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.namespace).map(str::to_owned))
                    .collect(),
                failed: scan.failed,
            },
            Err(err) => {
                log_durable_error(&err.into(), &self.namespace, "keys");
                KeyScan {
                    keys: Vec::new(),
                    failed: 1,
                }
            }
        }
    }

    /// Deletes every entry with `expires_at <= now` from both tiers.
    pub fn sweep_expired(&self) -> SweepStats {
        self.sweep_expired_with(false)
    }

    /// Walks both tiers and removes expired entries, along with corrupt durable records.
    ///
    /// If `dry_run` is `true`, nothing is actually deleted. Errors are handled per entry, a
    /// single bad record never aborts the sweep.
    pub fn sweep_expired_with(&self, dry_run: bool) -> SweepStats {
        let now = self.now();
        let mut stats = SweepStats::default();

        for (key, envelope) in self.volatile.iter() {
            if envelope.is_valid(now) {
                stats.retained += 1;
                continue;
            }
            if dry_run {
                stats.removed_volatile += 1;
                continue;
            }
            // Expiry is checked again under the entry lock, a fresh `set` must survive.
            let result = self
                .volatile
                .entry_by_ref(key.as_str())
                .and_compute_with(|entry| match entry {
                    Some(entry) if !entry.value().is_valid(now) => Op::Remove,
                    _ => Op::Nop,
                });
            match result {
                CompResult::Removed(_) => stats.removed_volatile += 1,
                CompResult::Unchanged(_) => stats.retained += 1,
                _ => {}
            }
        }

        if let Some(durable) = &self.durable {
            let scan = self.durable_keys();
            stats.failed += scan.failed;

            for key in scan.keys {
                let durable_key = self.durable_key(&key);
                let is_expired = |raw: &[u8]| match CacheEnvelope::from_record(raw) {
                    Ok(envelope) => !envelope.is_valid(now),
                    Err(err) => {
                        log_durable_error(&err, &key, "sweep");
                        true
                    }
                };

                let outcome = if dry_run {
                    durable
                        .get(&durable_key)
                        .map(|raw| raw.map(|raw| is_expired(&raw)))
                } else {
                    durable.remove_if(&durable_key, &is_expired)
                };

                match outcome {
                    Ok(Some(true)) => {
                        tracing::trace!(key, "Swept durable entry");
                        stats.removed_durable += 1;
                    }
                    Ok(Some(false)) => stats.retained += 1,
                    // removed in the meantime
                    Ok(None) => {}
                    Err(err) => {
                        log_durable_error(&err.into(), &key, "sweep");
                        stats.failed += 1;
                    }
                }
            }
        }

        metric!(counter("caches.sweep.removed") += stats.removed() as i64);
        metric!(gauge("caches.sweep.retained") = stats.retained as u64);
        stats
    }
}

fn is_corrupt(err: &CacheError) -> bool {
    match err {
        CacheError::Io(e) => e.kind() == std::io::ErrorKind::InvalidData,
        err => err.is_corrupt(),
    }
}
