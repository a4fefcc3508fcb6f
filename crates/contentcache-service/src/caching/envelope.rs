use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::clock::Timestamp;

use super::CacheError;

/// A cached payload together with the time it expires.
///
/// Envelopes are never modified in place. A newer write for the same key replaces the whole
/// envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEnvelope {
    pub value: Arc<Value>,
    pub expires_at: Timestamp,
}

impl CacheEnvelope {
    pub fn new(value: Arc<Value>, expires_at: Timestamp) -> Self {
        Self { value, expires_at }
    }

    /// An envelope is valid strictly before its expiry. At `now == expires_at` it is expired.
    pub fn is_valid(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }

    /// Serializes this envelope into its durable form: `{"data": .., "expiry": ..}`.
    pub fn to_record(&self) -> Result<Vec<u8>, CacheError> {
        let record = DurableRecordRef {
            data: &self.value,
            expiry: self.expires_at,
        };
        serde_json::to_vec(&record).map_err(CacheError::Serialize)
    }

    /// Parses an envelope from its durable form.
    pub fn from_record(bytes: &[u8]) -> Result<Self, CacheError> {
        let record: DurableRecord = serde_json::from_slice(bytes).map_err(CacheError::Corrupt)?;
        Ok(Self {
            value: Arc::new(record.data),
            expires_at: record.expiry,
        })
    }
}

#[derive(Deserialize)]
struct DurableRecord {
    data: Value,
    expiry: Timestamp,
}

#[derive(Serialize)]
struct DurableRecordRef<'a> {
    data: &'a Value,
    expiry: Timestamp,
}
