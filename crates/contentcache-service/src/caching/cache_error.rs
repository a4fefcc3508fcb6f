use std::io;

use thiserror::Error;

/// An error that happens while reading or writing the durable tier.
///
/// None of these are ever surfaced to callers of the cache. They are logged, and the
/// affected entry is treated as a cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The durable store could not be accessed.
    #[error("durable store i/o failed")]
    Io(#[from] io::Error),
    /// A durable record exists but cannot be parsed as an envelope.
    #[error("corrupt durable record: {0}")]
    Corrupt(#[source] serde_json::Error),
    /// A value could not be serialized into a durable record.
    #[error("failed to serialize durable record")]
    Serialize(#[source] serde_json::Error),
}

impl CacheError {
    /// Whether this error means the stored record itself is bad and should be deleted.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Logs a durable tier error for the given key.
///
/// The error is attached as a `dyn Error` so the whole source chain ends up in the log.
pub(super) fn log_durable_error(err: &CacheError, key: &str, operation: &'static str) {
    let err: &dyn std::error::Error = err;
    tracing::error!(error = err, key, operation, "Durable cache tier failed");
}
