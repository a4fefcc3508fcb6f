//! Content cache and request coordination.
//!
//! See the [`caching`] module for an overview of how the cache layers fit together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod keys;
pub mod logging;
pub mod utils;

pub use caching::{ContentCache, FetchOptions};
