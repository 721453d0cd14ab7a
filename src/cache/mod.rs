//! Durable generational cache for request/response snapshots.
//!
//! This module provides the storage the worker serves from:
//! - One named generation per worker version
//! - GET-only keys (method + URL)
//! - Atomic multi-entry writes for manifest pre-caching
//! - Lookup within one generation or across all of them

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::{CacheKey, CacheStorage, ResponseSnapshot};
