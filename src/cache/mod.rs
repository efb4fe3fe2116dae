//! Request/response caching for offline support.
//!
//! This module provides the two-namespace cache used by the worker:
//! - A static cache filled once per version from a fixed asset list
//! - A dynamic cache filled at runtime from successful GET responses
//! - Network-first and cache-first strategies over a fetcher closure
//! - Version pruning, so only the current generation survives activation

mod layer;
mod storage;
mod types;

pub use layer::{CacheLayer, CacheNames};
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{CacheEntry, CacheKey, CacheResult};

#[cfg(test)]
pub use types::CacheSource;
