//! Response cache for offline reads.
//!
//! This module provides a TTL-bounded, versioned cache that:
//! - Wraps each value with `{ timestamp, expiresAt, version }` metadata
//! - Purges entries read past their expiry
//! - Treats unreadable records as misses instead of errors
//! - Tracks when each key was last refreshed from the server

mod entry;
mod store;

pub use entry::{CacheConfig, CacheEntry, CacheMetadata, CacheOptions};
pub use store::{CacheKeyInfo, CacheStore};
