//! Durable key/value storage shared by the cache, the pending-request queue
//! and the sync bookkeeping.
//!
//! Each consumer owns its own keys. Cache records live under the
//! [`NAMESPACE`] prefix; the three system keys below share the prefix but are
//! never touched by cache invalidation.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;

/// Prefix for every key the data layer writes.
pub const NAMESPACE: &str = "@offline_";

/// Persisted pending-request list.
pub const PENDING_REQUESTS_KEY: &str = "@offline_pending_requests";

/// Persisted sync status snapshot.
pub const SYNC_STATUS_KEY: &str = "@offline_sync_status";

/// Per-key "last synced at" map.
pub const LAST_SYNC_KEY: &str = "@offline_last_sync";

/// Keys that belong to the queue and sync bookkeeping rather than the cache.
pub const SYSTEM_KEYS: [&str; 3] = [PENDING_REQUESTS_KEY, SYNC_STATUS_KEY, LAST_SYNC_KEY];

/// Whether `key` is one of the system keys.
pub fn is_system_key(key: &str) -> bool {
  SYSTEM_KEYS.contains(&key)
}

/// Trait for key/value storage backends.
///
/// Values are opaque strings (JSON in practice). Every call is atomic on its
/// own; callers that need read-modify-write consistency hold their own lock.
pub trait KeyValueStorage: Send + Sync {
  /// Read a value.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace a value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a value. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// Remove several values at once.
  fn remove_many(&self, keys: &[String]) -> Result<()>;

  /// All stored keys, sorted.
  fn keys(&self) -> Result<Vec<String>>;

  /// Size of the stored value in bytes.
  fn size_of(&self, key: &str) -> Result<Option<usize>> {
    Ok(self.get(key)?.map(|v| v.len()))
  }
}
