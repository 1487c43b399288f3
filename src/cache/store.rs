//! Cache store over the shared key/value storage.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::entry::{CacheConfig, CacheEntry, CacheMetadata, CacheOptions};
use crate::clock::{duration_ms, Clock, EpochMillis};
use crate::error::{Error, Result};
use crate::storage::{is_system_key, KeyValueStorage, LAST_SYNC_KEY, NAMESPACE};

/// Size of one stored key, as reported by [`CacheStore::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyInfo {
  pub key: String,
  pub size_bytes: usize,
}

/// TTL-bounded cache of server responses.
///
/// Reads never fail: missing, expired and unreadable entries all come back
/// as `None`. Expired entries are purged on the way. Unreadable ones are
/// left in place, since they may only fail to decode as the requested type.
pub struct CacheStore {
  storage: Arc<dyn KeyValueStorage>,
  clock: Arc<dyn Clock>,
  config: CacheConfig,
  /// Serializes read-modify-write of the last-sync map
  last_sync_lock: Mutex<()>,
}

impl CacheStore {
  /// Create a cache over `storage` with store-wide defaults from `config`.
  pub fn new(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
    Self {
      storage,
      clock,
      config,
      last_sync_lock: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Prefix `key` with the storage namespace unless it already has it.
  pub fn namespaced(key: &str) -> String {
    if key.starts_with(NAMESPACE) {
      key.to_string()
    } else {
      format!("{NAMESPACE}{key}")
    }
  }

  /// Cache key for an entity collection or a single entity.
  pub fn entity_key(entity_type: &str, entity_id: Option<&str>) -> String {
    match entity_id {
      Some(id) => format!("{NAMESPACE}{entity_type}_{id}"),
      None => format!("{NAMESPACE}{entity_type}"),
    }
  }

  /// Save `data` under `key` with the store defaults.
  pub fn save<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<()> {
    self.save_with(key, data, &CacheOptions::default())
  }

  /// Save `data` under `key`, overriding max age and version where given.
  pub fn save_with<T: Serialize + ?Sized>(
    &self,
    key: &str,
    data: &T,
    options: &CacheOptions,
  ) -> Result<()> {
    let key = Self::namespaced(key);
    if is_system_key(&key) {
      return Err(Error::ReservedKey(key));
    }

    let now = self.clock.now_ms();
    let max_age = options.max_age.unwrap_or(self.config.max_age);
    let entry = CacheEntry {
      data,
      metadata: CacheMetadata {
        timestamp: now,
        expires_at: Some(now.saturating_add(duration_ms(max_age))),
        version: options
          .version
          .clone()
          .unwrap_or_else(|| self.config.version.clone()),
      },
    };

    let serialized = serde_json::to_string(&entry)?;
    self.storage.set(&key, &serialized)?;
    debug!(key = %key, "cached response");

    self.record_last_sync(&key, now);
    Ok(())
  }

  /// Cached data for `key`, or `None` if missing, expired or unreadable.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.entry(key, false).map(|e| e.data)
  }

  /// Cached data for `key` even if it has expired.
  pub fn get_ignoring_expiry<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.entry(key, true).map(|e| e.data)
  }

  /// Full cache entry for `key`.
  pub fn entry<T: DeserializeOwned>(&self, key: &str, ignore_expiry: bool) -> Option<CacheEntry<T>> {
    let key = Self::namespaced(key);
    if is_system_key(&key) {
      return None;
    }

    let raw = match self.storage.get(&key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, error = %e, "failed to read cache entry");
        return None;
      }
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "discarding unreadable cache entry");
        return None;
      }
    };

    if !ignore_expiry && entry.is_expired(self.clock.now_ms()) {
      debug!(key = %key, "cache entry expired");
      self.purge(&key);
      return None;
    }

    Some(entry)
  }

  /// Whether `key` holds an unexpired entry. Never purges.
  pub fn is_valid(&self, key: &str) -> bool {
    let key = Self::namespaced(key);
    let Ok(Some(raw)) = self.storage.get(&key) else {
      return false;
    };
    match serde_json::from_str::<CacheEntry<serde::de::IgnoredAny>>(&raw) {
      Ok(entry) => !entry.is_expired(self.clock.now_ms()),
      Err(_) => false,
    }
  }

  /// Remove one cache entry.
  pub fn invalidate(&self, key: &str) -> Result<()> {
    let key = Self::namespaced(key);
    if is_system_key(&key) {
      warn!(key = %key, "refusing to invalidate system key");
      return Ok(());
    }
    self.storage.remove(&key)
  }

  /// Remove every cache entry, leaving queue and sync bookkeeping intact.
  pub fn invalidate_all(&self) -> Result<usize> {
    let keys: Vec<String> = self
      .storage
      .keys()?
      .into_iter()
      .filter(|k| k.starts_with(NAMESPACE) && !is_system_key(k))
      .collect();

    self.storage.remove_many(&keys)?;
    debug!(count = keys.len(), "invalidated all cache entries");
    Ok(keys.len())
  }

  /// When `key` was last saved from a server response.
  pub fn last_synced_at(&self, key: &str) -> Option<EpochMillis> {
    self.last_sync_map().get(&Self::namespaced(key)).copied()
  }

  /// Stored size of every namespaced key, system keys included.
  pub fn info(&self) -> Result<Vec<CacheKeyInfo>> {
    let mut info = Vec::new();
    for key in self.storage.keys()? {
      if !key.starts_with(NAMESPACE) {
        continue;
      }
      let size_bytes = self.storage.size_of(&key)?.unwrap_or(0);
      info.push(CacheKeyInfo { key, size_bytes });
    }
    Ok(info)
  }

  fn purge(&self, key: &str) {
    if let Err(e) = self.storage.remove(key) {
      warn!(key = %key, error = %e, "failed to purge expired cache entry");
    }
  }

  fn last_sync_map(&self) -> BTreeMap<String, EpochMillis> {
    match self.storage.get(LAST_SYNC_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "discarding unreadable last-sync map");
        BTreeMap::new()
      }),
      Ok(None) => BTreeMap::new(),
      Err(e) => {
        warn!(error = %e, "failed to read last-sync map");
        BTreeMap::new()
      }
    }
  }

  fn record_last_sync(&self, key: &str, now: EpochMillis) {
    let Ok(_guard) = self.last_sync_lock.lock() else {
      warn!("last-sync lock poisoned");
      return;
    };

    let mut map = self.last_sync_map();
    map.insert(key.to_string(), now);

    let result = serde_json::to_string(&map)
      .map_err(Error::from)
      .and_then(|raw| self.storage.set(LAST_SYNC_KEY, &raw));
    if let Err(e) = result {
      warn!(key = %key, error = %e, "failed to update last-sync map");
    }
  }
}
