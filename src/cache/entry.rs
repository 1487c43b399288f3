//! Cache record types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::EpochMillis;

/// Default cache lifetime: 24 hours.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default schema version stamped on new entries.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Store-wide cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
  /// How long a saved entry stays valid
  pub max_age: Duration,
  /// Schema version written into each entry
  pub version: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_age: DEFAULT_MAX_AGE,
      version: DEFAULT_VERSION.to_string(),
    }
  }
}

/// Per-save overrides of [`CacheConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
  pub max_age: Option<Duration>,
  pub version: Option<String>,
}

impl CacheOptions {
  pub fn max_age(max_age: Duration) -> Self {
    Self {
      max_age: Some(max_age),
      version: None,
    }
  }
}

/// Metadata stored next to every cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// When the entry was written
  pub timestamp: EpochMillis,
  /// When the entry stops being valid. Records without one never expire.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<EpochMillis>,
  /// Schema version of the payload
  pub version: String,
}

/// A cached value with its metadata, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
  /// An entry is expired strictly after its `expires_at`.
  pub fn is_expired(&self, now: EpochMillis) -> bool {
    matches!(self.metadata.expires_at, Some(expires_at) if now > expires_at)
  }
}
