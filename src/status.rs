//! Sync status published to UI badges.
//!
//! Consumers subscribe to a `watch` channel instead of polling: every change
//! made through [`SyncStatusPublisher::update`] is pushed to subscribers and
//! written through to storage so a restart shows the last known state.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::warn;

use crate::clock::EpochMillis;
use crate::storage::{KeyValueStorage, SYNC_STATUS_KEY};

/// A pending request that failed during the most recent drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
  pub request_id: String,
  pub error: String,
  pub timestamp: EpochMillis,
  pub entity_type: String,
}

/// Snapshot of sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_syncing: bool,
  /// Always equal to the pending queue length
  pub pending_count: usize,
  pub last_sync_time: Option<EpochMillis>,
  pub last_sync_success: bool,
  /// Failures from the most recent drain only
  #[serde(default)]
  pub sync_errors: Vec<SyncError>,
}

impl Default for SyncStatus {
  fn default() -> Self {
    Self {
      is_syncing: false,
      pending_count: 0,
      last_sync_time: None,
      last_sync_success: true,
      sync_errors: Vec::new(),
    }
  }
}

impl SyncStatus {
  /// Whether a status badge should be shown.
  pub fn needs_attention(&self) -> bool {
    self.pending_count > 0 || self.is_syncing
  }

  /// Human-readable age of the last sync.
  pub fn last_sync_label(&self, now: EpochMillis) -> String {
    let Some(last) = self.last_sync_time else {
      return "Never synced".to_string();
    };

    let minutes = now.saturating_sub(last).max(0) / 60_000;
    let hours = minutes / 60;

    if minutes < 1 {
      "Just now".to_string()
    } else if minutes < 60 {
      format!("{minutes}m ago")
    } else if hours < 24 {
      format!("{hours}h ago")
    } else {
      "Over 24h ago".to_string()
    }
  }
}

/// Owner of the live [`SyncStatus`].
pub struct SyncStatusPublisher {
  storage: Arc<dyn KeyValueStorage>,
  tx: watch::Sender<SyncStatus>,
  /// Orders modify + persist so the stored snapshot never goes backwards
  write_lock: Mutex<()>,
}

impl SyncStatusPublisher {
  /// Restore the last persisted status, or start from the default.
  ///
  /// `is_syncing` is always reset: a drain cannot survive a restart.
  pub fn load(storage: Arc<dyn KeyValueStorage>) -> Self {
    let mut status = match storage.get(SYNC_STATUS_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "discarding unreadable sync status");
        SyncStatus::default()
      }),
      Ok(None) => SyncStatus::default(),
      Err(e) => {
        warn!(error = %e, "failed to read sync status");
        SyncStatus::default()
      }
    };
    status.is_syncing = false;

    let (tx, _) = watch::channel(status);
    Self {
      storage,
      tx,
      write_lock: Mutex::new(()),
    }
  }

  /// Current status snapshot.
  pub fn current(&self) -> SyncStatus {
    self.tx.borrow().clone()
  }

  /// Subscribe to status changes.
  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.tx.subscribe()
  }

  /// Apply `f` to the status, notify subscribers if anything changed, and
  /// persist the result. Returns the new snapshot.
  pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
    let _guard = self
      .write_lock
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);

    let mut changed = false;
    self.tx.send_if_modified(|status| {
      let before = status.clone();
      f(status);
      changed = *status != before;
      changed
    });

    let snapshot = self.current();
    if changed {
      self.persist(&snapshot);
    }
    snapshot
  }

  fn persist(&self, status: &SyncStatus) {
    let result = serde_json::to_string(status)
      .map_err(crate::error::Error::from)
      .and_then(|raw| self.storage.set(SYNC_STATUS_KEY, &raw));
    if let Err(e) = result {
      warn!(error = %e, "failed to persist sync status");
    }
  }
}
