//! Durable FIFO queue of mutations waiting to reach the server.
//!
//! The whole list is stored as one JSON array. Every mutation runs its
//! read-modify-write under the queue lock and refreshes the published
//! `pending_count` before the lock is released, so subscribers never see a
//! count that disagrees with the stored list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, EpochMillis};
use crate::error::Result;
use crate::http::{HttpRequest, Mutation};
use crate::status::SyncStatusPublisher;
use crate::storage::{KeyValueStorage, PENDING_REQUESTS_KEY};

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
  pub id: String,
  /// Endpoint as the caller gave it; resolved at replay time
  pub url: String,
  pub method: Mutation,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub headers: BTreeMap<String, String>,
  pub entity_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entity_id: Option<String>,
  pub timestamp: EpochMillis,
  pub retry_count: u32,
}

impl PendingRequest {
  /// The request to send when replaying this entry.
  pub fn to_http(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.into(),
      url: self.url.clone(),
      body: self.body.clone(),
      headers: self.headers.clone(),
    }
  }
}

/// Fields supplied by the caller when queuing a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingRequest {
  pub url: String,
  pub method: Mutation,
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
  pub entity_type: String,
  pub entity_id: Option<String>,
}

/// Persistent queue of pending mutations.
pub struct PendingRequestQueue {
  storage: Arc<dyn KeyValueStorage>,
  clock: Arc<dyn Clock>,
  status: Arc<SyncStatusPublisher>,
  lock: Mutex<()>,
}

impl PendingRequestQueue {
  pub fn new(
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    status: Arc<SyncStatusPublisher>,
  ) -> Self {
    Self {
      storage,
      clock,
      status,
      lock: Mutex::new(()),
    }
  }

  /// Re-derive the published `pending_count` from the stored list.
  pub fn reconcile(&self) -> Result<usize> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    let len = self.read()?.len();
    self.status.update(|s| s.pending_count = len);
    Ok(len)
  }

  /// Append a mutation and return the stored entry.
  pub fn enqueue(&self, request: NewPendingRequest) -> Result<PendingRequest> {
    let now = self.clock.now_ms();
    let entry = PendingRequest {
      id: new_request_id(now),
      url: request.url,
      method: request.method,
      body: request.body,
      headers: request.headers,
      entity_type: request.entity_type,
      entity_id: request.entity_id,
      timestamp: now,
      retry_count: 0,
    };

    let stored = entry.clone();
    let len = self.mutate(move |pending| {
      pending.push(stored);
      pending.len()
    })?;

    info!(
      request_id = %entry.id,
      method = ?entry.method,
      url = %entry.url,
      pending = len,
      "queued request for later sync"
    );
    Ok(entry)
  }

  /// All pending requests in insertion order.
  pub fn list(&self) -> Result<Vec<PendingRequest>> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    self.read()
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.list()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Remove one request. Returns whether it was present.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self.mutate(|pending| {
      let before = pending.len();
      pending.retain(|r| r.id != id);
      pending.len() != before
    })?;
    debug!(request_id = %id, removed, "removed pending request");
    Ok(removed)
  }

  /// Bump the retry count of one request. Returns the new count.
  pub fn increment_retry(&self, id: &str) -> Result<Option<u32>> {
    self.mutate(|pending| {
      pending.iter_mut().find(|r| r.id == id).map(|r| {
        r.retry_count += 1;
        r.retry_count
      })
    })
  }

  /// Drop every pending request.
  pub fn clear(&self) -> Result<()> {
    self.mutate(Vec::clear)
  }

  /// Read, apply `f`, write back, and publish the new length, all under the
  /// queue lock.
  fn mutate<R>(&self, f: impl FnOnce(&mut Vec<PendingRequest>) -> R) -> Result<R> {
    let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

    let mut pending = self.read()?;
    let result = f(&mut pending);
    self.write(&pending)?;

    let len = pending.len();
    self.status.update(|s| s.pending_count = len);
    Ok(result)
  }

  fn read(&self) -> Result<Vec<PendingRequest>> {
    match self.storage.get(PENDING_REQUESTS_KEY)? {
      Some(raw) => Ok(serde_json::from_str(&raw)?),
      None => Ok(Vec::new()),
    }
  }

  fn write(&self, pending: &[PendingRequest]) -> Result<()> {
    let raw = serde_json::to_string(pending)?;
    self.storage.set(PENDING_REQUESTS_KEY, &raw)
  }
}

/// `<epoch-ms>-<9 random hex chars>`.
fn new_request_id(now: EpochMillis) -> String {
  let random = Uuid::new_v4().simple().to_string();
  format!("{now}-{}", &random[..9])
}
