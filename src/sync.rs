//! Replays the pending queue against the server.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::http::HttpExecutor;
use crate::network::NetworkMonitor;
use crate::notify::{changes, NotificationKind, Notifier};
use crate::queue::{PendingRequest, PendingRequestQueue};
use crate::status::{SyncError, SyncStatusPublisher};

/// Default number of failed replays an entry survives before it is dropped.
pub const DEFAULT_MAX_REPLAY_RETRIES: u32 = 3;

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadyRunning,
  Offline,
}

/// Counts from one completed drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  /// Failed and kept for another attempt
  pub retained: usize,
  /// Failed at the retry ceiling and removed
  pub dropped: usize,
  pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  Skipped(SkipReason),
  Completed(DrainReport),
}

impl DrainOutcome {
  pub fn report(&self) -> Option<&DrainReport> {
    match self {
      Self::Completed(report) => Some(report),
      Self::Skipped(_) => None,
    }
  }
}

/// Clears the in-progress flag when the drain ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Drains the [`PendingRequestQueue`], at most one drain at a time.
pub struct SyncOrchestrator {
  queue: Arc<PendingRequestQueue>,
  http: Arc<HttpExecutor>,
  network: Arc<NetworkMonitor>,
  status: Arc<SyncStatusPublisher>,
  notifier: Arc<dyn Notifier>,
  clock: Arc<dyn Clock>,
  max_replay_retries: u32,
  in_progress: AtomicBool,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<PendingRequestQueue>,
    http: Arc<HttpExecutor>,
    network: Arc<NetworkMonitor>,
    status: Arc<SyncStatusPublisher>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      queue,
      http,
      network,
      status,
      notifier,
      clock,
      max_replay_retries: DEFAULT_MAX_REPLAY_RETRIES,
      in_progress: AtomicBool::new(false),
    }
  }

  pub fn with_max_replay_retries(mut self, max: u32) -> Self {
    self.max_replay_retries = max;
    self
  }

  pub fn is_syncing(&self) -> bool {
    self.in_progress.load(Ordering::Acquire)
  }

  /// Replay every pending request once.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    if !self.network.is_online() {
      debug!("skipping drain while offline");
      return Ok(DrainOutcome::Skipped(SkipReason::Offline));
    }
    if self
      .in_progress
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already in progress");
      return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
    }
    let _in_flight = InFlight(&self.in_progress);

    let started = self.clock.now_ms();
    self.status.update(|s| {
      s.is_syncing = true;
      s.last_sync_time = Some(started);
    });

    let result = match self.replay_all().await {
      Ok(report) => self.finish(&report).map(|()| report),
      Err(e) => Err(e),
    };
    result
      .map(DrainOutcome::Completed)
      .map_err(|e| self.abort(e))
  }

  /// User-initiated sync. Fails while offline.
  pub async fn manual_sync(&self) -> Result<DrainOutcome> {
    if !self.network.is_online() {
      self
        .notifier
        .notify(NotificationKind::Error, "Offline", "Cannot sync while offline");
      return Err(Error::SyncOffline);
    }
    self.drain().await
  }

  /// Drain once per offline to online transition. A transition within
  /// `debounce` of the previous trigger defers its drain until the window
  /// closes, so flaps collapse into one trailing drain.
  pub fn spawn_reconnect_watcher(
    self: &Arc<Self>,
    debounce: Duration,
    cancel: CancellationToken,
  ) -> JoinHandle<()> {
    let this = Arc::clone(self);
    let mut rx = self.network.subscribe();
    let mut was_online = rx.borrow_and_update().is_online();

    tokio::spawn(async move {
      let mut last_trigger: Option<Instant> = None;
      let mut deferred: Option<Instant> = None;
      loop {
        let trigger = tokio::select! {
          _ = cancel.cancelled() => break,
          _ = sleep_until_deadline(deferred) => {
            deferred = None;
            true
          }
          changed = rx.changed() => {
            if changed.is_err() {
              break;
            }
            let online = rx.borrow_and_update().is_online();
            let reconnected = online && !was_online;
            was_online = online;
            if !reconnected {
              continue;
            }

            match last_trigger {
              Some(at) if at.elapsed() < debounce => {
                if deferred.is_none() {
                  debug!("reconnect within debounce window, deferring drain");
                  deferred = Some(at + debounce);
                }
                false
              }
              _ => true,
            }
          }
        };
        if !trigger {
          continue;
        }

        last_trigger = Some(Instant::now());
        info!("back online, draining pending requests");
        if let Err(e) = this.drain().await {
          warn!(error = %e, "reconnect drain failed");
        }
      }
      debug!("reconnect watcher stopped");
    })
  }

  async fn replay_all(&self) -> Result<DrainReport> {
    let pending = self.queue.list()?;
    let mut report = DrainReport {
      attempted: pending.len(),
      ..DrainReport::default()
    };
    if pending.is_empty() {
      return Ok(report);
    }

    info!(count = pending.len(), "replaying pending requests");
    let results = join_all(pending.iter().map(|entry| self.replay(entry))).await;

    for (entry, result) in pending.iter().zip(results) {
      match result {
        Ok(()) => {
          self.queue.remove(&entry.id)?;
          report.synced += 1;
        }
        Err(e) => {
          warn!(
            request_id = %entry.id,
            url = %entry.url,
            retry_count = entry.retry_count,
            error = %e,
            "replay failed"
          );
          report.errors.push(SyncError {
            request_id: entry.id.clone(),
            error: e.to_string(),
            timestamp: self.clock.now_ms(),
            entity_type: entry.entity_type.clone(),
          });

          if entry.retry_count < self.max_replay_retries {
            self.queue.increment_retry(&entry.id)?;
            report.retained += 1;
          } else {
            warn!(request_id = %entry.id, "dropping request after max retries");
            self.queue.remove(&entry.id)?;
            report.dropped += 1;
          }
        }
      }
    }
    Ok(report)
  }

  /// A 2xx counts as delivered even when its body is not JSON.
  async fn replay(&self, entry: &PendingRequest) -> Result<()> {
    match self.http.send(&entry.to_http()).await {
      Ok(_) | Err(Error::Decode(_)) => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Notify, then publish the final status. Subscribers waiting for
  /// `is_syncing == false` see the drain fully finished.
  fn finish(&self, report: &DrainReport) -> Result<()> {
    let remaining = self.queue.len()?;
    let success = report.errors.is_empty();

    info!(
      attempted = report.attempted,
      synced = report.synced,
      retained = report.retained,
      dropped = report.dropped,
      "drain finished"
    );

    if !success {
      let failed = report.errors.len();
      self.notifier.notify(
        NotificationKind::Error,
        "Sync Issues",
        &format!("{failed} {} failed to sync", changes(failed)),
      );
    } else if report.synced > 0 {
      let synced = report.synced;
      self.notifier.notify(
        NotificationKind::Success,
        "Synced",
        &format!("{synced} pending {} synced successfully", changes(synced)),
      );
    }

    self.status.update(|s| {
      s.is_syncing = false;
      s.pending_count = remaining;
      s.last_sync_success = success;
      s.sync_errors = report.errors.clone();
    });
    Ok(())
  }

  fn abort(&self, e: Error) -> Error {
    error!(error = %e, "drain aborted");
    self.status.update(|s| {
      s.is_syncing = false;
      s.last_sync_success = false;
    });
    e
  }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::http::RetryPolicy;
  use crate::network::NetworkState;
  use crate::notify::LogNotifier;
  use crate::storage::{KeyValueStorage, MemoryStorage, PENDING_REQUESTS_KEY};

  fn orchestrator(storage: Arc<dyn KeyValueStorage>, online: bool) -> SyncOrchestrator {
    let clock = Arc::new(ManualClock::new(5_000));
    let status = Arc::new(SyncStatusPublisher::load(storage.clone()));
    let queue = Arc::new(PendingRequestQueue::new(storage, clock.clone(), status.clone()));
    let http = Arc::new(
      HttpExecutor::with_client(reqwest::Client::new(), "http://127.0.0.1:1", RetryPolicy::none())
        .unwrap(),
    );
    let initial = if online {
      NetworkState::online()
    } else {
      NetworkState::offline()
    };
    SyncOrchestrator::new(
      queue,
      http,
      Arc::new(NetworkMonitor::new(initial)),
      status,
      Arc::new(LogNotifier),
      clock,
    )
  }

  #[tokio::test]
  async fn test_drain_skips_while_offline() {
    let sync = orchestrator(Arc::new(MemoryStorage::new()), false);
    let outcome = sync.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome::Skipped(SkipReason::Offline));
    assert!(!sync.status.current().is_syncing);
  }

  #[tokio::test]
  async fn test_drain_of_empty_queue() {
    let sync = orchestrator(Arc::new(MemoryStorage::new()), true);
    let outcome = sync.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome::Completed(DrainReport::default()));

    let status = sync.status.current();
    assert!(!status.is_syncing);
    assert!(status.last_sync_success);
    assert_eq!(status.last_sync_time, Some(5_000));
    assert!(!sync.is_syncing());
  }

  #[tokio::test]
  async fn test_corrupt_queue_aborts_drain() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(PENDING_REQUESTS_KEY, "not json").unwrap();

    let sync = orchestrator(storage, true);
    assert!(sync.drain().await.is_err());

    let status = sync.status.current();
    assert!(!status.is_syncing);
    assert!(!status.last_sync_success);
    // The flag is released even on failure
    assert!(!sync.is_syncing());
  }

  #[tokio::test]
  async fn test_manual_sync_offline_fails() {
    let sync = orchestrator(Arc::new(MemoryStorage::new()), false);
    assert!(matches!(sync.manual_sync().await, Err(Error::SyncOffline)));
  }
}
