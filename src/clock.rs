//! Wall-clock source for cache expiry and sync bookkeeping.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now_ms(&self) -> EpochMillis;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> EpochMillis {
    Utc::now().timestamp_millis()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(start: EpochMillis) -> Self {
    Self {
      now: AtomicI64::new(start),
    }
  }

  pub fn set(&self, now: EpochMillis) {
    self.now.store(now, Ordering::SeqCst);
  }

  /// Move the clock forward and return the new time.
  pub fn advance(&self, by: Duration) -> EpochMillis {
    let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
    self.now.fetch_add(by, Ordering::SeqCst).saturating_add(by)
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> EpochMillis {
    self.now.load(Ordering::SeqCst)
  }
}

/// Convert a duration into whole milliseconds for epoch arithmetic.
pub(crate) fn duration_ms(d: Duration) -> EpochMillis {
  i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
