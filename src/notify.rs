//! User-facing notifications (toasts, snackbars).

use std::fmt;
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  Info,
  Success,
  Warning,
  Error,
}

impl fmt::Display for NotificationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Info => "info",
      Self::Success => "success",
      Self::Warning => "warning",
      Self::Error => "error",
    })
  }
}

/// Sink for messages shown to the user.
pub trait Notifier: Send + Sync {
  fn notify(&self, kind: NotificationKind, title: &str, message: &str);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, kind: NotificationKind, title: &str, message: &str) {
    match kind {
      NotificationKind::Info | NotificationKind::Success => {
        info!(%kind, title, message, "notification");
      }
      NotificationKind::Warning => warn!(title, message, "notification"),
      NotificationKind::Error => error!(title, message, "notification"),
    }
  }
}

/// Noun for `count` changes.
pub(crate) fn changes(count: usize) -> &'static str {
  if count == 1 {
    "change"
  } else {
    "changes"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_changes_pluralization() {
    assert_eq!(changes(1), "change");
    assert_eq!(changes(0), "changes");
    assert_eq!(changes(4), "changes");
  }
}
