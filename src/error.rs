use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure mode of the data layer.
///
/// Callers mostly care about three groups: connectivity outcomes
/// (`OfflineNoCache`, `Queued`), HTTP status mappings, and local storage
/// problems. [`Error::is_queued`] marks the one variant that is not a real
/// failure: the mutation is durably stored and will be replayed.
#[derive(Debug, Error)]
pub enum Error {
  // ── Connectivity ────────────────────────────────────────────────
  /// Read issued while offline with nothing usable in the cache.
  #[error("No internet connection and no cached data available")]
  OfflineNoCache,

  /// Mutation issued while offline; stored in the pending queue.
  #[error("Offline - request queued")]
  Queued { request_id: String },

  /// Manual sync requested while offline.
  #[error("Cannot sync while offline")]
  SyncOffline,

  // ── HTTP ────────────────────────────────────────────────────────
  #[error("Unauthorized - please log in again")]
  Unauthorized,

  #[error("Forbidden - you don't have permission")]
  Forbidden,

  #[error("Not found")]
  NotFound,

  #[error("Server error - please try again later")]
  Server { status: u16 },

  /// Any other non-2xx response.
  #[error("{message}")]
  Http { status: u16, message: String },

  /// Network-level failure: connection refused, timeout, request failed.
  #[error("Network request failed: {0}")]
  Network(String),

  /// Response body was not valid JSON.
  #[error("Invalid response body: {0}")]
  Decode(String),

  #[error("Invalid URL: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("Failed to build HTTP client: {0}")]
  Client(String),

  #[error("Invalid header {0}")]
  InvalidHeader(String),

  // ── Local state ─────────────────────────────────────────────────
  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Cache write aimed at a key owned by the queue or sync bookkeeping.
  #[error("Key {0} is reserved for sync bookkeeping")]
  ReservedKey(String),
}

impl Error {
  /// The mutation was queued for later replay rather than lost.
  pub fn is_queued(&self) -> bool {
    matches!(self, Self::Queued { .. })
  }

  /// Network-level failure that the HTTP executor retries with backoff.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Network(_))
  }

  /// Worth trying again later: transient failures and 5xx responses.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network(_) | Self::Server { .. })
  }

  /// HTTP status behind this error, if one was received.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Unauthorized => Some(401),
      Self::Forbidden => Some(403),
      Self::NotFound => Some(404),
      Self::Server { status } | Self::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Classify a reqwest failure that happened before a status was received.
  pub(crate) fn from_transport(e: reqwest::Error) -> Self {
    if e.is_builder() {
      Self::Client(e.to_string())
    } else if e.is_decode() {
      Self::Decode(e.to_string())
    } else if e.is_timeout() {
      Self::Network(format!("timeout: {e}"))
    } else {
      Self::Network(e.to_string())
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}
