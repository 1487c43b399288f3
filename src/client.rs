//! Offline-aware API client.
//!
//! Reads are served from the cache while offline and revalidated in the
//! background while online. Mutations issued while offline, or that fail on
//! the network, are queued for replay.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::clock::{Clock, EpochMillis};
use crate::error::{Error, Result};
use crate::http::{HttpExecutor, HttpRequest, Method, Mutation};
use crate::network::NetworkMonitor;
use crate::notify::{NotificationKind, Notifier};
use crate::queue::{NewPendingRequest, PendingRequestQueue};

/// Entity type recorded for queued requests that did not name one.
pub const UNKNOWN_ENTITY: &str = "unknown";

/// Per-call options for [`ApiClient::fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
  pub method: Method,
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
  /// Bypass the cache for this read while online
  pub skip_cache: bool,
  pub cache_key: Option<String>,
  pub entity_type: Option<String>,
  pub entity_id: Option<String>,
}

impl FetchOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn skip_cache(mut self, skip: bool) -> Self {
    self.skip_cache = skip;
    self
  }

  pub fn cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
    self.entity_type = Some(entity_type.into());
    self
  }

  pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
    self.entity_id = Some(entity_id.into());
    self
  }

  /// Explicit cache key, else one derived from the entity.
  pub fn resolved_cache_key(&self) -> Option<String> {
    self.cache_key.clone().or_else(|| {
      self
        .entity_type
        .as_deref()
        .map(|t| CacheStore::entity_key(t, self.entity_id.as_deref()))
    })
  }

  fn to_request(&self, endpoint: &str) -> HttpRequest {
    HttpRequest {
      method: self.method,
      url: endpoint.to_string(),
      body: self.body.clone(),
      headers: self.headers.clone(),
    }
  }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
  pub data: T,
  /// Served from the cache rather than the network
  pub cached: bool,
  /// When `data` was obtained from the server
  pub timestamp: EpochMillis,
}

impl<T> ApiResponse<T> {
  fn from_cache(entry: CacheEntry<T>) -> Self {
    Self {
      data: entry.data,
      cached: true,
      timestamp: entry.metadata.timestamp,
    }
  }
}

/// Entry point for application API calls.
pub struct ApiClient {
  http: Arc<HttpExecutor>,
  cache: Arc<CacheStore>,
  queue: Arc<PendingRequestQueue>,
  network: Arc<NetworkMonitor>,
  notifier: Arc<dyn Notifier>,
  clock: Arc<dyn Clock>,
  refreshes: TaskTracker,
  cancel: CancellationToken,
}

impl ApiClient {
  pub fn new(
    http: Arc<HttpExecutor>,
    cache: Arc<CacheStore>,
    queue: Arc<PendingRequestQueue>,
    network: Arc<NetworkMonitor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      http,
      cache,
      queue,
      network,
      notifier,
      clock,
      refreshes: TaskTracker::new(),
      cancel: CancellationToken::new(),
    }
  }

  /// Set or clear the bearer token.
  pub fn set_auth_token(&self, token: Option<String>) {
    self.http.set_auth_token(token);
  }

  /// Perform an API call with offline handling.
  pub async fn fetch<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    options: FetchOptions,
  ) -> Result<ApiResponse<T>> {
    let online = self.network.is_online();
    let is_read = options.method.is_read();
    let cache_key = options.resolved_cache_key();
    let request = options.to_request(endpoint);

    if is_read && (!online || !options.skip_cache) {
      if let Some(key) = cache_key.as_deref() {
        if let Some(entry) = self.cache.entry::<T>(key, false) {
          if online {
            debug!(endpoint, "serving cached data, revalidating");
            self.spawn_refresh(key.to_string(), request);
          } else {
            debug!(endpoint, "offline, serving cached data");
          }
          return Ok(ApiResponse::from_cache(entry));
        }
      }
    }

    if !online {
      return Err(match options.method.as_mutation() {
        Some(mutation) => self.queue_mutation(mutation, endpoint, &options),
        None => Error::OfflineNoCache,
      });
    }

    match self.http.send_with_retry(&request).await {
      Ok(data) => {
        let decoded: T =
          serde_json::from_value(data.clone()).map_err(|e| Error::Decode(e.to_string()))?;
        if is_read && !options.skip_cache {
          if let Some(key) = cache_key.as_deref() {
            if let Err(e) = self.cache.save(key, &data) {
              warn!(key, error = %e, "failed to cache response");
            }
          }
        }
        Ok(ApiResponse {
          data: decoded,
          cached: false,
          timestamp: self.clock.now_ms(),
        })
      }
      Err(e) => {
        if e.is_transient() {
          if let Some(mutation) = options.method.as_mutation() {
            warn!(endpoint, error = %e, "mutation failed on the network, queuing");
            return Err(self.queue_mutation(mutation, endpoint, &options));
          }
        }
        // Looked up whatever skip_cache says; expired entries are purged, not served
        let fallback = match cache_key.as_deref() {
          Some(key) if is_read => self.cache.entry::<T>(key, false),
          _ => None,
        };
        match fallback {
          Some(entry) => {
            warn!(endpoint, error = %e, "request failed, falling back to cache");
            self
              .notifier
              .notify(NotificationKind::Warning, "Connection Issue", "Showing cached data");
            Ok(ApiResponse::from_cache(entry))
          }
          None => Err(e),
        }
      }
    }
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    self.refreshes.close();
    self.refreshes.wait().await;
    self.refreshes.reopen();
  }

  /// Cancel background refreshes and wait for them to exit. No new refreshes
  /// start afterwards.
  pub async fn shutdown(&self) {
    self.cancel.cancel();
    self.refreshes.close();
    self.refreshes.wait().await;
  }

  /// Number of background refreshes still running.
  pub fn pending_refreshes(&self) -> usize {
    self.refreshes.len()
  }

  fn queue_mutation(&self, mutation: Mutation, endpoint: &str, options: &FetchOptions) -> Error {
    let queued = self.queue.enqueue(NewPendingRequest {
      url: endpoint.to_string(),
      method: mutation,
      body: options.body.clone(),
      headers: options.headers.clone(),
      entity_type: options
        .entity_type
        .clone()
        .unwrap_or_else(|| UNKNOWN_ENTITY.to_string()),
      entity_id: options.entity_id.clone(),
    });

    match queued {
      Ok(entry) => {
        self.notifier.notify(
          NotificationKind::Info,
          "Offline",
          "Your changes will be synced when you're back online",
        );
        Error::Queued {
          request_id: entry.id,
        }
      }
      Err(e) => e,
    }
  }

  fn spawn_refresh(&self, key: String, request: HttpRequest) {
    if self.cancel.is_cancelled() {
      return;
    }

    let http = Arc::clone(&self.http);
    let cache = Arc::clone(&self.cache);
    let cancel = self.cancel.clone();

    self.refreshes.spawn(async move {
      tokio::select! {
        _ = cancel.cancelled() => debug!(key = %key, "background refresh cancelled"),
        result = http.send_with_retry(&request) => match result {
          Ok(data) => match cache.save(&key, &data) {
            Ok(()) => debug!(key = %key, "background refresh updated cache"),
            Err(e) => warn!(key = %key, error = %e, "failed to cache refreshed data"),
          },
          Err(e) => warn!(key = %key, error = %e, "background refresh failed"),
        },
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_resolution() {
    assert_eq!(FetchOptions::new().resolved_cache_key(), None);
    assert_eq!(
      FetchOptions::new().cache_key("jobs").resolved_cache_key(),
      Some("jobs".to_string())
    );
    assert_eq!(
      FetchOptions::new().entity_type("job").resolved_cache_key(),
      Some("@offline_job".to_string())
    );
    assert_eq!(
      FetchOptions::new()
        .entity_type("job")
        .entity_id("5")
        .resolved_cache_key(),
      Some("@offline_job_5".to_string())
    );
    // Explicit key wins
    assert_eq!(
      FetchOptions::new()
        .cache_key("mine")
        .entity_type("job")
        .resolved_cache_key(),
      Some("mine".to_string())
    );
  }

  #[test]
  fn test_request_from_options() {
    let options = FetchOptions::new()
      .method(Method::Put)
      .body(serde_json::json!({"a": 1}))
      .header("X-Trace", "1");
    let request = options.to_request("/jobs/5");
    assert_eq!(request.method, Method::Put);
    assert_eq!(request.url, "/jobs/5");
    assert_eq!(request.headers.get("X-Trace").map(String::as_str), Some("1"));
  }
}
