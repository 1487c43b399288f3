//! HTTP executor: JSON requests with bearer auth, status mapping and
//! exponential backoff on network failures.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// HTTP method of an API call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Delete,
  Patch,
}

impl Method {
  /// GET and HEAD are reads; everything else mutates server state.
  pub fn is_read(self) -> bool {
    matches!(self, Self::Get | Self::Head)
  }

  /// The mutation this method represents, if any.
  pub fn as_mutation(self) -> Option<Mutation> {
    match self {
      Self::Get | Self::Head => None,
      Self::Post => Some(Mutation::Post),
      Self::Put => Some(Mutation::Put),
      Self::Delete => Some(Mutation::Delete),
      Self::Patch => Some(Mutation::Patch),
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
      Self::Patch => "PATCH",
    }
  }

  fn to_reqwest(self) -> reqwest::Method {
    match self {
      Self::Get => reqwest::Method::GET,
      Self::Head => reqwest::Method::HEAD,
      Self::Post => reqwest::Method::POST,
      Self::Put => reqwest::Method::PUT,
      Self::Delete => reqwest::Method::DELETE,
      Self::Patch => reqwest::Method::PATCH,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "DELETE" => Ok(Self::Delete),
      "PATCH" => Ok(Self::Patch),
      other => Err(format!("unsupported HTTP method: {other}")),
    }
  }
}

/// A method that changes server state and can be queued for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mutation {
  Post,
  Put,
  Delete,
  Patch,
}

impl From<Mutation> for Method {
  fn from(m: Mutation) -> Self {
    match m {
      Mutation::Post => Self::Post,
      Mutation::Put => Self::Put,
      Mutation::Delete => Self::Delete,
      Mutation::Patch => Self::Patch,
    }
  }
}

/// Backoff policy for network-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_millis(1_000),
      max_delay: Duration::from_millis(10_000),
    }
  }
}

impl RetryPolicy {
  /// No retries at all.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (zero-based):
  /// `min(initial * 2^attempt, max)`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .initial_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// A request as the executor sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  /// Endpoint relative to the base URL, or an absolute URL
  pub url: String,
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
}

/// Executes JSON requests against the API.
pub struct HttpExecutor {
  http: reqwest::Client,
  base_url: String,
  token: RwLock<Option<String>>,
  retry: RetryPolicy,
}

impl HttpExecutor {
  /// Build an executor with its own reqwest client.
  pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Client(e.to_string()))?;

    Self::with_client(http, base_url, retry)
  }

  /// Build an executor around a pre-configured client.
  pub fn with_client(http: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Result<Self> {
    // Validate once so every joined endpoint starts from a sound base
    Url::parse(base_url)?;

    Ok(Self {
      http,
      base_url: base_url.trim_end_matches('/').to_string(),
      token: RwLock::new(None),
      retry,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.retry
  }

  /// Set or clear the bearer token used by all subsequent requests.
  pub fn set_auth_token(&self, token: Option<String>) {
    *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
  }

  pub fn has_auth_token(&self) -> bool {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  /// Absolute URLs pass through; anything else is appended to the base URL.
  pub fn resolve_url(&self, endpoint: &str) -> Result<Url> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
      return Ok(Url::parse(endpoint)?);
    }

    let full = if endpoint.starts_with('/') {
      format!("{}{endpoint}", self.base_url)
    } else {
      format!("{}/{endpoint}", self.base_url)
    };
    Ok(Url::parse(&full)?)
  }

  /// Send a request once.
  pub async fn send(&self, request: &HttpRequest) -> Result<Value> {
    let url = self.resolve_url(&request.url)?;
    debug!("{} {}", request.method, url);

    let mut builder = self
      .http
      .request(request.method.to_reqwest(), url)
      .headers(self.headers_for(request)?);

    if let Some(body) = &request.body {
      builder = builder.body(serde_json::to_vec(body)?);
    }

    let response = builder.send().await.map_err(Error::from_transport)?;
    Self::parse_response(response).await
  }

  /// Send a request, retrying network-level failures with backoff.
  ///
  /// Received HTTP statuses are never retried here, 5xx included.
  pub async fn send_with_retry(&self, request: &HttpRequest) -> Result<Value> {
    let mut attempt = 0;
    loop {
      match self.send(request).await {
        Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
          let delay = self.retry.delay_for(attempt);
          warn!(
            url = %request.url,
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %e,
            "network request failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        result => return result,
      }
    }
  }

  /// Whether the API answers at all. Any HTTP response counts as reachable.
  pub async fn probe(&self) -> bool {
    match self
      .http
      .head(self.base_url.as_str())
      .timeout(Duration::from_secs(5))
      .send()
      .await
    {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "reachability probe failed");
        false
      }
    }
  }

  /// Content type first, caller headers over it, bearer token last.
  fn headers_for(&self, request: &HttpRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in &request.headers {
      let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
      let header_value =
        HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{name}: {e}")))?;
      headers.insert(header_name, header_value);
    }

    let token = self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| Error::InvalidHeader(format!("authorization: {e}")))?;
      headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
  }

  async fn parse_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();

    if !status.is_success() {
      return Err(match status.as_u16() {
        401 => Error::Unauthorized,
        403 => Error::Forbidden,
        404 => Error::NotFound,
        code if code >= 500 => Error::Server { status: code },
        code => {
          let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| {
              body
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
            })
            .unwrap_or_else(|| format!("HTTP error! status: {code}"));
          Error::Http {
            status: code,
            message,
          }
        }
      });
    }

    let bytes = response.bytes().await.map_err(Error::from_transport)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
  }
}
