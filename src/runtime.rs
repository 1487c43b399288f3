//! Composition root: builds every service once and owns their lifecycle.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::client::ApiClient;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::http::HttpExecutor;
use crate::network::{NetworkMonitor, NetworkState};
use crate::notify::{LogNotifier, Notifier};
use crate::queue::PendingRequestQueue;
use crate::status::SyncStatusPublisher;
use crate::storage::{KeyValueStorage, SqliteStorage};
use crate::sync::SyncOrchestrator;

/// Optional overrides for [`DataLayer`] construction.
pub struct DataLayerBuilder {
  config: Config,
  storage: Option<Arc<dyn KeyValueStorage>>,
  clock: Option<Arc<dyn Clock>>,
  notifier: Option<Arc<dyn Notifier>>,
  http_client: Option<reqwest::Client>,
  initial_network: NetworkState,
}

impl DataLayerBuilder {
  pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// Use a pre-built reqwest client instead of one built from the config.
  pub fn http_client(mut self, client: reqwest::Client) -> Self {
    self.http_client = Some(client);
    self
  }

  pub fn initial_network(mut self, state: NetworkState) -> Self {
    self.initial_network = state;
    self
  }

  /// Build the services, restore persisted state and start the reconnect
  /// watcher. Must be called from within a tokio runtime.
  pub async fn init(self) -> Result<DataLayer> {
    let config = self.config;

    let storage: Arc<dyn KeyValueStorage> = match self.storage {
      Some(storage) => storage,
      None => match &config.storage.path {
        Some(path) => Arc::new(SqliteStorage::open_at(path)?),
        None => Arc::new(SqliteStorage::open()?),
      },
    };
    let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

    let retry = config.api.retry.policy();
    let http = Arc::new(match self.http_client {
      Some(client) => HttpExecutor::with_client(client, &config.api.base_url, retry)?,
      None => HttpExecutor::new(&config.api.base_url, config.api.timeout(), retry)?,
    });

    let status = Arc::new(SyncStatusPublisher::load(storage.clone()));
    let cache = Arc::new(CacheStore::new(
      storage.clone(),
      clock.clone(),
      config.cache.to_config(),
    ));
    let queue = Arc::new(PendingRequestQueue::new(
      storage.clone(),
      clock.clone(),
      status.clone(),
    ));
    let network = Arc::new(NetworkMonitor::new(self.initial_network));

    let pending = queue.reconcile()?;
    debug!(pending, "restored pending queue");

    let sync = Arc::new(
      SyncOrchestrator::new(
        queue.clone(),
        http.clone(),
        network.clone(),
        status.clone(),
        notifier.clone(),
        clock.clone(),
      )
      .with_max_replay_retries(config.sync.max_replay_retries),
    );
    let api = Arc::new(ApiClient::new(
      http.clone(),
      cache.clone(),
      queue.clone(),
      network.clone(),
      notifier,
      clock,
    ));

    let cancel = CancellationToken::new();
    let watcher = sync.spawn_reconnect_watcher(config.sync.reconnect_debounce(), cancel.clone());

    info!(base_url = %http.base_url(), pending, "data layer ready");

    Ok(DataLayer {
      config,
      http,
      cache,
      queue,
      network,
      status,
      sync,
      api,
      cancel,
      watcher: Mutex::new(Some(watcher)),
    })
  }
}

/// Every service of the offline data layer, wired together.
pub struct DataLayer {
  config: Config,
  http: Arc<HttpExecutor>,
  cache: Arc<CacheStore>,
  queue: Arc<PendingRequestQueue>,
  network: Arc<NetworkMonitor>,
  status: Arc<SyncStatusPublisher>,
  sync: Arc<SyncOrchestrator>,
  api: Arc<ApiClient>,
  cancel: CancellationToken,
  watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DataLayer {
  pub fn builder(config: Config) -> DataLayerBuilder {
    DataLayerBuilder {
      config,
      storage: None,
      clock: None,
      notifier: None,
      http_client: None,
      initial_network: NetworkState::default(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn api(&self) -> &Arc<ApiClient> {
    &self.api
  }

  pub fn sync(&self) -> &Arc<SyncOrchestrator> {
    &self.sync
  }

  pub fn network(&self) -> &Arc<NetworkMonitor> {
    &self.network
  }

  pub fn status(&self) -> &Arc<SyncStatusPublisher> {
    &self.status
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<PendingRequestQueue> {
    &self.queue
  }

  pub fn http(&self) -> &Arc<HttpExecutor> {
    &self.http
  }

  pub fn set_auth_token(&self, token: Option<String>) {
    self.http.set_auth_token(token);
  }

  pub fn set_online(&self, online: bool) {
    self.network.set_online(online);
  }

  /// Stop the reconnect watcher and background refreshes and wait for both.
  pub async fn dispose(&self) {
    self.cancel.cancel();
    self.api.shutdown().await;

    let watcher = self
      .watcher
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(handle) = watcher {
      if let Err(e) = handle.await {
        warn!(error = %e, "reconnect watcher ended abnormally");
      }
    }
    debug!("data layer disposed");
  }
}
