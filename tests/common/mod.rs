// Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::MockServer;

use offsync::{
  Config, DataLayer, KeyValueStorage, MemoryStorage, NetworkState, NotificationKind, Notifier,
};

/// Notifier that remembers every notification.
#[derive(Default)]
pub struct RecordingNotifier {
  events: Mutex<Vec<(NotificationKind, String, String)>>,
}

impl RecordingNotifier {
  pub fn events(&self) -> Vec<(NotificationKind, String, String)> {
    self.events.lock().unwrap().clone()
  }

  pub fn has(&self, kind: NotificationKind, title: &str) -> bool {
    self
      .events()
      .iter()
      .any(|(k, t, _)| *k == kind && t == title)
  }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, kind: NotificationKind, title: &str, message: &str) {
    self
      .events
      .lock()
      .unwrap()
      .push((kind, title.to_string(), message.to_string()));
  }
}

/// Config pointing at `base_url` with millisecond retry delays.
pub fn test_config(base_url: &str) -> Config {
  let mut config = Config::default();
  config.api.base_url = base_url.to_string();
  config.api.retry.initial_delay_ms = 1;
  config.api.retry.max_delay_ms = 5;
  config
}

pub struct Harness {
  pub server: MockServer,
  pub layer: DataLayer,
  pub notifier: Arc<RecordingNotifier>,
}

pub async fn build_layer(
  config: Config,
  storage: Arc<dyn KeyValueStorage>,
  network: NetworkState,
  notifier: Arc<RecordingNotifier>,
) -> DataLayer {
  DataLayer::builder(config)
    .storage(storage)
    .notifier(notifier)
    .initial_network(network)
    .http_client(reqwest::Client::new())
    .init()
    .await
    .unwrap()
}

pub async fn setup_with(network: NetworkState) -> Harness {
  let server = MockServer::start().await;
  let notifier = Arc::new(RecordingNotifier::default());
  let layer = build_layer(
    test_config(&server.uri()),
    Arc::new(MemoryStorage::new()),
    network,
    notifier.clone(),
  )
  .await;
  Harness {
    server,
    layer,
    notifier,
  }
}

pub async fn setup_online() -> Harness {
  setup_with(NetworkState::online()).await
}

pub async fn setup_offline() -> Harness {
  setup_with(NetworkState::offline()).await
}

/// Wait until the published status satisfies `f`.
pub async fn wait_for_status(layer: &DataLayer, f: impl FnMut(&offsync::SyncStatus) -> bool) {
  let mut rx = layer.status().subscribe();
  tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
    .await
    .expect("timed out waiting for sync status")
    .expect("status channel closed");
}
