// Integration tests for queue replay and reconnect handling.

mod common;

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
  build_layer, setup_offline, setup_online, test_config, wait_for_status, RecordingNotifier,
};
use offsync::{
  DrainOutcome, Error, FetchOptions, Method, Mutation, NetworkState, NewPendingRequest,
  NotificationKind, SkipReason, SqliteStorage,
};

fn put_job(id: &str) -> NewPendingRequest {
  NewPendingRequest {
    url: format!("/jobs/{id}"),
    method: Mutation::Put,
    body: Some(json!({"status": "done"})),
    headers: BTreeMap::new(),
    entity_type: "job".into(),
    entity_id: Some(id.into()),
  }
}

async fn queue_offline_put(layer: &offsync::DataLayer, id: &str) -> String {
  let err = layer
    .api()
    .fetch::<Value>(
      &format!("/jobs/{id}"),
      FetchOptions::new()
        .method(Method::Put)
        .body(json!({"status": "done"}))
        .entity_type("job")
        .entity_id(id),
    )
    .await
    .unwrap_err();
  match err {
    Error::Queued { request_id } => request_id,
    other => panic!("expected Queued, got {other:?}"),
  }
}

#[tokio::test]
async fn test_offline_put_syncs_after_reconnect() {
  let h = setup_offline().await;

  queue_offline_put(&h.layer, "5").await;
  assert_eq!(h.layer.status().current().pending_count, 1);

  Mock::given(method("PUT"))
    .and(path("/jobs/5"))
    .and(body_json(json!({"status": "done"})))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5})))
    .expect(1)
    .mount(&h.server)
    .await;

  h.layer.set_online(true);
  wait_for_status(&h.layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  let status = h.layer.status().current();
  assert!(status.last_sync_success);
  assert!(status.last_sync_time.is_some());
  assert!(status.sync_errors.is_empty());
  assert!(h.layer.queue().is_empty().unwrap());

  let (kind, title, message) = h.notifier.events().pop().unwrap();
  assert_eq!(kind, NotificationKind::Success);
  assert_eq!(title, "Synced");
  assert_eq!(message, "1 pending change synced successfully");
}

#[tokio::test]
async fn test_retry_ceiling_drops_after_four_attempts() {
  let h = setup_online().await;
  let entry = h.layer.queue().enqueue(put_job("9")).unwrap();

  Mock::given(method("PUT"))
    .and(path("/jobs/9"))
    .respond_with(ResponseTemplate::new(500))
    .expect(4)
    .mount(&h.server)
    .await;

  for attempt in 1..=3u32 {
    let outcome = h.layer.sync().drain().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.retained, 1);
    assert_eq!(report.dropped, 0);
    assert_eq!(h.layer.queue().list().unwrap()[0].retry_count, attempt);
  }

  let outcome = h.layer.sync().drain().await.unwrap();
  let report = outcome.report().unwrap();
  assert_eq!(report.dropped, 1);
  assert_eq!(report.errors.len(), 1);

  assert!(h.layer.queue().is_empty().unwrap());
  let status = h.layer.status().current();
  assert_eq!(status.pending_count, 0);
  assert!(!status.last_sync_success);
  assert_eq!(status.sync_errors.len(), 1);
  assert_eq!(status.sync_errors[0].request_id, entry.id);
  assert_eq!(status.sync_errors[0].entity_type, "job");
  assert_eq!(
    status.sync_errors[0].error,
    "Server error - please try again later"
  );

  let (kind, title, message) = h.notifier.events().pop().unwrap();
  assert_eq!(kind, NotificationKind::Error);
  assert_eq!(title, "Sync Issues");
  assert_eq!(message, "1 change failed to sync");
}

#[tokio::test]
async fn test_partial_failure_keeps_failed_entries() {
  let h = setup_online().await;
  h.layer.queue().enqueue(put_job("1")).unwrap();
  let failing = h.layer.queue().enqueue(put_job("2")).unwrap();
  h.layer.queue().enqueue(put_job("3")).unwrap();

  Mock::given(method("PUT"))
    .and(path("/jobs/2"))
    .respond_with(ResponseTemplate::new(422).set_body_json(json!({"message": "Stale version"})))
    .mount(&h.server)
    .await;
  Mock::given(method("PUT"))
    .and(path_regex(r"^/jobs/[13]$"))
    .respond_with(ResponseTemplate::new(200))
    .expect(2)
    .mount(&h.server)
    .await;

  let outcome = h.layer.sync().drain().await.unwrap();
  let report = outcome.report().unwrap();
  assert_eq!(report.attempted, 3);
  assert_eq!(report.synced, 2);
  assert_eq!(report.retained, 1);

  let remaining = h.layer.queue().list().unwrap();
  assert_eq!(remaining.len(), 1);
  assert_eq!(remaining[0].id, failing.id);
  assert_eq!(remaining[0].retry_count, 1);

  let status = h.layer.status().current();
  assert_eq!(status.pending_count, 1);
  assert_eq!(status.sync_errors[0].error, "Stale version");
}

#[tokio::test]
async fn test_concurrent_drain_is_skipped() {
  let h = setup_online().await;
  h.layer.queue().enqueue(put_job("1")).unwrap();

  Mock::given(method("PUT"))
    .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
    .expect(1)
    .mount(&h.server)
    .await;

  let sync = h.layer.sync();
  let (first, second) = tokio::join!(sync.drain(), sync.drain());

  assert!(matches!(first.unwrap(), DrainOutcome::Completed(_)));
  assert_eq!(
    second.unwrap(),
    DrainOutcome::Skipped(SkipReason::AlreadyRunning)
  );
  assert!(!sync.is_syncing());
}

#[tokio::test]
async fn test_drain_skips_while_offline() {
  let h = setup_offline().await;
  h.layer.queue().enqueue(put_job("1")).unwrap();

  let outcome = h.layer.sync().drain().await.unwrap();
  assert_eq!(outcome, DrainOutcome::Skipped(SkipReason::Offline));
  assert_eq!(h.layer.queue().len().unwrap(), 1);
}

#[tokio::test]
async fn test_reconnect_drains_all_entries_once() {
  let h = setup_offline().await;
  for id in ["1", "2", "3"] {
    queue_offline_put(&h.layer, id).await;
  }
  assert_eq!(h.layer.status().current().pending_count, 3);

  Mock::given(method("PUT"))
    .and(path_regex(r"^/jobs/\d+$"))
    .respond_with(ResponseTemplate::new(200))
    .expect(3)
    .mount(&h.server)
    .await;

  h.layer.set_online(true);
  wait_for_status(&h.layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  assert!(h.layer.queue().is_empty().unwrap());
  let (_, _, message) = h.notifier.events().pop().unwrap();
  assert_eq!(message, "3 pending changes synced successfully");
}

#[tokio::test]
async fn test_flap_inside_debounce_defers_drain() {
  let server = MockServer::start().await;
  let notifier = Arc::new(RecordingNotifier::default());
  let mut config = test_config(&server.uri());
  config.sync.reconnect_debounce_ms = 1_000;
  let layer = build_layer(
    config,
    Arc::new(offsync::MemoryStorage::new()),
    NetworkState::offline(),
    notifier.clone(),
  )
  .await;

  Mock::given(method("PUT"))
    .respond_with(ResponseTemplate::new(200))
    .expect(2)
    .mount(&server)
    .await;

  queue_offline_put(&layer, "1").await;
  layer.set_online(true);
  wait_for_status(&layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  layer.set_online(false);
  tokio::time::sleep(Duration::from_millis(50)).await;
  queue_offline_put(&layer, "2").await;
  layer.set_online(true);

  // Held back until the window closes, then drained
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(layer.queue().len().unwrap(), 1);
  wait_for_status(&layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  let successes = notifier
    .events()
    .into_iter()
    .filter(|(kind, _, _)| *kind == NotificationKind::Success)
    .count();
  assert_eq!(successes, 2);
  layer.dispose().await;
}

#[tokio::test]
async fn test_each_reconnect_drains_without_debounce() {
  let server = MockServer::start().await;
  let mut config = test_config(&server.uri());
  config.sync.reconnect_debounce_ms = 0;
  let layer = build_layer(
    config,
    Arc::new(offsync::MemoryStorage::new()),
    NetworkState::offline(),
    Arc::new(RecordingNotifier::default()),
  )
  .await;

  Mock::given(method("PUT"))
    .respond_with(ResponseTemplate::new(200))
    .expect(2)
    .mount(&server)
    .await;

  queue_offline_put(&layer, "1").await;
  layer.set_online(true);
  wait_for_status(&layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  layer.set_online(false);
  // Let the watcher observe the offline state
  tokio::time::sleep(Duration::from_millis(50)).await;
  queue_offline_put(&layer, "2").await;
  layer.set_online(true);
  wait_for_status(&layer, |s| s.pending_count == 0 && !s.is_syncing).await;

  layer.dispose().await;
}

#[tokio::test]
async fn test_manual_sync_offline_fails() {
  let h = setup_offline().await;

  let err = h.layer.sync().manual_sync().await.unwrap_err();
  assert!(matches!(err, Error::SyncOffline));
  assert_eq!(err.to_string(), "Cannot sync while offline");
  assert!(h.notifier.has(NotificationKind::Error, "Offline"));
}

#[tokio::test]
async fn test_manual_sync_online_drains() {
  let h = setup_online().await;
  h.layer.queue().enqueue(put_job("1")).unwrap();

  Mock::given(method("PUT"))
    .respond_with(ResponseTemplate::new(200))
    .expect(1)
    .mount(&h.server)
    .await;

  let outcome = h.layer.sync().manual_sync().await.unwrap();
  assert_eq!(outcome.report().unwrap().synced, 1);
}

#[tokio::test]
async fn test_replay_sends_token_and_accepts_non_json_body() {
  let h = setup_online().await;
  h.layer.set_auth_token(Some("tok".into()));
  h.layer
    .queue()
    .enqueue(NewPendingRequest {
      url: "/notes".into(),
      method: Mutation::Post,
      body: Some(json!({"text": "hello"})),
      headers: BTreeMap::from([("X-Client".to_string(), "field-app".to_string())]),
      entity_type: "note".into(),
      entity_id: None,
    })
    .unwrap();

  Mock::given(method("POST"))
    .and(path("/notes"))
    .and(header("authorization", "Bearer tok"))
    .and(header("x-client", "field-app"))
    .and(body_json(json!({"text": "hello"})))
    .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
    .expect(1)
    .mount(&h.server)
    .await;

  let outcome = h.layer.sync().drain().await.unwrap();
  let report = outcome.report().unwrap();
  assert_eq!(report.synced, 1);
  assert!(report.errors.is_empty());
  // Replay never writes to the cache
  assert!(h.layer.cache().info().unwrap().iter().all(|k| !k.key.contains("note")));
}

#[tokio::test]
async fn test_queued_mutation_survives_restart() {
  let dir = tempfile::tempdir().unwrap();
  let db = dir.path().join("store.db");
  let server = MockServer::start().await;

  let request_id = {
    let layer = build_layer(
      test_config(&server.uri()),
      Arc::new(SqliteStorage::open_at(&db).unwrap()),
      NetworkState::offline(),
      Arc::new(RecordingNotifier::default()),
    )
    .await;
    let id = queue_offline_put(&layer, "5").await;
    layer.dispose().await;
    id
  };

  let layer = build_layer(
    test_config(&server.uri()),
    Arc::new(SqliteStorage::open_at(&db).unwrap()),
    NetworkState::offline(),
    Arc::new(RecordingNotifier::default()),
  )
  .await;

  assert_eq!(layer.status().current().pending_count, 1);
  let pending = layer.queue().list().unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].id, request_id);
  assert_eq!(pending[0].url, "/jobs/5");

  Mock::given(method("PUT"))
    .and(path("/jobs/5"))
    .respond_with(ResponseTemplate::new(200))
    .expect(1)
    .mount(&server)
    .await;

  layer.set_online(true);
  wait_for_status(&layer, |s| s.pending_count == 0 && !s.is_syncing).await;
  assert!(layer.status().current().last_sync_success);
  layer.dispose().await;
}
