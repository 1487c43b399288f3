use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offsync::{
  Config, DataLayer, DrainOutcome, Error, FetchOptions, Method, NetworkState, NotificationKind,
  Notifier, SkipReason, SyncStatus,
};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first API client: cached reads, queued mutations, sync on reconnect")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Skip the connectivity probe and act as if offline
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint, from cache when offline
  Get {
    endpoint: String,
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    entity_id: Option<String>,
    #[arg(long)]
    cache_key: Option<String>,
    /// Always go to the network while online
    #[arg(long)]
    skip_cache: bool,
  },
  /// Send a mutation, queuing it when offline
  Send {
    method: Method,
    endpoint: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    entity_id: Option<String>,
  },
  /// Replay queued mutations now
  Sync,
  /// Show sync status
  Status,
  /// Inspect or clear the pending queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Inspect or clear the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Probe connectivity, sync on reconnect and print status until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Clear,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  Info,
  /// Clear one key, or every cache entry
  Clear { key: Option<String> },
}

/// Prints notifications to stderr.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
  fn notify(&self, kind: NotificationKind, title: &str, message: &str) {
    eprintln!("[{kind}] {title}: {message}");
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging();

  let config = Config::load(args.config.as_deref())?;

  let initial = if args.offline {
    NetworkState::offline()
  } else {
    NetworkState::default()
  };
  let layer = DataLayer::builder(config)
    .notifier(Arc::new(ConsoleNotifier))
    .initial_network(initial)
    .init()
    .await?;
  layer.set_auth_token(Config::get_api_token());

  if !args.offline {
    let state = layer.network().refresh(layer.http()).await;
    info!(online = state.is_online(), "startup connectivity probe");
  }

  let result = run(&layer, args.command, args.offline).await;

  layer.api().settle().await;
  layer.dispose().await;
  result
}

async fn run(layer: &DataLayer, command: Command, offline: bool) -> Result<()> {
  match command {
    Command::Get {
      endpoint,
      entity_type,
      entity_id,
      cache_key,
      skip_cache,
    } => {
      let mut options = FetchOptions::new().skip_cache(skip_cache);
      options.entity_type = entity_type;
      options.entity_id = entity_id;
      options.cache_key = cache_key;

      let response = layer.api().fetch::<Value>(&endpoint, options).await?;
      if response.cached {
        eprintln!("(cached)");
      }
      println!("{}", serde_json::to_string_pretty(&response.data)?);
    }

    Command::Send {
      method,
      endpoint,
      body,
      entity_type,
      entity_id,
    } => {
      if method.is_read() {
        return Err(eyre!("{method} is not a mutation, use `get`"));
      }
      let mut options = FetchOptions::new().method(method);
      if let Some(body) = body {
        let body: Value =
          serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON body: {e}"))?;
        options = options.body(body);
      }
      options.entity_type = entity_type;
      options.entity_id = entity_id;

      match layer.api().fetch::<Value>(&endpoint, options).await {
        Ok(response) => println!("{}", serde_json::to_string_pretty(&response.data)?),
        Err(Error::Queued { request_id }) => println!("queued {request_id}"),
        Err(e) => return Err(e.into()),
      }
    }

    Command::Sync => match layer.sync().manual_sync().await? {
      DrainOutcome::Completed(report) => println!(
        "attempted {}, synced {}, retained {}, dropped {}",
        report.attempted, report.synced, report.retained, report.dropped
      ),
      DrainOutcome::Skipped(SkipReason::AlreadyRunning) => println!("sync already in progress"),
      DrainOutcome::Skipped(SkipReason::Offline) => println!("offline, nothing synced"),
    },

    Command::Status => {
      let online = layer.network().is_online();
      print_status(&layer.status().current(), online);
    }

    Command::Queue { action } => match action {
      QueueAction::List => {
        let pending = layer.queue().list()?;
        if pending.is_empty() {
          println!("no pending requests");
        }
        for request in pending {
          println!(
            "{}  {} {}  {}{}  retries={}",
            request.id,
            Method::from(request.method),
            request.url,
            request.entity_type,
            request
              .entity_id
              .map(|id| format!("/{id}"))
              .unwrap_or_default(),
            request.retry_count
          );
        }
      }
      QueueAction::Clear => {
        let count = layer.queue().len()?;
        layer.queue().clear()?;
        println!("cleared {count} pending requests");
      }
    },

    Command::Cache { action } => match action {
      CacheAction::Info => {
        for entry in layer.cache().info()? {
          let synced = layer
            .cache()
            .last_synced_at(&entry.key)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
          println!("{:<40} {:>8} B  last_sync={synced}", entry.key, entry.size_bytes);
        }
      }
      CacheAction::Clear { key: Some(key) } => {
        layer.cache().invalidate(&key)?;
        println!("cleared {key}");
      }
      CacheAction::Clear { key: None } => {
        let count = layer.cache().invalidate_all()?;
        println!("cleared {count} cache entries");
      }
    },

    Command::Watch => watch(layer, offline).await?,
  }
  Ok(())
}

async fn watch(layer: &DataLayer, offline: bool) -> Result<()> {
  let mut status_rx = layer.status().subscribe();
  let mut network_rx = layer.network().subscribe();
  let period = layer.config().sync.probe_interval().max(Duration::from_millis(100));
  let mut probe = tokio::time::interval(period);

  print_status(&status_rx.borrow_and_update(), layer.network().is_online());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      _ = probe.tick(), if !offline => {
        layer.network().refresh(layer.http()).await;
      }
      changed = status_rx.changed() => {
        if changed.is_err() {
          break;
        }
        let status = status_rx.borrow_and_update().clone();
        print_status(&status, layer.network().is_online());
      }
      changed = network_rx.changed() => {
        if changed.is_err() {
          break;
        }
        let online = network_rx.borrow_and_update().is_online();
        println!("network: {}", if online { "online" } else { "offline" });
      }
    }
  }
  Ok(())
}

fn print_status(status: &SyncStatus, online: bool) {
  let now = chrono::Utc::now().timestamp_millis();
  println!(
    "{} | pending {} | {}{} | last sync: {}",
    if online { "online" } else { "offline" },
    status.pending_count,
    if status.is_syncing { "syncing" } else { "idle" },
    if status.last_sync_success { "" } else { " (last sync failed)" },
    status.last_sync_label(now)
  );
  for error in &status.sync_errors {
    println!("  {} [{}]: {}", error.request_id, error.entity_type, error.error);
  }
}

/// Log to a daily file under the data directory. The filter comes from
/// `OFFSYNC_LOG` (default `info`).
fn init_logging() -> Option<WorkerGuard> {
  let log_dir = dirs::data_dir()?.join("offsync").join("logs");
  std::fs::create_dir_all(&log_dir).ok()?;

  let filter = EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let file_appender = tracing_appender::rolling::daily(&log_dir, "offsync.log");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true),
    )
    .init();

  Some(guard)
}
