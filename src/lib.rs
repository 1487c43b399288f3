//! Offline-first data access for API-backed apps.
//!
//! Reads go through a TTL cache with stale-while-revalidate; mutations made
//! while offline land in a durable queue that is replayed when connectivity
//! returns. [`DataLayer`] wires the services together:
//!
//! ```no_run
//! # async fn run() -> offsync::Result<()> {
//! use offsync::{Config, DataLayer, FetchOptions};
//!
//! let layer = DataLayer::builder(Config::default()).init().await?;
//! let jobs = layer
//!   .api()
//!   .fetch::<serde_json::Value>("/jobs", FetchOptions::new().entity_type("jobs"))
//!   .await?;
//! println!("cached={} {}", jobs.cached, jobs.data);
//! layer.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod notify;
pub mod queue;
pub mod runtime;
pub mod status;
pub mod storage;
pub mod sync;

pub use cache::{CacheConfig, CacheEntry, CacheOptions, CacheStore};
pub use client::{ApiClient, ApiResponse, FetchOptions};
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use http::{HttpExecutor, HttpRequest, Method, Mutation, RetryPolicy};
pub use network::{ConnectionType, NetworkMonitor, NetworkState, Transition};
pub use notify::{LogNotifier, NotificationKind, Notifier};
pub use queue::{NewPendingRequest, PendingRequest, PendingRequestQueue};
pub use runtime::{DataLayer, DataLayerBuilder};
pub use status::{SyncError, SyncStatus, SyncStatusPublisher};
pub use storage::{KeyValueStorage, MemoryStorage, SqliteStorage};
pub use sync::{DrainOutcome, DrainReport, SkipReason, SyncOrchestrator};
