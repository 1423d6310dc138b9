//! # Gitray Sync
//!
//! Runtime for the Gitray engine: local persistence over SQLite, a durable
//! journal of unsynced actions, debounced batch commits and adapters for the
//! remote repository.
//!
//! A book is opened with [`Gitray::open`]. Writes go to the local state and
//! the stash right away; the scheduler later runs a sync cycle that pulls
//! remote changes, reconciles them and commits the result in one remote
//! commit.
//!
//! ```no_run
//! use gitray_engine::BaseItem;
//! use gitray_sync::{Gitray, MemoryRemote, StoreManager, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> gitray_sync::Result<()> {
//! gitray_sync::logging::init();
//! let config = SyncConfig::from_env()?;
//! let manager = StoreManager::new(&config.data_dir);
//! let book = Gitray::open(&manager, "home", Arc::new(MemoryRemote::new()), config).await?;
//!
//! book.add("bills", "bills", BaseItem::new("bill-1", json!({"amount": 12}))).await?;
//! let report = book.sync().await?;
//! assert!(report.committed());
//! book.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod gitray;
pub mod inflight;
pub mod logging;
pub mod remote;
pub mod scheduler;
pub mod stash;

pub use config::{ConfigError, GithubConfig, SyncConfig};
pub use db::{IndexSpec, StoreHandle, StoreManager, StoreOptions};
pub use error::{Result, SyncError};
pub use gitray::{Gitray, MetaRecord, SyncReport};
pub use inflight::InFlight;
pub use remote::{BlobWrite, CommitId, CommitRequest, GithubRemote, MemoryRemote, RemoteStore};
pub use scheduler::{BatchOutcome, BatchRunner, Scheduler, SchedulerConfig};
pub use stash::{Stash, StashRecord};
