//! Unified error handling for the sync runtime.

use crate::config::ConfigError;
use std::time::Duration;

/// Sync runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] gitray_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote commit timed out after {0:?}")]
    Timeout(Duration),

    #[error("Schema upgrade conflict on {db}: expected version {expected}, found {found}")]
    SchemaUpgradeConflict { db: String, expected: i64, found: i64 },

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Record for {store} has no string key field {field:?}")]
    MissingKey { store: String, field: String },

    #[error("Local database corrupted: {0}")]
    Corrupted(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_)
                | SyncError::Timeout(_)
                | SyncError::SchemaUpgradeConflict { .. }
                | SyncError::Engine(gitray_engine::Error::HashMismatch { .. })
        )
    }

    /// Whether the local database can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Corrupted(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RemoteUnavailable(err.to_string())
    }
}

/// Result type alias for the sync runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
