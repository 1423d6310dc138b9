//! Opens local databases and creates sub-stores on demand.
//!
//! Creating a sub-store is a schema upgrade: the registry row, its indexes
//! and the schema version bump commit together or not at all. Upgrades of
//! one database are serialized by a per-database async lock within the
//! process and by SQLite's write lock across processes.

use super::{create_pool, run_migrations, validate_name, Pool, StoreHandle, StoreOptions};
use crate::error::{Result, SyncError};
use dashmap::DashMap;
use sqlx::Row;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upgrade attempts before a conflict is reported to the caller.
pub const MAX_UPGRADE_ATTEMPTS: usize = 5;

const DB_EXTENSION: &str = "sqlite";

/// Manages the local databases under one data directory.
#[derive(Debug)]
pub struct StoreManager {
    data_dir: PathBuf,
    pools: DashMap<String, Pool>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            pools: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Create a shared manager.
    pub fn new_shared(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(data_dir))
    }

    fn lock_for(&self, db: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(db.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open (or create) a database, running migrations on first open.
    pub async fn database(&self, db: &str) -> Result<Pool> {
        validate_name(db)?;
        if let Some(pool) = self.pools.get(db) {
            return Ok(pool.clone());
        }

        let lock = self.lock_for(db);
        let _guard = lock.lock().await;
        if let Some(pool) = self.pools.get(db) {
            return Ok(pool.clone());
        }

        let path = self.data_dir.join(format!("{}.{}", db, DB_EXTENSION));
        let pool = create_pool(&path).await?;
        run_migrations(&pool).await?;
        tracing::debug!(db, path = %path.display(), "Opened local database");

        self.pools.insert(db.to_string(), pool.clone());
        Ok(pool)
    }

    /// Get a handle to `store` in `db`, creating the sub-store if missing.
    ///
    /// Safe to call concurrently: exactly one caller creates the sub-store,
    /// the others observe it. An existing sub-store keeps the options it was
    /// created with.
    pub async fn ensure_store(
        &self,
        db: &str,
        store: &str,
        options: StoreOptions,
    ) -> Result<StoreHandle> {
        validate_name(store)?;
        options.validate()?;
        let pool = self.database(db).await?;

        if let Some(existing) = registered_options(&pool, store).await? {
            return Ok(StoreHandle::new(pool, db, store, existing));
        }

        let lock = self.lock_for(db);
        let mut last_conflict = None;
        for attempt in 1..=MAX_UPGRADE_ATTEMPTS {
            let _guard = lock.lock().await;
            let current = schema_version(&pool).await?;

            match create_sub_store(&pool, db, store, &options, current).await {
                Ok(Some(version)) => {
                    tracing::info!(db, store, version, "Created sub-store");
                    return Ok(StoreHandle::new(pool, db, store, options));
                }
                Ok(None) => {
                    let existing = registered_options(&pool, store)
                        .await?
                        .ok_or_else(|| SyncError::StoreNotFound(store.to_string()))?;
                    return Ok(StoreHandle::new(pool, db, store, existing));
                }
                Err(err @ SyncError::SchemaUpgradeConflict { .. }) => {
                    tracing::warn!(db, store, attempt, error = %err, "Schema upgrade conflict, retrying");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_conflict.unwrap_or_else(|| SyncError::StoreNotFound(store.to_string())))
    }

    /// Handle to an existing sub-store.
    pub async fn open_store(&self, db: &str, store: &str) -> Result<StoreHandle> {
        let pool = self.database(db).await?;
        let options = registered_options(&pool, store)
            .await?
            .ok_or_else(|| SyncError::StoreNotFound(store.to_string()))?;
        Ok(StoreHandle::new(pool, db, store, options))
    }

    /// Current schema version of a database.
    pub async fn schema_version(&self, db: &str) -> Result<i64> {
        let pool = self.database(db).await?;
        schema_version(&pool).await
    }

    /// Names of the sub-stores of a database.
    pub async fn stores(&self, db: &str) -> Result<Vec<String>> {
        let pool = self.database(db).await?;
        let rows = sqlx::query("SELECT name FROM sub_stores ORDER BY name")
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get("name").map_err(SyncError::from))
            .collect()
    }

    /// Close every open pool.
    pub async fn close(&self) {
        let pools: Vec<Pool> = self.pools.iter().map(|p| p.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.close().await;
        }
    }
}

async fn schema_version(pool: &Pool) -> Result<i64> {
    let row = sqlx::query("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.try_get("version")?),
        None => Err(SyncError::Corrupted("missing schema version record".to_string())),
    }
}

async fn registered_options(pool: &Pool, store: &str) -> Result<Option<StoreOptions>> {
    let row = sqlx::query("SELECT options FROM sub_stores WHERE name = ?")
        .bind(store)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let text: String = row.try_get("options")?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| SyncError::Corrupted(format!("options of {}: {}", store, e)))
        }
        None => Ok(None),
    }
}

/// Create `store` as the upgrade from `expected` to `expected + 1`.
///
/// Returns the new version, or `None` when the sub-store already exists.
/// Fails with `SchemaUpgradeConflict` when the version moved since it was
/// read; nothing is written in that case.
async fn create_sub_store(
    pool: &Pool,
    db: &str,
    store: &str,
    options: &StoreOptions,
    expected: i64,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;

    let exists = sqlx::query("SELECT 1 FROM sub_stores WHERE name = ?")
        .bind(store)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
    if exists {
        return Ok(None);
    }

    let bumped = sqlx::query("UPDATE schema_version SET version = version + 1 WHERE id = 1 AND version = ?")
        .bind(expected)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if bumped == 0 {
        let found: i64 = sqlx::query("SELECT version FROM schema_version WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?
            .try_get("version")?;
        return Err(SyncError::SchemaUpgradeConflict {
            db: db.to_string(),
            expected,
            found,
        });
    }

    let version = expected + 1;
    sqlx::query("INSERT INTO sub_stores (name, options, created_in) VALUES (?, ?, ?)")
        .bind(store)
        .bind(serde_json::to_string(options)?)
        .bind(version)
        .execute(&mut *tx)
        .await?;

    // Names were validated as identifiers.
    for index in &options.indexes {
        let order = index
            .order_by
            .as_ref()
            .map(|f| format!(", json_extract(value, '$.{}')", f))
            .unwrap_or_default();
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{store}_{name}\" ON records (json_extract(value, '$.{field}'){order}) WHERE store = '{store}'",
            store = store,
            name = index.name,
            field = index.field,
            order = order,
        );
        sqlx::query(&sql).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(Some(version))
}
