//! Handle to one sub-store of a local database.

use super::{Pool, StoreOptions};
use crate::error::{Result, SyncError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::Row;

/// Key-value access to a sub-store. Records are JSON objects keyed by the
/// string found at the sub-store's key field.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    pool: Pool,
    db: String,
    store: String,
    options: StoreOptions,
}

impl StoreHandle {
    pub(crate) fn new(pool: Pool, db: &str, store: &str, options: StoreOptions) -> Self {
        Self {
            pool,
            db: db.to_string(),
            store: store.to_string(),
            options,
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn name(&self) -> &str {
        &self.store
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn key_of(&self, value: &Value) -> Result<String> {
        value
            .get(&self.options.key_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::MissingKey {
                store: self.store.clone(),
                field: self.options.key_field.clone(),
            })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM records WHERE store = ? AND key = ?")
            .bind(&self.store)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    /// Get a record decoded into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a record. Returns its key.
    pub async fn put(&self, value: &Value) -> Result<String> {
        let key = self.key_of(value)?;
        upsert(&self.pool, &self.store, &key, value).await?;
        Ok(key)
    }

    /// Serialize `record` and store it.
    pub async fn put_as<T: Serialize>(&self, record: &T) -> Result<String> {
        self.put(&serde_json::to_value(record)?).await
    }

    /// Insert or replace records in one transaction.
    pub async fn put_many(&self, values: &[Value]) -> Result<Vec<String>> {
        let keys = values
            .iter()
            .map(|v| self.key_of(v))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for (key, value) in keys.iter().zip(values) {
            upsert(&mut *tx, &self.store, key, value).await?;
        }
        tx.commit().await?;
        Ok(keys)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE store = ? AND key = ?")
            .bind(&self.store)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete records in one transaction. Missing keys are ignored.
    pub async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for key in keys {
            deleted += sqlx::query("DELETE FROM records WHERE store = ? AND key = ?")
                .bind(&self.store)
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// All records ordered by key.
    pub async fn all(&self) -> Result<Vec<Value>> {
        let rows = sqlx::query("SELECT value FROM records WHERE store = ? ORDER BY key")
            .bind(&self.store)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Records whose indexed field equals `value`, in index order.
    pub async fn find_by(&self, index: &str, value: &Value) -> Result<Vec<Value>> {
        let spec = self
            .options
            .index(index)
            .ok_or_else(|| SyncError::StoreNotFound(format!("{}.{}", self.store, index)))?;

        // Field names are validated identifiers, see `StoreOptions::validate`.
        let order = match &spec.order_by {
            Some(field) => format!("json_extract(value, '$.{}'), key", field),
            None => "key".to_string(),
        };
        let sql = format!(
            "SELECT value FROM records WHERE store = ? AND json_extract(value, '$.{}') = json_extract(?, '$') ORDER BY {}",
            spec.field, order
        );

        let rows = sqlx::query(&sql)
            .bind(&self.store)
            .bind(value.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE store = ?")
            .bind(&self.store)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Remove every record of this sub-store.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE store = ?")
            .bind(&self.store)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn upsert<'e, E>(executor: E, store: &str, key: &str, value: &Value) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO records (store, key, value)
        VALUES (?, ?, ?)
        ON CONFLICT (store, key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(store)
    .bind(key)
    .bind(value.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Value> {
    let text: String = row.try_get("value")?;
    serde_json::from_str(&text).map_err(|e| SyncError::Corrupted(format!("undecodable record: {}", e)))
}
