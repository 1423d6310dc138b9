//! Item types: application records and their bookkeeping envelope.

use crate::{CollectionName, ItemId, StoreName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Keys owned by the engine; they are never taken from application input.
pub const RESERVED_KEYS: [&str; 6] = [
    "id",
    "__store",
    "__collection",
    "__created_at",
    "__updated_at",
    "__deleted_at",
];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Drop reserved keys from an application-supplied field map.
pub fn strip_reserved(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Any application record. Only `id` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseItem {
    pub id: ItemId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BaseItem {
    pub fn new(id: impl Into<ItemId>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields: fields.as_object().map(strip_reserved).unwrap_or_default(),
        }
    }
}

/// An item with its bookkeeping fields.
///
/// A deleted item is a tombstone: it stays in the store with `__deleted_at`
/// set so the deletion travels through diff and merge like any other change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullItem {
    pub id: ItemId,
    #[serde(rename = "__store")]
    pub store: StoreName,
    #[serde(rename = "__collection")]
    pub collection: CollectionName,
    #[serde(rename = "__created_at")]
    pub created_at: Timestamp,
    #[serde(rename = "__updated_at")]
    pub updated_at: Timestamp,
    #[serde(
        rename = "__deleted_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<Timestamp>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl FullItem {
    /// Wrap a base item created at `now`.
    pub fn new(
        base: BaseItem,
        store: impl Into<StoreName>,
        collection: impl Into<CollectionName>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: base.id,
            store: store.into(),
            collection: collection.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            fields: strip_reserved(&base.fields),
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Replace all fields (re-adding an existing id). The creation time is kept
    /// and any tombstone is cleared.
    pub fn replace(&mut self, base: BaseItem, now: Timestamp) {
        self.fields = strip_reserved(&base.fields);
        self.deleted_at = None;
        self.touch(now);
    }

    /// Shallow-merge `changes` into the fields.
    pub fn apply_changes(&mut self, changes: &Map<String, Value>, now: Timestamp) {
        for (key, value) in changes {
            if !is_reserved(key) {
                self.fields.insert(key.clone(), value.clone());
            }
        }
        self.touch(now);
    }

    /// Mark the item deleted. `__updated_at` is left untouched; the
    /// tombstone is never older than the last edit.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        if self.deleted_at.is_none() {
            self.deleted_at = Some(now.max(self.updated_at));
        }
    }

    /// Every local edit moves `__updated_at` forward, even when the local
    /// clock lags behind the one that wrote the previous version.
    fn touch(&mut self, now: Timestamp) {
        self.updated_at = now.max(self.created_at).max(self.updated_at + 1);
    }

    /// Latest moment this item was written, deletions included.
    pub fn last_modified(&self) -> Timestamp {
        self.updated_at.max(self.deleted_at.unwrap_or(0))
    }

    /// Whether `self` should replace `other` under last-writer-wins.
    ///
    /// Later writes win; on equal times a tombstone beats a live item. Any
    /// remaining tie goes to the greater encoded form, so every replica picks
    /// the same winner. Fully equal candidates do not supersede each other.
    pub fn supersedes(&self, other: &FullItem) -> bool {
        match self.last_modified().cmp(&other.last_modified()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (self.is_active(), other.is_active()) {
                (false, true) => true,
                (true, false) => false,
                _ => self.encoded() > other.encoded(),
            },
        }
    }

    /// Compact JSON with sorted field keys.
    fn encoded(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
