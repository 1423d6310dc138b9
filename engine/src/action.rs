//! Action types for expressing pending mutations.
//!
//! Every mutation is journaled as an action before it reaches the remote.
//! Actions are immutable once journaled; the payload type is fixed per kind
//! and unknown kinds are rejected when decoding.

use crate::{BaseItem, CollectionName, EntryId, ItemId, Patch, StoreName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Add (or re-add) a full item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddAction {
    /// Journal entry ID
    pub id: EntryId,
    pub collection: CollectionName,
    pub store: StoreName,
    pub payload: BaseItem,
}

/// Soft-delete an item by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveAction {
    /// Journal entry ID
    pub id: EntryId,
    pub collection: CollectionName,
    pub store: StoreName,
    pub payload: ItemId,
}

/// Partial changes to an existing item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChanges {
    pub id: ItemId,
    pub changes: Map<String, Value>,
}

/// Update an existing item with partial changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAction {
    /// Journal entry ID
    pub id: EntryId,
    pub collection: CollectionName,
    pub store: StoreName,
    pub payload: ItemChanges,
}

/// Patch the metadata of a collection, or the root metadata when
/// `collection` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAction {
    /// Journal entry ID
    pub id: EntryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionName>,
    pub store: StoreName,
    pub payload: Patch,
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    Add(AddAction),
    Remove(RemoveAction),
    Update(UpdateAction),
    Meta(MetaAction),
}

impl Action {
    pub fn add(
        id: impl Into<EntryId>,
        collection: impl Into<CollectionName>,
        store: impl Into<StoreName>,
        item: BaseItem,
    ) -> Self {
        Action::Add(AddAction {
            id: id.into(),
            collection: collection.into(),
            store: store.into(),
            payload: item,
        })
    }

    pub fn remove(
        id: impl Into<EntryId>,
        collection: impl Into<CollectionName>,
        store: impl Into<StoreName>,
        item_id: impl Into<ItemId>,
    ) -> Self {
        Action::Remove(RemoveAction {
            id: id.into(),
            collection: collection.into(),
            store: store.into(),
            payload: item_id.into(),
        })
    }

    pub fn update(
        id: impl Into<EntryId>,
        collection: impl Into<CollectionName>,
        store: impl Into<StoreName>,
        item_id: impl Into<ItemId>,
        changes: Map<String, Value>,
    ) -> Self {
        Action::Update(UpdateAction {
            id: id.into(),
            collection: collection.into(),
            store: store.into(),
            payload: ItemChanges {
                id: item_id.into(),
                changes,
            },
        })
    }

    pub fn meta(
        id: impl Into<EntryId>,
        collection: Option<CollectionName>,
        store: impl Into<StoreName>,
        patch: Patch,
    ) -> Self {
        Action::Meta(MetaAction {
            id: id.into(),
            collection,
            store: store.into(),
            payload: patch,
        })
    }

    /// Get the journal entry ID.
    pub fn entry_id(&self) -> &EntryId {
        match self {
            Action::Add(a) => &a.id,
            Action::Remove(a) => &a.id,
            Action::Update(a) => &a.id,
            Action::Meta(a) => &a.id,
        }
    }

    /// Get the target collection; `None` targets the root metadata.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Action::Add(a) => Some(a.collection.as_str()),
            Action::Remove(a) => Some(a.collection.as_str()),
            Action::Update(a) => Some(a.collection.as_str()),
            Action::Meta(a) => a.collection.as_deref(),
        }
    }

    pub fn store(&self) -> &StoreName {
        match self {
            Action::Add(a) => &a.store,
            Action::Remove(a) => &a.store,
            Action::Update(a) => &a.store,
            Action::Meta(a) => &a.store,
        }
    }

    /// The item this action targets, if it is an item action.
    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            Action::Add(a) => Some(&a.payload.id),
            Action::Remove(a) => Some(&a.payload),
            Action::Update(a) => Some(&a.payload.id),
            Action::Meta(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Add(_) => "add",
            Action::Remove(_) => "remove",
            Action::Update(_) => "update",
            Action::Meta(_) => "meta",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
