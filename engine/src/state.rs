//! Book state - the in-memory view of one book.
//!
//! The state holds root metadata and every collection's metadata and items.
//! Actions are applied to it optimistically, in journal order, so reads see
//! local writes immediately.

use crate::{
    error::Result, patch, Action, CollectionName, EntryId, Error, FullItem, ItemId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata and items of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionState {
    pub meta: Map<String, Value>,
    items: BTreeMap<ItemId, FullItem>,
}

impl CollectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an item by ID, tombstones included.
    pub fn get(&self, id: &str) -> Option<&FullItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FullItem> {
        self.items.get_mut(id)
    }

    pub fn insert(&mut self, item: FullItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn active_items(&self) -> impl Iterator<Item = &FullItem> {
        self.items.values().filter(|i| i.is_active())
    }

    pub fn all_items(&self) -> impl Iterator<Item = &FullItem> {
        self.items.values()
    }

    /// Items in chunk order: oldest first, ties broken by id.
    pub fn ordered_items(&self) -> Vec<&FullItem> {
        let mut items: Vec<_> = self.items.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Count of active items.
    pub fn len(&self) -> usize {
        self.active_items().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of applying an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// The journal entry that was applied
    pub entry_id: EntryId,
    /// The collection affected, `None` for root metadata
    pub collection: Option<CollectionName>,
    /// The item affected, for item actions
    pub item_id: Option<ItemId>,
}

/// The state of one book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookState {
    pub root_meta: Map<String, Value>,
    collections: BTreeMap<CollectionName, CollectionState>,
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an action at time `now`.
    ///
    /// Replaying an action that already took effect is harmless: adds
    /// upsert, removes of tombstones are no-ops and patches are idempotent.
    pub fn apply(&mut self, action: &Action, now: Timestamp) -> Result<ApplyResult> {
        let entry_id = action.entry_id().clone();
        match action {
            Action::Add(add) => {
                let collection = self.collection_entry(&add.collection);
                match collection.get_mut(&add.payload.id) {
                    Some(existing) => existing.replace(add.payload.clone(), now),
                    None => collection.insert(FullItem::new(
                        add.payload.clone(),
                        add.store.clone(),
                        add.collection.clone(),
                        now,
                    )),
                }
                Ok(ApplyResult {
                    entry_id,
                    collection: Some(add.collection.clone()),
                    item_id: Some(add.payload.id.clone()),
                })
            }
            Action::Update(update) => {
                let item = self.item_mut(&update.collection, &update.payload.id)?;
                if !item.is_active() {
                    return Err(Error::OperationOnDeleted(update.payload.id.clone()));
                }
                item.apply_changes(&update.payload.changes, now);
                Ok(ApplyResult {
                    entry_id,
                    collection: Some(update.collection.clone()),
                    item_id: Some(update.payload.id.clone()),
                })
            }
            Action::Remove(remove) => {
                let item = self.item_mut(&remove.collection, &remove.payload)?;
                item.mark_deleted(now);
                Ok(ApplyResult {
                    entry_id,
                    collection: Some(remove.collection.clone()),
                    item_id: Some(remove.payload.clone()),
                })
            }
            Action::Meta(meta) => {
                let target = match &meta.collection {
                    Some(name) => &mut self.collection_entry(name).meta,
                    None => &mut self.root_meta,
                };
                patch::merge_into(target, &meta.payload);
                Ok(ApplyResult {
                    entry_id,
                    collection: meta.collection.clone(),
                    item_id: None,
                })
            }
        }
    }

    fn item_mut(&mut self, collection: &str, id: &str) -> Result<&mut FullItem> {
        self.collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Error::ItemNotFound(id.to_string()))
    }

    /// Get or create a collection.
    pub fn collection_entry(&mut self, name: &str) -> &mut CollectionState {
        self.collections.entry(name.to_string()).or_default()
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionState> {
        self.collections.get(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&CollectionName, &CollectionState)> {
        self.collections.iter()
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    /// Get an active item.
    pub fn get(&self, collection: &str, id: &str) -> Option<&FullItem> {
        self.get_including_deleted(collection, id)
            .filter(|i| i.is_active())
    }

    /// Get an item including tombstones.
    pub fn get_including_deleted(&self, collection: &str, id: &str) -> Option<&FullItem> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    /// Insert or replace an item as-is (used when loading or reconciling).
    pub fn put_item(&mut self, item: FullItem) {
        self.collection_entry(&item.collection.clone()).insert(item);
    }

    /// Metadata of a collection, or root metadata for `None`.
    pub fn meta(&self, collection: Option<&str>) -> Option<&Map<String, Value>> {
        match collection {
            Some(name) => self.collections.get(name).map(|c| &c.meta),
            None => Some(&self.root_meta),
        }
    }

    pub fn set_meta(&mut self, collection: Option<&str>, meta: Map<String, Value>) {
        match collection {
            Some(name) => self.collection_entry(name).meta = meta,
            None => self.root_meta = meta,
        }
    }

    /// Query items of a collection.
    pub fn query(&self, collection: &str) -> Option<QueryBuilder<'_>> {
        self.collections.get(collection).map(QueryBuilder::new)
    }

    /// Total item count across collections, tombstones included.
    pub fn item_count(&self) -> usize {
        self.collections.values().map(|c| c.items.len()).sum()
    }
}

/// Builder for querying items in a collection.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    collection: &'a CollectionState,
    store: Option<&'a str>,
    include_deleted: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(collection: &'a CollectionState) -> Self {
        Self {
            collection,
            store: None,
            include_deleted: false,
        }
    }

    /// Restrict results to one store.
    pub fn store(mut self, store: &'a str) -> Self {
        self.store = Some(store);
        self
    }

    /// Include tombstones in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn matches(&self, item: &FullItem) -> bool {
        (self.include_deleted || item.is_active())
            && self.store.map_or(true, |s| item.store == s)
    }

    /// All matching items, oldest first.
    pub fn all(self) -> Vec<&'a FullItem> {
        self.collection
            .ordered_items()
            .into_iter()
            .filter(|i| self.matches(i))
            .collect()
    }

    /// Count matching items.
    pub fn count(self) -> usize {
        self.collection
            .all_items()
            .filter(|i| self.matches(i))
            .count()
    }

    /// Filter matching items by a predicate on their fields.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a FullItem>
    where
        F: Fn(&Map<String, Value>) -> bool,
    {
        self.collection
            .ordered_items()
            .into_iter()
            .filter(|i| self.matches(i) && predicate(&i.fields))
            .collect()
    }
}
