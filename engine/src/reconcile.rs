//! Reconciliation of remote changes into local state.
//!
//! Items merge by last-writer-wins on their bookkeeping timestamps, so the
//! outcome does not depend on which side syncs first. Metadata merges
//! structurally: the remote's changes since the last common base are
//! computed as a patch and merged into the local metadata, which keeps
//! concurrent edits to disjoint keys.
//!
//! Remote deletions of whole blobs never remove local data. Items are
//! deleted through tombstones, which arrive as ordinary item changes.

use crate::{
    error::Result,
    layout::PathKind,
    patch,
    transform::{decode_chunk, decode_meta},
    BookState, CollectionName, DetailEntry, FullItem, ItemId, Layout, Path, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local version was kept
    LocalWins,
    /// Remote version replaced the local one
    RemoteWins,
}

/// An item that differed on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub collection: CollectionName,
    pub item_id: ItemId,
    pub local_modified: Timestamp,
    pub remote_modified: Timestamp,
    pub resolution: ConflictResolution,
}

/// Remote side of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteChanges {
    /// Changed blobs with their decoded content
    pub entries: Vec<DetailEntry>,
    /// Paths that disappeared from the remote
    pub deleted: Vec<Path>,
}

/// Result of reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    /// Remote items written into local state
    pub applied_items: Vec<ItemId>,
    /// Items where the local version was kept over a differing remote one
    pub kept_local: Vec<ItemId>,
    /// Meta paths whose remote changes were merged
    pub merged_meta: Vec<Path>,
    /// Items that differed on both sides
    pub conflicts: Vec<Conflict>,
    /// Remote paths that were not applied (deletions and unknown paths)
    pub ignored: Vec<Path>,
}

impl ReconcileResult {
    /// Whether reconciliation changed local state.
    pub fn changed_local(&self) -> bool {
        !self.applied_items.is_empty() || !self.merged_meta.is_empty()
    }
}

/// Merges remote changes into a book state.
pub struct Reconciler<'a> {
    layout: &'a Layout,
    /// Meta contents of the last common snapshot, by path
    bases: &'a BTreeMap<Path, Map<String, Value>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(layout: &'a Layout, bases: &'a BTreeMap<Path, Map<String, Value>>) -> Self {
        Self { layout, bases }
    }

    /// Merge `remote` into `state`.
    ///
    /// Entries are decoded before anything is written, so a malformed blob
    /// leaves `state` untouched.
    pub fn reconcile(&self, state: &mut BookState, remote: RemoteChanges) -> Result<ReconcileResult> {
        let mut result = ReconcileResult::default();
        let mut metas: Vec<(Option<CollectionName>, Path, Map<String, Value>)> = Vec::new();
        let mut items: Vec<FullItem> = Vec::new();

        for entry in &remote.entries {
            match self.layout.parse(&entry.path) {
                PathKind::RootMeta => {
                    metas.push((None, entry.path.clone(), decode_meta(&entry.path, &entry.content)?));
                }
                PathKind::CollectionMeta { collection } => {
                    let meta = decode_meta(&entry.path, &entry.content)?;
                    metas.push((Some(collection), entry.path.clone(), meta));
                }
                PathKind::Chunk { .. } => items.extend(decode_chunk(&entry.path, &entry.content)?),
                // Asset content is fetched on demand through its reference.
                PathKind::Asset { .. } => {}
                PathKind::Unknown => result.ignored.push(entry.path.clone()),
            }
        }

        for (collection, path, remote_meta) in metas {
            if self.merge_meta(state, collection.as_deref(), &path, &remote_meta) {
                result.merged_meta.push(path);
            }
        }

        for item in items {
            self.merge_item(state, item, &mut result);
        }

        result.ignored.extend(remote.deleted);
        Ok(result)
    }

    fn merge_meta(
        &self,
        state: &mut BookState,
        collection: Option<&str>,
        path: &str,
        remote: &Map<String, Value>,
    ) -> bool {
        let empty = Map::new();
        let base = self.bases.get(path).unwrap_or(&empty);
        let changes = patch::diff(base, remote);
        if changes.is_empty() {
            return false;
        }

        let mut local = state.meta(collection).cloned().unwrap_or_default();
        patch::merge_into(&mut local, &changes);
        state.set_meta(collection, local);
        true
    }

    fn merge_item(&self, state: &mut BookState, remote: FullItem, result: &mut ReconcileResult) {
        let local = state.get_including_deleted(&remote.collection, &remote.id);
        match local {
            None => {
                result.applied_items.push(remote.id.clone());
                state.put_item(remote);
            }
            Some(local) if *local == remote => {}
            Some(local) => {
                let resolution = if remote.supersedes(local) {
                    ConflictResolution::RemoteWins
                } else {
                    ConflictResolution::LocalWins
                };
                result.conflicts.push(Conflict {
                    collection: remote.collection.clone(),
                    item_id: remote.id.clone(),
                    local_modified: local.last_modified(),
                    remote_modified: remote.last_modified(),
                    resolution,
                });
                match resolution {
                    ConflictResolution::RemoteWins => {
                        result.applied_items.push(remote.id.clone());
                        state.put_item(remote);
                    }
                    ConflictResolution::LocalWins => result.kept_local.push(remote.id),
                }
            }
        }
    }
}
