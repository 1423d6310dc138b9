//! The sync orchestrator.
//!
//! A [`Gitray`] owns one book: its in-memory state, the local sub-stores that
//! mirror it, the persistent stash of unsynced actions and the scheduler that
//! commits them. Local writes apply immediately and never wait for the
//! remote; a sync cycle later pulls remote changes, reconciles them into the
//! local state and commits whatever still differs.

use crate::config::SyncConfig;
use crate::db::{StoreHandle, StoreManager, StoreOptions};
use crate::error::{Result, SyncError};
use crate::inflight::InFlight;
use crate::remote::{BlobWrite, CommitId, CommitRequest, RemoteStore};
use crate::scheduler::{BatchOutcome, BatchRunner, Scheduler, SchedulerConfig};
use crate::stash::Stash;
use async_trait::async_trait;
use futures::future::try_join_all;
use gitray_engine::{
    diff, hash, layout::asset_ref, transform, Action, ApplyResult, BaseItem, BookState, Conflict,
    ContentRef, DetailEntry, EntryId, FullItem, Hash, Layout, Patch, PathKind, Reconciler,
    RemoteChanges, StoreDetail, StoreStructure, SyncSnapshot, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

const ITEMS_STORE: &str = "items";
const META_STORE: &str = "meta";
const STASH_STORE: &str = "stash";

/// Index of the items sub-store by `__store`.
pub const BY_STORE_INDEX: &str = "by_store";

/// Key of the meta record holding the last synced snapshot.
pub const STRUCTURE_KEY: &str = "$structure";

/// Item records are keyed by collection and id, ids are only unique within
/// a collection.
const ITEM_KEY: &str = "__key";

/// Stored form of a collection or root meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub content: Map<String, Value>,
    /// Hash of the blob as of the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Journal entries covered by the cycle
    pub entries: usize,
    /// Remote blobs fetched
    pub fetched: usize,
    /// Items taken from the remote
    pub applied_items: usize,
    pub conflicts: Vec<Conflict>,
    /// Paths written and deleted by the commit
    pub changed: usize,
    pub deleted: usize,
    pub commit: Option<CommitId>,
}

impl SyncReport {
    pub fn committed(&self) -> bool {
        self.commit.is_some()
    }
}

struct Local {
    state: BookState,
    stash: Stash,
    last_known: Option<SyncSnapshot>,
}

struct Inner {
    book: String,
    layout: Layout,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    items: StoreHandle,
    meta: StoreHandle,
    local: Mutex<Local>,
    cycle: Mutex<()>,
    inflight: InFlight<Vec<u8>>,
}

/// A synchronized book.
pub struct Gitray {
    inner: Arc<Inner>,
    scheduler: Scheduler,
}

impl std::fmt::Debug for Gitray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gitray")
            .field("book", &self.inner.book)
            .field("layout", &self.inner.layout)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

fn new_entry_id() -> EntryId {
    uuid::Uuid::new_v4().to_string()
}

fn item_key(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

fn item_record(item: &FullItem) -> Value {
    let mut value = item.to_value();
    if let Value::Object(fields) = &mut value {
        fields.insert(ITEM_KEY.into(), json!(item_key(&item.collection, &item.id)));
    }
    value
}

fn item_from_record(mut value: Value) -> Result<FullItem> {
    if let Value::Object(fields) = &mut value {
        fields.remove(ITEM_KEY);
    }
    serde_json::from_value(value).map_err(|e| SyncError::Corrupted(format!("undecodable item: {}", e)))
}

impl Gitray {
    /// Open `book` with the repository root as its layout.
    pub async fn open(
        manager: &StoreManager,
        book: &str,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::open_with_layout(manager, book, Layout::new(), remote, config).await
    }

    /// Open `book`, load its local state and replay unsynced actions.
    pub async fn open_with_layout(
        manager: &StoreManager,
        book: &str,
        layout: Layout,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let items = manager
            .ensure_store(
                book,
                ITEMS_STORE,
                StoreOptions::keyed_by(ITEM_KEY).with_index(
                    BY_STORE_INDEX,
                    "__store",
                    Some("__created_at"),
                ),
            )
            .await?;
        let meta = manager
            .ensure_store(book, META_STORE, StoreOptions::keyed_by("path"))
            .await?;
        let stash_store = manager
            .ensure_store(book, STASH_STORE, StoreOptions::keyed_by("id"))
            .await?;

        let mut state = BookState::new();
        for record in items.all().await? {
            state.put_item(item_from_record(record)?);
        }

        let mut last_known = None;
        for record in meta.all().await? {
            if record.get("path").and_then(Value::as_str) == Some(STRUCTURE_KEY) {
                last_known = decode_snapshot(record);
                continue;
            }
            let record: MetaRecord = serde_json::from_value(record)
                .map_err(|e| SyncError::Corrupted(format!("undecodable meta: {}", e)))?;
            state.set_meta(record.collection.as_deref(), record.content);
        }

        let stash = Stash::open(stash_store).await?;
        let replayed = stash.len();
        for (action, applied_at) in stash.replay() {
            if superseded(&state, &action, applied_at) {
                continue;
            }
            if let Err(err) = state.apply(&action, applied_at) {
                tracing::warn!(book, entry = %action.entry_id(), error = %err, "Skipping unreplayable action");
            }
        }

        let inner = Arc::new(Inner {
            book: book.to_string(),
            layout,
            config,
            remote,
            items,
            meta,
            local: Mutex::new(Local {
                state,
                stash,
                last_known,
            }),
            cycle: Mutex::new(()),
            inflight: InFlight::new(),
        });

        if replayed > 0 {
            let local = inner.local.lock().await;
            inner.persist_all(&local.state).await?;
        }

        let scheduler = Scheduler::spawn(inner.clone(), SchedulerConfig::from(&inner.config));
        if replayed > 0 {
            scheduler.notify();
        }

        tracing::info!(book, pending = replayed, "Book opened");
        Ok(Self { inner, scheduler })
    }

    pub fn book(&self) -> &str {
        &self.inner.book
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Apply a local action. It is journaled before it takes effect and
    /// committed by a later sync cycle.
    pub async fn apply(&self, action: Action) -> Result<ApplyResult> {
        if let Some(collection) = action.collection() {
            self.inner.layout.validate_collection(collection)?;
        }
        let now = now_millis();

        let mut guard = self.inner.local.lock().await;
        let local = &mut *guard;
        let entry = local.stash.append(action, now).await?;
        let result = match local.state.apply(&entry.action, now) {
            Ok(result) => result,
            Err(err) => {
                local.stash.discard(&entry.id).await?;
                return Err(err.into());
            }
        };
        self.inner.persist_applied(&local.state, &result).await?;
        drop(guard);

        self.scheduler.notify();
        Ok(result)
    }

    /// Add or replace an item.
    pub async fn add(&self, collection: &str, store: &str, item: BaseItem) -> Result<ApplyResult> {
        self.apply(Action::add(new_entry_id(), collection, store, item))
            .await
    }

    /// Merge `changes` into an existing item.
    pub async fn update(
        &self,
        collection: &str,
        store: &str,
        id: &str,
        changes: Map<String, Value>,
    ) -> Result<ApplyResult> {
        self.apply(Action::update(new_entry_id(), collection, store, id, changes))
            .await
    }

    /// Delete an item, leaving a tombstone.
    pub async fn remove(&self, collection: &str, store: &str, id: &str) -> Result<ApplyResult> {
        self.apply(Action::remove(new_entry_id(), collection, store, id))
            .await
    }

    /// Patch a collection's meta, or the root meta for `None`.
    pub async fn patch_meta(&self, collection: Option<&str>, patch: Patch) -> Result<ApplyResult> {
        let store = collection.unwrap_or(self.inner.book.as_str()).to_string();
        self.apply(Action::meta(
            new_entry_id(),
            collection.map(str::to_string),
            store,
            patch,
        ))
        .await
    }

    /// An active item.
    pub async fn get(&self, collection: &str, id: &str) -> Option<FullItem> {
        self.inner.local.lock().await.state.get(collection, id).cloned()
    }

    /// Active items of a collection, oldest first.
    pub async fn items(&self, collection: &str) -> Vec<FullItem> {
        let local = self.inner.local.lock().await;
        local
            .state
            .query(collection)
            .map(|q| q.all().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active items of one store inside a collection, oldest first.
    pub async fn store_items(&self, collection: &str, store: &str) -> Vec<FullItem> {
        let local = self.inner.local.lock().await;
        local
            .state
            .query(collection)
            .map(|q| q.store(store).all().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Items of a store as persisted locally, tombstones included.
    pub async fn stored_items(&self, store: &str) -> Result<Vec<FullItem>> {
        self.inner
            .items
            .find_by(BY_STORE_INDEX, &json!(store))
            .await?
            .into_iter()
            .map(item_from_record)
            .collect()
    }

    /// Meta of a collection, or the root meta for `None`.
    pub async fn meta(&self, collection: Option<&str>) -> Option<Map<String, Value>> {
        self.inner.local.lock().await.state.meta(collection).cloned()
    }

    /// Journal entries not yet committed.
    pub async fn pending_count(&self) -> usize {
        self.inner.local.lock().await.stash.len()
    }

    /// Snapshot of the last successful sync.
    pub async fn last_synced(&self) -> Option<SyncSnapshot> {
        self.inner.local.lock().await.last_known.clone()
    }

    /// Bytes of a remote asset, given its path or an `asset:` field value.
    pub async fn asset(&self, reference: &str) -> Result<Vec<u8>> {
        let path = asset_ref(reference).unwrap_or(reference);
        if !matches!(self.inner.layout.parse(path), PathKind::Asset { .. }) {
            return Err(gitray_engine::Error::InvalidPath(path.to_string()).into());
        }
        let hash = path.rsplit('/').next().unwrap_or_default();
        self.inner
            .fetch_verified(&ContentRef::new(path, hash))
            .await
    }

    /// Run a sync cycle now.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.inner.sync().await
    }

    /// Forget the last synced snapshot so the next cycle re-diffs everything
    /// against the remote.
    pub async fn force_need_sync(&self) -> Result<()> {
        self.inner.invalidate_snapshot().await?;
        self.scheduler.notify();
        Ok(())
    }

    /// Stop background syncing, waiting for a running cycle to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        tracing::info!(book = %self.inner.book, "Book closed");
    }
}

/// Whether the stored item already reflects a later change than `action`.
fn superseded(state: &BookState, action: &Action, applied_at: Timestamp) -> bool {
    match (action.collection(), action.item_id()) {
        (Some(collection), Some(id)) => state
            .get_including_deleted(collection, id)
            .is_some_and(|item| item.last_modified() > applied_at),
        _ => false,
    }
}

fn decode_snapshot(mut record: Value) -> Option<SyncSnapshot> {
    let snapshot = record.get_mut("snapshot").map(Value::take)?;
    match serde_json::from_value::<SyncSnapshot>(snapshot) {
        Ok(snapshot) if snapshot.validate().is_ok() => Some(snapshot),
        _ => {
            tracing::warn!("Discarding unreadable sync snapshot");
            None
        }
    }
}

fn empty_structure(layout: &Layout) -> StoreStructure {
    StoreStructure::new(ContentRef::unhashed(layout.root_meta()))
}

impl Inner {
    async fn persist_item(&self, state: &BookState, collection: &str, id: &str) -> Result<()> {
        if let Some(item) = state.get_including_deleted(collection, id) {
            self.items.put(&item_record(item)).await?;
        }
        Ok(())
    }

    async fn persist_meta(&self, state: &BookState, collection: Option<&str>) -> Result<()> {
        let path = match collection {
            Some(name) => self.layout.collection_meta(name),
            None => self.layout.root_meta(),
        };
        let content = state.meta(collection).cloned().unwrap_or_default();
        let hash = self
            .meta
            .get_as::<MetaRecord>(&path)
            .await
            .ok()
            .flatten()
            .and_then(|r| r.hash);
        let record = MetaRecord {
            path,
            collection: collection.map(str::to_string),
            content,
            hash,
        };
        self.meta.put_as(&record).await?;
        Ok(())
    }

    async fn persist_applied(&self, state: &BookState, result: &ApplyResult) -> Result<()> {
        if let (Some(collection), Some(id)) = (&result.collection, &result.item_id) {
            self.persist_item(state, collection, id).await?;
        }
        // Items create their collection on demand, so its meta is stored too.
        self.persist_meta(state, result.collection.as_deref()).await
    }

    async fn persist_all(&self, state: &BookState) -> Result<()> {
        let records: Vec<Value> = state
            .collections()
            .flat_map(|(_, c)| c.all_items())
            .map(item_record)
            .collect();
        self.items.put_many(&records).await?;
        self.persist_meta(state, None).await?;
        for name in state.collection_names() {
            self.persist_meta(state, Some(name)).await?;
        }
        Ok(())
    }

    async fn invalidate_snapshot(&self) -> Result<()> {
        self.local.lock().await.last_known = None;
        self.meta.delete(STRUCTURE_KEY).await?;
        tracing::info!(book = %self.book, "Sync snapshot invalidated");
        Ok(())
    }

    async fn fetch_verified(&self, content: &ContentRef) -> Result<Vec<u8>> {
        let remote = self.remote.clone();
        let target = content.clone();
        let key = format!("{}@{}", content.path, content.hash);
        let bytes = self
            .inflight
            .run(&key, move || async move { remote.fetch_blob(&target).await })
            .await?;
        if content.has_hash() {
            hash::verify(&content.path, &bytes, &content.hash)?;
        }
        Ok(bytes)
    }

    /// Fetch and decode the blobs that changed remotely since `base`.
    async fn pull(&self, base: &StoreStructure, remote: &StoreStructure) -> Result<RemoteChanges> {
        let changes = diff::diff(base, remote);
        let changed: HashSet<&str> = changes.changed.iter().map(String::as_str).collect();
        let wanted: Vec<ContentRef> = remote
            .refs()
            .filter(|r| r.has_hash() && changed.contains(r.path.as_str()))
            .filter(|r| !matches!(self.layout.parse(&r.path), PathKind::Asset { .. }))
            .cloned()
            .collect();

        let fetched = try_join_all(wanted.iter().map(|r| self.fetch_verified(r))).await?;
        let entries = wanted
            .into_iter()
            .zip(fetched)
            .map(|(r, bytes)| {
                let content = transform::content_from_bytes(&self.layout, &r.path, bytes)?;
                Ok(DetailEntry {
                    path: r.path,
                    content,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RemoteChanges {
            entries,
            deleted: changes.deleted,
        })
    }

    async fn sync(&self) -> Result<SyncReport> {
        let _cycle = self.cycle.lock().await;

        let (batch, base) = {
            let mut local = self.local.lock().await;
            let batch: Vec<EntryId> = local.stash.drain().into_iter().map(|e| e.id).collect();
            (batch, local.last_known.clone())
        };

        match self.run_cycle(base).await {
            Ok((mut report, snapshot)) => {
                let mut local = self.local.lock().await;
                local.stash.commit_success(&batch).await?;
                self.meta
                    .put(&json!({ "path": STRUCTURE_KEY, "snapshot": snapshot }))
                    .await?;
                self.record_synced_hashes(&local.state, &snapshot).await?;
                local.last_known = Some(snapshot);
                report.entries = batch.len();

                tracing::info!(
                    book = %self.book,
                    entries = report.entries,
                    changed = report.changed,
                    deleted = report.deleted,
                    conflicts = report.conflicts.len(),
                    "Sync cycle finished"
                );
                Ok(report)
            }
            Err(err) => {
                self.local.lock().await.stash.commit_failure(&batch);
                if matches!(err, SyncError::Engine(gitray_engine::Error::HashMismatch { .. })) {
                    self.invalidate_snapshot().await?;
                }
                tracing::warn!(book = %self.book, entries = batch.len(), error = %err, "Sync cycle failed");
                Err(err)
            }
        }
    }

    async fn record_synced_hashes(&self, state: &BookState, snapshot: &SyncSnapshot) -> Result<()> {
        let collections = std::iter::once(None).chain(state.collection_names().map(|n| Some(n.as_str())));
        for collection in collections {
            let path = match collection {
                Some(name) => self.layout.collection_meta(name),
                None => self.layout.root_meta(),
            };
            let record = MetaRecord {
                hash: snapshot.structure.hash_of(&path).map(str::to_string),
                path,
                collection: collection.map(str::to_string),
                content: state.meta(collection).cloned().unwrap_or_default(),
            };
            self.meta.put_as(&record).await?;
        }
        Ok(())
    }

    async fn run_cycle(&self, base: Option<SyncSnapshot>) -> Result<(SyncReport, SyncSnapshot)> {
        let mut report = SyncReport::default();
        let remote_structure = self.remote.fetch_structure(&self.layout).await?;
        let base_structure = base
            .as_ref()
            .map(|s| s.structure.clone())
            .unwrap_or_else(|| empty_structure(&self.layout));

        let incoming = match &remote_structure {
            Some(remote) => self.pull(&base_structure, remote).await?,
            None => RemoteChanges::default(),
        };
        report.fetched = incoming.entries.len();

        let bases: BTreeMap<_, _> = base.map(|s| s.metas).unwrap_or_default();
        let detail = {
            let mut guard = self.local.lock().await;
            let local = &mut *guard;
            let merged = Reconciler::new(&self.layout, &bases).reconcile(&mut local.state, incoming)?;

            for conflict in &merged.conflicts {
                self.persist_item(&local.state, &conflict.collection, &conflict.item_id)
                    .await?;
            }
            for (name, collection) in local.state.collections() {
                for id in &merged.applied_items {
                    if collection.get(id).is_some() {
                        self.persist_item(&local.state, name, id).await?;
                    }
                }
            }
            for path in &merged.merged_meta {
                let collection = match self.layout.parse(path) {
                    PathKind::CollectionMeta { collection } => Some(collection),
                    _ => None,
                };
                self.persist_meta(&local.state, collection.as_deref()).await?;
            }

            report.applied_items = merged.applied_items.len();
            report.conflicts = merged.conflicts;
            transform::to_detail(&local.state, &self.layout, self.config.chunk_size)?
        };

        let remote_now = remote_structure.unwrap_or_else(|| empty_structure(&self.layout));
        let request = commit_request(&detail, &remote_now);
        report.changed = request.writes.len();
        report.deleted = request.deletes.len();

        if !request.is_empty() {
            report.commit = Some(self.commit(request).await?);
        }

        let snapshot = SyncSnapshot::from_detail(&detail, now_millis())?;
        Ok((report, snapshot))
    }

    /// Commit under the configured timeout. A commit that times out keeps
    /// running in the background but the cycle counts as failed.
    async fn commit(&self, request: CommitRequest) -> Result<CommitId> {
        let remote = self.remote.clone();
        let task = tokio::spawn(async move { remote.commit(request).await });
        match tokio::time::timeout(self.config.commit_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SyncError::RemoteUnavailable(format!("commit task failed: {}", join))),
            Err(_) => Err(SyncError::Timeout(self.config.commit_timeout)),
        }
    }
}

/// Writes and deletions taking the remote to `detail`. Linked assets are
/// only listed, never written.
fn commit_request(detail: &StoreDetail, remote: &StoreStructure) -> CommitRequest {
    let mut changes = diff::diff(remote, &detail.structure());
    changes.changed.retain(|path| detail.entry(path).is_some());
    let writes = changes
        .changed
        .iter()
        .filter_map(|path| detail.entry(path))
        .map(|entry| BlobWrite {
            path: entry.path.clone(),
            bytes: entry.content.to_bytes(),
        })
        .collect();
    CommitRequest {
        message: changes.describe(),
        writes,
        deletes: changes.deleted,
    }
}

#[async_trait]
impl BatchRunner for Inner {
    async fn run_batch(&self) -> Result<BatchOutcome> {
        let report = self.sync().await?;
        Ok(BatchOutcome {
            entries: report.entries,
            committed: report.committed(),
        })
    }

    async fn has_pending(&self) -> bool {
        self.local.lock().await.stash.has_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitray_engine::{CollectionDetail, Content};

    #[test]
    fn item_records_round_trip_without_key() {
        let item = FullItem::new(BaseItem::new("b1", json!({"amount": 3})), "bills", "bills", 10);
        let record = item_record(&item);
        assert_eq!(record[ITEM_KEY], "bills/b1");
        assert_eq!(item_from_record(record).unwrap(), item);
    }

    #[test]
    fn corrupted_item_record() {
        let err = item_from_record(json!({"id": 1})).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn snapshot_record_decoding() {
        let layout = Layout::new();
        let snapshot = SyncSnapshot::new(empty_structure(&layout), 5);
        let record = json!({"path": STRUCTURE_KEY, "snapshot": snapshot});
        assert_eq!(decode_snapshot(record), Some(snapshot));
        assert_eq!(decode_snapshot(json!({"path": STRUCTURE_KEY})), None);
        assert_eq!(
            decode_snapshot(json!({"path": STRUCTURE_KEY, "snapshot": {"formatVersion": 99}})),
            None
        );
    }

    #[test]
    fn commit_request_skips_linked_assets() {
        let detail = StoreDetail {
            meta: DetailEntry::json("meta.json", json!({})),
            collections: vec![CollectionDetail {
                name: "bills".into(),
                meta: DetailEntry::json("bills/meta.json", json!({})),
                chunks: vec![DetailEntry::json("bills/0.json", json!([]))],
                assets: vec![],
                linked: vec![ContentRef::new("bills/assets/abc", "abc")],
            }],
        };
        let remote = StoreStructure::new(ContentRef::new("meta.json", Content::Json(json!({})).hash()));

        let request = commit_request(&detail, &remote);
        let paths: Vec<_> = request.writes.iter().map(|w| w.path.as_str()).collect();
        assert_eq!(paths, vec!["bills/meta.json", "bills/0.json"]);
        assert!(request.deletes.is_empty());
        assert_eq!(request.message, "update 2 files");
    }
}
