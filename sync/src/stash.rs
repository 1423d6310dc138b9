//! Persistent action journal.
//!
//! Wraps the in-memory [`Journal`] with a sub-store holding one record per
//! unpurged entry. A record is written before the entry becomes visible, so
//! every acknowledged action survives a restart; on reopen every stored entry
//! is pending again.

use crate::db::StoreHandle;
use crate::error::Result;
use gitray_engine::{Action, EntryId, Journal, JournalEntry, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stored form of a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StashRecord {
    #[serde(flatten)]
    pub entry: JournalEntry,
    /// When the action was applied locally, so replays are exact
    pub applied_at: Timestamp,
}

/// Journal backed by a local sub-store.
#[derive(Debug)]
pub struct Stash {
    journal: Journal,
    applied_at: std::collections::HashMap<EntryId, Timestamp>,
    store: StoreHandle,
}

impl Stash {
    /// Load every stored entry as pending.
    ///
    /// A record that no longer decodes is skipped with a warning and left in
    /// the store; the remaining entries still load.
    pub async fn open(store: StoreHandle) -> Result<Self> {
        let mut records = Vec::new();
        for value in store.all().await? {
            let id = value.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            match serde_json::from_value::<StashRecord>(value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(store = store.name(), id = %id, error = %err, "Skipping undecodable stash record")
                }
            }
        }
        let applied_at = records
            .iter()
            .map(|r| (r.entry.id.clone(), r.applied_at))
            .collect();
        let journal = Journal::recover(records.into_iter().map(|r| r.entry));

        if !journal.is_empty() {
            tracing::info!(
                store = store.name(),
                entries = journal.len(),
                "Recovered pending actions"
            );
        }

        Ok(Self {
            journal,
            applied_at,
            store,
        })
    }

    /// Journal `action` durably.
    pub async fn append(&mut self, action: Action, applied_at: Timestamp) -> Result<JournalEntry> {
        let entry = self.journal.append(action)?;
        let record = StashRecord {
            entry: entry.clone(),
            applied_at,
        };
        if let Err(err) = self.store.put_as(&record).await {
            self.journal.commit_success(std::slice::from_ref(&entry.id));
            return Err(err);
        }
        self.applied_at.insert(entry.id.clone(), applied_at);
        Ok(entry)
    }

    /// Drop an entry whose action could not be applied.
    pub async fn discard(&mut self, id: &EntryId) -> Result<()> {
        self.journal.commit_success(std::slice::from_ref(id));
        self.applied_at.remove(id);
        self.store.delete(id).await?;
        Ok(())
    }

    /// Take all pending entries for a commit. Empty while a batch is out.
    pub fn drain(&mut self) -> Vec<JournalEntry> {
        self.journal.drain()
    }

    /// Purge committed entries. Purging twice is harmless.
    ///
    /// Entries leave the journal even if deleting their records fails; they
    /// are then replayed after a restart, which is idempotent.
    pub async fn commit_success(&mut self, ids: &[EntryId]) -> Result<usize> {
        let removed = self.journal.commit_success(ids);
        for id in &removed {
            self.applied_at.remove(id);
        }
        self.store.delete_many(ids).await?;
        Ok(removed.len())
    }

    /// Return a failed batch to pending.
    pub fn commit_failure(&mut self, ids: &[EntryId]) {
        self.journal.commit_failure(ids);
    }

    /// Entries in append order with the time each was applied.
    pub fn replay(&self) -> Vec<(Action, Timestamp)> {
        self.journal
            .entries()
            .map(|e| {
                let at = self.applied_at.get(&e.id).copied().unwrap_or_default();
                (e.action.clone(), at)
            })
            .collect()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn has_pending(&self) -> bool {
        self.journal.has_pending()
    }

    pub fn is_processing(&self) -> bool {
        self.journal.is_processing()
    }

    pub fn len(&self) -> usize {
        self.journal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.journal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{StoreManager, StoreOptions};
    use gitray_engine::{BaseItem, EntryState};
    use serde_json::json;
    use tempfile::tempdir;

    fn add(id: &str) -> Action {
        Action::add(id, "bills", "bills", BaseItem::new(id, json!({})))
    }

    async fn open(manager: &StoreManager) -> Stash {
        let store = manager
            .ensure_store("books", "stash", StoreOptions::keyed_by("id"))
            .await
            .unwrap();
        Stash::open(store).await.unwrap()
    }

    #[tokio::test]
    async fn durable_across_reopen() {
        let dir = tempdir().unwrap();
        let manager = StoreManager::new(dir.path());

        let mut stash = open(&manager).await;
        for i in 0..5 {
            stash.append(add(&format!("e{}", i)), 100 + i).await.unwrap();
        }
        // A batch was in flight when the process stopped.
        assert_eq!(stash.drain().len(), 5);

        let reopened = open(&manager).await;
        assert_eq!(reopened.len(), 5);
        assert_eq!(reopened.journal().pending_count(), 5);
        assert!(reopened
            .journal()
            .entries()
            .all(|e| e.state == EntryState::Pending));

        let replay = reopened.replay();
        assert_eq!(replay[0].1, 100);
        assert_eq!(replay[4].0.entry_id(), "e4");
    }

    #[tokio::test]
    async fn purge_removes_records() {
        let dir = tempdir().unwrap();
        let manager = StoreManager::new(dir.path());

        let mut stash = open(&manager).await;
        stash.append(add("e1"), 1).await.unwrap();
        stash.append(add("e2"), 2).await.unwrap();
        let batch: Vec<_> = stash.drain().into_iter().map(|e| e.id).collect();

        // Appended while the batch is out.
        stash.append(add("e3"), 3).await.unwrap();

        assert_eq!(stash.commit_success(&batch).await.unwrap(), 2);
        assert_eq!(stash.commit_success(&batch).await.unwrap(), 0);

        let reopened = open(&manager).await;
        let ids: Vec<_> = reopened.journal().entries().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e3"]);
    }

    #[tokio::test]
    async fn failure_returns_to_pending() {
        let dir = tempdir().unwrap();
        let manager = StoreManager::new(dir.path());

        let mut stash = open(&manager).await;
        stash.append(add("e1"), 1).await.unwrap();
        let batch: Vec<_> = stash.drain().into_iter().map(|e| e.id).collect();
        assert!(stash.is_processing());
        assert!(stash.drain().is_empty());

        stash.commit_failure(&batch);
        assert!(stash.has_pending());
        assert_eq!(stash.drain().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_record_does_not_block_open() {
        let dir = tempdir().unwrap();
        let manager = StoreManager::new(dir.path());

        let mut stash = open(&manager).await;
        stash.append(add("e1"), 1).await.unwrap();
        stash
            .store
            .put(&json!({"id": "e0", "seq": 0, "state": "pending", "action": {"kind": "rename"}}))
            .await
            .unwrap();

        let reopened = open(&manager).await;
        let ids: Vec<_> = reopened.journal().entries().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1"]);
    }

    #[tokio::test]
    async fn discard_and_duplicates() {
        let dir = tempdir().unwrap();
        let manager = StoreManager::new(dir.path());

        let mut stash = open(&manager).await;
        stash.append(add("e1"), 1).await.unwrap();
        assert!(stash.append(add("e1"), 2).await.is_err());

        stash.discard(&"e1".to_string()).await.unwrap();
        assert!(stash.is_empty());
        assert!(open(&manager).await.is_empty());
    }
}
