//! Action journal (stash) state machine.
//!
//! Each entry moves `pending -> processing -> {removed | pending}`. Only one
//! batch may be processing at a time; appends made while a batch is out
//! always land in `pending` and go out with the next batch. Persistence is
//! the caller's concern: entries are stored until purged, and any stored
//! entry is treated as pending on recovery.

use crate::{error::Result, Action, EntryId, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lifecycle state of a journal entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[default]
    Pending,
    Processing,
}

/// A journaled action with its FIFO position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Journal entry ID (same as the action's)
    pub id: EntryId,
    /// Append order
    pub seq: u64,
    pub action: Action,
    #[serde(default)]
    pub state: EntryState,
}

/// In-memory journal.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: BTreeMap<u64, JournalEntry>,
    by_id: HashMap<EntryId, u64>,
    next_seq: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a journal from persisted entries.
    ///
    /// Without a durable commit acknowledgement, entries found `processing`
    /// can only safely be assumed `pending`. Duplicate ids keep the earliest
    /// entry.
    pub fn recover(persisted: impl IntoIterator<Item = JournalEntry>) -> Self {
        let mut sorted: Vec<JournalEntry> = persisted.into_iter().collect();
        sorted.sort_by_key(|e| e.seq);

        let mut journal = Self::new();
        for mut entry in sorted {
            if journal.by_id.contains_key(&entry.id) || journal.entries.contains_key(&entry.seq) {
                continue;
            }
            entry.state = EntryState::Pending;
            journal.next_seq = journal.next_seq.max(entry.seq + 1);
            journal.by_id.insert(entry.id.clone(), entry.seq);
            journal.entries.insert(entry.seq, entry);
        }
        journal
    }

    /// Append an action as a pending entry.
    pub fn append(&mut self, action: Action) -> Result<JournalEntry> {
        let id = action.entry_id().clone();
        if self.by_id.contains_key(&id) {
            return Err(Error::InvalidAction(format!("duplicate journal entry: {}", id)));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = JournalEntry {
            id: id.clone(),
            seq,
            action,
            state: EntryState::Pending,
        };
        self.by_id.insert(id, seq);
        self.entries.insert(seq, entry.clone());
        Ok(entry)
    }

    /// Take every pending entry for processing, in append order.
    ///
    /// Returns nothing while a previous batch is still processing.
    pub fn drain(&mut self) -> Vec<JournalEntry> {
        if self.is_processing() {
            return Vec::new();
        }
        self.entries
            .values_mut()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| {
                e.state = EntryState::Processing;
                e.clone()
            })
            .collect()
    }

    /// Remove committed entries. Unknown ids are ignored, so purging twice is
    /// harmless. Returns the ids actually removed.
    pub fn commit_success(&mut self, ids: &[EntryId]) -> Vec<EntryId> {
        let mut removed = Vec::new();
        for id in ids {
            if let Some(seq) = self.by_id.remove(id) {
                self.entries.remove(&seq);
                removed.push(id.clone());
            }
        }
        removed
    }

    /// Return entries of a failed batch to pending.
    pub fn commit_failure(&mut self, ids: &[EntryId]) {
        for id in ids {
            let Some(seq) = self.by_id.get(id).copied() else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&seq) {
                entry.state = EntryState::Pending;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&JournalEntry> {
        self.by_id.get(id).and_then(|seq| self.entries.get(seq))
    }

    /// All entries in append order.
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.values()
    }

    /// All journaled actions in append order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.entries.values().map(|e| &e.action)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.count(EntryState::Pending)
    }

    pub fn processing_count(&self) -> usize {
        self.count(EntryState::Processing)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn is_processing(&self) -> bool {
        self.processing_count() > 0
    }

    fn count(&self, state: EntryState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }
}
