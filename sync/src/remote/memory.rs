//! In-process remote for tests and offline development.

use super::{structure_from_listing, CommitId, CommitRequest, RemoteStore};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use gitray_engine::{hash::blob_hash, ContentRef, Layout, Path, StoreStructure};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<Path, Vec<u8>>,
    commits: Vec<(CommitId, String)>,
    offline: bool,
    fail_next: usize,
    commit_delay: Option<Duration>,
    fetch_count: usize,
    /// Bytes served instead of the stored content, keyed by path
    tampered: BTreeMap<Path, Vec<u8>>,
}

/// A remote repository held in memory. Cloning shares the repository, so
/// several devices can sync against one instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: std::sync::Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning only means another device panicked mid-test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject every request until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `n` requests.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Hold every commit for `delay` before applying it.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.lock().commit_delay = delay;
    }

    /// Serve `bytes` for `path` while the listing keeps the real hash.
    pub fn tamper(&self, path: &str, bytes: Vec<u8>) {
        self.lock().tampered.insert(path.to_string(), bytes);
    }

    pub fn clear_tampering(&self) {
        self.lock().tampered.clear();
    }

    /// Write a file directly, as another client would.
    pub fn write_external(&self, path: &str, bytes: Vec<u8>) {
        let mut state = self.lock();
        state.files.insert(path.to_string(), bytes);
        let id = format!("external-{}", state.commits.len() + 1);
        state.commits.push((id, format!("write {}", path)));
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn read_json(&self, path: &str) -> Option<serde_json::Value> {
        self.read(path).and_then(|b| serde_json::from_slice(&b).ok())
    }

    /// All stored paths.
    pub fn files(&self) -> Vec<Path> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits.len()
    }

    /// Commit messages, oldest first.
    pub fn commit_messages(&self) -> Vec<String> {
        self.lock().commits.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Number of blob fetches served.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetch_count
    }

    fn check_available(state: &mut State) -> Result<()> {
        if state.offline {
            return Err(SyncError::RemoteUnavailable("remote is offline".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::RemoteUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_structure(&self, layout: &Layout) -> Result<Option<StoreStructure>> {
        let mut state = self.lock();
        Self::check_available(&mut state)?;
        let listing = state
            .files
            .iter()
            .map(|(path, bytes)| (path.clone(), blob_hash(bytes)));
        Ok(structure_from_listing(layout, listing))
    }

    async fn fetch_blob(&self, content: &ContentRef) -> Result<Vec<u8>> {
        let mut state = self.lock();
        Self::check_available(&mut state)?;
        state.fetch_count += 1;
        if let Some(bytes) = state.tampered.get(&content.path) {
            return Ok(bytes.clone());
        }
        state
            .files
            .get(&content.path)
            .cloned()
            .ok_or_else(|| SyncError::RemoteUnavailable(format!("blob not found: {}", content.path)))
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitId> {
        let delay = {
            let mut state = self.lock();
            Self::check_available(&mut state)?;
            state.commit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        for write in request.writes {
            state.files.insert(write.path, write.bytes);
        }
        for path in &request.deletes {
            state.files.remove(path);
        }
        let id = format!("commit-{}", state.commits.len() + 1);
        state.commits.push((id.clone(), request.message));
        tracing::debug!(commit = %id, "Memory remote committed");
        Ok(id)
    }
}
