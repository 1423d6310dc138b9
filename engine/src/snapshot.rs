//! Record of the last successful sync.
//!
//! The snapshot is what local changes are diffed against before a commit,
//! and its meta contents are the merge bases for remote meta changes. It is
//! designed for deterministic serialization so the persisted form is stable.

use crate::{
    error::Result, transform::decode_meta, Error, Path, StoreDetail, StoreStructure, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// The last tree both sides agreed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub structure: StoreStructure,
    /// Decoded meta contents by path
    pub metas: BTreeMap<Path, Map<String, Value>>,
    /// When the snapshot was taken (ms since epoch)
    #[serde(default)]
    pub synced_at: Timestamp,
}

impl SyncSnapshot {
    pub fn new(structure: StoreStructure, synced_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            structure,
            metas: BTreeMap::new(),
            synced_at,
        }
    }

    /// Snapshot a tree that was just written to, or read from, the remote.
    pub fn from_detail(detail: &StoreDetail, synced_at: Timestamp) -> Result<Self> {
        let mut snapshot = Self::new(detail.structure(), synced_at);
        let metas = std::iter::once(&detail.meta).chain(detail.collections.iter().map(|c| &c.meta));
        for entry in metas {
            let meta = decode_meta(&entry.path, &entry.content)?;
            snapshot.metas.insert(entry.path.clone(), meta);
        }
        Ok(snapshot)
    }

    /// Record the content of a meta path.
    pub fn set_meta(&mut self, path: impl Into<Path>, meta: Map<String, Value>) {
        self.metas.insert(path.into(), meta);
    }

    pub fn meta(&self, path: &str) -> Option<&Map<String, Value>> {
        self.metas.get(path)
    }

    /// Check the snapshot is usable: known format, and every recorded meta
    /// belongs to the structure.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if let Some(path) = self
            .metas
            .keys()
            .find(|p| self.structure.hash_of(p).is_none())
        {
            return Err(Error::InvalidSnapshot(format!(
                "meta {} is not part of the structure",
                path
            )));
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
