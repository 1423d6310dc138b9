//! Object/path model of the remote tree.
//!
//! [`StoreStructure`] is the comparison representation (paths and hashes
//! only); [`StoreDetail`] is the working representation carrying the content
//! of every node.

use crate::{hash::blob_hash, CollectionName, Hash, Path};
use serde::{Deserialize, Serialize};

/// A stored blob identified by location and content hash.
///
/// An empty hash means "unknown" and always compares as changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub path: Path,
    #[serde(default)]
    pub hash: Hash,
}

impl ContentRef {
    pub fn new(path: impl Into<Path>, hash: impl Into<Hash>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
        }
    }

    /// A reference whose hash is not known.
    pub fn unhashed(path: impl Into<Path>) -> Self {
        Self::new(path, String::new())
    }

    pub fn has_hash(&self) -> bool {
        !self.hash.is_empty()
    }
}

/// One named collection inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStructure {
    pub name: CollectionName,
    pub meta: ContentRef,
    #[serde(default)]
    pub chunks: Vec<ContentRef>,
    #[serde(default)]
    pub assets: Vec<ContentRef>,
}

impl CollectionStructure {
    fn refs(&self) -> impl Iterator<Item = &ContentRef> {
        std::iter::once(&self.meta)
            .chain(self.chunks.iter())
            .chain(self.assets.iter())
    }
}

/// Snapshot of the whole remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStructure {
    pub meta: ContentRef,
    #[serde(default)]
    pub collections: Vec<CollectionStructure>,
}

impl StoreStructure {
    /// A snapshot with only a root meta reference.
    pub fn new(meta: ContentRef) -> Self {
        Self {
            meta,
            collections: Vec::new(),
        }
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionStructure> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// All references in construction order: root meta, then each
    /// collection's meta, chunks and assets.
    pub fn refs(&self) -> impl Iterator<Item = &ContentRef> {
        std::iter::once(&self.meta).chain(self.collections.iter().flat_map(|c| c.refs()))
    }

    /// Hash recorded for `path`, if the path is part of the snapshot.
    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.refs()
            .find(|r| r.path == path)
            .map(|r| r.hash.as_str())
    }
}

/// Materialized content of a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Content {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Content {
    /// Bytes written to the repository for this content.
    ///
    /// JSON is encoded compactly; `serde_json::Map` keeps keys sorted so equal
    /// values always encode to equal bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Content::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Content::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn hash(&self) -> Hash {
        blob_hash(&self.to_bytes())
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Content::Json(value) => Some(value),
            Content::Binary(_) => None,
        }
    }
}

/// A blob with its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailEntry {
    pub path: Path,
    pub content: Content,
}

impl DetailEntry {
    pub fn json(path: impl Into<Path>, value: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            content: Content::Json(value),
        }
    }

    pub fn binary(path: impl Into<Path>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Content::Binary(bytes),
        }
    }

    pub fn content_ref(&self) -> ContentRef {
        ContentRef::new(self.path.clone(), self.content.hash())
    }
}

/// One collection with materialized content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDetail {
    pub name: CollectionName,
    pub meta: DetailEntry,
    pub chunks: Vec<DetailEntry>,
    pub assets: Vec<DetailEntry>,
    /// Assets referenced by items whose content lives only in the remote.
    #[serde(default)]
    pub linked: Vec<ContentRef>,
}

impl CollectionDetail {
    /// Asset references sorted by path, content-carrying entries first on
    /// duplicate paths.
    fn asset_refs(&self) -> Vec<ContentRef> {
        let mut refs: Vec<ContentRef> = self.assets.iter().map(DetailEntry::content_ref).collect();
        for link in &self.linked {
            if !refs.iter().any(|r| r.path == link.path) {
                refs.push(link.clone());
            }
        }
        refs.sort_by(|a, b| a.path.cmp(&b.path));
        refs
    }
}

/// Working representation of the tree: every node with its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDetail {
    pub meta: DetailEntry,
    pub collections: Vec<CollectionDetail>,
}

impl StoreDetail {
    /// Derive the comparison snapshot by hashing every entry.
    pub fn structure(&self) -> StoreStructure {
        StoreStructure {
            meta: self.meta.content_ref(),
            collections: self
                .collections
                .iter()
                .map(|c| CollectionStructure {
                    name: c.name.clone(),
                    meta: c.meta.content_ref(),
                    chunks: c.chunks.iter().map(DetailEntry::content_ref).collect(),
                    assets: c.asset_refs(),
                })
                .collect(),
        }
    }

    /// All entries in construction order.
    pub fn entries(&self) -> impl Iterator<Item = &DetailEntry> {
        std::iter::once(&self.meta).chain(self.collections.iter().flat_map(|c| {
            std::iter::once(&c.meta)
                .chain(c.chunks.iter())
                .chain(c.assets.iter())
        }))
    }

    pub fn entry(&self, path: &str) -> Option<&DetailEntry> {
        self.entries().find(|e| e.path == path)
    }
}
