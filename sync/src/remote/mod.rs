//! Remote repository adapters.
//!
//! The runtime only needs three things from a remote: the current tree
//! listing, blob contents by reference, and an atomic multi-file commit.

mod github;
mod memory;

pub use github::GithubRemote;
pub use memory::MemoryRemote;

use crate::error::Result;
use async_trait::async_trait;
use gitray_engine::{CollectionStructure, ContentRef, Hash, Layout, Path, PathKind, StoreStructure};
use std::collections::BTreeMap;

/// Identifier of a created commit.
pub type CommitId = String;

/// A file written by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobWrite {
    pub path: Path,
    pub bytes: Vec<u8>,
}

/// An atomic set of writes and deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitRequest {
    pub message: String,
    pub writes: Vec<BlobWrite>,
    pub deletes: Vec<Path>,
}

impl CommitRequest {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// A git-like remote holding one or more books.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current structure of the book under `layout`, `None` if the book has
    /// never been committed.
    async fn fetch_structure(&self, layout: &Layout) -> Result<Option<StoreStructure>>;

    /// Raw bytes of a blob.
    async fn fetch_blob(&self, content: &ContentRef) -> Result<Vec<u8>>;

    /// Apply all writes and deletions as one commit. Either every change
    /// lands or none does.
    async fn commit(&self, request: CommitRequest) -> Result<CommitId>;
}

/// Build a book structure from a flat `(path, hash)` listing.
///
/// Paths outside the layout are ignored. Returns `None` when the listing has
/// no root meta. A collection with chunks or assets but no meta blob gets an
/// unhashed meta reference so it still shows up as changed.
pub fn structure_from_listing<I>(layout: &Layout, listing: I) -> Option<StoreStructure>
where
    I: IntoIterator<Item = (Path, Hash)>,
{
    #[derive(Default)]
    struct Partial {
        meta: Option<ContentRef>,
        chunks: Vec<(usize, ContentRef)>,
        assets: Vec<ContentRef>,
    }

    let mut root = None;
    let mut collections: BTreeMap<String, Partial> = BTreeMap::new();

    for (path, hash) in listing {
        match layout.parse(&path) {
            PathKind::RootMeta => root = Some(ContentRef::new(path, hash)),
            PathKind::CollectionMeta { collection } => {
                collections.entry(collection).or_default().meta = Some(ContentRef::new(path, hash));
            }
            PathKind::Chunk { collection, index } => {
                collections
                    .entry(collection)
                    .or_default()
                    .chunks
                    .push((index, ContentRef::new(path, hash)));
            }
            PathKind::Asset { collection } => {
                collections
                    .entry(collection)
                    .or_default()
                    .assets
                    .push(ContentRef::new(path, hash));
            }
            PathKind::Unknown => {}
        }
    }

    let meta = root?;
    let collections = collections
        .into_iter()
        .map(|(name, mut partial)| {
            partial.chunks.sort_by_key(|(index, _)| *index);
            partial.assets.sort_by(|a, b| a.path.cmp(&b.path));
            CollectionStructure {
                meta: partial
                    .meta
                    .unwrap_or_else(|| ContentRef::unhashed(layout.collection_meta(&name))),
                chunks: partial.chunks.into_iter().map(|(_, r)| r).collect(),
                assets: partial.assets,
                name,
            }
        })
        .collect();

    Some(StoreStructure { meta, collections })
}
