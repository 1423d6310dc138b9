//! Repository path layout.
//!
//! Every node of a book maps to a fixed path inside the remote repository:
//!
//! ```text
//! meta.json                       root metadata
//! <collection>/meta.json          collection metadata
//! <collection>/<n>.json           n-th data chunk
//! <collection>/assets/<hash>      binary asset
//! ```

use crate::{error::Result, CollectionName, Error, Hash, Path};

const META_FILE: &str = "meta.json";
const ASSETS_DIR: &str = "assets";
const CHUNK_EXT: &str = ".json";

/// Prefix used when an item field references an extracted asset.
pub const ASSET_REF_PREFIX: &str = "asset:";

/// What a repository path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    RootMeta,
    CollectionMeta { collection: CollectionName },
    Chunk { collection: CollectionName, index: usize },
    Asset { collection: CollectionName },
    Unknown,
}

/// Path layout, optionally rooted under a directory of the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    prefix: String,
}

impl Layout {
    /// Layout at the repository root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout rooted at `prefix` (e.g. one directory per book).
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { prefix }
    }

    /// The directory prefix, empty at the repository root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, rest: &str) -> Path {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }

    pub fn root_meta(&self) -> Path {
        self.join(META_FILE)
    }

    pub fn collection_meta(&self, collection: &str) -> Path {
        self.join(&format!("{}/{}", collection, META_FILE))
    }

    pub fn chunk(&self, collection: &str, index: usize) -> Path {
        self.join(&format!("{}/{}{}", collection, index, CHUNK_EXT))
    }

    pub fn asset(&self, collection: &str, hash: &str) -> Path {
        self.join(&format!("{}/{}/{}", collection, ASSETS_DIR, hash))
    }

    /// Reject collection names that would not round-trip through `parse`.
    pub fn validate_collection(&self, collection: &str) -> Result<()> {
        if collection.is_empty()
            || collection.contains('/')
            || collection == META_FILE
            || collection.starts_with('.')
        {
            return Err(Error::InvalidPath(collection.to_string()));
        }
        Ok(())
    }

    /// Classify a repository path.
    pub fn parse(&self, path: &str) -> PathKind {
        let rest = if self.prefix.is_empty() {
            path
        } else {
            match path
                .strip_prefix(self.prefix.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                Some(rest) => rest,
                None => return PathKind::Unknown,
            }
        };

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [META_FILE] => PathKind::RootMeta,
            [collection, META_FILE] => PathKind::CollectionMeta {
                collection: collection.to_string(),
            },
            [collection, file] => match file
                .strip_suffix(CHUNK_EXT)
                .and_then(|n| n.parse::<usize>().ok())
            {
                Some(index) => PathKind::Chunk {
                    collection: collection.to_string(),
                    index,
                },
                None => PathKind::Unknown,
            },
            [collection, ASSETS_DIR, name] if !name.is_empty() => PathKind::Asset {
                collection: collection.to_string(),
            },
            _ => PathKind::Unknown,
        }
    }

    /// Path function for the asset extractor: content-addressed asset path
    /// inside `collection`, and the reference string stored in the item.
    pub fn asset_paths(&self, collection: &str) -> impl Fn(&[u8]) -> AssetPath + '_ {
        let collection = collection.to_string();
        move |bytes: &[u8]| {
            let hash: Hash = crate::hash::blob_hash(bytes);
            let relative = self.asset(&collection, &hash);
            AssetPath {
                stored: format!("{}{}", ASSET_REF_PREFIX, relative),
                relative,
            }
        }
    }
}

/// Where an extracted binary lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPath {
    /// Value written into the item field in place of the binary.
    pub stored: String,
    /// Repository path of the asset blob.
    pub relative: Path,
}

/// Repository path referenced by an item field value, if it is an asset ref.
pub fn asset_ref(value: &str) -> Option<&str> {
    value.strip_prefix(ASSET_REF_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_at_root() {
        let layout = Layout::new();
        assert_eq!(layout.root_meta(), "meta.json");
        assert_eq!(layout.collection_meta("bills"), "bills/meta.json");
        assert_eq!(layout.chunk("bills", 0), "bills/0.json");
        assert_eq!(layout.asset("bills", "abc"), "bills/assets/abc");
    }

    #[test]
    fn paths_with_prefix() {
        let layout = Layout::with_prefix("/books/home/");
        assert_eq!(layout.prefix(), "books/home");
        assert_eq!(layout.chunk("bills", 2), "books/home/bills/2.json");
        assert_eq!(
            layout.parse("books/home/bills/2.json"),
            PathKind::Chunk {
                collection: "bills".into(),
                index: 2
            }
        );
        assert_eq!(layout.parse("other/bills/2.json"), PathKind::Unknown);
    }

    #[test]
    fn parse_classifies_paths() {
        let layout = Layout::new();
        assert_eq!(layout.parse("meta.json"), PathKind::RootMeta);
        assert_eq!(
            layout.parse("bills/meta.json"),
            PathKind::CollectionMeta {
                collection: "bills".into()
            }
        );
        assert_eq!(
            layout.parse("bills/assets/abc"),
            PathKind::Asset {
                collection: "bills".into()
            }
        );
        assert_eq!(layout.parse("bills/readme.md"), PathKind::Unknown);
        assert_eq!(layout.parse("a/b/c/d"), PathKind::Unknown);
    }

    #[test]
    fn asset_paths_are_content_addressed() {
        let layout = Layout::new();
        let path_fn = layout.asset_paths("bills");
        let a = path_fn(b"png-bytes");
        let b = path_fn(b"png-bytes");
        assert_eq!(a, b);
        assert!(a.relative.starts_with("bills/assets/"));
        assert_eq!(asset_ref(&a.stored), Some(a.relative.as_str()));
    }

    #[test]
    fn invalid_collection_names() {
        let layout = Layout::new();
        assert!(layout.validate_collection("bills").is_ok());
        assert!(layout.validate_collection("").is_err());
        assert!(layout.validate_collection("a/b").is_err());
        assert!(layout.validate_collection("meta.json").is_err());
    }
}
