//! Tree differ.
//!
//! Both snapshots are flattened into a single path namespace (root meta,
//! collection metas, chunks, assets) and compared path by path, which is
//! linear in the size of the two snapshots.

use crate::{Path, StoreStructure};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDiff {
    /// Paths present in the newer snapshot that are new or carry a
    /// different (or unknown) hash, in the newer snapshot's order.
    pub changed: Vec<Path>,
    /// Paths present only in the older snapshot, in its order.
    pub deleted: Vec<Path>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Short human-readable summary, used as a commit message.
    pub fn describe(&self) -> String {
        match (self.changed.len(), self.deleted.len()) {
            (0, 0) => "no changes".to_string(),
            (1, 0) => format!("update {}", self.changed[0]),
            (0, 1) => format!("delete {}", self.deleted[0]),
            (c, 0) => format!("update {} files", c),
            (0, d) => format!("delete {} files", d),
            (c, d) => format!("update {} files, delete {} files", c, d),
        }
    }
}

/// Flatten a snapshot into `(path, hash)` pairs, first occurrence wins.
fn flatten(structure: &StoreStructure) -> Vec<(&str, &str)> {
    let mut seen = HashSet::new();
    structure
        .refs()
        .filter(|r| seen.insert(r.path.as_str()))
        .map(|r| (r.path.as_str(), r.hash.as_str()))
        .collect()
}

/// Compute the changed and deleted paths going from `a` to `b`.
pub fn diff(a: &StoreStructure, b: &StoreStructure) -> TreeDiff {
    let a_paths = flatten(a);
    let b_paths = flatten(b);

    let a_hashes: HashMap<&str, &str> = a_paths.iter().copied().collect();
    let b_set: HashSet<&str> = b_paths.iter().map(|(p, _)| *p).collect();

    let changed = b_paths
        .iter()
        .filter(|(path, hash)| match a_hashes.get(path) {
            // A missing hash on either side cannot prove equality.
            Some(old) => old.is_empty() || hash.is_empty() || old != hash,
            None => true,
        })
        .map(|(path, _)| path.to_string())
        .collect();

    let deleted = a_paths
        .iter()
        .filter(|(path, _)| !b_set.contains(path))
        .map(|(path, _)| path.to_string())
        .collect();

    TreeDiff { changed, deleted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionStructure, ContentRef};

    fn bills(chunk_hash: &str, assets: Vec<ContentRef>) -> StoreStructure {
        StoreStructure {
            meta: ContentRef::new("meta.json", "m0"),
            collections: vec![CollectionStructure {
                name: "bills".into(),
                meta: ContentRef::new("bills/meta.json", "bm"),
                chunks: vec![ContentRef::new("bills/0.json", chunk_hash)],
                assets,
            }],
        }
    }

    #[test]
    fn identical_snapshots_have_no_diff() {
        let s = bills("h1", vec![ContentRef::new("assets/a.png", "ha")]);
        let d = diff(&s, &s);
        assert!(d.changed.is_empty());
        assert!(d.deleted.is_empty());
        assert!(d.is_empty());
    }

    #[test]
    fn changed_chunk_and_added_asset() {
        let a = bills("h1", vec![]);
        let b = bills("h2", vec![ContentRef::new("assets/img1.png", "h3")]);

        let d = diff(&a, &b);
        assert_eq!(d.changed, vec!["bills/0.json", "assets/img1.png"]);
        assert!(d.deleted.is_empty());
    }

    #[test]
    fn deleted_path_is_not_changed() {
        let a = bills("h1", vec![ContentRef::new("bills/assets/p", "hp")]);
        let b = bills("h1", vec![]);

        let d = diff(&a, &b);
        assert_eq!(d.deleted, vec!["bills/assets/p"]);
        assert!(d.changed.is_empty());
    }

    #[test]
    fn missing_hash_counts_as_changed() {
        let a = bills("", vec![]);
        let b = bills("", vec![]);
        assert_eq!(diff(&a, &b).changed, vec!["bills/0.json"]);

        let c = bills("h1", vec![]);
        assert_eq!(diff(&c, &a).changed, vec!["bills/0.json"]);
    }

    #[test]
    fn removed_collection_deletes_all_its_paths() {
        let a = bills("h1", vec![]);
        let b = StoreStructure::new(ContentRef::new("meta.json", "m0"));

        let d = diff(&a, &b);
        assert!(d.changed.is_empty());
        assert_eq!(d.deleted, vec!["bills/meta.json", "bills/0.json"]);
    }

    #[test]
    fn same_content_moved_between_paths() {
        // Content addressing: equal hashes at a new path still count as a new path.
        let a = bills("h1", vec![ContentRef::new("bills/assets/x", "hx")]);
        let b = bills("h1", vec![ContentRef::new("bills/assets/y", "hx")]);

        let d = diff(&a, &b);
        assert_eq!(d.changed, vec!["bills/assets/y"]);
        assert_eq!(d.deleted, vec!["bills/assets/x"]);
    }

    #[test]
    fn describe_summaries() {
        assert_eq!(TreeDiff::default().describe(), "no changes");
        let d = TreeDiff {
            changed: vec!["a".into(), "b".into()],
            deleted: vec!["c".into()],
        };
        assert_eq!(d.describe(), "update 2 files, delete 1 files");
    }
}
