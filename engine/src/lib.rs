//! # Gitray Engine
//!
//! The deterministic core of a local-first sync engine that stores a book of
//! JSON collections in a git repository.
//!
//! This crate has no knowledge of files, network or time sources. Every
//! function is pure over its inputs; the runtime lives in `gitray-sync`.
//!
//! ## Core Concepts
//!
//! ### Tree
//!
//! A book maps onto a fixed repository layout ([`Layout`]): root metadata,
//! then per collection a metadata blob, numbered JSON chunks of items, and
//! content-addressed binary assets. [`StoreStructure`] records the path and
//! git blob hash ([`hash::blob_hash`]) of every node; [`StoreDetail`] carries
//! the content. Two structures are compared with [`diff`](diff::diff).
//!
//! ### Actions
//!
//! Local mutations are expressed as [`Action`]s (add, remove, update, meta),
//! journaled in a [`Journal`] and applied optimistically to a [`BookState`].
//! Deletions are tombstones, so they travel through sync like any change.
//!
//! ### Merging
//!
//! Items merge by last-writer-wins on their bookkeeping timestamps.
//! Metadata merges through structural [`Patch`]es computed against the last
//! synced snapshot, so concurrent edits to disjoint keys both survive.
//!
//! ## Quick Start
//!
//! ```rust
//! use gitray_engine::{diff, transform, Action, BaseItem, BookState, Layout};
//! use serde_json::json;
//!
//! let layout = Layout::new();
//! let mut state = BookState::new();
//! let before = transform::to_detail(&state, &layout, 100).unwrap().structure();
//!
//! let add = Action::add("entry-1", "bills", "bills", BaseItem::new("bill-1", json!({"amount": 12})));
//! state.apply(&add, 1706745600000).unwrap();
//!
//! let after = transform::to_detail(&state, &layout, 100).unwrap().structure();
//! let changes = diff::diff(&before, &after);
//! assert_eq!(changes.changed, vec!["bills/meta.json", "bills/0.json"]);
//! assert!(changes.deleted.is_empty());
//! ```

pub mod action;
pub mod diff;
pub mod error;
pub mod extract;
pub mod hash;
pub mod item;
pub mod journal;
pub mod layout;
pub mod patch;
pub mod reconcile;
pub mod snapshot;
pub mod state;
pub mod transform;
pub mod tree;

// Re-export main types at crate root
pub use action::{Action, AddAction, ItemChanges, MetaAction, RemoveAction, UpdateAction};
pub use diff::TreeDiff;
pub use error::Error;
pub use extract::{Asset, Extracted, Field, RawItem};
pub use item::{BaseItem, FullItem};
pub use journal::{EntryState, Journal, JournalEntry};
pub use layout::{AssetPath, Layout, PathKind};
pub use patch::{Patch, PatchValue};
pub use reconcile::{Conflict, ConflictResolution, ReconcileResult, Reconciler, RemoteChanges};
pub use snapshot::{SyncSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{ApplyResult, BookState, CollectionState, QueryBuilder};
pub use tree::{
    CollectionDetail, CollectionStructure, Content, ContentRef, DetailEntry, StoreDetail,
    StoreStructure,
};

/// Type aliases for clarity
pub type Path = String;
pub type Hash = String;
pub type CollectionName = String;
pub type StoreName = String;
pub type ItemId = String;
pub type EntryId = String;
pub type Timestamp = u64;
