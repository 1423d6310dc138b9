//! Conversion between a book state and its repository tree.
//!
//! Items are written as JSON arrays split into fixed-size chunks, oldest
//! first. Binary fields are extracted into assets on the way out; on the way
//! in items keep their asset references.

use crate::{
    error::Result,
    extract::{self, raw_item},
    hash::is_blob_hash,
    layout::{asset_ref, PathKind},
    BookState, CollectionDetail, CollectionState, Content, ContentRef, DetailEntry, Error,
    FullItem, Layout, StoreDetail,
};
use serde_json::{Map, Value};

/// Items per chunk when nothing else is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Build the working tree of a book.
pub fn to_detail(state: &BookState, layout: &Layout, chunk_size: usize) -> Result<StoreDetail> {
    let chunk_size = chunk_size.max(1);
    let mut collections = Vec::new();

    for (name, collection) in state.collections() {
        layout.validate_collection(name)?;
        collections.push(collection_detail(name, collection, layout, chunk_size));
    }

    Ok(StoreDetail {
        meta: DetailEntry::json(layout.root_meta(), Value::Object(state.root_meta.clone())),
        collections,
    })
}

fn collection_detail(
    name: &str,
    collection: &CollectionState,
    layout: &Layout,
    chunk_size: usize,
) -> CollectionDetail {
    let raw = collection
        .ordered_items()
        .into_iter()
        .map(|item| match item.to_value() {
            Value::Object(fields) => raw_item(&fields),
            _ => Default::default(),
        })
        .collect();
    let extracted = extract::extract(raw, layout.asset_paths(name));

    let linked = linked_assets(name, &extracted.items, layout);
    let chunks = extracted
        .items
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, items)| {
            let array = items.iter().cloned().map(Value::Object).collect();
            DetailEntry::json(layout.chunk(name, index), Value::Array(array))
        })
        .collect();
    let assets = extracted
        .assets
        .into_iter()
        .map(|a| DetailEntry::binary(a.path, a.bytes))
        .collect();

    CollectionDetail {
        name: name.to_string(),
        meta: DetailEntry::json(layout.collection_meta(name), Value::Object(collection.meta.clone())),
        chunks,
        assets,
        linked,
    }
}

/// Asset references already stored in items. An asset path ends with the
/// blob hash of its content, so the reference carries its own hash.
fn linked_assets(collection: &str, items: &[Map<String, Value>], layout: &Layout) -> Vec<ContentRef> {
    let mut linked: Vec<ContentRef> = Vec::new();
    for value in items.iter().flat_map(|i| i.values()) {
        let Some(path) = value.as_str().and_then(asset_ref) else {
            continue;
        };
        let in_collection = matches!(
            layout.parse(path),
            PathKind::Asset { collection: ref c } if c == collection
        );
        let hash = path.rsplit('/').next().unwrap_or_default();
        if in_collection && is_blob_hash(hash) && !linked.iter().any(|r| r.path == path) {
            linked.push(ContentRef::new(path, hash));
        }
    }
    linked
}

/// Rebuild a book state from its working tree.
pub fn from_detail(detail: &StoreDetail) -> Result<BookState> {
    let mut state = BookState::new();
    state.root_meta = decode_meta(&detail.meta.path, &detail.meta.content)?;

    for collection in &detail.collections {
        let meta = decode_meta(&collection.meta.path, &collection.meta.content)?;
        state.set_meta(Some(&collection.name), meta);
        for chunk in &collection.chunks {
            for item in decode_chunk(&chunk.path, &chunk.content)? {
                state.put_item(item);
            }
        }
    }
    Ok(state)
}

/// Decode the content of a meta blob.
pub fn decode_meta(path: &str, content: &Content) -> Result<Map<String, Value>> {
    match content {
        Content::Json(Value::Object(map)) => Ok(map.clone()),
        Content::Json(_) => Err(Error::decode(path, "meta is not an object")),
        Content::Binary(_) => Err(Error::decode(path, "meta is binary")),
    }
}

/// Decode the items of a chunk blob.
pub fn decode_chunk(path: &str, content: &Content) -> Result<Vec<FullItem>> {
    match content {
        Content::Json(value @ Value::Array(_)) => {
            serde_json::from_value(value.clone()).map_err(|e| Error::decode(path, e))
        }
        Content::Json(_) => Err(Error::decode(path, "chunk is not an array")),
        Content::Binary(_) => Err(Error::decode(path, "chunk is binary")),
    }
}

/// Interpret raw blob bytes according to where they live.
pub fn content_from_bytes(layout: &Layout, path: &str, bytes: Vec<u8>) -> Result<Content> {
    match layout.parse(path) {
        PathKind::Asset { .. } => Ok(Content::Binary(bytes)),
        PathKind::Unknown => Err(Error::InvalidPath(path.to_string())),
        _ => serde_json::from_slice(&bytes)
            .map(Content::Json)
            .map_err(|e| Error::decode(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extract::binary_value, hash::blob_hash, Action, BaseItem, Patch};
    use serde_json::json;

    fn state_with(n: usize) -> BookState {
        let mut state = BookState::new();
        state
            .apply(
                &Action::meta("m", None, "books", Patch::new().set("name", json!("home"))),
                1,
            )
            .unwrap();
        for i in 0..n {
            state
                .apply(
                    &Action::add(
                        format!("e{}", i),
                        "bills",
                        "bills",
                        BaseItem::new(format!("b{}", i), json!({"n": i})),
                    ),
                    100 + i as u64,
                )
                .unwrap();
        }
        state
    }

    #[test]
    fn chunks_items_in_creation_order() {
        let state = state_with(5);
        let detail = to_detail(&state, &Layout::new(), 2).unwrap();

        let bills = &detail.collections[0];
        let paths: Vec<_> = bills.chunks.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["bills/0.json", "bills/1.json", "bills/2.json"]);

        let first = bills.chunks[0].content.as_json().unwrap();
        assert_eq!(first[0]["id"], "b0");
        assert_eq!(first[1]["id"], "b1");
        assert_eq!(first[0]["__created_at"], 100);
        assert_eq!(detail.meta.content, Content::Json(json!({"name": "home"})));
    }

    #[test]
    fn identical_state_identical_hashes() {
        let a = to_detail(&state_with(3), &Layout::new(), 10).unwrap();
        let b = to_detail(&state_with(3), &Layout::new(), 10).unwrap();
        assert_eq!(a.structure(), b.structure());
    }

    #[test]
    fn binary_fields_become_assets() {
        let mut state = BookState::new();
        state
            .apply(
                &Action::add(
                    "e1",
                    "bills",
                    "bills",
                    BaseItem::new("b1", json!({"photo": binary_value(b"jpeg")})),
                ),
                10,
            )
            .unwrap();

        let detail = to_detail(&state, &Layout::new(), 10).unwrap();
        let bills = &detail.collections[0];
        assert_eq!(bills.assets.len(), 1);

        let path = format!("bills/assets/{}", blob_hash(b"jpeg"));
        assert_eq!(bills.assets[0].path, path);
        let chunk = bills.chunks[0].content.as_json().unwrap();
        assert_eq!(chunk[0]["photo"], json!(format!("asset:{}", path)));
    }

    #[test]
    fn asset_references_are_linked() {
        let path = format!("bills/assets/{}", blob_hash(b"jpeg"));
        let mut state = BookState::new();
        state
            .apply(
                &Action::add(
                    "e1",
                    "bills",
                    "bills",
                    BaseItem::new(
                        "b1",
                        json!({"photo": format!("asset:{}", path), "other": "asset:elsewhere/x"}),
                    ),
                ),
                10,
            )
            .unwrap();

        let detail = to_detail(&state, &Layout::new(), 10).unwrap();
        let structure = detail.structure();
        assert_eq!(
            structure.hash_of(&path),
            Some(blob_hash(b"jpeg").as_str())
        );
        assert!(detail.entry(&path).is_none());
        assert_eq!(structure.collection("bills").unwrap().assets.len(), 1);
    }

    #[test]
    fn roundtrip_through_detail() {
        let mut state = state_with(4);
        state
            .apply(&Action::remove("r", "bills", "bills", "b2"), 500)
            .unwrap();

        let detail = to_detail(&state, &Layout::new(), 3).unwrap();
        let rebuilt = from_detail(&detail).unwrap();
        assert_eq!(rebuilt, state);
    }

    #[test]
    fn rejects_bad_collection_names() {
        let mut state = BookState::new();
        state.set_meta(Some("a/b"), Map::new());
        assert!(matches!(
            to_detail(&state, &Layout::new(), 10),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn decode_errors() {
        assert!(decode_meta("meta.json", &Content::Json(json!([1]))).is_err());
        assert!(decode_chunk("c/0.json", &Content::Json(json!({}))).is_err());
        assert!(decode_chunk("c/0.json", &Content::Json(json!([{"id": 1}]))).is_err());
        assert!(decode_chunk("c/0.json", &Content::Binary(vec![1])).is_err());
    }

    #[test]
    fn content_by_path_kind() {
        let layout = Layout::new();
        assert_eq!(
            content_from_bytes(&layout, "c/assets/h", vec![0xff]).unwrap(),
            Content::Binary(vec![0xff])
        );
        assert_eq!(
            content_from_bytes(&layout, "c/meta.json", b"{\"a\":1}".to_vec()).unwrap(),
            Content::Json(json!({"a": 1}))
        );
        assert!(matches!(
            content_from_bytes(&layout, "c/0.json", b"nope".to_vec()),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            content_from_bytes(&layout, "README.md", Vec::new()),
            Err(Error::InvalidPath(_))
        ));
    }
}
