//! Asset extraction.
//!
//! Binary item fields are pulled out of items into separate content-addressed
//! blobs, and replaced in the item by a reference string. Locally a binary
//! field travels inside JSON as `{"$$binary": "<base64>"}`.

use crate::{layout::AssetPath, Path};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Marker key of an inline binary value.
pub const BINARY_MARKER: &str = "$$binary";

/// A top-level item field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Json(Value),
    Binary(Vec<u8>),
}

impl Field {
    /// Classify a JSON value, decoding inline binaries.
    ///
    /// A marker object that does not hold valid base64 stays plain JSON.
    pub fn from_value(value: Value) -> Self {
        match decode_binary(&value) {
            Some(bytes) => Field::Binary(bytes),
            None => Field::Json(value),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Field::Json(value) => value,
            Field::Binary(bytes) => binary_value(&bytes),
        }
    }
}

/// Inline JSON representation of a binary value.
pub fn binary_value(bytes: &[u8]) -> Value {
    let mut map = Map::new();
    map.insert(BINARY_MARKER.to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(map)
}

fn decode_binary(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(BINARY_MARKER)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

/// An item as a map of classified fields.
pub type RawItem = BTreeMap<String, Field>;

/// Classify every top-level field of a JSON item.
pub fn raw_item(fields: &Map<String, Value>) -> RawItem {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), Field::from_value(v.clone())))
        .collect()
}

/// A binary blob pulled out of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub path: Path,
    pub bytes: Vec<u8>,
}

/// Items with binaries replaced by references, plus the binaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub items: Vec<Map<String, Value>>,
    /// One entry per distinct path, in first-seen order.
    pub assets: Vec<Asset>,
}

/// Replace every binary field with the reference produced by `path_fn`.
pub fn extract<F>(items: Vec<RawItem>, path_fn: F) -> Extracted
where
    F: Fn(&[u8]) -> AssetPath,
{
    let mut seen = HashSet::new();
    let mut out = Extracted::default();

    for item in items {
        let mut fields = Map::new();
        for (key, field) in item {
            let value = match field {
                Field::Json(value) => value,
                Field::Binary(bytes) => {
                    let AssetPath { stored, relative } = path_fn(&bytes);
                    if seen.insert(relative.clone()) {
                        out.assets.push(Asset {
                            path: relative,
                            bytes,
                        });
                    }
                    Value::String(stored)
                }
            };
            fields.insert(key, value);
        }
        out.items.push(fields);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Layout;
    use serde_json::json;

    fn item(pairs: Vec<(&str, Field)>) -> RawItem {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn replaces_binary_fields() {
        let layout = Layout::new();
        let items = vec![item(vec![
            ("id", Field::Json(json!("a"))),
            ("photo", Field::Binary(b"png-bytes".to_vec())),
        ])];

        let extracted = extract(items, layout.asset_paths("bills"));
        assert_eq!(extracted.assets.len(), 1);

        let asset = &extracted.assets[0];
        assert!(asset.path.starts_with("bills/assets/"));
        assert_eq!(asset.bytes, b"png-bytes".to_vec());
        assert_eq!(
            extracted.items[0]["photo"],
            json!(format!("asset:{}", asset.path))
        );
        assert_eq!(extracted.items[0]["id"], json!("a"));
    }

    #[test]
    fn identical_binaries_emitted_once() {
        let layout = Layout::new();
        let items = vec![
            item(vec![("a", Field::Binary(vec![1, 2, 3]))]),
            item(vec![
                ("b", Field::Binary(vec![1, 2, 3])),
                ("c", Field::Binary(vec![4])),
            ]),
        ];

        let extracted = extract(items, layout.asset_paths("bills"));
        assert_eq!(extracted.assets.len(), 2);
        assert_eq!(extracted.items[0]["a"], extracted.items[1]["b"]);
    }

    #[test]
    fn items_without_binaries_pass_through() {
        let layout = Layout::new();
        let items = vec![item(vec![("n", Field::Json(json!(1)))])];
        let extracted = extract(items, layout.asset_paths("bills"));
        assert!(extracted.assets.is_empty());
        assert_eq!(Value::Object(extracted.items[0].clone()), json!({"n": 1}));

        let empty = extract(Vec::new(), layout.asset_paths("bills"));
        assert!(empty.items.is_empty());
        assert!(empty.assets.is_empty());
    }

    #[test]
    fn inline_binary_encoding() {
        let value = binary_value(b"hi");
        assert_eq!(value, json!({"$$binary": "aGk="}));
        assert_eq!(Field::from_value(value), Field::Binary(b"hi".to_vec()));

        // Not binaries.
        let bad = json!({"$$binary": "***"});
        assert_eq!(Field::from_value(bad.clone()), Field::Json(bad));
        let extra = json!({"$$binary": "aGk=", "x": 1});
        assert_eq!(Field::from_value(extra.clone()), Field::Json(extra));
    }

    #[test]
    fn raw_item_classifies_fields() {
        let fields = json!({"n": 1, "blob": {"$$binary": "AQI="}});
        let raw = raw_item(fields.as_object().unwrap());
        assert_eq!(raw["n"], Field::Json(json!(1)));
        assert_eq!(raw["blob"], Field::Binary(vec![1, 2]));
        assert_eq!(raw["blob"].clone().into_value(), json!({"$$binary": "AQI="}));
    }
}
