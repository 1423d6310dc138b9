//! Structural patch and merge for nested JSON metadata.
//!
//! A patch records, key by key, what must be set on a target object to turn
//! it into a newer version. Nested objects are patched recursively so two
//! devices that changed disjoint fields of the same metadata object can both
//! apply their changes. Arrays and primitives are always replaced wholesale.
//!
//! On the wire a patch is a JSON object tagged with `"$$patch": true`:
//!
//! ```json
//! {"$$patch": true, "b": {"$$patch": true, "y": 3}}
//! ```
//!
//! [`diff`] only ever produces "set" entries; keys that exist only in the old
//! object are preserved by [`merge`]. Removing a key requires an explicit
//! [`PatchValue::Unset`] entry (`{"$$unset": true}`), which callers build with
//! [`Patch::unset`].
//!
//! Application data may itself use the marker names. A set value that is an
//! object holding a marker key travels wrapped as `{"$$value": ...}`, and an
//! entry key starting with `$$` gets one more `$` on the wire, so every patch
//! decodes back to itself.

use crate::{error::Result, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key marking an object as a patch.
pub const PATCH_MARKER: &str = "$$patch";
/// Key marking a field removal.
pub const UNSET_MARKER: &str = "$$unset";
/// Key wrapping a set value that would read as a marker.
pub const VALUE_MARKER: &str = "$$value";

/// A single entry of a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    /// Overwrite the field with this value.
    Set(Value),
    /// Recursively patch the nested object.
    Nested(Patch),
    /// Remove the field.
    Unset,
}

/// A recursive, key-scoped difference between two JSON objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    entries: BTreeMap<String, PatchValue>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&PatchValue> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &PatchValue)> {
        self.entries.iter()
    }

    /// Builder: set `key` to `value`.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), PatchValue::Set(value));
        self
    }

    /// Builder: patch the nested object at `key`.
    pub fn nested(mut self, key: impl Into<String>, patch: Patch) -> Self {
        self.entries.insert(key.into(), PatchValue::Nested(patch));
        self
    }

    /// Builder: remove `key` from the target.
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), PatchValue::Unset);
        self
    }

    /// Encode as a tagged JSON object.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(PATCH_MARKER.to_string(), Value::Bool(true));
        for (key, entry) in &self.entries {
            let value = match entry {
                PatchValue::Set(value) => encode_set(value),
                PatchValue::Nested(patch) => patch.to_value(),
                PatchValue::Unset => unset_value(),
            };
            map.insert(escape_key(key), value);
        }
        Value::Object(map)
    }

    /// Decode a tagged JSON object, rejecting malformed markers.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::PatchApplication("patch must be an object".into()))?;

        match map.get(PATCH_MARKER) {
            Some(Value::Bool(true)) => {}
            Some(other) => {
                return Err(Error::PatchApplication(format!(
                    "conflicting patch marker: {}",
                    other
                )))
            }
            None => return Err(Error::PatchApplication("missing patch marker".into())),
        }

        let mut entries = BTreeMap::new();
        for (key, value) in map {
            if key == PATCH_MARKER {
                continue;
            }
            entries.insert(unescape_key(key), decode_entry(key, value)?);
        }
        Ok(Self { entries })
    }
}

fn unset_value() -> Value {
    let mut map = Map::new();
    map.insert(UNSET_MARKER.to_string(), Value::Bool(true));
    Value::Object(map)
}

fn is_marker(key: &str) -> bool {
    key == PATCH_MARKER || key == UNSET_MARKER || key == VALUE_MARKER
}

fn encode_set(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.keys().any(|k| is_marker(k)) => {
            let mut wrapper = Map::new();
            wrapper.insert(VALUE_MARKER.to_string(), value.clone());
            Value::Object(wrapper)
        }
        _ => value.clone(),
    }
}

fn escape_key(key: &str) -> String {
    if key.starts_with("$$") {
        format!("${}", key)
    } else {
        key.to_string()
    }
}

fn unescape_key(key: &str) -> String {
    match key.strip_prefix('$') {
        Some(rest) if rest.starts_with("$$") => rest.to_string(),
        _ => key.to_string(),
    }
}

fn decode_entry(key: &str, value: &Value) -> Result<PatchValue> {
    if let Value::Object(map) = value {
        if map.len() == 1 {
            if let Some(inner) = map.get(VALUE_MARKER) {
                return Ok(PatchValue::Set(inner.clone()));
            }
        }
        if map.contains_key(PATCH_MARKER) {
            return Ok(PatchValue::Nested(Patch::from_value(value)?));
        }
        if let Some(marker) = map.get(UNSET_MARKER) {
            if marker != &Value::Bool(true) || map.len() != 1 {
                return Err(Error::PatchApplication(format!(
                    "malformed unset marker for '{}'",
                    key
                )));
            }
            return Ok(PatchValue::Unset);
        }
    }
    Ok(PatchValue::Set(value.clone()))
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Patch::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Compute the patch that turns `old` into `new` on every key of `new`.
pub fn diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Patch {
    let mut patch = Patch::new();
    for (key, new_value) in new {
        let old_value = old.get(key);
        if old_value == Some(new_value) {
            continue;
        }
        match (old_value, new_value) {
            (Some(Value::Object(old_map)), Value::Object(new_map)) => {
                let nested = diff(old_map, new_map);
                if !nested.is_empty() {
                    patch.entries.insert(key.clone(), PatchValue::Nested(nested));
                }
            }
            _ => {
                patch
                    .entries
                    .insert(key.clone(), PatchValue::Set(new_value.clone()));
            }
        }
    }
    patch
}

/// Apply `patch` to `target`, returning the merged object.
pub fn merge(target: &Map<String, Value>, patch: &Patch) -> Map<String, Value> {
    let mut result = target.clone();
    merge_into(&mut result, patch);
    result
}

/// Apply `patch` to `target` in place.
pub fn merge_into(target: &mut Map<String, Value>, patch: &Patch) {
    for (key, entry) in &patch.entries {
        match entry {
            PatchValue::Set(value) => {
                target.insert(key.clone(), value.clone());
            }
            PatchValue::Unset => {
                target.remove(key);
            }
            PatchValue::Nested(nested) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(map) = slot {
                    merge_into(map, nested);
                }
            }
        }
    }
}

/// Decode `patch` and merge it into `target`.
///
/// A malformed patch is reported and `target` is returned untouched by the
/// caller, since nothing is modified before decoding succeeds.
pub fn merge_value(target: &Map<String, Value>, patch: &Value) -> Result<Map<String, Value>> {
    let patch = Patch::from_value(patch)?;
    Ok(merge(target, &patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn nested_change_produces_nested_patch() {
        let old = obj(json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let new = obj(json!({"a": 1, "b": {"x": 1, "y": 3}}));

        let patch = diff(&old, &new);
        assert_eq!(
            patch.to_value(),
            json!({"$$patch": true, "b": {"$$patch": true, "y": 3}})
        );

        let merged = merge(&old, &patch);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": {"x": 1, "y": 3}}));
    }

    #[test]
    fn equal_objects_give_empty_patch() {
        let old = obj(json!({"a": [1, 2], "b": {"c": null}}));
        let patch = diff(&old, &old);
        assert!(patch.is_empty());
        assert_eq!(patch.to_value(), json!({"$$patch": true}));
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        let old = obj(json!({"tags": ["a", "b", "c"]}));
        let new = obj(json!({"tags": ["a", "c"]}));

        let patch = diff(&old, &new);
        assert_eq!(patch.get("tags"), Some(&PatchValue::Set(json!(["a", "c"]))));
    }

    #[test]
    fn object_replacing_primitive_is_set() {
        let old = obj(json!({"a": 1}));
        let new = obj(json!({"a": {"b": 2}}));
        let patch = diff(&old, &new);
        assert_eq!(patch.get("a"), Some(&PatchValue::Set(json!({"b": 2}))));
    }

    #[test]
    fn keys_only_in_old_are_preserved() {
        let old = obj(json!({"keep": true, "a": 1}));
        let new = obj(json!({"a": 2}));

        let merged = merge(&old, &diff(&old, &new));
        assert_eq!(Value::Object(merged), json!({"keep": true, "a": 2}));
    }

    #[test]
    fn merge_is_idempotent() {
        let old = obj(json!({"a": {"b": {"c": 1}}, "d": [1]}));
        let new = obj(json!({"a": {"b": {"c": 2, "e": 3}}, "d": [2]}));
        let patch = diff(&old, &new);

        let once = merge(&old, &patch);
        let twice = merge(&once, &patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn disjoint_edits_both_survive() {
        let base = obj(json!({"budget": {"food": 100, "rent": 900}}));
        let device_a = obj(json!({"budget": {"food": 150, "rent": 900}}));
        let device_b = obj(json!({"budget": {"food": 100, "rent": 950}}));

        let patch_b = diff(&base, &device_b);
        let merged = merge(&device_a, &patch_b);
        assert_eq!(
            Value::Object(merged),
            json!({"budget": {"food": 150, "rent": 950}})
        );
    }

    #[test]
    fn nested_patch_into_missing_key_defaults_to_object() {
        let patch = Patch::new().nested("settings", Patch::new().set("theme", json!("dark")));
        let merged = merge(&Map::new(), &patch);
        assert_eq!(Value::Object(merged), json!({"settings": {"theme": "dark"}}));
    }

    #[test]
    fn unset_removes_key() {
        let target = obj(json!({"a": 1, "b": 2}));
        let patch = Patch::new().unset("a");
        assert_eq!(patch.to_value(), json!({"$$patch": true, "a": {"$$unset": true}}));

        let merged = merge(&target, &patch);
        assert_eq!(Value::Object(merged), json!({"b": 2}));
    }

    #[test]
    fn decode_rejects_malformed_patches() {
        assert!(matches!(
            Patch::from_value(&json!({"a": 1})),
            Err(Error::PatchApplication(_))
        ));
        assert!(matches!(
            Patch::from_value(&json!({"$$patch": "yes"})),
            Err(Error::PatchApplication(_))
        ));
        assert!(matches!(
            Patch::from_value(&json!([1, 2])),
            Err(Error::PatchApplication(_))
        ));
        assert!(matches!(
            Patch::from_value(&json!({"$$patch": true, "b": {"$$patch": false}})),
            Err(Error::PatchApplication(_))
        ));
        assert!(matches!(
            Patch::from_value(&json!({"$$patch": true, "b": {"$$unset": true, "x": 1}})),
            Err(Error::PatchApplication(_))
        ));
    }

    #[test]
    fn merge_value_leaves_target_on_error() {
        let target = obj(json!({"a": 1}));
        let result = merge_value(&target, &json!({"$$patch": 0, "a": 2}));
        assert!(result.is_err());
        assert_eq!(Value::Object(target), json!({"a": 1}));
    }

    #[test]
    fn values_shaped_like_markers_stay_values() {
        let patch = Patch::new()
            .set("cfg", json!({"$$patch": false}))
            .set("flag", json!({"$$unset": true}))
            .set("raw", json!({"$$value": 1}))
            .set("blob", json!({"$$binary": "AQID"}));

        let wire = patch.to_value();
        assert_eq!(wire["cfg"], json!({"$$value": {"$$patch": false}}));
        assert_eq!(wire["blob"], json!({"$$binary": "AQID"}));

        let decoded = Patch::from_value(&wire).unwrap();
        assert_eq!(decoded, patch);

        let merged = merge(&Map::new(), &decoded);
        assert_eq!(
            Value::Object(merged),
            json!({
                "cfg": {"$$patch": false},
                "flag": {"$$unset": true},
                "raw": {"$$value": 1},
                "blob": {"$$binary": "AQID"}
            })
        );
    }

    #[test]
    fn marker_named_keys_survive_the_wire() {
        let old = obj(json!({"opts": {"$$patch": 1, "$$unset": 1}}));
        let new = obj(json!({"opts": {"$$patch": 2, "$$unset": 1}, "$$value": 3}));

        let patch = diff(&old, &new);
        let wire = patch.to_value();
        assert_eq!(wire["$$$value"], json!(3));
        assert_eq!(wire["opts"], json!({"$$patch": true, "$$$patch": 2}));

        let decoded = Patch::from_value(&wire).unwrap();
        assert_eq!(decoded, patch);
        assert_eq!(Value::Object(merge(&old, &decoded)), Value::Object(new));
    }

    #[test]
    fn serde_roundtrip() {
        let patch = Patch::new()
            .set("a", json!(1))
            .nested("b", Patch::new().set("c", json!([1])))
            .unset("d");

        let json = serde_json::to_string(&patch).unwrap();
        let parsed: Patch = serde_json::from_str(&json).unwrap();
        assert_eq!(patch, parsed);

        let bad: std::result::Result<Patch, _> = serde_json::from_str(r#"{"a":1}"#);
        assert!(bad.is_err());
    }
}
