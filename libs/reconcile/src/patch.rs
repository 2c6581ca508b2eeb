//! Strategic merge patch over a typed schema.
//!
//! A structural merge, not a generic deep merge:
//!
//! - objects merge field by field; a `null` patch value deletes the field
//! - lists are atomic (replaced whole) unless the schema declares a merge
//!   key for their path, in which case elements are matched by that key and
//!   merged individually, and unmatched patch elements are appended
//! - `$patch: replace` on an object (or as a list element) replaces instead
//!   of merging; `$patch: delete` removes the object or the matched element
//! - `$deleteFromPrimitiveList/<field>` removes values from a scalar list
//! - `$setElementOrder/<field>` is accepted and ignored
//!
//! Paths are dotted field names from the document root; list elements do
//! not add a path segment (`spec.process.env` covers every env entry, and
//! `spec.process.env.valueFrom` the field inside each one).

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";

/// Patch application errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The patch document is not shaped like a patch.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// A `$` directive this implementation does not understand.
    #[error("unsupported patch directive: {0}")]
    UnsupportedDirective(String),

    /// An element of a keyed list lacks its merge key.
    #[error("element of {path} is missing merge key {key:?}")]
    MissingMergeKey { path: String, key: String },

    /// The original could not be encoded.
    #[error("failed to encode original: {0}")]
    Encode(String),

    /// The merged document does not fit the target type.
    #[error("failed to decode merged document: {0}")]
    Decode(String),
}

/// Merge keys for the list fields of a type.
#[derive(Debug, Clone, Default)]
pub struct PatchSchema {
    merge_keys: BTreeMap<String, String>,
}

impl PatchSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that the list at `path` merges elements by `key`.
    pub fn merge_key(mut self, path: impl Into<String>, key: impl Into<String>) -> Self {
        self.merge_keys.insert(path.into(), key.into());
        self
    }

    fn merge_key_for(&self, path: &str) -> Option<&str> {
        self.merge_keys.get(path).map(String::as_str)
    }
}

/// Apply `patch` to `original`.
pub fn strategic_merge(
    original: &Value,
    patch: &Value,
    schema: &PatchSchema,
) -> Result<Value, PatchError> {
    let Value::Object(patch) = patch else {
        return Err(PatchError::InvalidPatch(format!(
            "expected a JSON object, got {}",
            kind_of(patch)
        )));
    };
    let original = match original {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(PatchError::InvalidPatch(format!(
                "original must be a JSON object, got {}",
                kind_of(other)
            )))
        }
    };

    let merged = merge_map(original, patch, "", schema)?.unwrap_or_default();
    Ok(Value::Object(merged))
}

/// Encode `original`, apply `patch` and decode the result as `T`.
pub fn strategic_merge_typed<T>(
    original: &T,
    patch: &Value,
    schema: &PatchSchema,
) -> Result<T, PatchError>
where
    T: Serialize + DeserializeOwned,
{
    let encoded = serde_json::to_value(original).map_err(|e| PatchError::Encode(e.to_string()))?;
    let merged = strategic_merge(&encoded, patch, schema)?;
    serde_json::from_value(merged).map_err(|e| PatchError::Decode(e.to_string()))
}

/// Merge one object level. `None` means the object was deleted.
fn merge_map(
    mut original: Map<String, Value>,
    patch: &Map<String, Value>,
    path: &str,
    schema: &PatchSchema,
) -> Result<Option<Map<String, Value>>, PatchError> {
    match patch.get(PATCH_DIRECTIVE) {
        None => {}
        Some(Value::String(d)) if d == "merge" => {}
        Some(Value::String(d)) if d == "delete" => return Ok(None),
        Some(Value::String(d)) if d == "replace" => {
            let mut replaced = Map::new();
            for (key, value) in patch {
                if key != PATCH_DIRECTIVE {
                    replaced.insert(key.clone(), value.clone());
                }
            }
            return Ok(Some(replaced));
        }
        Some(other) => {
            return Err(PatchError::UnsupportedDirective(format!(
                "{PATCH_DIRECTIVE}: {other}"
            )))
        }
    }

    for (key, value) in patch {
        if key == PATCH_DIRECTIVE || key.starts_with(SET_ELEMENT_ORDER) {
            continue;
        }

        if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            let Value::Array(remove) = value else {
                return Err(PatchError::InvalidPatch(format!(
                    "{key} must be a list, got {}",
                    kind_of(value)
                )));
            };
            if let Some(Value::Array(items)) = original.get_mut(field) {
                items.retain(|item| !remove.contains(item));
            }
            continue;
        }

        if key.starts_with('$') {
            return Err(PatchError::UnsupportedDirective(key.clone()));
        }

        if value.is_null() {
            original.remove(key);
            continue;
        }

        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };

        let merged = match (original.remove(key), value) {
            (Some(Value::Object(o)), Value::Object(p)) => {
                merge_map(o, p, &child_path, schema)?.map(Value::Object)
            }
            (None, Value::Object(p)) => {
                merge_map(Map::new(), p, &child_path, schema)?.map(Value::Object)
            }
            (Some(Value::Array(o)), Value::Array(p)) => {
                Some(merge_list(o, p, &child_path, schema)?)
            }
            (None, Value::Array(p)) => Some(merge_list(Vec::new(), p, &child_path, schema)?),
            (_, v) => Some(v.clone()),
        };

        if let Some(merged) = merged {
            original.insert(key.clone(), merged);
        }
    }

    Ok(Some(original))
}

fn merge_list(
    original: Vec<Value>,
    patch: &[Value],
    path: &str,
    schema: &PatchSchema,
) -> Result<Value, PatchError> {
    let Some(merge_key) = schema.merge_key_for(path) else {
        return Ok(Value::Array(patch.to_vec()));
    };

    if patch.iter().any(|item| is_list_replace(item)) {
        let items = patch
            .iter()
            .filter(|item| !is_list_replace(item))
            .cloned()
            .collect();
        return Ok(Value::Array(items));
    }

    let mut result = original;
    for item in patch {
        let Value::Object(item_map) = item else {
            if !result.contains(item) {
                result.push(item.clone());
            }
            continue;
        };

        let Some(key_value) = item_map.get(merge_key) else {
            return Err(PatchError::MissingMergeKey {
                path: path.to_string(),
                key: merge_key.to_string(),
            });
        };

        let position = result
            .iter()
            .position(|existing| existing.get(merge_key) == Some(key_value));

        match position {
            Some(i) => {
                let existing = match result[i].take() {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                match merge_map(existing, item_map, path, schema)? {
                    Some(merged) => result[i] = Value::Object(merged),
                    None => {
                        result.remove(i);
                    }
                }
            }
            None => {
                if let Some(added) = merge_map(Map::new(), item_map, path, schema)? {
                    result.push(Value::Object(added));
                }
            }
        }
    }

    Ok(Value::Array(result))
}

/// A bare `{"$patch": "replace"}` list element.
fn is_list_replace(item: &Value) -> bool {
    item.as_object().is_some_and(|map| {
        map.len() == 1 && map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("replace")
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
