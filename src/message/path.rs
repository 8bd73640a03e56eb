//! Colon-separated payload paths
//!
//! Nested payloads are addressed with `:` separated keys, e.g. `motor:speed`.
//! Numeric segments index into arrays (`sensors:0:value`).
//!
//! - [`flatten`] turns a nested payload into `path -> leaf` pairs
//! - [`unflatten`] rebuilds the nested form
//! - [`merge_patch`] applies a patch and reports what changed

use super::Payload;
use serde_json::Value;
use std::collections::BTreeMap;

/// Path separator
pub const SEPARATOR: char = ':';

/// Flat view of a payload, ordered by path
pub type FlatMap = BTreeMap<String, Value>;

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix(SEPARATOR)
        .unwrap_or(path)
        .split(SEPARATOR)
        .filter(|s| !s.is_empty())
}

fn index_of(segment: &str) -> Option<usize> {
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

fn flatten_into(out: &mut FlatMap, value: &Value, prefix: &mut String) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push(SEPARATOR);
                }
                prefix.push_str(key);
                flatten_into(out, child, prefix);
                prefix.truncate(len);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                let len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push(SEPARATOR);
                }
                prefix.push_str(&i.to_string());
                flatten_into(out, child, prefix);
                prefix.truncate(len);
            }
        }
        leaf => {
            out.insert(prefix.clone(), leaf.clone());
        }
    }
}

/// Flatten a nested payload into `path -> leaf value` pairs
pub fn flatten(payload: &Payload) -> FlatMap {
    let mut out = FlatMap::new();
    let mut prefix = String::new();
    for (key, value) in payload {
        prefix.clear();
        prefix.push_str(key);
        flatten_into(&mut out, value, &mut prefix);
    }
    out
}

fn slot<'a>(level: &'a mut Value, segment: &str) -> &'a mut Value {
    match index_of(segment) {
        Some(idx) => {
            if !level.is_array() {
                *level = Value::Array(Vec::new());
            }
            match level {
                Value::Array(items) => {
                    if items.len() <= idx {
                        items.resize(idx + 1, Value::Null);
                    }
                    &mut items[idx]
                }
                other => other,
            }
        }
        None => {
            if !level.is_object() {
                *level = Value::Object(Payload::new());
            }
            match level {
                Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
                other => other,
            }
        }
    }
}

fn set_in(root: &mut Value, path: &str, value: Value) {
    let mut level = root;
    for segment in segments(path) {
        level = slot(level, segment);
    }
    *level = value;
}

/// Rebuild a nested payload from flat `path -> value` pairs
pub fn unflatten<'a, I>(flat: I) -> Payload
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut root = Value::Object(Payload::new());
    for (path, value) in flat {
        set_in(&mut root, path, value.clone());
    }
    match root {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Look up a value by path
pub fn get_path<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut parts = segments(path);
    let first = parts.next()?;
    let mut level = payload.get(first)?;
    for segment in parts {
        level = match level {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(index_of(segment)?)?,
            _ => return None,
        };
    }
    Some(level)
}

/// Set a value by path, creating intermediate objects as needed
pub fn set_path(payload: &mut Payload, path: &str, value: Value) {
    let mut root = Value::Object(std::mem::take(payload));
    set_in(&mut root, path, value);
    if let Value::Object(map) = root {
        *payload = map;
    }
}

fn merge_value(target: &mut Value, patch: &Value, diff: &mut Value) -> usize {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Payload::new());
            }
            if !diff.is_object() {
                *diff = Value::Object(Payload::new());
            }
            let (Value::Object(target_map), Value::Object(diff_map)) = (target, diff) else {
                return 0;
            };
            let mut changed = 0;
            for (key, value) in patch_map {
                if value.is_null() {
                    if target_map.remove(key).is_some() {
                        diff_map.insert(key.clone(), Value::Null);
                        changed += 1;
                    }
                    continue;
                }
                let entry = target_map.entry(key.clone()).or_insert(Value::Null);
                let mut sub_diff = Value::Null;
                let n = merge_value(entry, value, &mut sub_diff);
                if n > 0 {
                    diff_map.insert(key.clone(), sub_diff);
                    changed += n;
                }
            }
            changed
        }
        other => {
            if target != other {
                *target = other.clone();
                *diff = other.clone();
                1
            } else {
                0
            }
        }
    }
}

/// Merge `patch` into `target` (RFC 7386 semantics: `null` deletes a key)
///
/// Returns the number of leaves that changed together with a payload holding
/// only the changed parts.
pub fn merge_patch(target: &mut Payload, patch: &Payload) -> (usize, Payload) {
    let mut root = Value::Object(std::mem::take(target));
    let mut diff = Value::Object(Payload::new());
    let changed = merge_value(&mut root, &Value::Object(patch.clone()), &mut diff);
    if let Value::Object(map) = root {
        *target = map;
    }
    let diff = match diff {
        Value::Object(map) => map,
        _ => Payload::new(),
    };
    (changed, diff)
}
