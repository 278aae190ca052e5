//! Traversals over nested message bodies.
//!
//! Message bodies are free-form JSON objects; file entries (`uid`/`uri`
//! pairs) may sit at the top level, inside a `dataset` array, or nested one
//! level deeper inside a `collection`. These helpers visit the whole tree so
//! callers never care which shape they were handed.

use serde_json::{Map, Value};

/// Collect every value stored under `key` anywhere in the tree.
///
/// Objects are searched recursively; arrays are searched element-wise.
pub fn extract_values<'a>(var: &'a Value, key: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    collect_values(var, key, &mut out);
    out
}

fn collect_values<'a>(var: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match var {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    out.push(v);
                }
                collect_values(v, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_values(item, key, out);
            }
        }
        _ => {}
    }
}

/// Collect every string stored under `key` anywhere in the tree.
pub fn extract_strings(var: &Value, key: &str) -> Vec<String> {
    extract_values(var, key)
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect()
}

/// Collect a reference to every object that has an entry named `key`.
///
/// This is the traversal the push handler uses: each returned object is one
/// file entry carrying a `uri` (and usually a `uid` and `path`).
pub fn containers_with_key<'a>(var: &'a Value, key: &str) -> Vec<&'a Map<String, Value>> {
    let mut out = Vec::new();
    collect_containers(var, key, &mut out);
    out
}

fn collect_containers<'a>(var: &'a Value, key: &str, out: &mut Vec<&'a Map<String, Value>>) {
    match var {
        Value::Object(map) => {
            if map.contains_key(key) {
                out.push(map);
            }
            for v in map.values() {
                collect_containers(v, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_containers(item, key, out);
            }
        }
        _ => {}
    }
}

/// Rebuild the tree, applying `f` to every object that contains at least one
/// of `keys`. The callback receives the object and returns its replacement;
/// children of the replacement are traversed in turn.
pub fn translate_entries<F>(var: Value, keys: &[&str], f: &mut F) -> Value
where
    F: FnMut(Map<String, Value>) -> Map<String, Value>,
{
    match var {
        Value::Object(map) => {
            let map = if keys.iter().any(|k| map.contains_key(*k)) {
                f(map)
            } else {
                map
            };
            let map = map
                .into_iter()
                .map(|(k, v)| (k, translate_entries(v, keys, f)))
                .collect();
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| translate_entries(item, keys, f))
                .collect(),
        ),
        other => other,
    }
}
