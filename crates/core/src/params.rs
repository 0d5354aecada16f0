use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{read_json_opt, write_json_atomic};
use crate::error::Result;
use crate::lock::{FileLock, DEFAULT_TIMEOUT};

#[derive(Serialize, Deserialize, Default)]
struct Persisted {
    data: BTreeMap<String, Value>,
}

/// Flattens nested parameter trees into dotted keys, merges them into a
/// persisted flat map, and writes the result atomically. The persisted form
/// is always fully flat.
pub struct ParamStore {
    path: PathBuf,
    lock: FileLock,
}

impl ParamStore {
    pub fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self { path, lock: FileLock::new(lock_path) }
    }

    /// Flatten `tree` and merge it into the persisted map, overwriting
    /// duplicate keys.
    pub fn set(&self, tree: Value) -> Result<()> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let mut persisted: Persisted = read_json_opt(&self.path)?.unwrap_or_default();

        let mut flat = BTreeMap::new();
        flatten(&tree, String::new(), &mut flat);
        persisted.data.extend(flat);

        write_json_atomic(&self.path, &persisted)
    }

    /// Read the persisted map. If `flatten` is false, rebuild the nested
    /// tree by splitting keys at `.`. Returns `None` if nothing was ever set.
    pub fn get(&self, flatten: bool) -> Result<Option<Value>> {
        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let persisted: Option<Persisted> = read_json_opt(&self.path)?;
        let Some(persisted) = persisted else { return Ok(None) };
        if persisted.data.is_empty() {
            return Ok(None);
        }

        if flatten {
            let obj: serde_json::Map<String, Value> = persisted.data.into_iter().collect();
            Ok(Some(Value::Object(obj)))
        } else {
            Ok(Some(unflatten(&persisted.data)))
        }
    }
}

fn flatten(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten(v, key, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

fn unflatten(flat: &BTreeMap<String, Value>) -> Value {
    let mut root = serde_json::Map::new();
    for (key, value) in flat {
        let parts: Vec<&str> = key.split('.').collect();
        insert_path(&mut root, &parts, value.clone());
    }
    Value::Object(root)
}

fn insert_path(map: &mut serde_json::Map<String, Value>, parts: &[&str], value: Value) {
    let (head, rest) = (parts[0], &parts[1..]);
    if rest.is_empty() {
        map.insert(head.to_string(), value);
        return;
    }
    let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(child) = entry {
        insert_path(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ParamStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::new(dir.path().join("parameters.json"), dir.path().join("parameters.lock"));
        (dir, store)
    }

    #[test]
    fn empty_get_returns_none() {
        let (_dir, store) = store();
        assert_eq!(store.get(true).unwrap(), None);
    }

    #[test]
    fn set_flattens_nested_tree() {
        let (_dir, store) = store();
        store.set(json!({"model": {"lr": 0.01, "layers": {"count": 3}}})).unwrap();
        let flat = store.get(true).unwrap().unwrap();
        assert_eq!(flat["model.lr"], json!(0.01));
        assert_eq!(flat["model.layers.count"], json!(3));
    }

    #[test]
    fn get_after_set_round_trips_nested() {
        let (_dir, store) = store();
        let tree = json!({"a": {"b": 1, "c": "x"}, "d": true});
        store.set(tree.clone()).unwrap();
        assert_eq!(store.get(false).unwrap().unwrap(), tree);
    }

    #[test]
    fn later_set_overwrites_duplicate_keys() {
        let (_dir, store) = store();
        store.set(json!({"lr": 0.1})).unwrap();
        store.set(json!({"lr": 0.05, "epochs": 10})).unwrap();
        let flat = store.get(true).unwrap().unwrap();
        assert_eq!(flat["lr"], json!(0.05));
        assert_eq!(flat["epochs"], json!(10));
    }

    #[test]
    fn concurrent_sets_never_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(ParamStore::new(
            dir.path().join("parameters.json"),
            dir.path().join("parameters.lock"),
        ));

        std::thread::scope(|s| {
            for k in 0..8 {
                let store = store.clone();
                s.spawn(move || {
                    for p in 0..5 {
                        store.set(json!({ format!("k{k}_{p}"): p })).unwrap();
                    }
                });
            }
        });

        let flat = store.get(true).unwrap().unwrap();
        assert_eq!(flat.as_object().unwrap().len(), 40);
    }
}
