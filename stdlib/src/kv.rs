//! In-memory key–value store shared between the host and scripts.
//!
//! Values are stored as JSON, so a script reads back a copy of what it
//! stored, never the table itself.

use std::sync::Arc;

use dashmap::DashMap;
use luau_bridge::{Error, Frame, Outcome, Result, StackOps, TableOps};
use serde_json::Value;

use crate::value::{push_value, read_value};
use crate::{Export, Library, bad_argument};

/// Thread-safe store backing the `kv` library.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<String, Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with every field of a JSON object; other values are
    /// stored under the empty key.
    pub fn with_seed(seed: Value) -> Self {
        let store = Self::new();
        match seed {
            Value::Object(fields) => {
                for (key, value) in fields {
                    store.set(key, value);
                }
            }
            Value::Null => {}
            other => store.set(String::new(), other),
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Setting `null` removes the key.
    pub fn set(&self, key: String, value: Value) {
        if value.is_null() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct KvLibrary {
    store: Arc<KvStore>,
}

impl KvLibrary {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

impl Library for KvLibrary {
    fn name(&self) -> &str {
        "kv"
    }

    fn description(&self) -> &str {
        "Key-value store shared with the host"
    }

    fn exports(&self) -> Vec<Export> {
        let get = Arc::clone(&self.store);
        let set = Arc::clone(&self.store);
        let delete = Arc::clone(&self.store);
        let keys = Arc::clone(&self.store);
        vec![
            Export::new("get", move |frame: &Frame| kv_get(frame, &get)),
            Export::new("set", move |frame: &Frame| kv_set(frame, &set)),
            Export::new("delete", move |frame: &Frame| kv_delete(frame, &delete)),
            Export::new("keys", move |frame: &Frame| kv_keys(frame, &keys)),
        ]
    }
}

fn key_arg(frame: &Frame, function: &str) -> Result<String> {
    if frame.type_of(1) != luau_bridge::Type::String {
        return Err(bad_argument(1, function, "string", frame));
    }
    let bytes = frame.to_bytes(1).unwrap_or_default();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn kv_get(frame: &Frame, store: &KvStore) -> Result<Outcome> {
    let key = key_arg(frame, "get")?;
    match store.get(&key) {
        Some(value) => push_value(frame, &value).map_err(|e| Error::runtime(format!("kv.get: {e}")))?,
        None => frame.push_nil(),
    }
    Ok(Outcome::returns(1))
}

fn kv_set(frame: &Frame, store: &KvStore) -> Result<Outcome> {
    let key = key_arg(frame, "set")?;
    let value = read_value(frame, 2).map_err(|e| Error::runtime(format!("kv.set: {e}")))?;
    store.set(key, value);
    Ok(Outcome::NONE)
}

/// Returns whether the key existed.
fn kv_delete(frame: &Frame, store: &KvStore) -> Result<Outcome> {
    let key = key_arg(frame, "delete")?;
    frame.push_boolean(store.remove(&key).is_some());
    Ok(Outcome::returns(1))
}

fn kv_keys(frame: &Frame, store: &KvStore) -> Result<Outcome> {
    let keys = store.keys();
    frame.create_table(keys.len().try_into().unwrap_or(0), 0);
    for (i, key) in keys.iter().enumerate() {
        frame.push_string(key);
        frame.raw_set_index(-2, i as i64 + 1)?;
    }
    Ok(Outcome::returns(1))
}
