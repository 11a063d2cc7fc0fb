//! Per-actor key/value persistence.
//!
//! Every actor persists its state under its own namespace; multi-key writes
//! go through `put_many` so a single mutation lands atomically. The in-memory
//! backend keeps namespaces as nested concurrent maps.

use anyhow::Result;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// String-keyed JSON document store scoped to one actor.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value) -> Result<()>;
    /// Writes all entries as a single transaction.
    fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    /// Erases every key in the namespace.
    fn clear(&self) -> Result<()>;
}

/// Deserializes a stored document into a concrete type. A document that no
/// longer matches the expected shape is treated as absent.
pub fn get_as<T: DeserializeOwned>(store: &dyn Storage, key: &str) -> Option<T> {
    store
        .get(key)
        .and_then(|value| serde_json::from_value(value).ok())
}

/// Root of the in-memory store. Hands out one [`Storage`] handle per actor
/// namespace; handles created for the same name share the same data.
pub struct MemoryBackend {
    namespaces: DashMap<String, Arc<NamespaceStore>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            namespaces: DashMap::new(),
        })
    }

    pub fn namespace(&self, name: &str) -> Arc<dyn Storage> {
        let store = self
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(NamespaceStore {
                    data: DashMap::new(),
                })
            })
            .clone();
        store
    }
}

struct NamespaceStore {
    data: DashMap<String, Value>,
}

impl Storage for NamespaceStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.data.insert(key, value);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    fn clear(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }
}
