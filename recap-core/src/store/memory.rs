use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{KvStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let guard = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert(key.to_string(), value);
        Ok(())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        guard.extend(entries);
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        guard.remove(key);
        Ok(())
    }
}
