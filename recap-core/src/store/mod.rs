//! Persistent key-value port backing every ledger.
//!
//! Values are JSON documents addressed by a fixed set of [`keys`]. Ledgers
//! never reach a global store: they receive a [`StateStore`] handle.

mod memory;
mod sqlite;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryKvStore;
pub use sqlite::{SqliteKvStore, SqliteKvStoreBuilder};

pub mod keys {
    pub const MONITORING_PATH: &str = "monitoring_path";
    pub const GOALS: &str = "goals";
    pub const ACTIVE_GOAL: &str = "active_goal";
    pub const VIDEOS: &str = "videos";
    pub const PROCESSED_FILES: &str = "processed_files";
    pub const LOGS: &str = "logs";
    pub const SYNC_IDENTITY: &str = "sync_identity";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open state database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("state database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("state store path not configured")]
    MissingStore,
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to decode value for {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error("state store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Writes every entry or none of them.
    fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// Typed handle over a [`KvStore`].
///
/// The write guard serialises read-modify-write sequences across ledgers;
/// it is not re-entrant, so code holding it must only use the plain
/// `get_or`/`put` accessors.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<dyn KvStore>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::default()))
    }

    pub fn write_guard(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.inner.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> StoreResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let value = encode(key, value)?;
        self.inner.set(key, value)
    }

    pub fn put_many(&self, entries: Vec<StagedWrite>) -> StoreResult<()> {
        self.inner.set_many(
            entries
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
        )
    }

    pub fn remove(&self, key: &str) -> StoreResult<()> {
        self.inner.remove(key)
    }
}

/// One entry of an atomic [`StateStore::put_many`] batch.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    key: String,
    value: Value,
}

impl StagedWrite {
    pub fn new<T: Serialize + ?Sized>(key: &str, value: &T) -> StoreResult<Self> {
        Ok(Self {
            key: key.to_string(),
            value: encode(key, value)?,
        })
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}
