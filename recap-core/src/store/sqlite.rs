use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;

use crate::sqlite::configure_connection;

use super::{KvStore, StoreError, StoreResult};

const STATE_SCHEMA: &str = include_str!("../../../sql/state.sql");

#[derive(Debug, Clone)]
pub struct SqliteKvStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteKvStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteKvStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteKvStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteKvStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteKvStore {
    pub fn builder() -> SqliteKvStoreBuilder {
        SqliteKvStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteKvStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(())
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_state ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

fn upsert(conn: &Connection, key: &str, value: &Value) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO kv_state (key, value, updated_at)
         VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value.to_string()],
    )?;
    Ok(())
}

fn decode(key: &str, raw: String) -> StoreResult<Value> {
    serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.open()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM kv_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|raw| decode(key, raw)).transpose()
    }

    fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let conn = self.open()?;
        upsert(&conn, key, &value)
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for (key, value) in &entries {
            upsert(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM kv_state WHERE key = ?1", [key])?;
        Ok(())
    }
}
