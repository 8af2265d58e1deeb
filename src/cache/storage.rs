//! Durable key/value storage and its SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key holding the authenticated-user descriptor. Written by the auth
/// collaborator, only ever read here.
pub const CURRENT_SESSION_KEY: &str = "currentSession";

/// Trait for durable storage backends.
///
/// Every write is durable when the call returns.
pub trait KvStore: Send + Sync {
  /// Get the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn put(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key` if present.
  fn remove(&self, key: &str) -> Result<()>;
}

/// Read and deserialize a JSON value.
pub fn read_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
  match kv.get(key)? {
    Some(raw) => serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| eyre!("Failed to deserialize {}: {}", key, e)),
    None => Ok(None),
  }
}

/// Serialize and store a JSON value.
pub fn write_json<T: Serialize + ?Sized>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
  let raw =
    serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
  kv.put(key, &raw)
}

/// Storage that lives only as long as the process.
///
/// Clones share the same map, which is how tests simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryKv {
  entries: std::sync::Arc<Mutex<std::collections::HashMap<String, String>>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStore for MemoryKv {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn put(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteKv {
  conn: Mutex<Connection>,
}

impl SqliteKv {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }
}

/// Application data directory (`$XDG_DATA_HOME/invsync`).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("invsync"))
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KvStore for SqliteKv {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn put(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let kv = SqliteKv::open_at(&path).unwrap();
      kv.put("pendingQueue:barang", "[1,2,3]").unwrap();
      kv.put("pendingQueue:barang", "[1,2]").unwrap();
      kv.put("gone", "x").unwrap();
      kv.remove("gone").unwrap();
    }

    let kv = SqliteKv::open_at(&path).unwrap();
    assert_eq!(kv.get("pendingQueue:barang").unwrap().as_deref(), Some("[1,2]"));
    assert_eq!(kv.get("gone").unwrap(), None);
  }

  #[test]
  fn test_memory_clones_share_entries() {
    let kv = MemoryKv::new();
    let other = kv.clone();

    write_json(&kv, "k", &vec![1, 2]).unwrap();

    let loaded: Option<Vec<u32>> = read_json(&other, "k").unwrap();
    assert_eq!(loaded, Some(vec![1, 2]));
  }

  #[test]
  fn test_read_json_reports_corrupt_values() {
    let kv = MemoryKv::new();
    kv.put("k", "not json").unwrap();

    assert!(read_json::<Vec<u32>>(&kv, "k").is_err());
  }
}
