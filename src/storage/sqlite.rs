//! SQLite-backed key/value storage.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::KeyValueStorage;
use crate::error::{Error, Result};

/// Schema for the key/value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create storage directory: {e}")))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open store at {}: {e}",
        path.display()
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store. Nothing survives the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::Storage(format!("Failed to open in-memory store: {e}")))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".into()))?;

    Ok(data_dir.join("offsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run storage migrations: {e}")))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {e}")))
  }
}

impl KeyValueStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to read {key}: {e}")))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| Error::Storage(format!("Failed to write {key}: {e}")))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| Error::Storage(format!("Failed to remove {key}: {e}")))?;
    Ok(())
  }

  fn remove_many(&self, keys: &[String]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| Error::Storage(format!("Failed to begin transaction: {e}")))?;

    for key in keys {
      tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])
        .map_err(|e| Error::Storage(format!("Failed to remove {key}: {e}")))?;
    }

    tx.commit()
      .map_err(|e| Error::Storage(format!("Failed to commit transaction: {e}")))
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| Error::Storage(format!("Failed to prepare query: {e}")))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| Error::Storage(format!("Failed to list keys: {e}")))?
      .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(keys)
  }

  fn size_of(&self, key: &str) -> Result<Option<usize>> {
    let conn = self.lock()?;
    let size: Option<i64> = conn
      .query_row(
        "SELECT length(CAST(value AS BLOB)) FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to measure {key}: {e}")))?;

    Ok(size.map(|s| usize::try_from(s).unwrap_or(0)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_remove() {
    let store = SqliteStorage::open_in_memory().unwrap();

    assert_eq!(store.get("a").unwrap(), None);
    store.set("a", "1").unwrap();
    store.set("a", "2").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

    store.remove("a").unwrap();
    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
  }

  #[test]
  fn test_remove_many_and_keys() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.set("b", "x").unwrap();
    store.set("a", "y").unwrap();
    store.set("c", "z").unwrap();

    assert_eq!(store.keys().unwrap(), vec!["a", "b", "c"]);

    store
      .remove_many(&["a".to_string(), "c".to_string()])
      .unwrap();
    assert_eq!(store.keys().unwrap(), vec!["b"]);
  }

  #[test]
  fn test_size_counts_bytes() {
    let store = SqliteStorage::open_in_memory().unwrap();
    store.set("k", "héllo").unwrap();
    assert_eq!(store.size_of("k").unwrap(), Some(6));
    assert_eq!(store.size_of("missing").unwrap(), None);
  }

  #[test]
  fn test_reopen_keeps_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStorage::open_at(&path).unwrap();
      store.set("@offline_jobs", "[1,2]").unwrap();
    }

    let store = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(store.get("@offline_jobs").unwrap().as_deref(), Some("[1,2]"));
  }
}
