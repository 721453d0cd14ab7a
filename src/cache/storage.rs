//! SQLite implementation of the generational cache.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CacheKey, CacheStorage, GenerationInfo, ResponseSnapshot};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
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
    Ok(crate::db::data_dir()?.join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache generation; id preserves creation order
CREATE TABLE IF NOT EXISTS generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses keyed by generation and request hash
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_hash ON entries(request_hash);
"#;

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &CacheKey,
  response: &ResponseSnapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (generation, request_hash, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.cache_hash(),
        key.url().as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.url(), e))?;

  Ok(())
}

fn decode_row(status: u16, headers: String, body: Vec<u8>) -> Result<ResponseSnapshot> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  Ok(ResponseSnapshot {
    status,
    headers,
    body,
  })
}

impl CacheStorage for SqliteStorage {
  fn generation_names(&self) -> Result<Vec<String>> {
    Ok(
      self
        .generations()?
        .into_iter()
        .map(|generation| generation.name)
        .collect(),
    )
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT g.name, COUNT(e.request_hash) FROM generations g
         LEFT JOIN entries e ON e.generation = g.name
         GROUP BY g.id
         ORDER BY g.id",
      )
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let generations = stmt
      .query_map([], |row| {
        Ok(GenerationInfo {
          name: row.get(0)?,
          entries: row.get::<_, i64>(1)? as usize,
        })
      })
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(generations)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, generation: &str, key: &CacheKey, response: &ResponseSnapshot) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, generation, key, response)
  }

  fn put_all(&self, generation: &str, entries: &[(CacheKey, ResponseSnapshot)]) -> Result<()> {
    let conn = self.lock()?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, generation: &str, key: &CacheKey) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM entries
         WHERE generation = ? AND request_hash = ?",
        params![generation, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    row
      .map(|(status, headers, body)| decode_row(status, headers, body))
      .transpose()
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body FROM entries e
         INNER JOIN generations g ON g.name = e.generation
         WHERE e.request_hash = ?
         ORDER BY g.id
         LIMIT 1",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache: {}", e))?;

    row
      .map(|(status, headers, body)| decode_row(status, headers, body))
      .transpose()
  }
}
