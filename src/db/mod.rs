use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::host::RegistrationStore;
use crate::worker::WorkerScript;

/// Application data directory ($XDG_DATA_HOME/clozeshell).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("clozeshell"))
}

/// Schema for the app's own durable state.
const SCHEMA: &str = r#"
-- Text-keyed local storage
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Worker scripts of the registration: the active one and one waiting
CREATE TABLE IF NOT EXISTS registered_workers (
    role TEXT PRIMARY KEY CHECK (role IN ('active', 'waiting')),
    script TEXT NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Database connection wrapper for local storage and the worker registration
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at an explicit path
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("app.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read a text value from local storage
  pub fn get_item(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  /// Write a text value to local storage
  pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }
}

impl Database {
  fn load_role(&self, role: &str) -> Result<Option<WorkerScript>> {
    let script: Option<String> = self
      .conn()?
      .query_row(
        "SELECT script FROM registered_workers WHERE role = ?",
        params![role],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} worker: {}", role, e))?;

    script
      .map(|s| {
        serde_json::from_str(&s).map_err(|e| eyre!("Failed to parse {} worker: {}", role, e))
      })
      .transpose()
  }

  fn save_role(&self, role: &str, script: &WorkerScript) -> Result<()> {
    let data =
      serde_json::to_string(script).map_err(|e| eyre!("Failed to serialize script: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO registered_workers (role, script, saved_at)
         VALUES (?, ?, datetime('now'))",
        params![role, data],
      )
      .map_err(|e| eyre!("Failed to save {} worker: {}", role, e))?;
    Ok(())
  }
}

impl RegistrationStore for Database {
  fn load_active(&self) -> Result<Option<WorkerScript>> {
    self.load_role("active")
  }

  fn save_active(&self, script: &WorkerScript) -> Result<()> {
    self.save_role("active", script)
  }

  fn load_waiting(&self) -> Result<Option<WorkerScript>> {
    self.load_role("waiting")
  }

  fn save_waiting(&self, script: Option<&WorkerScript>) -> Result<()> {
    match script {
      Some(script) => self.save_role("waiting", script),
      None => {
        self
          .conn()?
          .execute("DELETE FROM registered_workers WHERE role = 'waiting'", [])
          .map_err(|e| eyre!("Failed to clear waiting worker: {}", e))?;
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::worker::ActivationPolicy;

  #[test]
  fn test_items_round_trip_and_overwrite() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.get_item("cards").unwrap(), None);

    db.set_item("cards", "[]").unwrap();
    db.set_item("cards", "[1]").unwrap();

    assert_eq!(db.get_item("cards").unwrap().as_deref(), Some("[1]"));
  }

  #[test]
  fn test_registration_keeps_latest_script() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.load_active().unwrap(), None);

    let v1 = WorkerScript::default();
    let v2 = WorkerScript {
      cache_name: "cloze-pwa-v2".into(),
      activation: ActivationPolicy::OnInstall,
      ..WorkerScript::default()
    };
    db.save_active(&v1).unwrap();
    db.save_active(&v2).unwrap();

    assert_eq!(db.load_active().unwrap(), Some(v2));
  }

  #[test]
  fn test_waiting_record_is_separate_from_active() {
    let db = Database::open_in_memory().unwrap();
    let v1 = WorkerScript::default();
    let v2 = WorkerScript {
      cache_name: "cloze-pwa-v2".into(),
      ..WorkerScript::default()
    };
    db.save_active(&v1).unwrap();
    db.save_waiting(Some(&v2)).unwrap();

    assert_eq!(db.load_active().unwrap(), Some(v1));
    assert_eq!(db.load_waiting().unwrap(), Some(v2));

    db.save_waiting(None).unwrap();
    db.save_waiting(None).unwrap();
    assert_eq!(db.load_waiting().unwrap(), None);
    assert!(db.load_active().unwrap().is_some());
  }
}
