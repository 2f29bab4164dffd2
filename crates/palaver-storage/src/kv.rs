//! Key-value persistence backends.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization. The
//! in-memory backend serves both tests and the degraded mode used when
//! durable storage is unavailable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use palaver_core::error::PalaverError;

/// Namespaced string key-value store.
///
/// All orchestrator persistence (session id, counters, flags, deadlines)
/// goes through this trait so the SQLite backend can be swapped for the
/// in-memory one when durable storage is unavailable.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PalaverError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PalaverError>;
    fn remove(&self, key: &str) -> Result<(), PalaverError>;
}

/// SQLite-backed key-value store.
///
/// Uses WAL mode for concurrent read/write safety. The connection is
/// wrapped in a Mutex since rusqlite Connection is not Sync.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn new(path: &Path) -> Result<Self, PalaverError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| PalaverError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| PalaverError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Session store opened at {}", path.display());

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, PalaverError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PalaverError::Storage(format!("Failed to open in-memory db: {}", e)))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), PalaverError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                     key   TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );",
            )
            .map_err(|e| PalaverError::Storage(format!("Failed to create schema: {}", e)))
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, PalaverError>
    where
        F: FnOnce(&Connection) -> Result<T, PalaverError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PalaverError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, PalaverError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| PalaverError::Storage(format!("Read failed for {}: {}", key, e)))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PalaverError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| PalaverError::Storage(format!("Write failed for {}: {}", key, e)))?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<(), PalaverError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(|e| PalaverError::Storage(format!("Delete failed for {}: {}", key, e)))?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

/// In-memory key-value store.
///
/// Used for tests and as the degraded-mode fallback when durable storage
/// cannot be opened (values then live only for the current page load).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PalaverError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| PalaverError::Storage(format!("Store lock poisoned: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PalaverError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| PalaverError::Storage(format!("Store lock poisoned: {}", e)))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PalaverError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| PalaverError::Storage(format!("Store lock poisoned: {}", e)))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(store: &dyn KeyValueStore) {
        assert!(store.get("missing").unwrap().is_none());

        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none());

        // Removing a missing key is not an error.
        store.remove("a").unwrap();
    }

    #[test]
    fn test_memory_store_roundtrip() {
        roundtrip(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        roundtrip(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.db");

        {
            let store = SqliteStore::new(&path).unwrap();
            store.set("session_id", "abc-123").unwrap();
        }

        // Re-open and read the value back.
        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.get("session_id").unwrap().as_deref(), Some("abc-123"));
        assert!(path.exists());
    }

    #[test]
    fn test_sqlite_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("palaver.db");
        let store = SqliteStore::new(&path).unwrap();
        store.set("k", "v").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_keys_are_independent() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("bot1:used", "3").unwrap();
        store.set("bot2:used", "0").unwrap();
        assert_eq!(store.get("bot1:used").unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("bot2:used").unwrap().as_deref(), Some("0"));
    }
}
