//! SQLite-backed key/value storage.
//!
//! Values are stored as JSON text in a single table, one row per
//! collection key.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::StorageError;
use crate::storage::KeyValueStorage;

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
#[allow(dead_code)]
const SCHEMA_VERSION: i32 = 1;

// ============================================================================
// SQLite Storage Implementation
// ============================================================================

/// Durable storage backend.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

fn backend(context: &str, e: rusqlite::Error) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, e))
}

impl SqliteStorage {
    /// Open or create the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| backend("failed to open database", e))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| backend("failed to set pragmas", e))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| backend("failed to open in-memory database", e))?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| backend("failed to create schema_version", e))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| backend("failed to read schema_version", e))?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| backend("migration v1 failed", e))?;

        Ok(())
    }
}

// ============================================================================
// Trait Implementation
// ============================================================================

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let conn = self.conn.lock().await;
        let text: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| backend("failed to read item", e))?;

        text.map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let text =
            serde_json::to_string(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, now],
        )
        .map_err(|e| backend("failed to write item", e))?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| backend("failed to delete item", e))?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT key FROM kv ORDER BY key")
            .map_err(|e| backend("failed to prepare query", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| backend("failed to list keys", e))?;
        let keys = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend("failed to read key", e))?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        storage.set_item("a", json!({"x": 1})).await.unwrap();
        storage.set_item("a", json!({"x": 2})).await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap(), Some(json!({"x": 2})));
        assert_eq!(storage.keys().await.unwrap(), vec!["a".to_string()]);

        storage.remove_item("a").await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.db");

        {
            let storage = SqliteStorage::new(&path).unwrap();
            storage.set_item("k", json!([1, 2, 3])).await.unwrap();
        }

        let storage = SqliteStorage::new(&path).unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), Some(json!([1, 2, 3])));
    }
}
