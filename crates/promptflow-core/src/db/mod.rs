//! SQLite database layer for Promptflow.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("[Database] SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| CoreError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| CoreError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), CoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sequences (
                    id                  TEXT PRIMARY KEY,
                    name                TEXT NOT NULL,
                    description         TEXT,
                    user_id             TEXT NOT NULL,
                    default_llm_model   TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_sequences_user ON sequences(user_id);

                CREATE TABLE IF NOT EXISTS variables (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    user_id         TEXT NOT NULL,
                    sequence_id     TEXT REFERENCES sequences(id) ON DELETE CASCADE,
                    scope_key       TEXT NOT NULL,
                    role            TEXT NOT NULL,
                    value           TEXT NOT NULL DEFAULT 'null',
                    description     TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    UNIQUE (name, user_id, scope_key)
                );
                CREATE INDEX IF NOT EXISTS idx_variables_sequence ON variables(sequence_id);

                CREATE TABLE IF NOT EXISTS global_lists (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    user_id         TEXT NOT NULL,
                    description     TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    UNIQUE (name, user_id)
                );

                CREATE TABLE IF NOT EXISTS global_list_items (
                    id              TEXT PRIMARY KEY,
                    list_id         TEXT NOT NULL REFERENCES global_lists(id) ON DELETE CASCADE,
                    value           TEXT NOT NULL DEFAULT 'null',
                    order_index     INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_global_list_items_list ON global_list_items(list_id);

                CREATE TABLE IF NOT EXISTS blocks (
                    id                  TEXT PRIMARY KEY,
                    sequence_id         TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                    name                TEXT NOT NULL,
                    type                TEXT NOT NULL,
                    position            INTEGER NOT NULL,
                    config              TEXT NOT NULL DEFAULT '{}',
                    llm_model_override  TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    UNIQUE (sequence_id, position)
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id                  TEXT PRIMARY KEY,
                    sequence_id         TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                    user_id             TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    started_at          INTEGER,
                    completed_at        INTEGER,
                    input_overrides     TEXT,
                    results_summary     TEXT,
                    error_message       TEXT,
                    llm_model_override  TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_sequence ON runs(sequence_id);

                CREATE TABLE IF NOT EXISTS block_runs (
                    id                  TEXT PRIMARY KEY,
                    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    block_id            TEXT REFERENCES blocks(id) ON DELETE SET NULL,
                    status              TEXT NOT NULL,
                    started_at          INTEGER,
                    completed_at        INTEGER,
                    block_name_snapshot TEXT NOT NULL,
                    block_type_snapshot TEXT NOT NULL,
                    rendered_prompt     TEXT,
                    raw_output          TEXT,
                    named_outputs       TEXT,
                    list_outputs        TEXT,
                    matrix_outputs      TEXT,
                    error_message       TEXT,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_block_runs_run ON block_runs(run_id);
                "
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_database_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("promptflow.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('sequences', 'variables', 'global_lists', 'global_list_items',
                                  'blocks', 'runs', 'block_runs')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 7);

        // Re-opening must not fail on the existing schema.
        drop(db);
        Database::open(path.to_str().unwrap()).unwrap();
    }
}
