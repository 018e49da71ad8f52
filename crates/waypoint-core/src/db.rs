//! SQLite database layer for the orchestrator.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::PersistenceError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| PersistenceError::Connection(format!("failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| PersistenceError::Connection(format!("failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            PersistenceError::Connection(format!("failed to open in-memory db: {}", e))
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| PersistenceError::Connection(format!("failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| PersistenceError::Connection(format!("lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| PersistenceError::Query(e.to_string()))
    }

    /// Execute a closure with access to the database connection
    /// (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| PersistenceError::Connection(format!("task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), PersistenceError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_instances (
                    instance_id         TEXT PRIMARY KEY,
                    workflow_name       TEXT NOT NULL,
                    current_step_name   TEXT,
                    status              TEXT NOT NULL
                        CHECK(status IN ('RUNNING', 'SUSPENDED', 'COMPLETED', 'FAILED')),
                    context             TEXT NOT NULL DEFAULT '{}',
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    completed_at        INTEGER
                );

                CREATE TABLE IF NOT EXISTS workflow_history (
                    history_id            INTEGER PRIMARY KEY AUTOINCREMENT,
                    instance_id           TEXT NOT NULL
                        REFERENCES workflow_instances(instance_id) ON DELETE CASCADE,
                    timestamp             INTEGER NOT NULL,
                    step_name             TEXT NOT NULL,
                    user_report           TEXT,
                    outcome_status        TEXT,
                    determined_next_step  TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_history_instance
                    ON workflow_history(instance_id);
                ",
            )
        })
    }
}
