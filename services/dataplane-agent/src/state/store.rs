//! SQLite-based snapshot store for the dataplane agent.
//!
//! This provides durable storage for registry snapshots, enabling name to
//! handle correlation after agent restarts.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use dpsync_reconcile::{Handle, ReconcileError, Snapshot, SnapshotEntry, SnapshotStore};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

impl From<StateStoreError> for ReconcileError {
    fn from(e: StateStoreError) -> Self {
        ReconcileError::Persistence(e.to_string())
    }
}

/// SQLite snapshot store.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create a snapshot store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                label TEXT PRIMARY KEY,
                saved_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot_entries (
                label TEXT NOT NULL REFERENCES snapshots(label) ON DELETE CASCADE,
                name TEXT NOT NULL,
                handle INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (label, name)
            );
            "#,
        )?;

        debug!("Snapshot store schema initialized");
        Ok(())
    }

    /// Replace the snapshot stored under `label`.
    pub fn put_snapshot(&self, label: &str, snapshot: &Snapshot) -> Result<(), StateStoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM snapshot_entries WHERE label = ?1",
            params![label],
        )?;
        tx.execute(
            r#"
            INSERT INTO snapshots (label, saved_at) VALUES (?1, ?2)
            ON CONFLICT(label) DO UPDATE SET saved_at = excluded.saved_at
            "#,
            params![label, snapshot.saved_at.timestamp_millis()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_entries (label, name, handle, metadata) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in &snapshot.entries {
                let metadata = serde_json::to_string(&entry.metadata)
                    .map_err(|e| StateStoreError::Invalid(format!("{}: {e}", entry.name)))?;
                stmt.execute(params![label, entry.name, entry.handle.0, metadata])?;
            }
        }
        tx.commit()?;

        debug!(label = %label, entries = snapshot.entries.len(), "Snapshot saved");
        Ok(())
    }

    /// Read the snapshot stored under `label`.
    pub fn get_snapshot(&self, label: &str) -> Result<Option<Snapshot>, StateStoreError> {
        let conn = self.conn.lock();

        let saved_at: Option<i64> = conn
            .query_row(
                "SELECT saved_at FROM snapshots WHERE label = ?1",
                params![label],
                |row| row.get(0),
            )
            .optional()?;
        let Some(saved_at) = saved_at else {
            return Ok(None);
        };
        let saved_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(saved_at)
            .single()
            .ok_or_else(|| StateStoreError::Invalid(format!("bad timestamp {saved_at}")))?;

        let mut stmt = conn.prepare(
            "SELECT name, handle, metadata FROM snapshot_entries WHERE label = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![label], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let entries = rows
            .into_iter()
            .map(|(name, handle, metadata)| {
                let metadata = serde_json::from_str(&metadata)
                    .map_err(|e| StateStoreError::Invalid(format!("{name}: {e}")))?;
                Ok(SnapshotEntry {
                    name,
                    handle: Handle(handle),
                    metadata,
                })
            })
            .collect::<Result<Vec<_>, StateStoreError>>()?;

        Ok(Some(Snapshot {
            label: label.to_string(),
            saved_at,
            entries,
        }))
    }

    /// Labels with a stored snapshot.
    pub fn list_labels(&self) -> Result<Vec<String>, StateStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT label FROM snapshots ORDER BY label")?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(labels)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, label: &str, snapshot: &Snapshot) -> Result<(), ReconcileError> {
        self.put_snapshot(label, snapshot).map_err(Into::into)
    }

    fn load(&self, label: &str) -> Result<Option<Snapshot>, ReconcileError> {
        self.get_snapshot(label).map_err(Into::into)
    }
}
