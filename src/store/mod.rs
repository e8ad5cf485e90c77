//! Durable storage: snapshot tables, the webhook audit log and the sync job queue.
//!
//! Backed by SQLite through `rusqlite`. All calls are synchronous and run on the
//! blocking pool via `tokio::task::spawn_blocking`.
//!
//! # Cross-worker coordination
//!
//! Each `Store` owns one connection. Workers that must coordinate (separate
//! processes, or separate pool members in tests) each open their own `Store`
//! against the same database file. Mutual exclusion on jobs comes from the
//! database write lock taken by the claim transaction (see [`jobs`]), never
//! from the in-process mutex guarding the connection.
//!
//! # Time
//!
//! Timestamps are stored as Unix epoch milliseconds so that ordering and
//! comparisons in SQL are plain integer comparisons.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;

use crate::types::InvalidTransition;

pub mod jobs;
mod schema;
pub mod snapshots;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite returned an error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column could not be (de)serialized.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value does not decode into its domain type.
    #[error("corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    /// The database was written by a newer build.
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// A stored job is in a state the requested transition does not allow.
    #[error("{0}")]
    Transition(#[from] InvalidTransition),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    Poisoned,

    /// The blocking task running the query panicked or was cancelled.
    #[error("background database task failed during {op}: {message}")]
    Background { op: &'static str, message: String },
}

impl StoreError {
    pub(crate) fn corrupt(column: &'static str, value: impl ToString) -> Self {
        StoreError::Corrupt {
            column,
            value: value.to_string(),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    ///
    /// The connection uses WAL journaling and a busy timeout, so concurrent
    /// writers from other connections wait for the lock instead of failing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Background {
                op: "create database directory",
                message: format!("{}: {}", parent.display(), e),
            })?;
        }

        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::configure(conn)
    }

    /// Opens a private in-memory database. Only useful when a single `Store`
    /// handle (and its clones) is enough.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        schema::migrate(&conn)?;
        debug!("database ready");
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Background {
            op,
            message: e.to_string(),
        })?
    }

    /// Round-trips a trivial query. Used by the readiness probe.
    pub async fn ping(&self) -> Result<()> {
        self.with_conn("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

pub(crate) fn from_millis(column: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::corrupt(column, millis))
}

pub(crate) fn opt_from_millis(
    column: &'static str,
    millis: Option<i64>,
) -> Result<Option<DateTime<Utc>>> {
    millis.map(|m| from_millis(column, m)).transpose()
}
