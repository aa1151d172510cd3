//! Durable conversation store backed by SQLite
//!
//! `SqliteStore` persists sessions, conversation events, approvals, and the
//! passive records attached to them. Every multi-row write runs inside a
//! single transaction, and session status changes are validated against the
//! state machine before they are written.
//!
//! The connection sits behind a mutex, so writes are serialized process-wide;
//! in particular conversation appends for one session can never race on
//! `sequence`. Locks are never held across an `.await`, and async callers
//! reach the database through [`SqliteStore::run_blocking`].

mod approvals;
mod conversation;
pub mod migrations;
mod records;
mod sessions;

pub use sessions::SessionChange;

use crate::error::{Result, SessionError};
use crate::types::from_millis;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long SQLite waits on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store shared by every component
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`, applying pending migrations
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, path = %path.display(), "Opening store");
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let applied = migrations::migrate(&mut conn)?;
        tracing::debug!(applied, "Store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the store on the blocking thread pool
    ///
    /// SQLite calls may wait up to the busy timeout, so async tasks never
    /// call the store directly.
    pub async fn run_blocking<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&SqliteStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SessionError::Fatal(format!("Store task failed: {}", e)))?
    }

    /// Schema version recorded in the database
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        migrations::current_version(&conn)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SessionError::Fatal(format!("Store lock poisoned: {}", e)))
    }
}

/// Map a constraint violation to a domain error, passing other failures through
pub(crate) fn on_constraint(
    err: rusqlite::Error,
    f: impl FnOnce() -> SessionError,
) -> SessionError {
    if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
        f()
    } else {
        SessionError::Storage(err)
    }
}

/// Decode a string column into a typed enum
pub(crate) fn enum_column<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = SessionError>,
{
    let idx = row.as_ref().column_index(name)?;
    let value: String = row.get(idx)?;
    value.parse().map_err(|e: SessionError| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

/// Decode a nullable string column into a typed enum
pub(crate) fn opt_enum_column<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = SessionError>,
{
    let idx = row.as_ref().column_index(name)?;
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| {
            v.parse().map_err(|e: SessionError| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .transpose()
}

pub(crate) fn timestamp(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(name)?))
}

pub(crate) fn opt_timestamp(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(name)?.map(from_millis))
}

pub(crate) fn json_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub(crate) fn to_json_list(values: &[String]) -> Result<Option<String>> {
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(values)?))
    }
}
