//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.  The connection sits
//! behind a mutex so one handle can be shared across tasks.  The async
//! store traits run their queries through [`Database::blocking`], which
//! moves them onto tokio's blocking pool.
//!
//! Live subscriptions are not a SQLite feature.  Writers publish the new
//! snapshot through a [`SnapshotHub`] while still holding the connection
//! lock, so subscribers observe writes in commit order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use charlink_shared::{Character, CharacterId, ConversationKey};
use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::hub::SnapshotHub;
use crate::log::SharedSnapshot;
use crate::migrations;

/// Cloning is cheap; clones share the connection and the hubs.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    pub(crate) conversations: Arc<SnapshotHub<ConversationKey, SharedSnapshot>>,
    pub(crate) characters: Arc<SnapshotHub<CharacterId, Option<Character>>>,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/charlink/charlink.db`
    /// - macOS:   `~/Library/Application Support/com.charlink.charlink/charlink.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\charlink\charlink\data\charlink.db`
    pub fn open() -> Result<Self> {
        let db_path = default_path()?;
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            conversations: Arc::new(SnapshotHub::new()),
            characters: Arc::new(SnapshotHub::new()),
        })
    }

    /// Lock the underlying connection.
    ///
    /// Callers should prefer the typed CRUD helpers.  A poisoned lock is
    /// recovered: every helper leaves the connection in a usable state.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `work` on the blocking thread pool with a handle to this
    /// database.
    pub async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Filesystem path of the open database, `None` for in-memory ones.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// `<data dir>/charlink.db`.
pub fn default_path() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("com", "charlink", "charlink").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().join("charlink.db"))
}

// ---------------------------------------------------------------------------
// Column helpers shared by the CRUD modules
// ---------------------------------------------------------------------------

/// Fixed-width so that text ordering matches time ordering.
pub(crate) fn encode_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn corrupt(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    conversion_error(idx, StoreCorruption(format!("unknown {what} '{raw}'")))
}

#[derive(Debug)]
struct StoreCorruption(String);

impl std::fmt::Display for StoreCorruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StoreCorruption {}

pub(crate) fn query_error(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => {
            StoreError::Corrupt(inner.to_string())
        }
        other => StoreError::Sqlite(other),
    }
}
