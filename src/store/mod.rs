//! SQLite-backed store for devices, jobs, runs and settings
//!
//! Every public method takes the connection lock for the duration of one
//! statement (or one short transaction), so concurrent tasks interleave at
//! record granularity.

mod ban;
mod devices;
mod events;
mod jobs;
pub mod models;
mod runs;
mod schema;
mod settings;

use crate::{WatchError, WatchResult};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use devices::Upsert;
pub use models::*;

/// Database wrapper with thread-safe connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> WatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        // CLI and daemon share the file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database (for testing)
    pub fn in_memory() -> WatchResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&self) -> WatchResult<()> {
        let conn = self.lock()?;
        schema::create_tables(&conn)?;
        Ok(())
    }

    fn lock(&self) -> WatchResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| WatchError::LockPoisoned)
    }
}

/// Parse a text column into `T`, reporting failures as a conversion error
pub(crate) fn parse_column<T>(idx: usize, text: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a JSON text column
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
