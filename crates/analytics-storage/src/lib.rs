//! Toolpulse Analytics Storage
//!
//! Storage backend abstraction for the analytics database.
//! The primary backend is a local SQLite file.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolpulse_analytics_core::{ensure_schema, AnalyticsError, Result};

pub mod batch;

pub use batch::{for_each_chunk, MAX_BATCH_STATEMENTS};

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend abstraction for analytics storage
///
/// Every connection handed out has the schema brought up to date, so
/// callers never see a partially migrated database.
pub trait AnalyticsBackend: Send + Sync {
    /// Open a connection to the analytics database
    fn get_connection(&self) -> Result<Connection>;

    /// Check if the database exists
    fn exists(&self) -> Result<bool>;

    /// Initialize a new database (create the file and schema)
    fn initialize(&self) -> Result<()>;
}

/// Local filesystem SQLite backend
#[derive(Clone, Debug)]
pub struct LocalSqliteBackend {
    /// Path to the SQLite database file
    path: PathBuf,
}

impl LocalSqliteBackend {
    /// Create a new local SQLite backend
    ///
    /// # Example
    /// ```
    /// use toolpulse_analytics_storage::LocalSqliteBackend;
    ///
    /// let backend = LocalSqliteBackend::new("analytics.db");
    /// ```
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the path to the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it can't go through execute_batch
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

impl AnalyticsBackend for LocalSqliteBackend {
    fn get_connection(&self) -> Result<Connection> {
        let conn = self.open()?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn initialize(&self) -> Result<()> {
        if self.exists()? {
            return Err(AnalyticsError::Other(format!(
                "Analytics database already exists at {:?}",
                self.path
            )));
        }

        let conn = self.open()?;
        ensure_schema(&conn)?;
        tracing::info!(path = ?self.path, "Initialized analytics database");

        Ok(())
    }
}
