//! Toolpulse Analytics Core
//!
//! Core types, errors, and the SQLite schema for the Toolpulse download
//! analytics service.

use serde::{Deserialize, Serialize};

pub mod days;
pub mod migrations;
pub mod validation;

/// A single download reported by a client.
///
/// `os`, `arch` and `backend` are optional; a download without them is
/// attributed to the "unspecified" platform and the `unknown` backend type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadEvent {
    /// Tool name (e.g. "node")
    pub tool: String,
    /// Version string as requested by the client (e.g. "20.0.0")
    pub version: String,
    /// Pseudonymous actor fingerprint
    pub actor: String,
    /// Operating system reported by the client
    pub os: Option<String>,
    /// CPU architecture reported by the client
    pub arch: Option<String>,
    /// Full backend identifier (e.g. "aqua:nodejs/node")
    pub backend: Option<String>,
}

/// Display metadata for a tool, owned by the external sync process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    pub repo_url: Option<String>,
    /// Ordered list of backend identifiers; the first one is the primary backend
    #[serde(default)]
    pub backends: Vec<String>,
    /// Security attestations (checksums, provenance, ...) as free-form JSON
    #[serde(default)]
    pub security: Option<serde_json::Value>,
    pub aqua_link: Option<String>,
    pub latest_version: Option<String>,
    pub version_count: Option<i64>,
    pub last_updated: Option<String>,
}

/// One entry in a tool's version catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub version: String,
    pub created_at: Option<String>,
    pub release_url: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
}

/// An externally issued API credential held in the token pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: i64,
    /// Identifier of the user who granted the token
    pub user_id: String,
    /// Secret value; never serialized in API responses
    #[serde(skip_serializing)]
    pub token: String,
    pub is_active: bool,
    pub usage_count: i64,
    /// Unix seconds
    pub last_used: Option<i64>,
    /// Unix seconds
    pub last_validated: Option<i64>,
    /// Unix seconds
    pub expires_at: Option<i64>,
    /// Unix seconds; the token is skipped by selection until this passes
    pub rate_limited_until: Option<i64>,
    pub created_at: i64,
}

/// Errors that can occur in analytics operations
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(e: serde_json::Error) -> Self {
        AnalyticsError::SerializationError(e.to_string())
    }
}

/// Result type for analytics operations
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Initialize the base SQLite schema
///
/// Creates the lookup and raw event tables if they don't exist:
/// - `tools`: tool name dictionary
/// - `backends`: full backend identifier dictionary
/// - `platforms`: (os, arch) dictionary, `''` meaning unspecified
/// - `downloads`: append-only download events
/// - `version_requests`: append-only "checked for updates" pings
///
/// Rollup tables, the token pool and later columns are added by
/// [`migrations::run_migrations`].
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS tools (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT UNIQUE NOT NULL
    );

    CREATE TABLE IF NOT EXISTS backends (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      full TEXT UNIQUE NOT NULL
    );

    -- NULL would defeat the UNIQUE constraint, so unspecified is ''
    CREATE TABLE IF NOT EXISTS platforms (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      os TEXT NOT NULL DEFAULT '',
      arch TEXT NOT NULL DEFAULT '',
      UNIQUE(os, arch)
    );

    CREATE TABLE IF NOT EXISTS downloads (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tool_id INTEGER NOT NULL,
      version TEXT NOT NULL,
      platform_id INTEGER,
      ip_hash TEXT NOT NULL,
      created_at INTEGER NOT NULL,
      FOREIGN KEY (tool_id) REFERENCES tools(id),
      FOREIGN KEY (platform_id) REFERENCES platforms(id)
    );

    CREATE INDEX IF NOT EXISTS idx_downloads_dedup ON downloads(tool_id, version, ip_hash, created_at);
    CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at);

    CREATE TABLE IF NOT EXISTS version_requests (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tool TEXT,
      ip_hash TEXT NOT NULL,
      created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_version_requests_created_at ON version_requests(created_at);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Bring a connection's database to the current schema.
///
/// Safe to call on every connection open: the base DDL is
/// `IF NOT EXISTS` and applied migrations are skipped.
pub fn ensure_schema(conn: &rusqlite::Connection) -> Result<()> {
    init_sqlite_schema(conn)?;
    let applied = migrations::run_migrations(conn)?;
    if applied > 0 {
        tracing::info!(applied, "Applied schema migrations");
    }
    Ok(())
}
