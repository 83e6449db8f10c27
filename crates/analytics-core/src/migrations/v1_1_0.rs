//! Migration v1.1.0: Backend attribution and tool metadata.
//!
//! This migration adds:
//! - `downloads.backend_id`, attributing each download to a backend
//! - Display metadata columns on `tools`, written by the metadata sync
//! - `tool_versions`, the per-tool version catalog
//!
//! Downloads recorded before this migration keep a NULL `backend_id` until
//! the backend attribution backfill runs.

use super::Migration;

/// Version number: 1_001_000 represents v1.1.0
/// Format: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
pub const VERSION: i64 = 1_001_000;

/// Columns to add to existing tables.
/// Format: (table_name, column_name, column_type)
const ADD_COLUMNS: &[(&str, &str, &str)] = &[
    ("downloads", "backend_id", "INTEGER REFERENCES backends(id)"),
    ("tools", "description", "TEXT"),
    ("tools", "license", "TEXT"),
    ("tools", "homepage", "TEXT"),
    ("tools", "repo_url", "TEXT"),
    // JSON array of backend identifiers, primary first
    ("tools", "backends", "TEXT"),
    // JSON object of security attestations
    ("tools", "security", "TEXT"),
    ("tools", "aqua_link", "TEXT"),
    ("tools", "latest_version", "TEXT"),
    ("tools", "version_count", "INTEGER"),
    ("tools", "last_updated", "TEXT"),
    ("tools", "metadata_synced_at", "INTEGER"),
];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.1.0: Backend attribution and tool metadata",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
-- ============================================================================
-- Toolpulse v1.1.0 Schema Migration
-- Backend attribution and tool metadata
-- ============================================================================

-- ----------------------------------------------------------------------------
-- 1. VERSION CATALOG
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS tool_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_id INTEGER NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT,
    release_url TEXT,
    prerelease INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (tool_id) REFERENCES tools(id),
    UNIQUE (tool_id, version)
);

CREATE INDEX IF NOT EXISTS idx_tool_versions_tool ON tool_versions(tool_id);
"#;
