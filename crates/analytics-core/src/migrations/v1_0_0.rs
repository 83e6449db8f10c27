//! Migration v1.0.0: Daily rollup tables.
//!
//! This migration adds the pre-aggregated tables read by the stats API:
//! - Global, per-tool, per-backend-type and per-(tool, backend-type) daily stats
//! - Combined DAU (downloads + version requests) and trailing 30-day MAU
//! - Daily version-request stats
//! - `downloads_daily`, the compaction target for raw downloads past retention

use super::Migration;

/// Version number: 1_000_000 represents v1.0.0
/// Format: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
pub const VERSION: i64 = 1_000_000;

const ADD_COLUMNS: &[(&str, &str, &str)] = &[];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.0.0: Daily rollup tables",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
-- ============================================================================
-- Toolpulse v1.0.0 Schema Migration
-- Daily rollups
-- ============================================================================

-- ----------------------------------------------------------------------------
-- 1. GLOBAL DAILY STATS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_stats (
    date TEXT PRIMARY KEY,
    total_downloads INTEGER NOT NULL,
    unique_users INTEGER NOT NULL
);

-- ----------------------------------------------------------------------------
-- 2. PER-TOOL DAILY STATS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_tool_stats (
    date TEXT NOT NULL,
    tool_id INTEGER NOT NULL,
    downloads INTEGER NOT NULL,
    unique_users INTEGER NOT NULL,
    PRIMARY KEY (date, tool_id)
);

CREATE INDEX IF NOT EXISTS idx_daily_tool_stats_tool ON daily_tool_stats(tool_id, date);

-- ----------------------------------------------------------------------------
-- 3. PER-BACKEND-TYPE DAILY STATS
-- backend_type is the prefix of backends.full before the first ':'
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_backend_stats (
    date TEXT NOT NULL,
    backend_type TEXT NOT NULL,
    downloads INTEGER NOT NULL,
    unique_users INTEGER NOT NULL,
    PRIMARY KEY (date, backend_type)
);

-- ----------------------------------------------------------------------------
-- 4. PER-(TOOL, BACKEND-TYPE) DAILY STATS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_tool_backend_stats (
    date TEXT NOT NULL,
    tool_id INTEGER NOT NULL,
    backend_type TEXT NOT NULL,
    downloads INTEGER NOT NULL,
    PRIMARY KEY (date, tool_id, backend_type)
);

CREATE INDEX IF NOT EXISTS idx_daily_tool_backend_type ON daily_tool_backend_stats(backend_type, date);

-- ----------------------------------------------------------------------------
-- 5. COMBINED DAU (downloads + version requests)
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_combined_stats (
    date TEXT PRIMARY KEY,
    unique_users INTEGER NOT NULL
);

-- ----------------------------------------------------------------------------
-- 6. TRAILING 30-DAY MAU SNAPSHOT
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_mau_stats (
    date TEXT PRIMARY KEY,
    mau INTEGER NOT NULL
);

-- ----------------------------------------------------------------------------
-- 7. VERSION REQUEST DAILY STATS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS daily_version_stats (
    date TEXT PRIMARY KEY,
    total_requests INTEGER NOT NULL,
    unique_users INTEGER NOT NULL
);

-- ----------------------------------------------------------------------------
-- 8. COMPACTED DOWNLOADS
-- Missing backend/platform are stored as 0 so the natural key is enforceable
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS downloads_daily (
    tool_id INTEGER NOT NULL,
    backend_id INTEGER NOT NULL DEFAULT 0,
    version TEXT NOT NULL,
    platform_id INTEGER NOT NULL DEFAULT 0,
    date TEXT NOT NULL,
    count INTEGER NOT NULL,
    unique_ips INTEGER NOT NULL,
    UNIQUE (tool_id, backend_id, version, platform_id, date)
);

CREATE INDEX IF NOT EXISTS idx_downloads_daily_tool_date ON downloads_daily(tool_id, date);
"#;
