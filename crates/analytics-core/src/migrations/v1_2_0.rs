//! Migration v1.2.0: Upstream access token pool.
//!
//! This migration adds the `access_tokens` table holding credentials granted
//! through OAuth. Tokens are rotated to spread load across the upstream
//! API's per-credential rate limits.
//!
//! # Lifecycle
//!
//! - `is_active = 1` and `rate_limited_until` NULL or in the past: selectable
//! - `rate_limited_until` in the future: skipped until the reset passes
//! - `is_active = 0`: deactivated (expired, revoked or rejected upstream)

use super::Migration;

/// Version number: 1_002_000 represents v1.2.0
/// Format: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
pub const VERSION: i64 = 1_002_000;

/// No columns to add to existing tables in this migration.
const ADD_COLUMNS: &[(&str, &str, &str)] = &[];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.2.0: Upstream access token pool",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
-- ============================================================================
-- Toolpulse v1.2.0 Schema Migration
-- Access token pool
-- ============================================================================

CREATE TABLE IF NOT EXISTS access_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    -- Upstream user that granted the token
    user_id TEXT NOT NULL,
    token TEXT UNIQUE NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    usage_count INTEGER NOT NULL DEFAULT 0,
    -- All timestamps are Unix seconds
    last_used INTEGER,
    last_validated INTEGER,
    expires_at INTEGER,
    rate_limited_until INTEGER,
    created_at INTEGER NOT NULL,

    CHECK (is_active IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_access_tokens_active ON access_tokens(is_active, last_used);
CREATE INDEX IF NOT EXISTS idx_access_tokens_user ON access_tokens(user_id);
"#;
