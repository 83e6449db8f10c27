//! Normalized event store
//!
//! Raw downloads and version requests are append-only. High-cardinality
//! strings (tool names, backend identifiers, platforms) are interned into
//! lookup tables and referenced by integer id.
//!
//! Lookup rows are created lazily with `INSERT OR IGNORE` followed by a
//! re-select, so two writers racing on the same new name converge on one id.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use toolpulse_analytics_core::days::{date_of, day_bounds, now_ts};
use toolpulse_analytics_core::validation::{normalize_optional, validate_download};
use toolpulse_analytics_core::{DownloadEvent, Result};
use tracing::debug;

/// Per-call memo of resolved lookup ids.
///
/// Lookup rows are never renamed or deleted, so entries never go stale.
#[derive(Debug, Default)]
pub struct LookupCache {
    tools: HashMap<String, i64>,
    backends: HashMap<String, i64>,
    platforms: HashMap<(String, String), i64>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve (creating if needed) the id of a tool
    pub fn tool_id(&mut self, conn: &Connection, name: &str) -> Result<i64> {
        if let Some(id) = self.tools.get(name) {
            return Ok(*id);
        }
        conn.execute("INSERT OR IGNORE INTO tools (name) VALUES (?1)", [name])?;
        let id: i64 = conn.query_row("SELECT id FROM tools WHERE name = ?1", [name], |row| {
            row.get(0)
        })?;
        self.tools.insert(name.to_string(), id);
        Ok(id)
    }

    /// Resolve (creating if needed) the id of a full backend identifier
    pub fn backend_id(&mut self, conn: &Connection, full: &str) -> Result<i64> {
        if let Some(id) = self.backends.get(full) {
            return Ok(*id);
        }
        conn.execute("INSERT OR IGNORE INTO backends (full) VALUES (?1)", [full])?;
        let id: i64 = conn.query_row("SELECT id FROM backends WHERE full = ?1", [full], |row| {
            row.get(0)
        })?;
        self.backends.insert(full.to_string(), id);
        Ok(id)
    }

    /// Resolve the platform id for an (os, arch) pair.
    ///
    /// Returns `None` when both sides are unspecified.
    pub fn platform_id(
        &mut self,
        conn: &Connection,
        os: Option<&str>,
        arch: Option<&str>,
    ) -> Result<Option<i64>> {
        if os.is_none() && arch.is_none() {
            return Ok(None);
        }
        let key = (os.unwrap_or("").to_string(), arch.unwrap_or("").to_string());
        if let Some(id) = self.platforms.get(&key) {
            return Ok(Some(*id));
        }
        conn.execute(
            "INSERT OR IGNORE INTO platforms (os, arch) VALUES (?1, ?2)",
            params![key.0, key.1],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM platforms WHERE os = ?1 AND arch = ?2",
            params![key.0, key.1],
            |row| row.get(0),
        )?;
        self.platforms.insert(key, id);
        Ok(Some(id))
    }
}

/// Result of recording a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    /// True when an identical (tool, version, actor) download already exists today
    pub deduplicated: bool,
}

/// Event writer bound to one connection and one lookup cache
pub struct EventStore<'c> {
    conn: &'c Connection,
    cache: LookupCache,
}

impl<'c> EventStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            cache: LookupCache::new(),
        }
    }

    /// Record a download at the current time
    pub fn record_download(&mut self, event: &DownloadEvent) -> Result<RecordOutcome> {
        self.record_download_at(event, now_ts())
    }

    /// Record a download at `now` (Unix seconds).
    ///
    /// At most one row is stored per (tool, version, actor) per UTC day;
    /// repeats return `deduplicated: true` and write nothing to `downloads`.
    /// Lookup rows may still be created for a deduplicated call.
    pub fn record_download_at(&mut self, event: &DownloadEvent, now: i64) -> Result<RecordOutcome> {
        validate_download(event)?;

        let tool = event.tool.trim();
        let version = event.version.trim();
        let os = normalize_optional(event.os.as_deref());
        let arch = normalize_optional(event.arch.as_deref());
        let backend = normalize_optional(event.backend.as_deref());

        let tool_id = self.cache.tool_id(self.conn, tool)?;

        let (start, end) = day_bounds(date_of(now));
        let existing: Option<i64> = self
            .conn
            .query_row(
                r#"
                SELECT id FROM downloads
                WHERE tool_id = ?1 AND version = ?2 AND ip_hash = ?3
                  AND created_at >= ?4 AND created_at < ?5
                LIMIT 1
                "#,
                params![tool_id, version, event.actor, start, end],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_some() {
            debug!(tool, version, "Duplicate download within day, skipping");
            return Ok(RecordOutcome { deduplicated: true });
        }

        let backend_id = match backend.as_deref() {
            Some(full) => Some(self.cache.backend_id(self.conn, full)?),
            None => None,
        };
        let platform_id = self
            .cache
            .platform_id(self.conn, os.as_deref(), arch.as_deref())?;

        self.conn.execute(
            r#"
            INSERT INTO downloads (tool_id, backend_id, version, platform_id, ip_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![tool_id, backend_id, version, platform_id, event.actor, now],
        )?;

        Ok(RecordOutcome {
            deduplicated: false,
        })
    }

    /// Record a version-check ping at the current time
    pub fn record_version_request(&mut self, actor: &str, tool: Option<&str>) -> Result<()> {
        self.record_version_request_at(actor, tool, now_ts())
    }

    /// Record a version-check ping at `now`. Always inserts.
    pub fn record_version_request_at(
        &mut self,
        actor: &str,
        tool: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let tool = normalize_optional(tool);
        self.conn.execute(
            "INSERT INTO version_requests (tool, ip_hash, created_at) VALUES (?1, ?2, ?3)",
            params![tool, actor, now],
        )?;
        Ok(())
    }
}

/// Look up a tool's id without creating it
pub fn find_tool_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT id FROM tools WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolpulse_analytics_core::days::{day_start, SECONDS_PER_DAY};
    use toolpulse_analytics_core::ensure_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn ts(date: &str) -> i64 {
        day_start(toolpulse_analytics_core::days::parse_date(date).unwrap())
    }

    fn download(tool: &str, version: &str, actor: &str) -> DownloadEvent {
        DownloadEvent {
            tool: tool.to_string(),
            version: version.to_string(),
            actor: actor.to_string(),
            ..Default::default()
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_dedup_within_day() {
        let conn = setup();
        let mut store = EventStore::new(&conn);
        let day = ts("2024-06-01");

        let first = store
            .record_download_at(&download("node", "20.0.0", "a1"), day + 10)
            .unwrap();
        let second = store
            .record_download_at(&download("node", "20.0.0", "a1"), day + 3_600)
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(count(&conn, "downloads"), 1);
    }

    #[test]
    fn test_next_day_inserts_again() {
        let conn = setup();
        let mut store = EventStore::new(&conn);
        let day = ts("2024-06-01");

        store
            .record_download_at(&download("node", "20.0.0", "a1"), day + SECONDS_PER_DAY - 1)
            .unwrap();
        let next = store
            .record_download_at(&download("node", "20.0.0", "a1"), day + SECONDS_PER_DAY)
            .unwrap();

        assert!(!next.deduplicated);
        assert_eq!(count(&conn, "downloads"), 2);
    }

    #[test]
    fn test_dedup_key_is_tool_version_actor() {
        let conn = setup();
        let mut store = EventStore::new(&conn);
        let now = ts("2024-06-01") + 100;

        store.record_download_at(&download("node", "20.0.0", "a1"), now).unwrap();
        store.record_download_at(&download("node", "20.1.0", "a1"), now).unwrap();
        store.record_download_at(&download("node", "20.0.0", "a2"), now).unwrap();
        store.record_download_at(&download("python", "3.12", "a1"), now).unwrap();

        assert_eq!(count(&conn, "downloads"), 4);
    }

    #[test]
    fn test_lookup_rows_are_shared() {
        let conn = setup();
        let now = ts("2024-06-01");

        let mut event = download("node", "20.0.0", "a1");
        event.os = Some("linux".to_string());
        event.arch = Some("x64".to_string());
        event.backend = Some("core:node".to_string());

        EventStore::new(&conn).record_download_at(&event, now).unwrap();
        event.actor = "a2".to_string();
        // A fresh store has an empty cache and must re-resolve the same ids
        EventStore::new(&conn).record_download_at(&event, now).unwrap();

        assert_eq!(count(&conn, "tools"), 1);
        assert_eq!(count(&conn, "backends"), 1);
        assert_eq!(count(&conn, "platforms"), 1);

        let distinct_platforms: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT platform_id) FROM downloads",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(distinct_platforms, 1);
    }

    #[test]
    fn test_missing_platform_and_backend_are_null() {
        let conn = setup();
        EventStore::new(&conn)
            .record_download_at(&download("node", "20.0.0", "a1"), 0)
            .unwrap();

        let (platform, backend): (Option<i64>, Option<i64>) = conn
            .query_row("SELECT platform_id, backend_id FROM downloads", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(platform.is_none());
        assert!(backend.is_none());
        assert_eq!(count(&conn, "platforms"), 0);
    }

    #[test]
    fn test_partial_platform() {
        let conn = setup();
        let mut cache = LookupCache::new();
        let a = cache.platform_id(&conn, Some("linux"), None).unwrap();
        let b = cache.platform_id(&conn, None, Some("linux")).unwrap();
        assert!(a.is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_download_writes_nothing() {
        let conn = setup();
        let mut store = EventStore::new(&conn);

        assert!(store.record_download_at(&download("", "1.0", "a1"), 0).is_err());
        assert!(store.record_download_at(&download("node", " ", "a1"), 0).is_err());

        assert_eq!(count(&conn, "downloads"), 0);
        assert_eq!(count(&conn, "tools"), 0);
    }

    #[test]
    fn test_version_requests_never_dedup() {
        let conn = setup();
        let mut store = EventStore::new(&conn);
        store.record_version_request_at("a1", None, 10).unwrap();
        store.record_version_request_at("a1", None, 10).unwrap();
        store.record_version_request_at("a1", Some("node"), 10).unwrap();
        assert_eq!(count(&conn, "version_requests"), 3);
    }

    #[test]
    fn test_find_tool_id() {
        let conn = setup();
        assert_eq!(find_tool_id(&conn, "node").unwrap(), None);
        EventStore::new(&conn)
            .record_download_at(&download("node", "20.0.0", "a1"), 0)
            .unwrap();
        assert!(find_tool_id(&conn, "node").unwrap().is_some());
    }
}
