//! Read-side stats queries
//!
//! Time series and rankings come from the rollup tables. Totals and
//! breakdowns (by version, os, arch) add raw downloads to the compacted
//! `downloads_daily` rows so history survives compaction.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use toolpulse_analytics_core::days::{format_date, shift, trailing_dates};
use toolpulse_analytics_core::{AnalyticsError, Result};

use crate::events::find_tool_id;
use crate::growth::DailyPoint;

/// Versions listed in a tool's breakdown
pub const VERSION_BREAKDOWN_LIMIT: usize = 20;

/// Tools listed per backend type
pub const TOOLS_PER_BACKEND: usize = 5;

/// (from, to) inclusive date strings for the `days` ending on `today`
fn range(today: NaiveDate, days: i64) -> (String, String) {
    (format_date(shift(today, -(days - 1))), format_date(today))
}

/// Downloads grouped under one key (a version, an os, a tool, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakdown {
    pub key: String,
    pub downloads: i64,
}

fn sorted_breakdown(map: HashMap<String, i64>, limit: Option<usize>) -> Vec<Breakdown> {
    let mut items: Vec<Breakdown> = map
        .into_iter()
        .map(|(key, downloads)| Breakdown { key, downloads })
        .collect();
    items.sort_by(|a, b| b.downloads.cmp(&a.downloads).then_with(|| a.key.cmp(&b.key)));
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

fn require_tool(conn: &Connection, tool: &str) -> Result<i64> {
    find_tool_id(conn, tool)?
        .ok_or_else(|| AnalyticsError::NotFound(format!("Tool '{}' not found", tool)))
}

// =============================================================================
// Per-tool stats
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStats {
    pub tool: String,
    pub total_downloads: i64,
    /// Last 30 days, oldest first, zero-filled
    pub daily: Vec<DailyPoint>,
    pub by_version: Vec<Breakdown>,
    pub by_os: Vec<Breakdown>,
    pub by_arch: Vec<Breakdown>,
}

/// Download breakdown for one tool as of `today`
pub fn tool_stats(conn: &Connection, tool: &str, today: NaiveDate) -> Result<ToolStats> {
    let tool_id = require_tool(conn, tool)?;

    let total_downloads: i64 = conn.query_row(
        r#"
        SELECT (SELECT COUNT(*) FROM downloads WHERE tool_id = ?1)
             + (SELECT COALESCE(SUM(count), 0) FROM downloads_daily WHERE tool_id = ?1)
        "#,
        [tool_id],
        |row| row.get(0),
    )?;

    let (from, to) = range(today, 30);
    let mut stmt = conn.prepare(
        "SELECT date, downloads FROM daily_tool_stats WHERE tool_id = ?1 AND date >= ?2 AND date <= ?3",
    )?;
    let by_date = stmt
        .query_map(params![tool_id, from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    let daily = trailing_dates(today, 30)
        .into_iter()
        .map(|d| {
            let date = format_date(d);
            let downloads = by_date.get(&date).copied().unwrap_or(0);
            DailyPoint { date, downloads }
        })
        .collect();

    let mut stmt = conn.prepare(
        r#"
        SELECT version, SUM(n) FROM (
            SELECT version, COUNT(*) AS n FROM downloads WHERE tool_id = ?1 GROUP BY version
            UNION ALL
            SELECT version, SUM(count) AS n FROM downloads_daily WHERE tool_id = ?1 GROUP BY version
        )
        GROUP BY version
        "#,
    )?;
    let versions = stmt
        .query_map([tool_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    // Platform id 0 in downloads_daily and NULL in downloads both mean unspecified
    let mut stmt = conn.prepare(
        r#"
        SELECT COALESCE(NULLIF(p.os, ''), 'unknown'), COALESCE(NULLIF(p.arch, ''), 'unknown'), SUM(n) FROM (
            SELECT platform_id, COUNT(*) AS n FROM downloads WHERE tool_id = ?1 GROUP BY platform_id
            UNION ALL
            SELECT NULLIF(platform_id, 0), SUM(count) AS n FROM downloads_daily WHERE tool_id = ?1 GROUP BY platform_id
        ) x
        LEFT JOIN platforms p ON p.id = x.platform_id
        GROUP BY 1, 2
        "#,
    )?;
    let platforms = stmt
        .query_map([tool_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut by_os: HashMap<String, i64> = HashMap::new();
    let mut by_arch: HashMap<String, i64> = HashMap::new();
    for (os, arch, n) in platforms {
        *by_os.entry(os).or_default() += n;
        *by_arch.entry(arch).or_default() += n;
    }

    Ok(ToolStats {
        tool: tool.to_string(),
        total_downloads,
        daily,
        by_version: sorted_breakdown(versions, Some(VERSION_BREAKDOWN_LIMIT)),
        by_os: sorted_breakdown(by_os, None),
        by_arch: sorted_breakdown(by_arch, None),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyPoint {
    /// `YYYY-MM`
    pub month: String,
    pub downloads: i64,
}

/// Downloads per calendar month for one tool, oldest first
pub fn tool_monthly(conn: &Connection, tool: &str) -> Result<Vec<MonthlyPoint>> {
    let tool_id = require_tool(conn, tool)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT substr(date, 1, 7) AS month, SUM(downloads)
        FROM daily_tool_stats
        WHERE tool_id = ?1
        GROUP BY month
        ORDER BY month
        "#,
    )?;
    let points = stmt
        .query_map([tool_id], |row| {
            Ok(MonthlyPoint {
                month: row.get(0)?,
                downloads: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(points)
}

// =============================================================================
// Rankings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopTool {
    pub tool: String,
    pub downloads: i64,
}

/// Tools with the most downloads over the `days` ending `today`
pub fn top_tools(conn: &Connection, days: i64, limit: usize, today: NaiveDate) -> Result<Vec<TopTool>> {
    let (from, to) = range(today, days);
    let mut stmt = conn.prepare(
        r#"
        SELECT t.name, SUM(s.downloads) AS total
        FROM daily_tool_stats s
        JOIN tools t ON t.id = s.tool_id
        WHERE s.date >= ?1 AND s.date <= ?2
        GROUP BY t.name
        ORDER BY total DESC, t.name ASC
        LIMIT ?3
        "#,
    )?;
    let tools = stmt
        .query_map(params![from, to, limit as i64], |row| {
            Ok(TopTool {
                tool: row.get(0)?,
                downloads: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tools)
}

/// Downloads over the last 30 days keyed by tool name
pub fn downloads_30d(conn: &Connection, today: NaiveDate) -> Result<BTreeMap<String, i64>> {
    let (from, to) = range(today, 30);
    let mut stmt = conn.prepare(
        r#"
        SELECT t.name, SUM(s.downloads)
        FROM daily_tool_stats s
        JOIN tools t ON t.id = s.tool_id
        WHERE s.date >= ?1 AND s.date <= ?2
        GROUP BY t.name
        "#,
    )?;
    let counts = stmt
        .query_map(params![from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
}

// =============================================================================
// Active users
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPoint {
    pub date: String,
    pub users: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUsers {
    pub dau: Vec<UserPoint>,
    pub mau: Vec<UserPoint>,
    /// Most recent MAU snapshot on or before `today`
    pub current_mau: i64,
}

fn user_series(
    conn: &Connection,
    sql: &str,
    today: NaiveDate,
    days: i64,
) -> Result<Vec<UserPoint>> {
    let (from, to) = range(today, days);
    let mut stmt = conn.prepare(sql)?;
    let by_date = stmt
        .query_map(params![from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(trailing_dates(today, days)
        .into_iter()
        .map(|d| {
            let date = format_date(d);
            let users = by_date.get(&date).copied().unwrap_or(0);
            UserPoint { date, users }
        })
        .collect())
}

/// DAU and MAU series over the `days` ending `today`, zero-filled
pub fn active_users(conn: &Connection, days: i64, today: NaiveDate) -> Result<ActiveUsers> {
    let dau = user_series(
        conn,
        "SELECT date, unique_users FROM daily_combined_stats WHERE date >= ?1 AND date <= ?2",
        today,
        days,
    )?;
    let mau = user_series(
        conn,
        "SELECT date, mau FROM daily_mau_stats WHERE date >= ?1 AND date <= ?2",
        today,
        days,
    )?;
    let current_mau: i64 = conn.query_row(
        "SELECT COALESCE((SELECT mau FROM daily_mau_stats WHERE date <= ?1 ORDER BY date DESC LIMIT 1), 0)",
        [format_date(today)],
        |row| row.get(0),
    )?;
    Ok(ActiveUsers {
        dau,
        mau,
        current_mau,
    })
}

// =============================================================================
// Backends
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendUsage {
    pub backend_type: String,
    pub downloads: i64,
    pub top_tools: Vec<TopTool>,
}

/// Downloads per backend type with its most downloaded tools
pub fn backend_stats(conn: &Connection, days: i64, today: NaiveDate) -> Result<Vec<BackendUsage>> {
    let (from, to) = range(today, days);

    let mut stmt = conn.prepare(
        r#"
        SELECT backend_type, SUM(downloads) AS total
        FROM daily_backend_stats
        WHERE date >= ?1 AND date <= ?2
        GROUP BY backend_type
        ORDER BY total DESC, backend_type ASC
        "#,
    )?;
    let types = stmt
        .query_map(params![from, to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut tools_stmt = conn.prepare(
        r#"
        SELECT t.name, SUM(s.downloads) AS total
        FROM daily_tool_backend_stats s
        JOIN tools t ON t.id = s.tool_id
        WHERE s.backend_type = ?1 AND s.date >= ?2 AND s.date <= ?3
        GROUP BY t.name
        ORDER BY total DESC, t.name ASC
        LIMIT ?4
        "#,
    )?;

    let mut usage = Vec::with_capacity(types.len());
    for (backend_type, downloads) in types {
        let top_tools = tools_stmt
            .query_map(
                params![backend_type, from, to, TOOLS_PER_BACKEND as i64],
                |row| {
                    Ok(TopTool {
                        tool: row.get(0)?,
                        downloads: row.get(1)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        usage.push(BackendUsage {
            backend_type,
            downloads,
            top_tools,
        });
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use crate::rollups::{populate_mau_for_date, populate_rollups_for_date};
    use toolpulse_analytics_core::days::{day_start, parse_date};
    use toolpulse_analytics_core::{ensure_schema, DownloadEvent};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn record(conn: &Connection, tool: &str, version: &str, actor: &str, os: Option<&str>, backend: Option<&str>, on: NaiveDate) {
        let event = DownloadEvent {
            tool: tool.to_string(),
            version: version.to_string(),
            actor: actor.to_string(),
            os: os.map(str::to_string),
            arch: os.map(|_| "x64".to_string()),
            backend: backend.map(str::to_string),
        };
        EventStore::new(conn)
            .record_download_at(&event, day_start(on) + 100)
            .unwrap();
    }

    /// Three days of activity for node and jq, rolled up
    fn seeded() -> (Connection, NaiveDate) {
        let conn = setup();
        let today = date("2024-06-30");
        for offset in 0..3 {
            let day = shift(today, -offset);
            record(&conn, "node", "20.0.0", "a1", Some("linux"), Some("core:node"), day);
            record(&conn, "node", "18.0.0", "a2", Some("macos"), Some("core:node"), day);
            record(&conn, "jq", "1.7", "a3", None, Some("aqua:jqlang/jq"), day);
            populate_rollups_for_date(&conn, day).unwrap();
            populate_mau_for_date(&conn, day).unwrap();
        }
        (conn, today)
    }

    #[test]
    fn test_tool_stats() {
        let (conn, today) = seeded();
        let stats = tool_stats(&conn, "node", today).unwrap();

        assert_eq!(stats.total_downloads, 6);
        assert_eq!(stats.daily.len(), 30);
        assert_eq!(stats.daily[29].downloads, 2);
        assert_eq!(stats.daily[0].downloads, 0);
        assert_eq!(stats.by_version.len(), 2);
        assert_eq!(stats.by_os.len(), 2);
        assert_eq!(
            stats.by_arch,
            vec![Breakdown {
                key: "x64".to_string(),
                downloads: 6
            }]
        );
    }

    #[test]
    fn test_tool_stats_include_compacted() {
        let (conn, today) = seeded();
        crate::compaction::compact_older_than(&conn, 0, day_start(shift(today, 1))).unwrap();

        let stats = tool_stats(&conn, "node", today).unwrap();
        assert_eq!(stats.total_downloads, 6);
        assert_eq!(stats.by_os.iter().map(|b| b.downloads).sum::<i64>(), 6);

        let jq = tool_stats(&conn, "jq", today).unwrap();
        assert_eq!(jq.by_os[0].key, "unknown");
    }

    #[test]
    fn test_tool_stats_unknown_tool() {
        let conn = setup();
        assert!(matches!(
            tool_stats(&conn, "missing", date("2024-06-30")),
            Err(AnalyticsError::NotFound(_))
        ));
    }

    #[test]
    fn test_tool_monthly() {
        let conn = setup();
        conn.execute_batch(
            "INSERT INTO tools (name) VALUES ('node');
             INSERT INTO daily_tool_stats VALUES ('2024-05-31', 1, 4, 4);
             INSERT INTO daily_tool_stats VALUES ('2024-06-01', 1, 2, 2);
             INSERT INTO daily_tool_stats VALUES ('2024-06-02', 1, 3, 3);",
        )
        .unwrap();
        let months = tool_monthly(&conn, "node").unwrap();
        assert_eq!(
            months,
            vec![
                MonthlyPoint { month: "2024-05".to_string(), downloads: 4 },
                MonthlyPoint { month: "2024-06".to_string(), downloads: 5 },
            ]
        );
    }

    #[test]
    fn test_top_tools_and_30d() {
        let (conn, today) = seeded();
        let top = top_tools(&conn, 7, 1, today).unwrap();
        assert_eq!(top, vec![TopTool { tool: "node".to_string(), downloads: 6 }]);

        let counts = downloads_30d(&conn, today).unwrap();
        assert_eq!(counts.get("node"), Some(&6));
        assert_eq!(counts.get("jq"), Some(&3));
    }

    #[test]
    fn test_active_users() {
        let (conn, today) = seeded();
        let users = active_users(&conn, 5, today).unwrap();
        assert_eq!(users.dau.len(), 5);
        assert_eq!(users.dau[4].users, 3);
        assert_eq!(users.dau[0].users, 0);
        assert_eq!(users.current_mau, 3);
    }

    #[test]
    fn test_backend_stats() {
        let (conn, today) = seeded();
        let backends = backend_stats(&conn, 7, today).unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].backend_type, "core");
        assert_eq!(backends[0].downloads, 6);
        assert_eq!(backends[0].top_tools[0].tool, "node");
        assert_eq!(backends[1].backend_type, "aqua");
        assert_eq!(backends[1].top_tools[0].tool, "jq");
    }
}
