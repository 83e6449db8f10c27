//! Daily rollup engine
//!
//! Scans one UTC day of raw events and upserts the pre-aggregated rows read
//! by the stats API. Every write is a full replace keyed by the natural key,
//! so re-running a date against unchanged raw data is a no-op.
//!
//! Rollups are sparse: a date without raw events writes nothing, and rows
//! already present for it are left alone. This keeps rollups of compacted
//! dates intact after their raw rows are gone.
//!
//! A date with rows in `downloads_daily` is skipped entirely: a partial
//! compaction can leave some of its raw rows behind, and recomputing from
//! those would undercount the date.
//!
//! Each run takes the write lock up front, so a rollup overlapping another
//! rollup or a compaction waits for it instead of reading a stale snapshot.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use toolpulse_analytics_core::days::{day_bounds, day_start, format_date, shift, trailing_dates};
use toolpulse_analytics_core::Result;
use tracing::{error, info, warn};

/// Length of the MAU window in days, ending on (and including) the snapshot date
pub const MAU_WINDOW_DAYS: i64 = 30;

/// Backend type of a joined `backends b` row: text before the first ':', or
/// `unknown` when the download has no backend
pub(crate) const BACKEND_TYPE_SQL: &str = r#"
    CASE
        WHEN b.full IS NULL THEN 'unknown'
        WHEN instr(b.full, ':') > 0 THEN substr(b.full, 1, instr(b.full, ':') - 1)
        ELSE b.full
    END
"#;

/// Rows written per rollup table for one date
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RollupCounts {
    pub daily_stats: usize,
    pub tool_stats: usize,
    pub backend_stats: usize,
    pub tool_backend_stats: usize,
    pub combined: usize,
    pub version_stats: usize,
    /// Groups that failed to upsert; the rest of the date is still written
    pub failed: usize,
    /// The date has compacted history and was left untouched
    pub compacted: bool,
}

impl RollupCounts {
    pub fn total(&self) -> usize {
        self.daily_stats
            + self.tool_stats
            + self.backend_stats
            + self.tool_backend_stats
            + self.combined
            + self.version_stats
    }
}

/// Summary of a multi-day backfill
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub days_processed: usize,
    pub mau_days_processed: usize,
    pub failed_days: usize,
}

/// Record one group's upsert outcome without aborting the date
fn tally(result: rusqlite::Result<usize>, ok: &mut usize, failed: &mut usize, table: &str, date: &str) {
    match result {
        Ok(_) => *ok += 1,
        Err(e) => {
            error!(table, date, error = %e, "Rollup upsert failed");
            *failed += 1;
        }
    }
}

/// Whether any raw rows of `date` have been folded into `downloads_daily`
fn is_compacted(tx: &Transaction<'_>, date: &str) -> Result<bool> {
    let found = tx
        .query_row(
            "SELECT 1 FROM downloads_daily WHERE date = ?1 LIMIT 1",
            [date],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Compute and upsert all daily rollups for `date`.
///
/// Runs in one transaction, so readers never see a half-populated date.
pub fn populate_rollups_for_date(conn: &Connection, date: NaiveDate) -> Result<RollupCounts> {
    let (start, end) = day_bounds(date);
    let date_str = format_date(date);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut counts = RollupCounts::default();

    if is_compacted(&tx, &date_str)? {
        tx.commit()?;
        warn!(date = %date_str, "Date has compacted history, rollups left unchanged");
        counts.compacted = true;
        return Ok(counts);
    }

    write_global(&tx, &date_str, start, end, &mut counts)?;
    write_per_tool(&tx, &date_str, start, end, &mut counts)?;
    write_per_backend(&tx, &date_str, start, end, &mut counts)?;

    tx.commit()?;

    info!(
        date = %date_str,
        rows = counts.total(),
        failed = counts.failed,
        "Populated daily rollups"
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_job("rollup", if counts.failed == 0 { "success" } else { "partial" });

    Ok(counts)
}

fn write_global(
    tx: &Transaction<'_>,
    date: &str,
    start: i64,
    end: i64,
    counts: &mut RollupCounts,
) -> Result<()> {
    let (total, unique): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT ip_hash) FROM downloads WHERE created_at >= ?1 AND created_at < ?2",
        params![start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if total > 0 {
        let result = tx.execute(
            r#"
            INSERT INTO daily_stats (date, total_downloads, unique_users) VALUES (?1, ?2, ?3)
            ON CONFLICT(date) DO UPDATE SET
                total_downloads = excluded.total_downloads,
                unique_users = excluded.unique_users
            "#,
            params![date, total, unique],
        );
        tally(result, &mut counts.daily_stats, &mut counts.failed, "daily_stats", date);
    }

    let combined: i64 = tx.query_row(
        r#"
        SELECT COUNT(DISTINCT ip_hash) FROM (
            SELECT ip_hash FROM downloads WHERE created_at >= ?1 AND created_at < ?2
            UNION
            SELECT ip_hash FROM version_requests WHERE created_at >= ?1 AND created_at < ?2
        )
        "#,
        params![start, end],
        |row| row.get(0),
    )?;
    if combined > 0 {
        let result = tx.execute(
            r#"
            INSERT INTO daily_combined_stats (date, unique_users) VALUES (?1, ?2)
            ON CONFLICT(date) DO UPDATE SET unique_users = excluded.unique_users
            "#,
            params![date, combined],
        );
        tally(result, &mut counts.combined, &mut counts.failed, "daily_combined_stats", date);
    }

    let (requests, requesters): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT ip_hash) FROM version_requests WHERE created_at >= ?1 AND created_at < ?2",
        params![start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if requests > 0 {
        let result = tx.execute(
            r#"
            INSERT INTO daily_version_stats (date, total_requests, unique_users) VALUES (?1, ?2, ?3)
            ON CONFLICT(date) DO UPDATE SET
                total_requests = excluded.total_requests,
                unique_users = excluded.unique_users
            "#,
            params![date, requests, requesters],
        );
        tally(result, &mut counts.version_stats, &mut counts.failed, "daily_version_stats", date);
    }

    Ok(())
}

fn write_per_tool(
    tx: &Transaction<'_>,
    date: &str,
    start: i64,
    end: i64,
    counts: &mut RollupCounts,
) -> Result<()> {
    let mut stmt = tx.prepare(
        r#"
        SELECT tool_id, COUNT(*), COUNT(DISTINCT ip_hash)
        FROM downloads
        WHERE created_at >= ?1 AND created_at < ?2
        GROUP BY tool_id
        "#,
    )?;
    let groups = stmt
        .query_map(params![start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (tool_id, downloads, unique) in groups {
        let result = tx.execute(
            r#"
            INSERT INTO daily_tool_stats (date, tool_id, downloads, unique_users) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(date, tool_id) DO UPDATE SET
                downloads = excluded.downloads,
                unique_users = excluded.unique_users
            "#,
            params![date, tool_id, downloads, unique],
        );
        tally(result, &mut counts.tool_stats, &mut counts.failed, "daily_tool_stats", date);
    }
    Ok(())
}

fn write_per_backend(
    tx: &Transaction<'_>,
    date: &str,
    start: i64,
    end: i64,
    counts: &mut RollupCounts,
) -> Result<()> {
    let typed = format!(
        r#"
        SELECT d.tool_id AS tool_id, d.ip_hash AS ip_hash, {} AS backend_type
        FROM downloads d
        LEFT JOIN backends b ON b.id = d.backend_id
        WHERE d.created_at >= ?1 AND d.created_at < ?2
        "#,
        BACKEND_TYPE_SQL
    );

    let mut stmt = tx.prepare(&format!(
        "SELECT backend_type, COUNT(*), COUNT(DISTINCT ip_hash) FROM ({}) GROUP BY backend_type",
        typed
    ))?;
    let by_type = stmt
        .query_map(params![start, end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (backend_type, downloads, unique) in by_type {
        let result = tx.execute(
            r#"
            INSERT INTO daily_backend_stats (date, backend_type, downloads, unique_users) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(date, backend_type) DO UPDATE SET
                downloads = excluded.downloads,
                unique_users = excluded.unique_users
            "#,
            params![date, backend_type, downloads, unique],
        );
        tally(result, &mut counts.backend_stats, &mut counts.failed, "daily_backend_stats", date);
    }

    let mut stmt = tx.prepare(&format!(
        "SELECT tool_id, backend_type, COUNT(*) FROM ({}) GROUP BY tool_id, backend_type",
        typed
    ))?;
    let by_tool_type = stmt
        .query_map(params![start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (tool_id, backend_type, downloads) in by_tool_type {
        let result = tx.execute(
            r#"
            INSERT INTO daily_tool_backend_stats (date, tool_id, backend_type, downloads) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(date, tool_id, backend_type) DO UPDATE SET downloads = excluded.downloads
            "#,
            params![date, tool_id, backend_type, downloads],
        );
        tally(
            result,
            &mut counts.tool_backend_stats,
            &mut counts.failed,
            "daily_tool_backend_stats",
            date,
        );
    }
    Ok(())
}

/// Compute the trailing 30-day MAU snapshot for `date`.
///
/// Counts distinct actors across downloads and version requests in
/// `[day_start(date - 29), day_start(date + 1))`. Returns whether a row was
/// written; an empty window writes nothing.
pub fn populate_mau_for_date(conn: &Connection, date: NaiveDate) -> Result<bool> {
    let start = day_start(shift(date, -(MAU_WINDOW_DAYS - 1)));
    let end = day_start(shift(date, 1));

    let mau: i64 = conn.query_row(
        r#"
        SELECT COUNT(DISTINCT ip_hash) FROM (
            SELECT ip_hash FROM downloads WHERE created_at >= ?1 AND created_at < ?2
            UNION
            SELECT ip_hash FROM version_requests WHERE created_at >= ?1 AND created_at < ?2
        )
        "#,
        params![start, end],
        |row| row.get(0),
    )?;

    if mau == 0 {
        return Ok(false);
    }

    conn.execute(
        r#"
        INSERT INTO daily_mau_stats (date, mau) VALUES (?1, ?2)
        ON CONFLICT(date) DO UPDATE SET mau = excluded.mau
        "#,
        params![format_date(date), mau],
    )?;
    Ok(true)
}

/// Populate rollups and MAU for the `days` dates ending on `today`, oldest first.
///
/// A failing date is logged and counted; the remaining dates still run.
pub fn backfill_rollups(conn: &Connection, days: i64, today: NaiveDate) -> Result<BackfillSummary> {
    let mut summary = BackfillSummary::default();

    for date in trailing_dates(today, days) {
        match populate_rollups_for_date(conn, date) {
            Ok(_) => summary.days_processed += 1,
            Err(e) => {
                warn!(date = %format_date(date), error = %e, "Rollup backfill failed for date");
                summary.failed_days += 1;
                continue;
            }
        }
        match populate_mau_for_date(conn, date) {
            Ok(true) => summary.mau_days_processed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(date = %format_date(date), error = %e, "MAU backfill failed for date");
                summary.failed_days += 1;
            }
        }
    }

    info!(
        days,
        days_processed = summary.days_processed,
        mau_days_processed = summary.mau_days_processed,
        failed_days = summary.failed_days,
        "Rollup backfill complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use toolpulse_analytics_core::days::parse_date;
    use toolpulse_analytics_core::{ensure_schema, DownloadEvent};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn record(conn: &Connection, tool: &str, actor: &str, backend: Option<&str>, on: &str) {
        let event = DownloadEvent {
            tool: tool.to_string(),
            version: "1.0.0".to_string(),
            actor: actor.to_string(),
            backend: backend.map(str::to_string),
            ..Default::default()
        };
        EventStore::new(conn)
            .record_download_at(&event, day_start(date(on)) + 60)
            .unwrap();
    }

    fn snapshot(conn: &Connection) -> Vec<(String, i64, i64)> {
        conn.prepare("SELECT date, tool_id, downloads FROM daily_tool_stats ORDER BY date, tool_id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_tool_stats_counts() {
        let conn = setup();
        record(&conn, "toolA", "actor1", None, "2024-01-01");
        record(&conn, "toolA", "actor1", None, "2024-01-01"); // deduplicated
        record(&conn, "toolA", "actor2", None, "2024-01-01");

        populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();

        let (downloads, unique): (i64, i64) = conn
            .query_row(
                r#"
                SELECT s.downloads, s.unique_users FROM daily_tool_stats s
                JOIN tools t ON t.id = s.tool_id
                WHERE s.date = '2024-01-01' AND t.name = 'toolA'
                "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(downloads, 2);
        assert_eq!(unique, 2);
    }

    #[test]
    fn test_rollups_are_idempotent() {
        let conn = setup();
        record(&conn, "node", "a1", Some("core:node"), "2024-01-01");
        record(&conn, "python", "a2", None, "2024-01-01");

        let first = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        let before = snapshot(&conn);
        let second = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        let after = snapshot(&conn);

        assert_eq!(first, second);
        assert_eq!(before, after);
    }

    #[test]
    fn test_backend_type_grouping() {
        let conn = setup();
        record(&conn, "node", "a1", Some("aqua:nodejs/node"), "2024-01-01");
        record(&conn, "jq", "a2", Some("aqua:jqlang/jq"), "2024-01-01");
        record(&conn, "ripgrep", "a3", Some("cargo:ripgrep"), "2024-01-01");
        record(&conn, "python", "a4", None, "2024-01-01");

        let counts = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        assert_eq!(counts.backend_stats, 3);
        assert_eq!(counts.tool_backend_stats, 4);

        let rows: Vec<(String, i64)> = conn
            .prepare("SELECT backend_type, downloads FROM daily_backend_stats ORDER BY backend_type")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                ("aqua".to_string(), 2),
                ("cargo".to_string(), 1),
                ("unknown".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_combined_dau_unions_version_requests() {
        let conn = setup();
        record(&conn, "node", "a1", None, "2024-01-01");
        let mut store = EventStore::new(&conn);
        let t = day_start(date("2024-01-01")) + 5;
        store.record_version_request_at("a1", None, t).unwrap();
        store.record_version_request_at("a2", None, t).unwrap();

        let counts = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        assert_eq!(counts.combined, 1);
        assert_eq!(counts.version_stats, 1);

        let dau: i64 = conn
            .query_row("SELECT unique_users FROM daily_combined_stats WHERE date = '2024-01-01'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dau, 2);

        let (requests, requesters): (i64, i64) = conn
            .query_row(
                "SELECT total_requests, unique_users FROM daily_version_stats WHERE date = '2024-01-01'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(requests, 2);
        assert_eq!(requesters, 2);
    }

    #[test]
    fn test_empty_date_is_sparse() {
        let conn = setup();
        conn.execute(
            "INSERT INTO daily_stats (date, total_downloads, unique_users) VALUES ('2024-01-01', 7, 3)",
            [],
        )
        .unwrap();

        let counts = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        assert_eq!(counts, RollupCounts::default());

        // Existing rows survive a re-run over a date with no raw data
        let total: i64 = conn
            .query_row("SELECT total_downloads FROM daily_stats WHERE date = '2024-01-01'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_partially_compacted_date_is_not_recomputed() {
        let conn = setup();
        record(&conn, "keep", "a1", None, "2024-01-01");
        record(&conn, "stuck", "a2", None, "2024-01-01");
        populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();

        conn.execute_batch(
            "CREATE TRIGGER reject_stuck BEFORE INSERT ON downloads_daily
             WHEN NEW.tool_id = (SELECT id FROM tools WHERE name = 'stuck')
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
        let summary =
            crate::compaction::compact_older_than(&conn, 0, day_start(date("2024-06-01"))).unwrap();
        assert_eq!(summary.failed, 1);

        let counts = populate_rollups_for_date(&conn, date("2024-01-01")).unwrap();
        assert!(counts.compacted);
        assert_eq!(counts.total(), 0);

        let total: i64 = conn
            .query_row("SELECT total_downloads FROM daily_stats WHERE date = '2024-01-01'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(snapshot(&conn).len(), 2);
    }

    #[test]
    fn test_mau_window() {
        let conn = setup();
        record(&conn, "node", "lonely", None, "2024-03-01");

        let mau_on = |d: &str| -> Option<i64> {
            populate_mau_for_date(&conn, date(d)).unwrap();
            conn.query_row("SELECT mau FROM daily_mau_stats WHERE date = ?1", [d], |row| row.get(0))
                .ok()
        };

        assert_eq!(mau_on("2024-02-29"), None);
        assert_eq!(mau_on("2024-03-01"), Some(1));
        assert_eq!(mau_on("2024-03-15"), Some(1));
        assert_eq!(mau_on("2024-03-30"), Some(1)); // D + 29
        assert_eq!(mau_on("2024-03-31"), None); // D + 30
    }

    #[test]
    fn test_mau_is_distinct_not_summed() {
        let conn = setup();
        for day in ["2024-03-01", "2024-03-02", "2024-03-03"] {
            record(&conn, "node", "same", None, day);
        }
        assert!(populate_mau_for_date(&conn, date("2024-03-03")).unwrap());
        let mau: i64 = conn
            .query_row("SELECT mau FROM daily_mau_stats WHERE date = '2024-03-03'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mau, 1);
    }

    #[test]
    fn test_backfill() {
        let conn = setup();
        record(&conn, "node", "a1", None, "2024-01-02");
        record(&conn, "node", "a2", None, "2024-01-03");

        let summary = backfill_rollups(&conn, 3, date("2024-01-03")).unwrap();
        assert_eq!(summary.days_processed, 3);
        // 2024-01-01 has an empty MAU window
        assert_eq!(summary.mau_days_processed, 2);
        assert_eq!(summary.failed_days, 0);
        assert_eq!(snapshot(&conn).len(), 2);
    }
}
