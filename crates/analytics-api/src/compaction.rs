//! Retention and compaction
//!
//! Raw downloads older than the retention horizon are folded into
//! `downloads_daily` (one row per tool, backend, version, platform and day)
//! and then deleted. Merge and delete share one SQLite transaction.
//!
//! Merges are additive: an existing `downloads_daily` row for the same key
//! has the new counts added to it. If a group fails to merge, only the raw
//! rows of groups that merged are deleted, so a re-run picks the failed
//! group up again without counting the others twice.
//!
//! The transaction takes the write lock before grouping, so overlapping runs
//! serialize: the later one sees the earlier one's deletes and merges nothing
//! twice. A run that cannot get the lock within the busy timeout fails
//! without writing.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use toolpulse_analytics_core::days::{date_of, day_start, parse_date, SECONDS_PER_DAY};
use toolpulse_analytics_core::validation::validate_horizon_days;
use toolpulse_analytics_core::{AnalyticsError, Result};
use tracing::{error, info};

/// Outcome of one compaction run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    /// Raw rows with `created_at` below this (Unix seconds) were eligible
    pub cutoff: i64,
    /// Groups merged into `downloads_daily`
    pub aggregated: usize,
    /// Raw rows deleted
    pub deleted: usize,
    /// Groups that failed to merge and were left in `downloads`
    pub failed: usize,
}

#[derive(Debug)]
struct Group {
    tool_id: i64,
    backend_id: i64,
    version: String,
    platform_id: i64,
    date: String,
    count: i64,
    unique_ips: i64,
}

/// Start of the UTC day containing `now - horizon_days`.
///
/// Aligning to a day boundary keeps each calendar day either fully raw or
/// fully compacted. The cutoff never lies after the start of `now`'s day.
pub fn compaction_cutoff(horizon_days: i64, now: i64) -> Result<i64> {
    validate_horizon_days(horizon_days, "horizon_days")?;
    let at = horizon_days
        .checked_mul(SECONDS_PER_DAY)
        .and_then(|span| now.checked_sub(span))
        .ok_or_else(|| {
            AnalyticsError::ValidationError(format!(
                "horizon_days {} is out of range",
                horizon_days
            ))
        })?;
    Ok(day_start(date_of(at)))
}

/// Compact raw downloads older than `horizon_days` before `now`.
pub fn compact_older_than(conn: &Connection, horizon_days: i64, now: i64) -> Result<CompactionSummary> {
    let cutoff = compaction_cutoff(horizon_days, now)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let groups = {
        let mut stmt = tx.prepare(
            r#"
            SELECT tool_id,
                   COALESCE(backend_id, 0),
                   version,
                   COALESCE(platform_id, 0),
                   date(created_at, 'unixepoch') AS day,
                   COUNT(*),
                   COUNT(DISTINCT ip_hash)
            FROM downloads
            WHERE created_at < ?1
            GROUP BY 1, 2, 3, 4, 5
            "#,
        )?;
        let rows = stmt
            .query_map([cutoff], |row| {
                Ok(Group {
                    tool_id: row.get(0)?,
                    backend_id: row.get(1)?,
                    version: row.get(2)?,
                    platform_id: row.get(3)?,
                    date: row.get(4)?,
                    count: row.get(5)?,
                    unique_ips: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut summary = CompactionSummary {
        cutoff,
        ..Default::default()
    };
    let mut merged: Vec<&Group> = Vec::with_capacity(groups.len());

    for group in &groups {
        let result = tx.execute(
            r#"
            INSERT INTO downloads_daily (tool_id, backend_id, version, platform_id, date, count, unique_ips)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tool_id, backend_id, version, platform_id, date) DO UPDATE SET
                count = count + excluded.count,
                unique_ips = unique_ips + excluded.unique_ips
            "#,
            params![
                group.tool_id,
                group.backend_id,
                group.version,
                group.platform_id,
                group.date,
                group.count,
                group.unique_ips
            ],
        );
        match result {
            Ok(_) => merged.push(group),
            Err(e) => {
                error!(
                    tool_id = group.tool_id,
                    version = %group.version,
                    date = %group.date,
                    error = %e,
                    "Failed to merge compaction group"
                );
                summary.failed += 1;
            }
        }
    }
    summary.aggregated = merged.len();

    if summary.failed == 0 {
        summary.deleted = tx.execute("DELETE FROM downloads WHERE created_at < ?1", [cutoff])?;
    } else {
        for group in &merged {
            let start = day_start(parse_date(&group.date)?);
            summary.deleted += tx.execute(
                r#"
                DELETE FROM downloads
                WHERE tool_id = ?1
                  AND COALESCE(backend_id, 0) = ?2
                  AND version = ?3
                  AND COALESCE(platform_id, 0) = ?4
                  AND created_at >= ?5 AND created_at < ?6
                  AND created_at < ?7
                "#,
                params![
                    group.tool_id,
                    group.backend_id,
                    group.version,
                    group.platform_id,
                    start,
                    start + SECONDS_PER_DAY,
                    cutoff
                ],
            )?;
        }
    }

    tx.commit()?;

    info!(
        horizon_days,
        cutoff,
        aggregated = summary.aggregated,
        deleted = summary.deleted,
        failed = summary.failed,
        "Compaction complete"
    );
    #[cfg(feature = "metrics")]
    crate::metrics::record_job("compaction", if summary.failed == 0 { "success" } else { "partial" });

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use toolpulse_analytics_core::validation::MAX_HORIZON_DAYS;
    use toolpulse_analytics_core::{ensure_schema, DownloadEvent};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn ts(date: &str) -> i64 {
        day_start(parse_date(date).unwrap())
    }

    fn record(conn: &Connection, version: &str, actor: &str, os: Option<&str>, at: i64) {
        let event = DownloadEvent {
            tool: "node".to_string(),
            version: version.to_string(),
            actor: actor.to_string(),
            os: os.map(str::to_string),
            ..Default::default()
        };
        EventStore::new(conn).record_download_at(&event, at).unwrap();
    }

    /// Downloads visible through raw rows plus compacted rows
    fn visible_total(conn: &Connection) -> i64 {
        let raw: i64 = conn
            .query_row("SELECT COUNT(*) FROM downloads", [], |row| row.get(0))
            .unwrap();
        let compacted: i64 = conn
            .query_row("SELECT COALESCE(SUM(count), 0) FROM downloads_daily", [], |row| row.get(0))
            .unwrap();
        raw + compacted
    }

    #[test]
    fn test_cutoff_is_day_aligned() {
        let now = ts("2024-06-10") + 12 * 3_600;
        assert_eq!(compaction_cutoff(0, now).unwrap(), ts("2024-06-10"));
        assert_eq!(compaction_cutoff(3, now).unwrap(), ts("2024-06-07"));
    }

    #[test]
    fn test_out_of_range_horizon_leaves_rows() {
        let conn = setup();
        let now = ts("2024-06-10") + 3_600;
        record(&conn, "1.0", "a1", None, now - 60);
        record(&conn, "1.0", "a2", None, ts("2024-01-01"));

        for horizon in [(1_i64 << 57) - 10, i64::MAX, -1] {
            let err = compact_older_than(&conn, horizon, now).unwrap_err();
            assert!(matches!(err, AnalyticsError::ValidationError(_)), "horizon {}", horizon);
        }
        let raw: i64 = conn
            .query_row("SELECT COUNT(*) FROM downloads", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, 2);
        let compacted: i64 = conn
            .query_row("SELECT COUNT(*) FROM downloads_daily", [], |row| row.get(0))
            .unwrap();
        assert_eq!(compacted, 0);

        // The largest accepted horizon compacts nothing recent
        let summary = compact_older_than(&conn, MAX_HORIZON_DAYS, now).unwrap();
        assert!(summary.cutoff <= ts("2024-06-10"));
        assert_eq!(summary.deleted, 0);
    }

    #[test]
    fn test_compaction_conserves_counts() {
        let conn = setup();
        let old = ts("2024-01-01");
        record(&conn, "1.0", "a1", Some("linux"), old + 10);
        record(&conn, "1.0", "a2", Some("linux"), old + 20);
        record(&conn, "1.0", "a3", None, old + 30);
        record(&conn, "2.0", "a1", None, old + 40);
        record(&conn, "2.0", "a1", None, ts("2024-06-09") + 40); // recent, kept

        let before = visible_total(&conn);
        let summary = compact_older_than(&conn, 90, ts("2024-06-10")).unwrap();

        assert_eq!(summary.aggregated, 3);
        assert_eq!(summary.deleted, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(visible_total(&conn), before);

        let (count, unique): (i64, i64) = conn
            .query_row(
                "SELECT count, unique_ips FROM downloads_daily WHERE version = '1.0' AND platform_id != 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(unique, 2);
    }

    #[test]
    fn test_second_run_is_noop() {
        let conn = setup();
        record(&conn, "1.0", "a1", None, ts("2024-01-01"));
        compact_older_than(&conn, 0, ts("2024-06-10")).unwrap();
        let before = visible_total(&conn);

        let summary = compact_older_than(&conn, 0, ts("2024-06-10")).unwrap();
        assert_eq!(summary.aggregated, 0);
        assert_eq!(summary.deleted, 0);
        assert_eq!(visible_total(&conn), before);
    }

    #[test]
    fn test_merge_is_additive() {
        let conn = setup();
        let day = ts("2024-01-01");
        conn.execute_batch(
            "INSERT INTO tools (name) VALUES ('node');
             INSERT INTO downloads_daily (tool_id, version, date, count, unique_ips)
             VALUES (1, '1.0', '2024-01-01', 5, 4);",
        )
        .unwrap();
        record(&conn, "1.0", "a1", None, day + 1);

        compact_older_than(&conn, 0, ts("2024-06-10")).unwrap();

        let (count, unique): (i64, i64) = conn
            .query_row("SELECT count, unique_ips FROM downloads_daily", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 6);
        assert_eq!(unique, 5);
    }

    #[test]
    fn test_failed_group_keeps_its_raw_rows() {
        let conn = setup();
        let day = ts("2024-01-01");
        record(&conn, "good", "a1", None, day + 1);
        record(&conn, "bad", "a1", None, day + 2);
        conn.execute_batch(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON downloads_daily
             WHEN NEW.version = 'bad'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        let before = visible_total(&conn);
        let summary = compact_older_than(&conn, 0, ts("2024-06-10")).unwrap();

        assert_eq!(summary.aggregated, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(visible_total(&conn), before);

        let remaining: String = conn
            .query_row("SELECT version FROM downloads", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, "bad");
    }
}
