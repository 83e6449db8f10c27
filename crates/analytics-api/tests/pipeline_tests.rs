//! End-to-end tests for the ingest → rollup → compaction pipeline
//!
//! Time is pinned so rollup dates and compaction cutoffs are deterministic.

use chrono::NaiveDate;
use rusqlite::Connection;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use toolpulse_analytics_api::compaction::compact_older_than;
use toolpulse_analytics_api::events::EventStore;
use toolpulse_analytics_api::rollups::{populate_mau_for_date, populate_rollups_for_date};
use toolpulse_analytics_api::stats::tool_stats;
use toolpulse_analytics_core::days::{day_start, SECONDS_PER_DAY};
use toolpulse_analytics_core::{AnalyticsError, DownloadEvent};
use toolpulse_analytics_storage::{AnalyticsBackend, LocalSqliteBackend};

fn june_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn open_db() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let backend = LocalSqliteBackend::new(dir.path().join("pipeline.db"));
    backend.initialize().unwrap();
    let conn = backend.get_connection().unwrap();
    (dir, conn)
}

fn node_download(actor: &str) -> DownloadEvent {
    DownloadEvent {
        tool: "node".to_string(),
        version: "20.0.0".to_string(),
        actor: actor.to_string(),
        os: Some("linux".to_string()),
        arch: Some("x64".to_string()),
        backend: Some("core:node".to_string()),
    }
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn test_ingest_rollup_compact_scenario() {
    let (_dir, conn) = open_db();
    let date = june_first();
    let base = day_start(date);

    // Five events from three actors; the two repeats are same-day duplicates
    let actors = ["actor-a", "actor-b", "actor-a", "actor-c", "actor-b"];
    let mut store = EventStore::new(&conn);
    let deduplicated: Vec<bool> = actors
        .iter()
        .enumerate()
        .map(|(i, actor)| {
            store
                .record_download_at(&node_download(actor), base + 3_600 * i as i64)
                .unwrap()
                .deduplicated
        })
        .collect();
    assert_eq!(deduplicated, vec![false, false, true, false, true]);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM downloads"), 3);

    let counts = populate_rollups_for_date(&conn, date).unwrap();
    assert_eq!(counts.failed, 0);
    assert!(populate_mau_for_date(&conn, date).unwrap());

    let (downloads, unique_users): (i64, i64) = conn
        .query_row(
            r#"
            SELECT s.downloads, s.unique_users
            FROM daily_tool_stats s JOIN tools t ON t.id = s.tool_id
            WHERE s.date = '2024-06-01' AND t.name = 'node'
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((downloads, unique_users), (3, 3));
    assert_eq!(
        count(&conn, "SELECT mau FROM daily_mau_stats WHERE date = '2024-06-01'"),
        3
    );

    // Horizon 0, evaluated the next day: all of June 1st is older than the cutoff
    let now = base + SECONDS_PER_DAY + 60;
    let summary = compact_older_than(&conn, 0, now).unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.deleted, 3);

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM downloads"), 0);
    assert_eq!(
        count(
            &conn,
            "SELECT SUM(count) FROM downloads_daily WHERE date = '2024-06-01'"
        ),
        3
    );

    // Reads see compacted history as before
    let stats = tool_stats(&conn, "node", NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()).unwrap();
    assert_eq!(stats.total_downloads, 3);
    assert_eq!(stats.by_version[0].key, "20.0.0");
    assert_eq!(stats.by_version[0].downloads, 3);

    // Rollups are unaffected by compaction
    assert_eq!(
        count(
            &conn,
            "SELECT downloads FROM daily_tool_stats WHERE date = '2024-06-01'"
        ),
        3
    );
}

#[test]
fn test_compaction_conserves_totals() {
    let (_dir, conn) = open_db();
    let start = day_start(june_first());
    let mut store = EventStore::new(&conn);

    for day in 0..10 {
        for actor in 0..(day % 4 + 1) {
            let mut event = node_download(&format!("actor-{}", actor));
            event.version = if actor % 2 == 0 { "20.0.0" } else { "22.0.0" }.to_string();
            event.os = if day % 3 == 0 { None } else { Some("darwin".to_string()) };
            store
                .record_download_at(&event, start + day * SECONDS_PER_DAY + actor * 10)
                .unwrap();
        }
    }

    let visible = |conn: &Connection| {
        count(conn, "SELECT COUNT(*) FROM downloads")
            + count(conn, "SELECT COALESCE(SUM(count), 0) FROM downloads_daily")
    };
    let before = visible(&conn);

    let now = start + 10 * SECONDS_PER_DAY;
    for horizon in [7, 4, 4, 0] {
        compact_older_than(&conn, horizon, now).unwrap();
        assert_eq!(visible(&conn), before, "horizon {}", horizon);
    }
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM downloads"), 0);
}

#[test]
fn test_rollup_rerun_is_identical() {
    let (_dir, conn) = open_db();
    let date = june_first();
    let mut store = EventStore::new(&conn);
    for actor in ["a", "b", "c"] {
        store
            .record_download_at(&node_download(actor), day_start(date) + 100)
            .unwrap();
    }

    let snapshot = |conn: &Connection| -> Vec<(String, i64, i64)> {
        let mut stmt = conn
            .prepare("SELECT date, downloads, unique_users FROM daily_tool_stats ORDER BY date")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    };

    let first = populate_rollups_for_date(&conn, date).unwrap();
    let rows = snapshot(&conn);
    let second = populate_rollups_for_date(&conn, date).unwrap();
    assert_eq!(first, second);
    assert_eq!(rows, snapshot(&conn));
}

/// Ten days of node downloads with rollups for each day
fn seeded_backend() -> (TempDir, LocalSqliteBackend, i64) {
    let dir = TempDir::new().unwrap();
    let backend = LocalSqliteBackend::new(dir.path().join("overlap.db"));
    backend.initialize().unwrap();
    let conn = backend.get_connection().unwrap();
    let start = day_start(june_first());
    let mut store = EventStore::new(&conn);
    for day in 0..10 {
        for actor in 0..(day % 3 + 1) {
            let mut event = node_download(&format!("actor-{}", actor));
            event.version = if actor % 2 == 0 { "20.0.0" } else { "22.0.0" }.to_string();
            store
                .record_download_at(&event, start + day * SECONDS_PER_DAY + actor)
                .unwrap();
        }
    }
    for day in 0..10 {
        let date = june_first() + chrono::Duration::days(day);
        populate_rollups_for_date(&conn, date).unwrap();
    }
    (dir, backend, start + 10 * SECONDS_PER_DAY)
}

fn visible(conn: &Connection) -> i64 {
    count(conn, "SELECT COUNT(*) FROM downloads")
        + count(conn, "SELECT COALESCE(SUM(count), 0) FROM downloads_daily")
}

fn rollup_snapshot(conn: &Connection) -> Vec<(String, i64)> {
    let mut stmt = conn
        .prepare("SELECT date, downloads FROM daily_tool_stats ORDER BY date")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_overlapping_daily_jobs_do_not_double_count() {
    let (_dir, backend, now) = seeded_backend();
    let conn = backend.get_connection().unwrap();
    let before = visible(&conn);
    let rollups_before = rollup_snapshot(&conn);
    let backend = Arc::new(backend);
    let barrier = Arc::new(Barrier::new(4));

    let compactions: Vec<_> = (0..2)
        .map(|_| {
            let backend = Arc::clone(&backend);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = backend.get_connection().unwrap();
                barrier.wait();
                compact_older_than(&conn, 0, now)
            })
        })
        .collect();
    let rollups: Vec<_> = (0..2)
        .map(|_| {
            let backend = Arc::clone(&backend);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = backend.get_connection().unwrap();
                barrier.wait();
                populate_rollups_for_date(&conn, june_first())
            })
        })
        .collect();

    let compactions: Vec<_> = compactions.into_iter().map(|h| h.join().unwrap()).collect();
    for handle in rollups {
        handle.join().unwrap().unwrap();
    }

    // Runs serialize on the write lock: one merges, the other finds nothing left
    let merging = compactions
        .iter()
        .filter(|r| matches!(r, Ok(summary) if summary.aggregated > 0))
        .count();
    assert_eq!(merging, 1);
    for summary in compactions.iter().flatten() {
        assert_eq!(summary.failed, 0);
    }

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM downloads"), 0);
    assert_eq!(visible(&conn), before);
    assert_eq!(rollup_snapshot(&conn), rollups_before);
}

#[test]
fn test_compaction_blocked_by_another_writer_fails_cleanly() {
    let (_dir, backend, now) = seeded_backend();
    let holder = backend.get_connection().unwrap();
    let before = visible(&holder);
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let loser = backend.get_connection().unwrap();
    loser.busy_timeout(Duration::from_millis(100)).unwrap();
    let result = compact_older_than(&loser, 0, now);
    assert!(matches!(result, Err(AnalyticsError::Sqlite(_))));

    holder.execute_batch("COMMIT").unwrap();
    assert_eq!(count(&holder, "SELECT COUNT(*) FROM downloads_daily"), 0);
    assert_eq!(visible(&holder), before);

    // Once the lock is free the retry compacts everything exactly once
    let summary = compact_older_than(&loser, 0, now).unwrap();
    assert!(summary.aggregated > 0);
    assert_eq!(visible(&holder), before);
}

