//! Growth and trend analytics
//!
//! Read-only queries over the rollup tables: week-over-week and
//! month-over-month deltas, per-tool sparklines and momentum-based
//! trending. Per-version trends are the exception: no per-version rollup
//! exists, so they read raw downloads together with `downloads_daily`.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use toolpulse_analytics_core::days::{day_start, format_date, shift, trailing_dates};
use toolpulse_analytics_core::{AnalyticsError, Result};

use crate::events::find_tool_id;

/// Tools below this many downloads in both compared weeks are left out of
/// per-tool growth rankings
pub const GROWTH_NOISE_FLOOR: i64 = 10;

/// Entries returned in each of the growing/declining lists
pub const GROWTH_LIST_LIMIT: usize = 10;

/// Days in the per-tool sparkline
pub const SPARKLINE_DAYS: i64 = 14;

/// Days averaged as "recent" activity when ranking trending tools
pub const TRENDING_RECENT_DAYS: i64 = 3;

/// Days averaged as the baseline, immediately preceding the recent window
pub const TRENDING_BASELINE_DAYS: i64 = 27;

/// Percentage change from `previous` to `current`.
///
/// `None` when both are zero. A move from zero to any activity is reported
/// as exactly 100.
pub fn growth_percentage(current: i64, previous: i64) -> Option<f64> {
    if previous > 0 {
        Some(((current - previous) as f64 / previous as f64) * 100.0)
    } else if current > 0 {
        Some(100.0)
    } else {
        None
    }
}

/// An inclusive range of dates, compared as `YYYY-MM-DD` strings
#[derive(Debug, Clone)]
struct Window {
    from: String,
    to: String,
}

impl Window {
    /// `days` dates ending `offset` days before `today`
    fn ending(today: NaiveDate, offset: i64, days: i64) -> Self {
        let to = shift(today, -offset);
        Self {
            from: format_date(shift(to, -(days - 1))),
            to: format_date(to),
        }
    }
}

fn global_total(conn: &Connection, window: &Window) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(total_downloads), 0) FROM daily_stats WHERE date >= ?1 AND date <= ?2",
        params![window.from, window.to],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn tool_total(conn: &Connection, tool_id: i64, window: &Window) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(downloads), 0) FROM daily_tool_stats WHERE tool_id = ?1 AND date >= ?2 AND date <= ?3",
        params![tool_id, window.from, window.to],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Per-tool totals over a window, keyed by tool name
fn tool_totals(conn: &Connection, window: &Window) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT t.name, SUM(s.downloads)
        FROM daily_tool_stats s
        JOIN tools t ON t.id = s.tool_id
        WHERE s.date >= ?1 AND s.date <= ?2
        GROUP BY t.name
        "#,
    )?;
    let totals = stmt
        .query_map(params![window.from, window.to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(totals)
}

// =============================================================================
// Growth
// =============================================================================

/// Current vs previous period totals and their delta
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodGrowth {
    pub current: i64,
    pub previous: i64,
    pub growth: Option<f64>,
}

impl PeriodGrowth {
    fn new(current: i64, previous: i64) -> Self {
        Self {
            current,
            previous,
            growth: growth_percentage(current, previous),
        }
    }
}

/// Global week-over-week and month-over-month growth
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalGrowth {
    pub wow: PeriodGrowth,
    pub mom: PeriodGrowth,
}

/// A tool's week-over-week growth
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolGrowthEntry {
    pub tool: String,
    pub this_week: i64,
    pub last_week: i64,
    pub growth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthMetrics {
    pub global: GlobalGrowth,
    pub top_growing: Vec<ToolGrowthEntry>,
    pub top_declining: Vec<ToolGrowthEntry>,
}

/// Global and per-tool growth as of `today`
pub fn growth_metrics(conn: &Connection, today: NaiveDate) -> Result<GrowthMetrics> {
    let this_week = Window::ending(today, 0, 7);
    let last_week = Window::ending(today, 7, 7);
    let this_month = Window::ending(today, 0, 30);
    let last_month = Window::ending(today, 30, 30);

    let global = GlobalGrowth {
        wow: PeriodGrowth::new(global_total(conn, &this_week)?, global_total(conn, &last_week)?),
        mom: PeriodGrowth::new(
            global_total(conn, &this_month)?,
            global_total(conn, &last_month)?,
        ),
    };

    let current = tool_totals(conn, &this_week)?;
    let previous = tool_totals(conn, &last_week)?;

    let mut names: Vec<&String> = current.keys().chain(previous.keys()).collect();
    names.sort();
    names.dedup();

    let mut entries: Vec<ToolGrowthEntry> = names
        .into_iter()
        .filter_map(|name| {
            let this_week = current.get(name).copied().unwrap_or(0);
            let last_week = previous.get(name).copied().unwrap_or(0);
            if this_week < GROWTH_NOISE_FLOOR && last_week < GROWTH_NOISE_FLOOR {
                return None;
            }
            growth_percentage(this_week, last_week).map(|growth| ToolGrowthEntry {
                tool: name.clone(),
                this_week,
                last_week,
                growth,
            })
        })
        .collect();

    entries.sort_by(|a, b| b.growth.total_cmp(&a.growth).then_with(|| a.tool.cmp(&b.tool)));

    let top_growing = entries
        .iter()
        .filter(|e| e.growth > 0.0)
        .take(GROWTH_LIST_LIMIT)
        .cloned()
        .collect();
    let top_declining = entries
        .iter()
        .rev()
        .filter(|e| e.growth < 0.0)
        .take(GROWTH_LIST_LIMIT)
        .cloned()
        .collect();

    Ok(GrowthMetrics {
        global,
        top_growing,
        top_declining,
    })
}

/// One day of a sparkline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyPoint {
    pub date: String,
    pub downloads: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolGrowth {
    pub tool: String,
    pub wow: PeriodGrowth,
    pub mom: PeriodGrowth,
    /// Last 14 days, oldest first, zero-filled
    pub sparkline: Vec<DailyPoint>,
}

/// Growth for a single tool as of `today`
pub fn tool_growth(conn: &Connection, tool: &str, today: NaiveDate) -> Result<ToolGrowth> {
    let tool_id = find_tool_id(conn, tool)?
        .ok_or_else(|| AnalyticsError::NotFound(format!("Tool '{}' not found", tool)))?;

    let wow = PeriodGrowth::new(
        tool_total(conn, tool_id, &Window::ending(today, 0, 7))?,
        tool_total(conn, tool_id, &Window::ending(today, 7, 7))?,
    );
    let mom = PeriodGrowth::new(
        tool_total(conn, tool_id, &Window::ending(today, 0, 30))?,
        tool_total(conn, tool_id, &Window::ending(today, 30, 30))?,
    );

    let window = Window::ending(today, 0, SPARKLINE_DAYS);
    let mut stmt = conn.prepare(
        "SELECT date, downloads FROM daily_tool_stats WHERE tool_id = ?1 AND date >= ?2 AND date <= ?3",
    )?;
    let by_date = stmt
        .query_map(params![tool_id, window.from, window.to], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    let sparkline = trailing_dates(today, SPARKLINE_DAYS)
        .into_iter()
        .map(|d| {
            let date = format_date(d);
            let downloads = by_date.get(&date).copied().unwrap_or(0);
            DailyPoint { date, downloads }
        })
        .collect();

    Ok(ToolGrowth {
        tool: tool.to_string(),
        wow,
        mom,
        sparkline,
    })
}

// =============================================================================
// Trending
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendingTool {
    pub tool: String,
    pub recent_avg: f64,
    pub baseline_avg: f64,
    pub score: f64,
    pub recent_downloads: i64,
}

/// Momentum score: percentage lift of the recent average over the baseline
/// average, or 0 without a baseline
pub fn trending_score(recent_avg: f64, baseline_avg: f64) -> f64 {
    if baseline_avg > 0.0 {
        ((recent_avg / baseline_avg) - 1.0) * 100.0
    } else {
        0.0
    }
}

/// Tools ranked by recent momentum as of `today`
pub fn trending_tools(conn: &Connection, limit: usize, today: NaiveDate) -> Result<Vec<TrendingTool>> {
    let recent = tool_totals(conn, &Window::ending(today, 0, TRENDING_RECENT_DAYS))?;
    let baseline = tool_totals(
        conn,
        &Window::ending(today, TRENDING_RECENT_DAYS, TRENDING_BASELINE_DAYS),
    )?;

    let mut names: Vec<&String> = recent.keys().chain(baseline.keys()).collect();
    names.sort();
    names.dedup();

    let mut ranked: Vec<TrendingTool> = names
        .into_iter()
        .map(|name| {
            let recent_downloads = recent.get(name).copied().unwrap_or(0);
            let recent_avg = recent_downloads as f64 / TRENDING_RECENT_DAYS as f64;
            let baseline_avg =
                baseline.get(name).copied().unwrap_or(0) as f64 / TRENDING_BASELINE_DAYS as f64;
            TrendingTool {
                tool: name.clone(),
                recent_avg,
                baseline_avg,
                score: trending_score(recent_avg, baseline_avg),
                recent_downloads,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.recent_downloads.cmp(&a.recent_downloads))
            .then_with(|| a.tool.cmp(&b.tool))
    });
    ranked.truncate(limit);
    Ok(ranked)
}

// =============================================================================
// Version trends
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Growing,
    Declining,
    Stable,
}

/// Label a version by comparing its first-week and last-week totals
pub fn classify_trend(first_week: i64, last_week: i64) -> Trend {
    if first_week == 0 && last_week == 0 {
        return Trend::Stable;
    }
    let first = first_week as f64;
    let last = last_week as f64;
    if last >= first * 1.1 {
        Trend::Growing
    } else if last <= first * 0.9 {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionShare {
    pub version: String,
    pub downloads: i64,
    /// Percentage of the tool's downloads in the window
    pub share: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionTrends {
    pub tool: String,
    pub days: i64,
    pub total: i64,
    pub versions: Vec<VersionShare>,
}

/// Per-version share of a tool's downloads over the `days` ending `today`.
///
/// Trend labels need two distinct weeks; windows under 14 days label every
/// version `stable`.
pub fn version_trends(
    conn: &Connection,
    tool: &str,
    days: i64,
    today: NaiveDate,
) -> Result<VersionTrends> {
    let tool_id = find_tool_id(conn, tool)?
        .ok_or_else(|| AnalyticsError::NotFound(format!("Tool '{}' not found", tool)))?;

    let window = Window::ending(today, 0, days);
    let start = day_start(shift(today, -(days - 1)));
    let end = day_start(shift(today, 1));

    let mut stmt = conn.prepare(
        r#"
        SELECT version, day, SUM(n) FROM (
            SELECT version, date(created_at, 'unixepoch') AS day, COUNT(*) AS n
            FROM downloads
            WHERE tool_id = ?1 AND created_at >= ?2 AND created_at < ?3
            GROUP BY version, day
            UNION ALL
            SELECT version, date AS day, count AS n
            FROM downloads_daily
            WHERE tool_id = ?1 AND date >= ?4 AND date <= ?5
        )
        GROUP BY version, day
        "#,
    )?;
    let rows = stmt
        .query_map(params![tool_id, start, end, window.from, window.to], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let first_week = Window::ending(today, days - 7, 7);
    let last_week = Window::ending(today, 0, 7);

    // version -> (total, first week, last week)
    let mut per_version: BTreeMap<String, (i64, i64, i64)> = BTreeMap::new();
    for (version, day, n) in rows {
        let entry = per_version.entry(version).or_default();
        entry.0 += n;
        if day >= first_week.from && day <= first_week.to {
            entry.1 += n;
        }
        if day >= last_week.from && day <= last_week.to {
            entry.2 += n;
        }
    }

    let total: i64 = per_version.values().map(|v| v.0).sum();
    let mut versions: Vec<VersionShare> = per_version
        .into_iter()
        .map(|(version, (downloads, first, last))| VersionShare {
            version,
            downloads,
            share: if total > 0 {
                downloads as f64 * 100.0 / total as f64
            } else {
                0.0
            },
            trend: if days >= 14 {
                classify_trend(first, last)
            } else {
                Trend::Stable
            },
        })
        .collect();
    versions.sort_by(|a, b| b.downloads.cmp(&a.downloads).then_with(|| a.version.cmp(&b.version)));

    Ok(VersionTrends {
        tool: tool.to_string(),
        days,
        total,
        versions,
    })
}
