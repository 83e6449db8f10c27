//! Toolpulse operator CLI
//!
//! Entry point for the scheduled jobs (rollups, MAU snapshots, compaction,
//! token expiry). Every command prints a JSON summary on stdout; logs go to
//! stderr.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use toolpulse_analytics_api::compaction::compact_older_than;
use toolpulse_analytics_api::config::ServiceConfig;
use toolpulse_analytics_api::rollups::{backfill_rollups, populate_mau_for_date, populate_rollups_for_date};
use toolpulse_analytics_api::token_pool::deactivate_expired;
use toolpulse_analytics_core::days::{date_of, format_date, now_ts, parse_date, shift};
use toolpulse_analytics_core::validation::{validate_days, validate_horizon_days};
use toolpulse_analytics_core::Result;
use toolpulse_analytics_storage::{AnalyticsBackend, LocalSqliteBackend};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolpulse")]
#[command(about = "Operator CLI for Toolpulse analytics jobs")]
#[command(version)]
struct Cli {
    /// SQLite database path (default: TOOLPULSE_DB_PATH or toolpulse.db)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Create a new database with the current schema
    Init,
    /// Populate rollups for one date
    Rollup {
        /// YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<String>,
    },
    /// Compute the trailing 30-day MAU snapshot for one date
    Mau {
        /// YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<String>,
    },
    /// Recompute rollups and MAU for the last N days
    Backfill {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Fold raw downloads older than the horizon into daily aggregates
    Compact {
        /// Default: TOOLPULSE_RETENTION_DAYS
        #[arg(long)]
        horizon_days: Option<i64>,
    },
    /// Scheduled run: rollups and MAU for yesterday and today, compaction, token expiry
    Daily,
    /// Deactivate tokens whose expiry has passed
    ExpireTokens,
}

fn date_arg(date: Option<&str>, now: i64) -> Result<NaiveDate> {
    match date {
        Some(s) => parse_date(s),
        None => Ok(date_of(now)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Execute `command` against `backend` as of `now` (Unix seconds)
fn run(
    command: &Commands,
    backend: &LocalSqliteBackend,
    config: &ServiceConfig,
    now: i64,
) -> Result<Value> {
    let today = date_of(now);

    match command {
        Commands::Init => {
            backend.initialize()?;
            Ok(json!({ "initialized": backend.path().display().to_string() }))
        }
        Commands::Rollup { date } => {
            let conn = backend.get_connection()?;
            let date = date_arg(date.as_deref(), now)?;
            let counts = populate_rollups_for_date(&conn, date)?;
            Ok(json!({ "date": format_date(date), "rollups": to_json(&counts)? }))
        }
        Commands::Mau { date } => {
            let conn = backend.get_connection()?;
            let date = date_arg(date.as_deref(), now)?;
            let written = populate_mau_for_date(&conn, date)?;
            Ok(json!({ "date": format_date(date), "written": written }))
        }
        Commands::Backfill { days } => {
            let conn = backend.get_connection()?;
            validate_days(*days, "days")?;
            to_json(&backfill_rollups(&conn, *days, today)?)
        }
        Commands::Compact { horizon_days } => {
            let conn = backend.get_connection()?;
            let horizon = horizon_days.unwrap_or(config.retention_days);
            validate_horizon_days(horizon, "horizon-days")?;
            to_json(&compact_older_than(&conn, horizon, now)?)
        }
        Commands::Daily => {
            let conn = backend.get_connection()?;
            let mut dates = Vec::new();
            for date in [shift(today, -1), today] {
                let rollups = populate_rollups_for_date(&conn, date)?;
                let mau = populate_mau_for_date(&conn, date)?;
                dates.push(json!({
                    "date": format_date(date),
                    "rollups": to_json(&rollups)?,
                    "mau": mau,
                }));
            }
            let compaction = compact_older_than(&conn, config.retention_days, now)?;
            let expired = deactivate_expired(&conn, now)?;
            Ok(json!({
                "dates": dates,
                "compaction": to_json(&compaction)?,
                "expired_tokens": expired,
            }))
        }
        Commands::ExpireTokens => {
            let conn = backend.get_connection()?;
            let expired = deactivate_expired(&conn, now)?;
            Ok(json!({ "expired_tokens": expired }))
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());
    let backend = LocalSqliteBackend::new(&db_path);

    match run(&cli.command, &backend, &config, now_ts()) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}", json!({ "error": e.to_string() }));
            std::process::exit(1);
        }
    }
}
