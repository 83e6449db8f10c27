//! Ordered, additive schema migrations.
//!
//! Each migration is a set of idempotent steps: columns are only added when
//! missing, and the SQL body only uses `IF NOT EXISTS` DDL. Applied versions
//! are recorded in `schema_migrations`, so a second run is a no-op.

use crate::Result;
use rusqlite::Connection;
use tracing::{debug, info};

pub mod v1_0_0;
pub mod v1_1_0;
pub mod v1_2_0;

/// A single schema upgrade step
#[derive(Debug, Clone)]
pub struct Migration {
    /// Format: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    /// Columns to add to existing tables: (table_name, column_name, column_type)
    pub add_columns: &'static [(&'static str, &'static str, &'static str)],
}

/// All migrations, in application order
pub fn all_migrations() -> Vec<Migration> {
    vec![
        v1_0_0::migration(),
        v1_1_0::migration(),
        v1_2_0::migration(),
    ]
}

/// Check whether `table` has a column named `column`
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

fn ensure_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          description TEXT NOT NULL,
          applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;
    Ok(())
}

fn is_applied(conn: &Connection, version: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    for (table, column, column_type) in migration.add_columns {
        if column_exists(&tx, table, column)? {
            debug!(table, column, "Column already present, skipping");
            continue;
        }
        tx.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, column_type
        ))?;
    }

    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.description],
    )?;
    tx.commit()?;
    Ok(())
}

/// Apply every pending migration in order.
///
/// Returns the number of migrations applied by this call.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    ensure_ledger(conn)?;

    let mut applied = 0;
    for migration in all_migrations() {
        if is_applied(conn, migration.version)? {
            continue;
        }
        apply(conn, &migration)?;
        info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
        applied += 1;
    }

    Ok(applied)
}

/// Highest applied migration version, if any
pub fn current_version(conn: &Connection) -> Result<Option<i64>> {
    ensure_ledger(conn)?;
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let versions: Vec<i64> = all_migrations().iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_run_migrations_records_versions() {
        let conn = Connection::open_in_memory().unwrap();
        crate::init_sqlite_schema(&conn).unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), all_migrations().len());
        assert_eq!(current_version(&conn).unwrap(), Some(v1_2_0::VERSION));
    }

    #[test]
    fn test_column_added_by_hand_is_tolerated() {
        let conn = Connection::open_in_memory().unwrap();
        crate::init_sqlite_schema(&conn).unwrap();

        // An operator added the column manually before the migration ran
        conn.execute_batch("ALTER TABLE downloads ADD COLUMN backend_id INTEGER")
            .unwrap();

        run_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "downloads", "backend_id").unwrap());
    }
}
