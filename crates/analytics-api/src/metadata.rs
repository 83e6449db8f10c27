//! Tool metadata and version catalog
//!
//! Display metadata is computed by an external sync process and pushed in
//! through the admin API. The analytics engine only stores and serves it.
//! The one place it feeds back into analytics is backend attribution: raw
//! downloads recorded before `downloads.backend_id` existed are attributed
//! to their tool's primary backend.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use toolpulse_analytics_core::days::now_ts;
use toolpulse_analytics_core::validation::{validate_tool_name, validate_version};
use toolpulse_analytics_core::{AnalyticsError, Result, ToolMetadata, ToolVersion};
use toolpulse_analytics_storage::for_each_chunk;
use tracing::{info, warn};

use crate::events::{find_tool_id, LookupCache};

const METADATA_COLUMNS: &str = "name, description, license, homepage, repo_url, backends, security, aqua_link, latest_version, version_count, last_updated";

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<(ToolMetadata, Option<String>, Option<String>)> {
    Ok((
        ToolMetadata {
            name: row.get(0)?,
            description: row.get(1)?,
            license: row.get(2)?,
            homepage: row.get(3)?,
            repo_url: row.get(4)?,
            backends: Vec::new(),
            security: None,
            aqua_link: row.get(7)?,
            latest_version: row.get(8)?,
            version_count: row.get(9)?,
            last_updated: row.get(10)?,
        },
        row.get(5)?,
        row.get(6)?,
    ))
}

/// Decode the JSON columns into the metadata struct
fn with_json(
    (mut meta, backends, security): (ToolMetadata, Option<String>, Option<String>),
) -> Result<ToolMetadata> {
    if let Some(raw) = backends {
        meta.backends = serde_json::from_str(&raw)?;
    }
    if let Some(raw) = security {
        meta.security = Some(serde_json::from_str(&raw)?);
    }
    Ok(meta)
}

/// Upsert display metadata for each entry, creating unknown tools.
///
/// Every entry is validated before anything is written.
pub fn sync_tool_metadata(conn: &Connection, entries: &[ToolMetadata]) -> Result<usize> {
    for entry in entries {
        validate_tool_name(&entry.name)?;
    }

    let synced_at = now_ts();
    let mut cache = LookupCache::new();
    let updated = for_each_chunk(conn, entries, |tx, chunk| {
        for entry in chunk {
            let tool_id = cache.tool_id(tx, &entry.name)?;
            let backends = serde_json::to_string(&entry.backends)?;
            let security = entry.security.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                r#"
                UPDATE tools SET
                    description = ?2,
                    license = ?3,
                    homepage = ?4,
                    repo_url = ?5,
                    backends = ?6,
                    security = ?7,
                    aqua_link = ?8,
                    latest_version = ?9,
                    version_count = ?10,
                    last_updated = ?11,
                    metadata_synced_at = ?12
                WHERE id = ?1
                "#,
                params![
                    tool_id,
                    entry.description,
                    entry.license,
                    entry.homepage,
                    entry.repo_url,
                    backends,
                    security,
                    entry.aqua_link,
                    entry.latest_version,
                    entry.version_count,
                    entry.last_updated,
                    synced_at
                ],
            )?;
        }
        Ok(chunk.len())
    })?;

    info!(count = updated, "Synced tool metadata");
    Ok(updated)
}

/// Upsert a tool's version catalog. Versions are never deleted.
pub fn sync_tool_versions(conn: &Connection, tool: &str, versions: &[ToolVersion]) -> Result<usize> {
    validate_tool_name(tool)?;
    for v in versions {
        validate_version(&v.version)?;
    }

    let tool_id = LookupCache::new().tool_id(conn, tool)?;
    let written = for_each_chunk(conn, versions, |tx, chunk| {
        for v in chunk {
            tx.execute(
                r#"
                INSERT INTO tool_versions (tool_id, version, created_at, release_url, prerelease)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(tool_id, version) DO UPDATE SET
                    created_at = excluded.created_at,
                    release_url = excluded.release_url,
                    prerelease = excluded.prerelease
                "#,
                params![tool_id, v.version, v.created_at, v.release_url, v.prerelease],
            )?;
        }
        Ok(chunk.len())
    })?;

    info!(tool, count = written, "Synced tool versions");
    Ok(written)
}

/// Metadata for one tool
pub fn get_tool_metadata(conn: &Connection, tool: &str) -> Result<ToolMetadata> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tools WHERE name = ?1", METADATA_COLUMNS),
            [tool],
            metadata_from_row,
        )
        .optional()?
        .ok_or_else(|| AnalyticsError::NotFound(format!("Tool '{}' not found", tool)))?;
    with_json(row)
}

/// Metadata for every known tool, by name
pub fn list_tools(conn: &Connection) -> Result<Vec<ToolMetadata>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tools ORDER BY name",
        METADATA_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], metadata_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(with_json).collect()
}

/// A tool's version catalog, newest release first
pub fn tool_versions(conn: &Connection, tool: &str, limit: usize) -> Result<Vec<ToolVersion>> {
    let tool_id = find_tool_id(conn, tool)?
        .ok_or_else(|| AnalyticsError::NotFound(format!("Tool '{}' not found", tool)))?;
    let mut stmt = conn.prepare(
        r#"
        SELECT version, created_at, release_url, prerelease
        FROM tool_versions
        WHERE tool_id = ?1
        ORDER BY created_at IS NULL, created_at DESC, id DESC
        LIMIT ?2
        "#,
    )?;
    let versions = stmt
        .query_map(params![tool_id, limit as i64], |row| {
            Ok(ToolVersion {
                version: row.get(0)?,
                created_at: row.get(1)?,
                release_url: row.get(2)?,
                prerelease: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(versions)
}

// =============================================================================
// Backend attribution
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackendBackfillSummary {
    /// Tools with a primary backend
    pub tools: usize,
    /// Raw downloads that received a backend id
    pub rows_updated: usize,
    /// Tools skipped because their backend list could not be decoded
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFinalizeSummary {
    /// Raw downloads still without a backend
    pub remaining_null: i64,
    pub index_created: bool,
}

/// Attribute unattributed raw downloads to their tool's primary backend
pub fn backfill_backend_ids(conn: &Connection) -> Result<BackendBackfillSummary> {
    let candidates: Vec<(i64, String, String)> = {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, backends FROM tools
            WHERE backends IS NOT NULL
              AND EXISTS (SELECT 1 FROM downloads d WHERE d.tool_id = tools.id AND d.backend_id IS NULL)
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut summary = BackendBackfillSummary::default();
    let mut primaries: Vec<(i64, String)> = Vec::with_capacity(candidates.len());
    for (tool_id, name, raw) in candidates {
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(list) => {
                if let Some(primary) = list.into_iter().find(|b| !b.trim().is_empty()) {
                    primaries.push((tool_id, primary));
                }
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Undecodable backend list, skipping");
                summary.skipped += 1;
            }
        }
    }
    summary.tools = primaries.len();

    let mut cache = LookupCache::new();
    summary.rows_updated = for_each_chunk(conn, &primaries, |tx, chunk| {
        let mut updated = 0;
        for (tool_id, primary) in chunk {
            let backend_id = cache.backend_id(tx, primary)?;
            updated += tx.execute(
                "UPDATE downloads SET backend_id = ?1 WHERE tool_id = ?2 AND backend_id IS NULL",
                params![backend_id, tool_id],
            )?;
        }
        Ok(updated)
    })?;

    info!(
        tools = summary.tools,
        rows_updated = summary.rows_updated,
        skipped = summary.skipped,
        "Backfilled download backend ids"
    );
    Ok(summary)
}

/// Report what the backfill left behind and index the attribution column
pub fn finalize_backend_migration(conn: &Connection) -> Result<BackendFinalizeSummary> {
    let remaining_null: i64 = conn.query_row(
        "SELECT COUNT(*) FROM downloads WHERE backend_id IS NULL",
        [],
        |row| row.get(0),
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_downloads_backend ON downloads(backend_id, created_at);",
    )?;
    if remaining_null > 0 {
        warn!(remaining_null, "Downloads without backend attribution remain");
    }
    Ok(BackendFinalizeSummary {
        remaining_null,
        index_created: true,
    })
}
