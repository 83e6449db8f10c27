//! Upstream access token pool
//!
//! Tokens granted through OAuth are rotated to spread load across the
//! upstream API's per-credential rate limits.
//!
//! # Lifecycle
//!
//! - **active**: selectable, least recently used first
//! - **rate-limited**: skipped until `rate_limited_until` passes; staleness is
//!   resolved at selection time, with no separate transition back
//! - **deactivated**: terminal; expired, rejected upstream or revoked
//!
//! The pool is shared mutable state across requests. Writes are
//! last-writer-wins: two requests that both find a token rate-limited both
//! record a similar reset time, which is harmless.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use toolpulse_analytics_core::days::{now_ts, SECONDS_PER_DAY};
use toolpulse_analytics_core::{AccessToken, AnalyticsError, Result};
use toolpulse_analytics_storage::{for_each_chunk, AnalyticsBackend};
use tracing::{debug, info, warn};

use crate::github::{UpstreamApi, UpstreamResponse};

/// Upper bound on upstream probes (validation or quota) per selection
pub const MAX_PROBE_ATTEMPTS: usize = 5;

/// Tokens validated more recently than this are not re-probed
pub const VALIDATION_TTL_SECS: i64 = SECONDS_PER_DAY;

/// Rate-limit window assumed when the upstream gives no reset time
pub const FALLBACK_RATE_LIMIT_SECS: i64 = 3_600;

/// Attempts per proxied call before giving up
pub const MAX_PROXY_ATTEMPTS: usize = 3;

/// Tokens expiring within this window are reported by the health check
pub const EXPIRING_SOON_SECS: i64 = 7 * SECONDS_PER_DAY;

const TOKEN_COLUMNS: &str = "id, user_id, token, is_active, usage_count, last_used, last_validated, expires_at, rate_limited_until, created_at";

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    Ok(AccessToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        usage_count: row.get(4)?,
        last_used: row.get(5)?,
        last_validated: row.get(6)?,
        expires_at: row.get(7)?,
        rate_limited_until: row.get(8)?,
        created_at: row.get(9)?,
    })
}

// =============================================================================
// Storage operations
// =============================================================================

/// Register a granted token, reactivating it if the secret is already known.
///
/// Returns the token id.
pub fn insert_token(
    conn: &Connection,
    user_id: &str,
    token: &str,
    expires_at: Option<i64>,
    now: i64,
) -> Result<i64> {
    if user_id.trim().is_empty() || token.trim().is_empty() {
        return Err(AnalyticsError::ValidationError(
            "user_id and token are required".to_string(),
        ));
    }
    conn.execute(
        r#"
        INSERT INTO access_tokens (user_id, token, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(token) DO UPDATE SET
            user_id = excluded.user_id,
            expires_at = excluded.expires_at,
            is_active = 1,
            rate_limited_until = NULL
        "#,
        params![user_id, token, expires_at, now],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM access_tokens WHERE token = ?1",
        [token],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_token(conn: &Connection, id: i64) -> Result<Option<AccessToken>> {
    let token = conn
        .query_row(
            &format!("SELECT {} FROM access_tokens WHERE id = ?1", TOKEN_COLUMNS),
            [id],
            token_from_row,
        )
        .optional()?;
    Ok(token)
}

/// Selectable tokens at `now`, least recently used first (never used first
/// of all), skipping ids in `exclude`
pub fn select_candidates(conn: &Connection, now: i64, exclude: &[i64]) -> Result<Vec<AccessToken>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {} FROM access_tokens
        WHERE is_active = 1
          AND (rate_limited_until IS NULL OR rate_limited_until <= ?1)
          AND (expires_at IS NULL OR expires_at > ?1)
        ORDER BY last_used IS NOT NULL, last_used ASC, id ASC
        "#,
        TOKEN_COLUMNS
    ))?;
    let tokens = stmt
        .query_map([now], token_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tokens
        .into_iter()
        .filter(|t| !exclude.contains(&t.id))
        .collect())
}

pub fn record_usage(conn: &Connection, id: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE access_tokens SET usage_count = usage_count + 1, last_used = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

pub fn mark_validated(conn: &Connection, id: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE access_tokens SET last_validated = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Skip the token until `reset_at`. Returns false for an unknown id.
pub fn mark_rate_limited(conn: &Connection, id: i64, reset_at: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE access_tokens SET rate_limited_until = ?2 WHERE id = ?1",
        params![id, reset_at],
    )?;
    Ok(updated > 0)
}

/// Force the next selection of this token to re-validate it upstream
pub fn flag_for_revalidation(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE access_tokens SET last_validated = NULL WHERE id = ?1",
        [id],
    )?;
    Ok(())
}

pub fn deactivate(conn: &Connection, id: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE access_tokens SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        [id],
    )?;
    Ok(updated > 0)
}

/// Deactivate every active token whose expiry has passed
pub fn deactivate_expired(conn: &Connection, now: i64) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE access_tokens SET is_active = 0 WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
        [now],
    )?;
    if updated > 0 {
        info!(count = updated, "Deactivated expired tokens");
    }
    Ok(updated)
}

pub fn delete_token(conn: &Connection, id: i64) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM access_tokens WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}

/// Delete tokens in bounded chunks; returns the number removed
pub fn delete_tokens(conn: &Connection, ids: &[i64]) -> Result<usize> {
    for_each_chunk(conn, ids, |tx, chunk| {
        let mut deleted = 0;
        for id in chunk {
            deleted += tx.execute("DELETE FROM access_tokens WHERE id = ?1", [id])?;
        }
        Ok(deleted)
    })
}

/// Pool composition at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub total: i64,
    pub active: i64,
    pub rate_limited: i64,
    pub inactive: i64,
    pub total_usage: i64,
    /// Active tokens expiring within seven days
    pub expiring_soon: Vec<AccessToken>,
    /// Every token, most used first (secrets are never serialized)
    pub tokens: Vec<AccessToken>,
}

pub fn pool_health(conn: &Connection, now: i64) -> Result<PoolHealth> {
    let (total, active, rate_limited, inactive, total_usage): (i64, i64, i64, i64, i64) = conn
        .query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN is_active = 1 AND (rate_limited_until IS NULL OR rate_limited_until <= ?1) THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_active = 1 AND rate_limited_until > ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_active = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(usage_count), 0)
            FROM access_tokens
            "#,
            [now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM access_tokens ORDER BY usage_count DESC, id ASC",
        TOKEN_COLUMNS
    ))?;
    let tokens = stmt
        .query_map([], token_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let expiring_soon = tokens
        .iter()
        .filter(|t| {
            t.is_active
                && t.expires_at
                    .is_some_and(|exp| exp > now && exp <= now + EXPIRING_SOON_SECS)
        })
        .cloned()
        .collect();

    Ok(PoolHealth {
        total,
        active,
        rate_limited,
        inactive,
        total_usage,
        expiring_soon,
        tokens,
    })
}

// =============================================================================
// Rotation
// =============================================================================

/// Failure of a proxied upstream call
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No upstream token available")]
    NoToken,

    #[error("Upstream request failed after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error(transparent)]
    Analytics(#[from] AnalyticsError),
}

/// Per-token result of probing the whole pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenTestResult {
    pub id: i64,
    pub user_id: String,
    pub valid: Option<bool>,
    pub remaining: Option<i64>,
    pub reset: Option<i64>,
    pub error: Option<String>,
}

/// Token selection and failover over a storage backend
pub struct TokenPool<B: AnalyticsBackend> {
    backend: Arc<B>,
}

impl<B: AnalyticsBackend> Clone for TokenPool<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: AnalyticsBackend + 'static> TokenPool<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Run `f` on the blocking pool with a fresh connection.
    ///
    /// Connections never live across an await, and a busy database never
    /// stalls an async worker.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let conn = backend.get_connection()?;
            f(&conn)
        })
        .await
        .map_err(|e| AnalyticsError::Other(format!("storage task failed: {}", e)))?
    }

    /// Pick the next usable token, or `None` when the pool has nothing to offer.
    ///
    /// Tokens not validated in the last day are validated upstream first and
    /// deactivated if rejected. With `min_remaining`, a token whose live
    /// quota is below it is marked rate-limited and skipped. At most
    /// [`MAX_PROBE_ATTEMPTS`] probing candidates are tried per call.
    pub async fn next_token(
        &self,
        upstream: &dyn UpstreamApi,
        min_remaining: Option<i64>,
    ) -> Result<Option<AccessToken>> {
        let now = now_ts();
        self.with_conn(move |c| deactivate_expired(c, now)).await?;

        let mut tried: Vec<i64> = Vec::new();
        let mut probes = 0;

        loop {
            let exclude = tried.clone();
            let candidate = self
                .with_conn(move |c| Ok(select_candidates(c, now_ts(), &exclude)?.into_iter().next()))
                .await?;
            let Some(token) = candidate else {
                debug!(tried = tried.len(), "No selectable token");
                #[cfg(feature = "metrics")]
                crate::metrics::record_token_selection("empty");
                return Ok(None);
            };
            tried.push(token.id);

            let needs_validation = token
                .last_validated
                .map_or(true, |at| now - at >= VALIDATION_TTL_SECS);
            if needs_validation || min_remaining.is_some() {
                if probes >= MAX_PROBE_ATTEMPTS {
                    warn!(probes, "Token probe budget exhausted");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_token_selection("exhausted");
                    return Ok(None);
                }
                probes += 1;
            }

            if needs_validation {
                match upstream.validate_token(&token.token).await {
                    Ok(true) => {
                        let id = token.id;
                        self.with_conn(move |c| mark_validated(c, id, now)).await?
                    }
                    Ok(false) => {
                        warn!(token_id = token.id, "Token rejected upstream, deactivating");
                        let id = token.id;
                        self.with_conn(move |c| deactivate(c, id)).await?;
                        continue;
                    }
                    Err(e) => {
                        warn!(token_id = token.id, error = %e, "Token validation failed, trying next");
                        continue;
                    }
                }
            }

            if let Some(min) = min_remaining {
                match upstream.rate_limit(&token.token).await {
                    Ok(limit) if limit.remaining < min => {
                        let reset = limit.reset.unwrap_or(now + FALLBACK_RATE_LIMIT_SECS);
                        debug!(token_id = token.id, remaining = limit.remaining, reset, "Token below quota floor");
                        let id = token.id;
                        self.with_conn(move |c| mark_rate_limited(c, id, reset)).await?;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(token_id = token.id, error = %e, "Quota probe failed, trying next");
                        continue;
                    }
                }
            }

            let id = token.id;
            let selected = self
                .with_conn(move |c| {
                    record_usage(c, id, now)?;
                    get_token(c, id)
                })
                .await?;
            #[cfg(feature = "metrics")]
            crate::metrics::record_token_selection("selected");
            return Ok(Some(selected.unwrap_or(token)));
        }
    }

    /// GET `path` upstream, rotating tokens on auth and quota failures.
    ///
    /// - 401: the token is flagged for re-validation and the call rotates
    /// - 403 with zero remaining quota, or 429: the token is rate-limited
    ///   until the reported reset (one hour without one) and the call rotates
    /// - transport errors rotate as well
    ///
    /// Any other response is returned as is.
    pub async fn proxy_get(
        &self,
        upstream: &dyn UpstreamApi,
        path: &str,
    ) -> std::result::Result<UpstreamResponse, ProxyError> {
        for attempt in 1..=MAX_PROXY_ATTEMPTS {
            let Some(token) = self.next_token(upstream, None).await? else {
                return Err(ProxyError::NoToken);
            };

            let response = match upstream.get(&token.token, path).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(token_id = token.id, attempt, error = %e, "Upstream request failed");
                    continue;
                }
            };

            let quota_exhausted = response.rate_limit.is_some_and(|r| r.remaining == 0);
            match response.status {
                401 => {
                    warn!(token_id = token.id, attempt, "Upstream returned 401, flagging token");
                    let id = token.id;
                    self.with_conn(move |c| flag_for_revalidation(c, id)).await?;
                }
                429 | 403 if response.status == 429 || quota_exhausted => {
                    let reset = response
                        .rate_limit
                        .and_then(|r| r.reset)
                        .unwrap_or(now_ts() + FALLBACK_RATE_LIMIT_SECS);
                    warn!(token_id = token.id, attempt, reset, "Token rate limited upstream");
                    let id = token.id;
                    self.with_conn(move |c| mark_rate_limited(c, id, reset)).await?;
                }
                _ => return Ok(response),
            }
        }

        Err(ProxyError::Exhausted {
            attempts: MAX_PROXY_ATTEMPTS,
        })
    }

    /// Probe every active token for validity and quota.
    ///
    /// Rejected tokens are deactivated; valid ones are marked validated.
    pub async fn test_all_tokens(&self, upstream: &dyn UpstreamApi) -> Result<Vec<TokenTestResult>> {
        let now = now_ts();
        let tokens: Vec<AccessToken> = self
            .with_conn(|c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {} FROM access_tokens WHERE is_active = 1 ORDER BY id",
                    TOKEN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], token_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut results = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut result = TokenTestResult {
                id: token.id,
                user_id: token.user_id.clone(),
                valid: None,
                remaining: None,
                reset: None,
                error: None,
            };

            match upstream.validate_token(&token.token).await {
                Ok(true) => {
                    result.valid = Some(true);
                    let id = token.id;
                    self.with_conn(move |c| mark_validated(c, id, now)).await?;
                    match upstream.rate_limit(&token.token).await {
                        Ok(limit) => {
                            result.remaining = Some(limit.remaining);
                            result.reset = limit.reset;
                        }
                        Err(e) => result.error = Some(e.to_string()),
                    }
                }
                Ok(false) => {
                    result.valid = Some(false);
                    let id = token.id;
                    self.with_conn(move |c| deactivate(c, id)).await?;
                }
                Err(e) => result.error = Some(e.to_string()),
            }
            results.push(result);
        }

        info!(count = results.len(), "Tested token pool");
        Ok(results)
    }
}
