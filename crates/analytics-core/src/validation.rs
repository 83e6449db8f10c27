//! Input validation for Toolpulse ingestion and admin payloads
//!
//! Provides validation functions to reject:
//! - Missing or blank required fields
//! - Excessively long inputs (bounded lookup-table growth)
//! - Control characters in identifiers
//! - Out-of-range query windows

use crate::{AnalyticsError, DownloadEvent, Result};

/// Maximum length for tool names
pub const MAX_TOOL_NAME_LEN: usize = 100;

/// Maximum length for version strings
pub const MAX_VERSION_LEN: usize = 100;

/// Maximum length for os/arch values
pub const MAX_PLATFORM_LEN: usize = 32;

/// Maximum length for full backend identifiers
pub const MAX_BACKEND_LEN: usize = 255;

/// Largest window (in days) accepted by read endpoints and backfills
pub const MAX_WINDOW_DAYS: i64 = 365;

/// Largest compaction horizon (in days); 0 compacts everything before today
pub const MAX_HORIZON_DAYS: i64 = 36_500;

fn validate_text(value: &str, field_name: &str, max_len: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AnalyticsError::ValidationError(format!(
            "{} is required",
            field_name
        )));
    }

    if value.len() > max_len {
        return Err(AnalyticsError::ValidationError(format!(
            "{} too long: {} > {} characters",
            field_name,
            value.len(),
            max_len
        )));
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(AnalyticsError::ValidationError(format!(
            "{} contains control characters",
            field_name
        )));
    }

    Ok(())
}

/// Validate a tool name
///
/// Requirements:
/// - Not empty or blank
/// - <= 100 characters
/// - No whitespace or control characters
pub fn validate_tool_name(name: &str) -> Result<()> {
    validate_text(name, "tool", MAX_TOOL_NAME_LEN)?;

    if name.chars().any(char::is_whitespace) {
        return Err(AnalyticsError::ValidationError(
            "tool cannot contain whitespace".to_string(),
        ));
    }

    Ok(())
}

/// Validate a version string
pub fn validate_version(version: &str) -> Result<()> {
    validate_text(version, "version", MAX_VERSION_LEN)
}

/// Validate an optional os or arch value. Blank counts as absent.
pub fn validate_platform_part(value: Option<&str>, field_name: &str) -> Result<()> {
    match value {
        Some(v) if !v.trim().is_empty() => validate_text(v, field_name, MAX_PLATFORM_LEN),
        _ => Ok(()),
    }
}

/// Validate an optional full backend identifier (e.g. "aqua:nodejs/node")
pub fn validate_backend(value: Option<&str>) -> Result<()> {
    match value {
        Some(v) if !v.trim().is_empty() => validate_text(v, "full", MAX_BACKEND_LEN),
        _ => Ok(()),
    }
}

/// Validate a download event before anything is written
pub fn validate_download(event: &DownloadEvent) -> Result<()> {
    validate_tool_name(&event.tool)?;
    validate_version(&event.version)?;
    validate_platform_part(event.os.as_deref(), "os")?;
    validate_platform_part(event.arch.as_deref(), "arch")?;
    validate_backend(event.backend.as_deref())?;

    if event.actor.is_empty() {
        return Err(AnalyticsError::ValidationError(
            "actor fingerprint is required".to_string(),
        ));
    }

    Ok(())
}

/// Validate a window length in days
///
/// Ensures the window is between 1 and 365 days (inclusive)
pub fn validate_days(days: i64, field_name: &str) -> Result<()> {
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(AnalyticsError::ValidationError(format!(
            "{} must be between 1 and {}, got {}",
            field_name, MAX_WINDOW_DAYS, days
        )));
    }
    Ok(())
}

/// Validate a compaction horizon in days
///
/// Zero is allowed; the upper bound keeps the cutoff arithmetic in range
pub fn validate_horizon_days(days: i64, field_name: &str) -> Result<()> {
    if !(0..=MAX_HORIZON_DAYS).contains(&days) {
        return Err(AnalyticsError::ValidationError(format!(
            "{} must be between 0 and {}, got {}",
            field_name, MAX_HORIZON_DAYS, days
        )));
    }
    Ok(())
}

/// Normalize an optional free-text field: trimmed, blank becomes `None`
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Backend type of a full backend identifier: the text before the first ':'
///
/// An identifier without a ':' is its own type.
pub fn backend_type(full: &str) -> &str {
    full.split(':').next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tool: &str, version: &str) -> DownloadEvent {
        DownloadEvent {
            tool: tool.to_string(),
            version: version.to_string(),
            actor: "abc123".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_tool_names() {
        assert!(validate_tool_name("node").is_ok());
        assert!(validate_tool_name("cargo:ripgrep").is_ok());
        assert!(validate_tool_name("aqua-tool_1.2").is_ok());
    }

    #[test]
    fn test_invalid_tool_names() {
        assert!(validate_tool_name("").is_err()); // Empty
        assert!(validate_tool_name("   ").is_err()); // Blank
        assert!(validate_tool_name(&"a".repeat(101)).is_err()); // Too long
        assert!(validate_tool_name("my tool").is_err()); // Space
        assert!(validate_tool_name("tool\n").is_err()); // Control
    }

    #[test]
    fn test_validate_download() {
        assert!(validate_download(&event("node", "20.0.0")).is_ok());
        assert!(validate_download(&event("", "20.0.0")).is_err());
        assert!(validate_download(&event("node", "")).is_err());

        let mut e = event("node", "20.0.0");
        e.os = Some("x".repeat(33));
        assert!(validate_download(&e).is_err());

        let mut e = event("node", "20.0.0");
        e.os = Some("  ".to_string());
        assert!(validate_download(&e).is_ok(), "blank os counts as absent");

        let mut e = event("node", "20.0.0");
        e.actor.clear();
        assert!(validate_download(&e).is_err());
    }

    #[test]
    fn test_validate_days() {
        assert!(validate_days(1, "days").is_ok());
        assert!(validate_days(365, "days").is_ok());
        assert!(validate_days(0, "days").is_err());
        assert!(validate_days(-3, "days").is_err());
        assert!(validate_days(366, "days").is_err());
    }

    #[test]
    fn test_validate_horizon_days() {
        assert!(validate_horizon_days(0, "horizon_days").is_ok());
        assert!(validate_horizon_days(90, "horizon_days").is_ok());
        assert!(validate_horizon_days(MAX_HORIZON_DAYS, "horizon_days").is_ok());
        assert!(validate_horizon_days(-1, "horizon_days").is_err());
        assert!(validate_horizon_days(MAX_HORIZON_DAYS + 1, "horizon_days").is_err());
        assert!(validate_horizon_days((1 << 57) - 10, "horizon_days").is_err());
    }

    #[test]
    fn test_normalize_optional() {
        assert_eq!(normalize_optional(Some(" linux ")), Some("linux".to_string()));
        assert_eq!(normalize_optional(Some("")), None);
        assert_eq!(normalize_optional(None), None);
    }

    #[test]
    fn test_backend_type() {
        assert_eq!(backend_type("aqua:nodejs/node"), "aqua");
        assert_eq!(backend_type("cargo:ripgrep"), "cargo");
        assert_eq!(backend_type("core"), "core");
        assert_eq!(backend_type("vfox:a:b"), "vfox");
    }
}
