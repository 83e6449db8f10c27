//! UTC calendar-day arithmetic on Unix-second timestamps.
//!
//! Every bucket in the analytics schema is a UTC day stored as `YYYY-MM-DD`
//! text, while raw events carry Unix seconds.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::{AnalyticsError, Result};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Date format used for every `date` column
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Unix seconds at 00:00:00 UTC of `date`
pub fn day_start(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

/// Half-open `[start, end)` range in Unix seconds covering `date`
pub fn day_bounds(date: NaiveDate) -> (i64, i64) {
    let start = day_start(date);
    (start, start + SECONDS_PER_DAY)
}

/// The UTC date a Unix timestamp falls on
pub fn date_of(ts: i64) -> NaiveDate {
    let midnight = ts.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY;
    DateTime::from_timestamp(midnight, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Today's UTC date
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Current Unix time in seconds
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// `date` shifted by `days` (negative goes back)
pub fn shift(date: NaiveDate, days: i64) -> NaiveDate {
    date + Duration::days(days)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| AnalyticsError::ValidationError(format!("Invalid date '{}': {}", s, e)))
}

/// The `days` dates ending at `end` (inclusive), oldest first
pub fn trailing_dates(end: NaiveDate, days: i64) -> Vec<NaiveDate> {
    (0..days.max(0)).rev().map(|i| shift(end, -i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_day_start_known_value() {
        // 2024-01-01T00:00:00Z
        assert_eq!(day_start(d("2024-01-01")), 1_704_067_200);
    }

    #[test]
    fn test_day_bounds_width() {
        let (start, end) = day_bounds(d("2024-06-01"));
        assert_eq!(end - start, SECONDS_PER_DAY);
    }

    #[test]
    fn test_date_of_edges() {
        let start = day_start(d("2024-06-01"));
        assert_eq!(date_of(start), d("2024-06-01"));
        assert_eq!(date_of(start + SECONDS_PER_DAY - 1), d("2024-06-01"));
        assert_eq!(date_of(start - 1), d("2024-05-31"));
    }

    #[test]
    fn test_trailing_dates_oldest_first() {
        let dates = trailing_dates(d("2024-03-02"), 3);
        assert_eq!(dates, vec![d("2024-02-29"), d("2024-03-01"), d("2024-03-02")]);
        assert!(trailing_dates(d("2024-03-02"), 0).is_empty());
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("2024-13-01").is_err());
        assert!(parse_date("yesterday").is_err());
    }
}
