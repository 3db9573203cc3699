/// timeutil.rs — ISO-8601 <-> epoch-millisecond conversions
///
/// Bar times are i64 epoch milliseconds everywhere inside the system; every
/// bus payload and task field carries ISO-8601 UTC strings.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::QuotesError;

/// Parse an ISO-8601 timestamp (with or without offset, or a bare date)
/// into epoch milliseconds, assuming UTC when no offset is present.
pub fn parse_utc_ms(value: &str) -> Result<i64, QuotesError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(start) = date.and_hms_opt(0, 0, 0) {
            return Ok(start.and_utc().timestamp_millis());
        }
    }
    Err(QuotesError::BadRange(format!("unparseable datetime '{value}'")))
}

/// Epoch milliseconds to an ISO-8601 UTC string (second precision).
pub fn ms_to_iso(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => format!("invalid({ms})"),
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
