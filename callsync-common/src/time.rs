//! Timestamp utilities
//!
//! Timestamps are persisted as INTEGER unix milliseconds so SQL can compare
//! them numerically (the ordering guard depends on this).

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a timestamp to unix milliseconds for storage
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored unix milliseconds back to a timestamp
///
/// Out-of-range values clamp to the unix epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Parse a provider timestamp
///
/// Accepts RFC 3339, RFC 2822 (`Tue, 15 Oct 2024 10:00:00 +0000`) and bare
/// unix seconds. Returns `None` for anything else.
pub fn parse_provider_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(ts) = DateTime::parse_from_rfc2822(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
