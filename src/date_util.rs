use chrono::{DateTime, Utc};

/// Storage format for timestamps. Fixed width, so lexical order is chronological.
const DB_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for storage.
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.format(DB_FORMAT).to_string()
}

/// Parse a stored (or any RFC 3339) timestamp.
pub fn from_db(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// `YYYY-MM-DD` for the UTC calendar day of `ts`.
pub fn date_key(ts: &DateTime<Utc>) -> String {
    ts.date_naive().format("%Y-%m-%d").to_string()
}

/// Whole minutes from `now` until `then`, rounded up. Zero when `then` has passed.
pub fn minutes_until(now: &DateTime<Utc>, then: &DateTime<Utc>) -> i64 {
    let secs = (*then - *now).num_seconds();
    if secs <= 0 {
        0
    } else {
        (secs + 59) / 60
    }
}
