use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::date_util;
use crate::error::Result;
use crate::storage::{repository, Database};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const EXPIRE_AFTER_HEADERS: &[&str] = &[
    "x-ratelimit-expire-after-seconds",
    "x-ratelimit-expire-after",
];

/// Reset values at or above this are unix epoch seconds; below it they are
/// a relative number of seconds.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Matches the display text of the errors `Error::is_rate_limited` accepts:
/// `RateLimited` and `Http` with status 429.
static RE_RATE_LIMITED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:Rate limited \(429 Too Many Requests\)|HTTP 429 from )").unwrap());

/// Rate-limit state reported by one API response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSnapshot {
    pub endpoint: String,
    pub rate_limit: u32,
    pub remaining: Option<u32>,
    pub reset: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

/// Read the rate-limit headers of a response.
///
/// Returns `None` when the quota header is missing, which callers must read
/// as "no information" rather than "unlimited".
pub fn extract(endpoint: &str, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitSnapshot> {
    let rate_limit = header_str(headers, LIMIT_HEADER)?.parse::<u32>().ok()?;
    let remaining = header_str(headers, REMAINING_HEADER).and_then(|v| v.parse::<u32>().ok());

    let reset = header_str(headers, RESET_HEADER)
        .and_then(|v| parse_reset(v, now))
        .or_else(|| {
            EXPIRE_AFTER_HEADERS
                .iter()
                .find_map(|name| header_str(headers, name))
                .and_then(|v| v.parse::<i64>().ok())
                .map(|secs| now + Duration::seconds(secs.max(0)))
        });

    Some(RateLimitSnapshot {
        endpoint: endpoint.to_string(),
        rate_limit,
        remaining,
        reset,
        captured_at: now,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(ts) = date_util::from_db(value) {
        return Some(ts);
    }
    let n = value.parse::<i64>().ok()?;
    if n >= EPOCH_THRESHOLD {
        DateTime::from_timestamp(n, 0)
    } else {
        Some(now + Duration::seconds(n.max(0)))
    }
}

/// Whether a stored run message describes a remote rate-limit rejection.
pub fn is_rate_limit_message(message: &str) -> bool {
    RE_RATE_LIMITED.is_match(message)
}

/// Append a snapshot to the rate-limit log. No-op for `None`.
pub async fn record(db: &Database, snapshot: Option<&RateLimitSnapshot>) -> Result<()> {
    let Some(snapshot) = snapshot.cloned() else {
        return Ok(());
    };
    db.writer()
        .call(move |conn| repository::insert_rate_limit_snapshot(conn, &snapshot))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_extract_full_headers() {
        let h = headers(&[
            ("X-RateLimit-Limit", "120"),
            ("X-RateLimit-Remaining", "37"),
            ("X-RateLimit-Reset", "2026-05-01T12:10:00Z"),
        ]);
        let snap = extract("listings", &h, now()).unwrap();
        assert_eq!(snap.endpoint, "listings");
        assert_eq!(snap.rate_limit, 120);
        assert_eq!(snap.remaining, Some(37));
        assert_eq!(snap.reset, Some(Utc.with_ymd_and_hms(2026, 5, 1, 12, 10, 0).unwrap()));
        assert_eq!(snap.captured_at, now());
    }

    #[test]
    fn test_missing_quota_is_no_information() {
        let h = headers(&[("X-RateLimit-Remaining", "10")]);
        assert!(extract("auth", &h, now()).is_none());
        assert!(extract("auth", &HeaderMap::new(), now()).is_none());
        let h = headers(&[("X-RateLimit-Limit", "many")]);
        assert!(extract("auth", &h, now()).is_none());
    }

    #[test]
    fn test_expire_after_fallback() {
        let h = headers(&[
            ("X-RateLimit-Limit", "60"),
            ("X-RateLimit-Expire-After-Seconds", "90"),
        ]);
        let snap = extract("reservations", &h, now()).unwrap();
        assert_eq!(snap.remaining, None);
        assert_eq!(snap.reset, Some(now() + Duration::seconds(90)));
    }

    #[test]
    fn test_reset_as_epoch_or_relative_seconds() {
        let epoch = now().timestamp() + 300;
        let h = headers(&[("X-RateLimit-Limit", "60"), ("X-RateLimit-Reset", &epoch.to_string())]);
        assert_eq!(
            extract("x", &h, now()).unwrap().reset,
            Some(now() + Duration::seconds(300))
        );

        let h = headers(&[("X-RateLimit-Limit", "60"), ("X-RateLimit-Reset", "45")]);
        assert_eq!(
            extract("x", &h, now()).unwrap().reset,
            Some(now() + Duration::seconds(45))
        );
    }

    #[test]
    fn test_is_rate_limit_message() {
        assert!(is_rate_limit_message("Rate limited (429 Too Many Requests) on listings"));
        assert!(is_rate_limit_message("HTTP 429 from reservations: slow down"));
        assert!(!is_rate_limit_message("HTTP 500 from listings: boom"));
        assert!(!is_rate_limit_message("HTTP 500 from listings: upstream rate limit exceeded"));
        assert!(!is_rate_limit_message("HTTP 503 from listings: 429 Too Many Requests"));
        assert!(!is_rate_limit_message("Synced 4290 listings"));
    }

    #[tokio::test]
    async fn test_record_appends_snapshot() {
        let db = Database::open_memory().await.unwrap();
        let snap = RateLimitSnapshot {
            endpoint: "auth".into(),
            rate_limit: 100,
            remaining: Some(99),
            reset: None,
            captured_at: now(),
        };
        record(&db, None).await.unwrap();
        record(&db, Some(&snap)).await.unwrap();

        let latest = db
            .reader()
            .call(|conn| repository::latest_rate_limit_snapshot(conn))
            .await
            .unwrap();
        assert_eq!(latest, Some(snap));
    }
}
