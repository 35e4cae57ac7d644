use chrono::{DateTime, Utc};

use crate::date_util;
use crate::error::Result;
use crate::storage::repository::{self, IntegrationHealth};
use crate::storage::Database;
use crate::sync::rate_limit::RateLimitSnapshot;

pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_ERROR: &str = "error";

/// Quota and traffic figures observed during one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthTelemetry {
    pub remaining_requests: Option<u32>,
    pub rate_limit_reset: Option<DateTime<Utc>>,
    pub request_count: u64,
}

impl HealthTelemetry {
    pub fn from_snapshot(snapshot: Option<&RateLimitSnapshot>, request_count: u64) -> Self {
        Self {
            remaining_requests: snapshot.and_then(|s| s.remaining),
            rate_limit_reset: snapshot.and_then(|s| s.reset),
            request_count,
        }
    }

    fn quota_exhausted(&self) -> bool {
        self.remaining_requests == Some(0)
    }
}

fn row(
    provider: &str,
    status: &str,
    now: DateTime<Utc>,
    last_error: Option<String>,
    is_rate_limited: bool,
    telemetry: &HealthTelemetry,
) -> IntegrationHealth {
    let stamp = date_util::to_db(&now);
    IntegrationHealth {
        provider: provider.to_string(),
        status: status.to_string(),
        last_synced: (status == STATUS_CONNECTED).then(|| stamp.clone()),
        last_error,
        remaining_requests: telemetry.remaining_requests.map(i64::from),
        rate_limit_reset: telemetry.rate_limit_reset.as_ref().map(date_util::to_db),
        request_count: i64::try_from(telemetry.request_count).unwrap_or(i64::MAX),
        is_rate_limited,
        updated_at: stamp,
    }
}

/// Record a completed run. `rate_limited` is set when part of the run was
/// throttled even though the run itself completed.
pub async fn record_success(
    db: &Database,
    provider: &str,
    now: DateTime<Utc>,
    rate_limited: bool,
    telemetry: &HealthTelemetry,
) -> Result<()> {
    let health = row(
        provider,
        STATUS_CONNECTED,
        now,
        None,
        rate_limited || telemetry.quota_exhausted(),
        telemetry,
    );
    db.writer()
        .call(move |conn| repository::upsert_integration_health(conn, &health))
        .await?;
    Ok(())
}

/// Record a failed run. The last successful sync time is preserved.
pub async fn record_failure(
    db: &Database,
    provider: &str,
    now: DateTime<Utc>,
    error_message: &str,
    rate_limited: bool,
    telemetry: &HealthTelemetry,
) -> Result<()> {
    let health = row(
        provider,
        STATUS_ERROR,
        now,
        Some(error_message.to_string()),
        rate_limited || telemetry.quota_exhausted(),
        telemetry,
    );
    db.writer()
        .call(move |conn| repository::upsert_integration_health(conn, &health))
        .await?;
    Ok(())
}

pub async fn get(db: &Database, provider: &str) -> Result<Option<IntegrationHealth>> {
    let provider = provider.to_string();
    let health = db
        .reader()
        .call(move |conn| repository::get_integration_health(conn, &provider))
        .await?;
    Ok(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_success_then_failure_keeps_last_synced() {
        let db = Database::open_memory().await.unwrap();
        let telemetry = HealthTelemetry {
            remaining_requests: Some(80),
            rate_limit_reset: Some(now() + Duration::minutes(1)),
            request_count: 12,
        };
        record_success(&db, "hostaway", now(), false, &telemetry).await.unwrap();

        let ok = get(&db, "hostaway").await.unwrap().unwrap();
        assert_eq!(ok.status, STATUS_CONNECTED);
        assert_eq!(ok.last_synced.as_deref(), Some("2026-05-01T12:00:00.000Z"));
        assert_eq!(ok.remaining_requests, Some(80));
        assert_eq!(ok.request_count, 12);
        assert!(!ok.is_rate_limited);
        assert!(ok.last_error.is_none());

        let later = now() + Duration::minutes(30);
        record_failure(
            &db,
            "hostaway",
            later,
            "Rate limited (429 Too Many Requests) on listings",
            true,
            &HealthTelemetry::from_snapshot(None, 2),
        )
        .await
        .unwrap();

        let failed = get(&db, "hostaway").await.unwrap().unwrap();
        assert_eq!(failed.status, STATUS_ERROR);
        assert_eq!(failed.last_synced, ok.last_synced);
        assert!(failed.last_error.unwrap().contains("429"));
        assert!(failed.is_rate_limited);
        assert_eq!(failed.request_count, 2);
        // No new snapshot this run, so the last known quota stays
        assert_eq!(failed.remaining_requests, Some(80));

        record_success(&db, "hostaway", later, false, &HealthTelemetry::default()).await.unwrap();
        let recovered = get(&db, "hostaway").await.unwrap().unwrap();
        assert_eq!(recovered.status, STATUS_CONNECTED);
        assert!(recovered.last_error.is_none());
        assert!(!recovered.is_rate_limited);
    }

    #[tokio::test]
    async fn test_exhausted_quota_flags_rate_limited() {
        let db = Database::open_memory().await.unwrap();
        let snapshot = RateLimitSnapshot {
            endpoint: "reservations".into(),
            rate_limit: 60,
            remaining: Some(0),
            reset: None,
            captured_at: now(),
        };
        record_success(
            &db,
            "hostaway",
            now(),
            false,
            &HealthTelemetry::from_snapshot(Some(&snapshot), 60),
        )
        .await
        .unwrap();

        let health = get(&db, "hostaway").await.unwrap().unwrap();
        assert!(health.is_rate_limited);
        assert_eq!(health.remaining_requests, Some(0));
    }

    #[tokio::test]
    async fn test_throttled_completed_run_flags_rate_limited() {
        let db = Database::open_memory().await.unwrap();
        record_success(&db, "hostaway", now(), true, &HealthTelemetry::from_snapshot(None, 4))
            .await
            .unwrap();

        let health = get(&db, "hostaway").await.unwrap().unwrap();
        assert_eq!(health.status, STATUS_CONNECTED);
        assert!(health.is_rate_limited);
        assert!(health.remaining_requests.is_none());
    }
}
