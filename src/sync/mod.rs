pub mod bookings;
pub mod cooldown;
pub mod health;
pub mod housekeeping;
pub mod listings;
pub mod orchestrator;
pub mod rate_limit;
pub mod token;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;

pub use cooldown::{GateDecision, GateState};

/// Callbacks for reporting sync progress. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_gate(&self, _decision: &GateDecision) {}
    fn on_listings_page(&self, _page: u32, _count: usize) {}
    fn on_listings_complete(&self, _summary: &listings::ListingsSummary) {}
    fn on_bookings_start(&self, _listings: usize, _concurrency: usize) {}
    fn on_listing_bookings(&self, _listing_id: &str, _result: &Result<bookings::ListingBookings, String>) {}
    fn on_complete(&self, _response: &SyncResponse) {}
}

/// A no-op progress reporter.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Successful run summary returned by the trigger surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub success: bool,
    pub listings_count: usize,
    pub bookings_synced: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_bookings: Option<usize>,
    pub message: String,
}

/// Failed or throttled run, with an HTTP-style status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub success: bool,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Completed(SyncSummary),
    Failed(SyncFailure),
}

impl SyncResponse {
    pub fn completed(listings_count: usize, bookings_synced: usize, failed_bookings: usize) -> Self {
        SyncResponse::Completed(SyncSummary {
            success: true,
            listings_count,
            bookings_synced,
            failed_bookings: (failed_bookings > 0).then_some(failed_bookings),
            message: completion_message(listings_count, bookings_synced, failed_bookings),
        })
    }

    /// 429 response for a run the cooldown gate refused.
    pub fn blocked(decision: &GateDecision) -> Self {
        SyncResponse::Failed(SyncFailure {
            success: false,
            status: 429,
            message: decision
                .message
                .clone()
                .unwrap_or_else(|| "Sync blocked".to_string()),
            next_retry_time: decision.next_retry_time,
        })
    }

    pub fn from_error(error: &Error, next_retry_time: Option<DateTime<Utc>>) -> Self {
        SyncResponse::Failed(SyncFailure {
            success: false,
            status: error.status_code(),
            message: error.to_string(),
            next_retry_time,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncResponse::Completed(_))
    }

    /// HTTP-style status: 200 on success.
    pub fn status(&self) -> u16 {
        match self {
            SyncResponse::Completed(_) => 200,
            SyncResponse::Failed(f) => f.status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SyncResponse::Completed(s) => &s.message,
            SyncResponse::Failed(f) => &f.message,
        }
    }
}

/// Message stored on a completed run, embedding the failed-listing count.
pub fn completion_message(listings: usize, bookings: usize, failed: usize) -> String {
    let mut message = format!("Synced {listings} listings and {bookings} bookings");
    if failed > 0 {
        message.push_str(&format!(" ({failed} listings failed booking sync)"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_json_shape() {
        let ok = SyncResponse::completed(3, 10, 0);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "success": true,
                "listingsCount": 3,
                "bookingsSynced": 10,
                "message": "Synced 3 listings and 10 bookings"
            })
        );
        assert_eq!(ok.status(), 200);

        let partial = SyncResponse::completed(3, 7, 1);
        let value = serde_json::to_value(&partial).unwrap();
        assert_eq!(value["failedBookings"], 1);
        assert!(partial.message().contains("1 listings failed"));
    }

    #[test]
    fn test_error_json_shape() {
        let err = Error::RateLimited {
            endpoint: "listings".into(),
        };
        let resp = SyncResponse::from_error(&err, None);
        assert!(!resp.is_success());
        assert_eq!(resp.status(), 429);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["status"], 429);
        assert!(value.get("nextRetryTime").is_none());

        let resp = SyncResponse::from_error(&Error::Config("no secret".into()), None);
        assert_eq!(resp.status(), 500);
    }
}
