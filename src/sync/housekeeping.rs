use async_trait::async_trait;
use chrono::Utc;

use crate::date_util;
use crate::storage::repository::{self, BookingRecord};
use crate::storage::Database;

pub const TURNOVER_TASK: &str = "turnover_cleaning";

/// Called for every booking the reconciler writes or cancels. Implementations
/// must not fail the booking sync; errors are theirs to log.
#[async_trait]
pub trait HousekeepingHook: Send + Sync {
    async fn on_booking(&self, booking: &BookingRecord);
}

pub struct NoopHousekeeping;

#[async_trait]
impl HousekeepingHook for NoopHousekeeping {
    async fn on_booking(&self, _booking: &BookingRecord) {}
}

/// Keeps one turnover-cleaning task per live booking, due on check-out day.
pub struct TurnoverPlanner {
    db: Database,
}

impl TurnoverPlanner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HousekeepingHook for TurnoverPlanner {
    async fn on_booking(&self, booking: &BookingRecord) {
        let now = date_util::to_db(&Utc::now());
        let booking_id = booking.id.clone();
        let listing_id = booking.listing_id.clone();
        let due_date = booking.check_out.clone();
        let cancelled = booking.status == "cancelled";

        let result = self
            .db
            .writer()
            .call(move |conn| {
                if cancelled {
                    repository::cancel_housekeeping_task(conn, &booking_id, &now)?;
                } else {
                    repository::upsert_housekeeping_task(
                        conn,
                        &booking_id,
                        &listing_id,
                        TURNOVER_TASK,
                        due_date.as_deref(),
                        &now,
                    )?;
                }
                Ok::<(), rusqlite::Error>(())
            })
            .await;

        if let Err(e) = result {
            log::warn!("Failed to update housekeeping task for booking {}: {e}", booking.id);
        }
    }
}
