use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::api::models::{self, Reservation};
use crate::api::ApiClient;
use crate::config::SyncConfig;
use crate::date_util;
use crate::error::Result;
use crate::storage::repository::{self, BookingRecord};
use crate::storage::Database;
use crate::sync::housekeeping::HousekeepingHook;
use crate::sync::rate_limit;

/// Per-listing booking counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingBookings {
    pub synced: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Map a remote reservation status onto the local vocabulary
/// (`confirmed`, `cancelled`, `pending`). Statuses that match no keyword are
/// kept, lowercased.
pub fn normalize_status(raw: Option<&str>) -> String {
    let status = raw.unwrap_or_default().trim().to_lowercase();
    if status.is_empty() {
        return "unknown".to_string();
    }
    let has = |words: &[&str]| words.iter().any(|w| status.contains(w));

    if has(&["cancelled", "canceled"]) {
        "cancelled".to_string()
    } else if has(&["booked", "confirmed", "complete"]) {
        "confirmed".to_string()
    } else if has(&["pending", "awaiting"]) {
        "pending".to_string()
    } else {
        status
    }
}

pub struct BookingsReconciler {
    db: Database,
    client: ApiClient,
    write_delay: Duration,
    hook: Arc<dyn HousekeepingHook>,
}

impl BookingsReconciler {
    pub fn new(
        db: Database,
        client: ApiClient,
        config: &SyncConfig,
        hook: Arc<dyn HousekeepingHook>,
    ) -> Self {
        Self {
            db,
            client,
            write_delay: config.booking_write_delay,
            hook,
        }
    }

    /// Mirror the current and upcoming reservations of one listing, then
    /// cancel local upcoming bookings the remote no longer returns.
    pub async fn sync_for_listing(&self, token: &str, listing_id: &str) -> Result<ListingBookings> {
        let today = date_util::date_key(&Utc::now());
        let now = date_util::to_db(&Utc::now());

        let response = self.client.reservations(token, listing_id, &today).await?;
        rate_limit::record(&self.db, response.rate_limit.as_ref()).await?;

        let mut counts = ListingBookings::default();
        let mut fetched: HashSet<String> = HashSet::new();

        for (i, raw) in response.body.results.into_iter().enumerate() {
            if i > 0 && !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            if let Some(id) = models::raw_id(&raw) {
                fetched.insert(id);
            }

            let reservation: Reservation = match serde_json::from_value(raw.clone()) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Skipping malformed reservation for listing {listing_id}: {e}");
                    counts.failed += 1;
                    continue;
                }
            };
            if let Some(other) = reservation.listing_id.as_deref().filter(|other| *other != listing_id) {
                log::warn!(
                    "Skipping reservation {} of listing {other} returned for listing {listing_id}",
                    reservation.id
                );
                counts.failed += 1;
                continue;
            }

            let booking = BookingRecord {
                id: reservation.id,
                listing_id: listing_id.to_string(),
                guest_name: reservation.guest_name,
                check_in: reservation.check_in,
                check_out: reservation.check_out,
                status: normalize_status(reservation.status.as_deref()),
                last_synced: now.clone(),
                raw_data: raw.to_string(),
            };

            let row = booking.clone();
            let written = self
                .db
                .writer()
                .call(move |conn| repository::upsert_booking(conn, &row))
                .await;
            match written {
                Ok(_) => {
                    counts.synced += 1;
                    self.hook.on_booking(&booking).await;
                }
                Err(e) => {
                    log::warn!("Failed to store booking {}: {e}", booking.id);
                    counts.failed += 1;
                }
            }
        }

        counts.cancelled = self.cancel_missing(listing_id, &today, &now, &fetched).await?;

        log::debug!(
            "Listing {listing_id}: {} bookings synced, {} failed, {} cancelled",
            counts.synced,
            counts.failed,
            counts.cancelled
        );
        Ok(counts)
    }

    async fn cancel_missing(
        &self,
        listing_id: &str,
        today: &str,
        now: &str,
        fetched: &HashSet<String>,
    ) -> Result<usize> {
        let open = self
            .db
            .reader()
            .call({
                let listing_id = listing_id.to_string();
                let today = today.to_string();
                move |conn| repository::open_bookings_for_listing(conn, &listing_id, &today)
            })
            .await?;

        let mut cancelled = 0;
        for mut booking in open.into_iter().filter(|b| !fetched.contains(&b.id)) {
            let id = booking.id.clone();
            let stamp = now.to_string();
            let changed = self
                .db
                .writer()
                .call(move |conn| repository::cancel_booking(conn, &id, &stamp))
                .await?;
            if changed {
                log::info!("Booking {} no longer returned; marked cancelled", booking.id);
                booking.status = "cancelled".to_string();
                booking.last_synced = now.to_string();
                self.hook.on_booking(&booking).await;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}
