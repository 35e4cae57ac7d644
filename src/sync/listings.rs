use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::api::models::{self, Listing, Page};
use crate::api::{ApiClient, ApiResponse};
use crate::config::SyncConfig;
use crate::date_util;
use crate::error::Result;
use crate::storage::repository::{self, NewListing, UpsertOutcome};
use crate::storage::Database;
use crate::sync::rate_limit::{self, RateLimitSnapshot};
use crate::sync::SyncProgress;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingsSummary {
    pub created: usize,
    pub updated: usize,
    pub archived: usize,
    pub failed: usize,
    pub pages: u32,
}

/// Result of a full listings pass.
#[derive(Debug, Clone)]
pub struct ListingsSync {
    /// Listings written this pass; the active set for the bookings phase.
    pub listings: Vec<Listing>,
    pub rate_limit: Option<RateLimitSnapshot>,
    pub summary: ListingsSummary,
}

pub struct ListingsReconciler {
    db: Database,
    client: ApiClient,
    page_size: u32,
    retry_delay: Duration,
}

impl ListingsReconciler {
    pub fn new(db: Database, client: ApiClient, config: &SyncConfig) -> Self {
        Self {
            db,
            client,
            page_size: config.page_size,
            retry_delay: config.listings_retry_delay,
        }
    }

    /// Mirror every remote listing, page by page, then archive local listings
    /// the remote no longer returns.
    pub async fn sync(&self, token: &str, progress: &dyn SyncProgress) -> Result<ListingsSync> {
        let now = date_util::to_db(&Utc::now());
        let mut seen: HashSet<String> = HashSet::new();
        let mut listings = Vec::new();
        let mut summary = ListingsSummary::default();
        let mut last_rate_limit = None;
        let mut page = 1u32;

        loop {
            let response = self.fetch_page(token, page).await?;
            rate_limit::record(&self.db, response.rate_limit.as_ref()).await?;
            if response.rate_limit.is_some() {
                last_rate_limit = response.rate_limit;
            }

            let items = response.body.results;
            if items.is_empty() {
                break;
            }
            log::debug!("Listings page {page}: {} items", items.len());
            progress.on_listings_page(page, items.len());
            summary.pages = page;

            for raw in items {
                if let Some(id) = models::raw_id(&raw) {
                    seen.insert(id);
                }
                let listing: Listing = match serde_json::from_value(raw.clone()) {
                    Ok(l) => l,
                    Err(e) => {
                        log::warn!("Skipping malformed listing on page {page}: {e}");
                        summary.failed += 1;
                        continue;
                    }
                };

                match self.write(listing.to_new_listing(&raw), &now).await {
                    Ok(UpsertOutcome::Created) => summary.created += 1,
                    Ok(UpsertOutcome::Updated) => summary.updated += 1,
                    Err(e) => {
                        log::warn!("Failed to store listing {}: {e}", listing.id);
                        summary.failed += 1;
                        continue;
                    }
                }
                listings.push(listing);
            }

            page += 1;
        }

        let archived = self
            .db
            .writer()
            .call(move |conn| repository::archive_missing_listings(conn, &seen, &now))
            .await?;
        if !archived.is_empty() {
            log::info!("Archived {} listings no longer returned: {}", archived.len(), archived.join(", "));
        }
        summary.archived = archived.len();

        log::info!(
            "Listings synced: {} created, {} updated, {} archived, {} failed",
            summary.created,
            summary.updated,
            summary.archived,
            summary.failed
        );
        progress.on_listings_complete(&summary);

        Ok(ListingsSync {
            listings,
            rate_limit: last_rate_limit.or_else(|| self.client.last_rate_limit()),
            summary,
        })
    }

    /// One page, retried once after a fixed delay if the API answers 429.
    async fn fetch_page(&self, token: &str, page: u32) -> Result<ApiResponse<Page>> {
        match self.client.listings_page(token, page, self.page_size).await {
            Err(e) if e.is_rate_limited() => {
                log::warn!(
                    "Listings page {page} rate limited; retrying in {}ms",
                    self.retry_delay.as_millis()
                );
                tokio::time::sleep(self.retry_delay).await;
                self.client.listings_page(token, page, self.page_size).await
            }
            other => other,
        }
    }

    async fn write(&self, listing: NewListing, now: &str) -> Result<UpsertOutcome> {
        let now = now.to_string();
        let outcome = self
            .db
            .writer()
            .call(move |conn| repository::upsert_listing(conn, &listing, &now))
            .await?;
        Ok(outcome)
    }
}
