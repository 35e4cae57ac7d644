pub mod api;
pub mod config;
pub mod date_util;
pub mod error;
pub mod storage;
pub mod sync;

pub use config::{CooldownPolicy, SyncConfig};
pub use error::{Error, Result};
pub use storage::Database;
pub use sync::rate_limit::RateLimitSnapshot;
pub use sync::{GateDecision, GateState, NoopProgress, SyncProgress, SyncResponse};

// Re-export repository row types needed by the binary crate, but not the module itself
pub use storage::repository::{
    BookingRecord, HousekeepingTask, IntegrationHealth, ListingRecord, SyncRun,
};

use chrono::Utc;
use serde::Serialize;

use storage::repository;
use sync::health;
use sync::orchestrator::SyncOrchestrator;

/// `app_config` keys consulted when the environment leaves a setting unset.
pub const CLIENT_ID_KEY: &str = "client_id";
pub const CLIENT_SECRET_KEY: &str = "client_secret";
pub const API_URL_KEY: &str = "api_url";

/// Local mirror summary shown by `rentalsync status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub active_listings: i64,
    pub archived_listings: i64,
    pub bookings: i64,
    pub pending_tasks: i64,
    pub last_run: Option<SyncRun>,
    pub last_completed: Option<SyncRun>,
}

/// Main entry point: sync trigger plus read access to the mirrored data.
pub struct RentalSync {
    db: Database,
    config: SyncConfig,
}

impl RentalSync {
    pub fn new(db: Database, config: SyncConfig) -> Self {
        Self { db, config }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The injected config with unset credentials and base URL filled in from
    /// `app_config`.
    pub async fn effective_config(&self) -> Result<SyncConfig> {
        let stored = self
            .db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::get_config(conn, CLIENT_ID_KEY)?,
                    repository::get_config(conn, CLIENT_SECRET_KEY)?,
                    repository::get_config(conn, API_URL_KEY)?,
                ))
            })
            .await?;

        let mut config = self.config.clone();
        let (client_id, client_secret, api_url) = stored;
        if config.client_id.is_none() {
            config.client_id = client_id;
        }
        if config.client_secret.is_none() {
            config.client_secret = client_secret;
        }
        if config.api_base_url == config::DEFAULT_API_URL {
            if let Some(url) = api_url {
                config = config.with_base_url(&url);
            }
        }
        Ok(config)
    }

    /// Run one gated sync. Never fails: every outcome is a [`SyncResponse`].
    pub async fn sync(&self, progress: &dyn SyncProgress) -> SyncResponse {
        let orchestrator = match self
            .effective_config()
            .await
            .and_then(|config| SyncOrchestrator::new(self.db.clone(), config))
        {
            Ok(o) => o,
            Err(e) => {
                log::error!("Cannot start sync: {e}");
                return SyncResponse::from_error(&e, None);
            }
        };
        orchestrator.run(progress).await
    }

    // ── Read views ─────────────────────────────────────────────────

    pub async fn status(&self) -> Result<StatusReport> {
        let service = self.config.service.clone();
        let report = self
            .db
            .reader()
            .call(move |conn| {
                let conn: &rusqlite::Connection = conn;
                let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));
                Ok::<_, rusqlite::Error>(StatusReport {
                    active_listings: count("SELECT COUNT(*) FROM listings WHERE sync_status = 'active'")?,
                    archived_listings: count("SELECT COUNT(*) FROM listings WHERE sync_status = 'archived'")?,
                    bookings: count("SELECT COUNT(*) FROM bookings")?,
                    pending_tasks: count("SELECT COUNT(*) FROM housekeeping_tasks WHERE status = 'pending'")?,
                    last_run: repository::latest_sync_run(conn, &service)?,
                    last_completed: repository::latest_completed_run(conn, &service)?,
                })
            })
            .await?;
        Ok(report)
    }

    pub async fn health(&self) -> Result<Option<IntegrationHealth>> {
        health::get(&self.db, &self.config.provider).await
    }

    pub async fn latest_rate_limit(&self) -> Result<Option<RateLimitSnapshot>> {
        let snapshot = self
            .db
            .reader()
            .call(|conn| repository::latest_rate_limit_snapshot(conn))
            .await?;
        Ok(snapshot)
    }

    pub async fn runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        let service = self.config.service.clone();
        let runs = self
            .db
            .reader()
            .call(move |conn| repository::recent_sync_runs(conn, Some(&service), limit))
            .await?;
        Ok(runs)
    }

    pub async fn listings(&self, include_archived: bool) -> Result<Vec<ListingRecord>> {
        let listings = self
            .db
            .reader()
            .call(move |conn| repository::list_listings(conn, include_archived))
            .await?;
        Ok(listings)
    }

    pub async fn bookings(&self, listing_id: Option<&str>) -> Result<Vec<BookingRecord>> {
        let listing_id = listing_id.map(str::to_string);
        let bookings = self
            .db
            .reader()
            .call(move |conn| repository::list_bookings(conn, listing_id.as_deref()))
            .await?;
        Ok(bookings)
    }

    pub async fn tasks(&self, include_cancelled: bool) -> Result<Vec<HousekeepingTask>> {
        let tasks = self
            .db
            .reader()
            .call(move |conn| repository::list_housekeeping_tasks(conn, include_cancelled))
            .await?;
        Ok(tasks)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let now = date_util::to_db(&Utc::now());
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value, &now)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
