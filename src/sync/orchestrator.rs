use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};

use crate::api::ApiClient;
use crate::config::SyncConfig;
use crate::date_util;
use crate::error::{Error, Result};
use crate::storage::repository::{self, RunCompletion, RunStatus};
use crate::storage::Database;
use crate::sync::bookings::{BookingsReconciler, ListingBookings};
use crate::sync::cooldown::{self, GateDecision};
use crate::sync::health::{self, HealthTelemetry};
use crate::sync::housekeeping::{HousekeepingHook, TurnoverPlanner};
use crate::sync::listings::ListingsReconciler;
use crate::sync::rate_limit::RateLimitSnapshot;
use crate::sync::token::TokenProvider;
use crate::sync::{completion_message, SyncProgress, SyncResponse};

pub const SYNC_TYPE_FULL: &str = "full";

const THROTTLED_BOOKINGS_NOTE: &str = "rate limited (429 Too Many Requests) during booking sync";

/// Totals of a pipeline pass that got through the listings phase.
#[derive(Debug, Clone, Default, PartialEq)]
struct PipelineOutcome {
    listings: usize,
    bookings: usize,
    failed_listings: usize,
    /// At least one listing's bookings failed on a 429.
    rate_limited: bool,
}

/// Aborts still-running booking tasks when the pipeline is dropped
/// (run timeout) before they were joined.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Runs one gated sync: claim, token, listings, bookings, finalize, health.
pub struct SyncOrchestrator {
    db: Database,
    config: SyncConfig,
    client: ApiClient,
    hook: Arc<dyn HousekeepingHook>,
}

impl SyncOrchestrator {
    pub fn new(db: Database, config: SyncConfig) -> Result<Self> {
        let client = ApiClient::new(&config)?;
        let hook = Arc::new(TurnoverPlanner::new(db.clone()));
        Ok(Self {
            db,
            config,
            client,
            hook,
        })
    }

    pub fn with_housekeeping(mut self, hook: Arc<dyn HousekeepingHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn run(&self, progress: &dyn SyncProgress) -> SyncResponse {
        let response = self.run_inner(progress).await;
        log::info!("Sync finished with status {}: {}", response.status(), response.message());
        progress.on_complete(&response);
        response
    }

    async fn run_inner(&self, progress: &dyn SyncProgress) -> SyncResponse {
        let started_at = Utc::now();
        let clock = Instant::now();
        let requests_before = self.client.requests_made();

        let claimed = cooldown::claim(
            &self.db,
            &self.config.service,
            SYNC_TYPE_FULL,
            started_at,
            self.config.cooldown,
        )
        .await;
        let (decision, run_id) = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                log::error!("Could not evaluate sync gate: {e}");
                return SyncResponse::from_error(&e, None);
            }
        };
        progress.on_gate(&decision);

        let Some(run_id) = run_id else {
            return SyncResponse::blocked(&decision);
        };

        let outcome = match tokio::time::timeout(self.config.run_timeout, self.pipeline(progress)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "sync run exceeded {:?}",
                self.config.run_timeout
            ))),
        };

        let finished_at = Utc::now();
        let duration_ms = i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX);
        let telemetry = HealthTelemetry::from_snapshot(
            self.client.last_rate_limit().as_ref(),
            self.client.requests_made().saturating_sub(requests_before),
        );

        match outcome {
            Ok(outcome) => {
                let mut message = completion_message(outcome.listings, outcome.bookings, outcome.failed_listings);
                let next_retry_time = outcome
                    .rate_limited
                    .then(|| backoff_deadline(&decision, finished_at, &self.config));
                if let Some(retry_at) = next_retry_time {
                    log::warn!(
                        "Sync run {run_id} was throttled during booking sync; next run allowed after {}",
                        date_util::to_db(&retry_at)
                    );
                    message.push_str("; ");
                    message.push_str(THROTTLED_BOOKINGS_NOTE);
                }
                let completion = RunCompletion {
                    status: RunStatus::Completed,
                    end_time: finished_at,
                    message,
                    items_count: (outcome.listings + outcome.bookings) as i64,
                    sync_duration_ms: duration_ms,
                    next_retry_time,
                };
                self.finalize(run_id, completion).await;
                if let Err(e) = health::record_success(
                    &self.db,
                    &self.config.provider,
                    finished_at,
                    outcome.rate_limited,
                    &telemetry,
                )
                .await
                {
                    log::error!("Failed to record integration health: {e}");
                }
                SyncResponse::completed(outcome.listings, outcome.bookings, outcome.failed_listings)
            }
            Err(e) => {
                let next_retry_time = retry_time_after(&e, &decision, finished_at, &self.config);
                log::error!("Sync run {run_id} failed: {e}");
                let completion = RunCompletion {
                    status: RunStatus::Error,
                    end_time: finished_at,
                    message: e.to_string(),
                    items_count: 0,
                    sync_duration_ms: duration_ms,
                    next_retry_time,
                };
                self.finalize(run_id, completion).await;
                if let Err(health_err) = health::record_failure(
                    &self.db,
                    &self.config.provider,
                    finished_at,
                    &e.to_string(),
                    e.is_rate_limited(),
                    &telemetry,
                )
                .await
                {
                    log::error!("Failed to record integration health: {health_err}");
                }
                SyncResponse::from_error(&e, next_retry_time)
            }
        }
    }

    async fn finalize(&self, run_id: i64, completion: RunCompletion) {
        let result = self
            .db
            .writer()
            .call(move |conn| repository::finish_sync_run(conn, run_id, &completion))
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => log::warn!("Sync run {run_id} was no longer in progress when finalized"),
            Err(e) => log::error!("Failed to finalize sync run {run_id}: {e}"),
        }
    }

    async fn pipeline(&self, progress: &dyn SyncProgress) -> Result<PipelineOutcome> {
        let token = TokenProvider::new(self.db.clone(), self.client.clone(), &self.config)
            .get_token()
            .await?;

        let listings = ListingsReconciler::new(self.db.clone(), self.client.clone(), &self.config)
            .sync(&token, progress)
            .await?;

        let width = fan_out_width(self.config.max_concurrency, listings.rate_limit.as_ref());
        let ids: Vec<String> = listings.listings.iter().map(|l| l.id.clone()).collect();
        log::info!("Syncing bookings for {} listings ({} at a time)", ids.len(), width);
        progress.on_bookings_start(ids.len(), width);

        let reconciler = Arc::new(BookingsReconciler::new(
            self.db.clone(),
            self.client.clone(),
            &self.config,
            Arc::clone(&self.hook),
        ));
        let semaphore = Arc::new(Semaphore::new(width));
        let token: Arc<str> = Arc::from(token);
        let listing_timeout = self.config.listing_timeout;

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let id = id.clone();
                let reconciler = Arc::clone(&reconciler);
                let semaphore = Arc::clone(&semaphore);
                let token = Arc::clone(&token);
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Other("booking semaphore closed".into()))?;
                    match tokio::time::timeout(listing_timeout, reconciler.sync_for_listing(&token, &id)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!("bookings for listing {id}"))),
                    }
                })
            })
            .collect();
        let _guard = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let mut outcome = PipelineOutcome {
            listings: ids.len(),
            ..PipelineOutcome::default()
        };
        for (id, handle) in ids.iter().zip(handles) {
            let result: std::result::Result<ListingBookings, String> = match handle.await {
                Ok(Ok(counts)) => Ok(counts),
                Ok(Err(e)) => {
                    outcome.rate_limited |= e.is_rate_limited();
                    Err(Error::Sync {
                        listing_id: id.clone(),
                        message: e.to_string(),
                    }
                    .to_string())
                }
                Err(e) => Err(join_failure(id, &e)),
            };
            match &result {
                Ok(counts) => outcome.bookings += counts.synced,
                Err(message) => {
                    log::warn!("{message}");
                    outcome.failed_listings += 1;
                }
            }
            progress.on_listing_bookings(id, &result);
        }

        Ok(outcome)
    }
}

/// Parallel width for the bookings phase: bounded by the remaining quota
/// when the listings phase reported one.
fn fan_out_width(max_concurrency: usize, snapshot: Option<&RateLimitSnapshot>) -> usize {
    let max = max_concurrency.max(1);
    match snapshot.and_then(|s| s.remaining) {
        Some(remaining) => max.min(remaining as usize).max(1),
        None => max,
    }
}

fn join_failure(listing_id: &str, error: &JoinError) -> String {
    if error.is_panic() {
        format!("booking task for listing {listing_id} panicked: {error}")
    } else {
        format!("booking task for listing {listing_id} was cancelled")
    }
}

/// Earliest time the gate lets the next run through after a 429.
fn backoff_deadline(decision: &GateDecision, finished_at: DateTime<Utc>, config: &SyncConfig) -> DateTime<Utc> {
    finished_at + Duration::minutes(config.cooldown.backoff_minutes(decision.retry_count))
}

/// When the run failed on a 429, the earliest time the gate should let the
/// next run through.
fn retry_time_after(
    error: &Error,
    decision: &GateDecision,
    finished_at: DateTime<Utc>,
    config: &SyncConfig,
) -> Option<DateTime<Utc>> {
    error
        .is_rate_limited()
        .then(|| backoff_deadline(decision, finished_at, config))
}
