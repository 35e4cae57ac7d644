use chrono::{DateTime, Duration, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;

use crate::config::CooldownPolicy;
use crate::date_util;
use crate::error::Result;
use crate::storage::repository::{self, RunStatus, SyncRun};
use crate::storage::Database;
use crate::sync::rate_limit;

pub const COOLDOWN_MESSAGE: &str =
    "Sync was performed recently. Please wait at least 15 minutes between syncs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    CanProceed,
    BlockedByCooldown,
    BlockedByRateLimit,
    BlockedByActiveRun,
}

/// Outcome of the gate check. `retry_count` is the value the next run is
/// recorded with; `backoff_minutes` is the backoff that applies to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub state: GateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub backoff_minutes: i64,
}

impl GateDecision {
    pub fn can_proceed(&self) -> bool {
        self.state == GateState::CanProceed
    }

    fn blocked(state: GateState, message: String, next_retry_time: Option<DateTime<Utc>>) -> Self {
        Self {
            state,
            message: Some(message),
            next_retry_time,
            retry_count: 0,
            backoff_minutes: 0,
        }
    }
}

/// The slice of sync history the gate looks at.
#[derive(Debug, Clone, Default)]
pub struct GateHistory {
    pub in_progress: Option<SyncRun>,
    pub latest: Option<SyncRun>,
    pub latest_completed: Option<SyncRun>,
}

impl GateHistory {
    pub fn load(conn: &rusqlite::Connection, service: &str) -> rusqlite::Result<Self> {
        Ok(Self {
            in_progress: repository::in_progress_run(conn, service)?,
            latest: repository::latest_sync_run(conn, service)?,
            latest_completed: repository::latest_completed_run(conn, service)?,
        })
    }
}

/// Decide whether a new run may start.
///
/// Precedence: an active run blocks outright; then a rate-limited latest run
/// (failed, or completed with throttled bookings) blocks until its retry
/// time; then a completed run inside the minimum interval blocks. An expired backoff window carries its incremented retry
/// count into the new run.
pub fn evaluate(history: &GateHistory, now: DateTime<Utc>, policy: &CooldownPolicy) -> GateDecision {
    if let Some(run) = &history.in_progress {
        return GateDecision::blocked(
            GateState::BlockedByActiveRun,
            format!(
                "A sync is already in progress (started {}).",
                date_util::to_db(&run.start_time)
            ),
            None,
        );
    }

    let mut retry_count = 0;
    if let Some(latest) = history.latest.as_ref().filter(|run| was_rate_limited(run)) {
        let backoff = policy.backoff_minutes(latest.retry_count);
        let next_retry_time = latest
            .next_retry_time
            .unwrap_or(latest.start_time + Duration::minutes(backoff));

        if next_retry_time > now {
            let minutes = date_util::minutes_until(&now, &next_retry_time);
            return GateDecision {
                state: GateState::BlockedByRateLimit,
                message: Some(format!(
                    "Rate limit exceeded. Please wait {minutes} minutes before retrying."
                )),
                next_retry_time: Some(next_retry_time),
                retry_count: latest.retry_count.saturating_add(1),
                backoff_minutes: backoff,
            };
        }
        retry_count = latest.retry_count.saturating_add(1);
    }

    if let Some(completed) = &history.latest_completed {
        let window_end = completed.start_time + Duration::minutes(policy.min_interval_minutes);
        if window_end > now {
            return GateDecision::blocked(
                GateState::BlockedByCooldown,
                COOLDOWN_MESSAGE.to_string(),
                Some(window_end),
            );
        }
    }

    GateDecision {
        state: GateState::CanProceed,
        message: None,
        next_retry_time: None,
        retry_count,
        backoff_minutes: policy.backoff_minutes(retry_count),
    }
}

/// A finished run hit a 429 when it scheduled a retry time. A completed run
/// does so when only its booking phase was throttled. Error rows without a
/// retry time fall back to the message.
fn was_rate_limited(run: &SyncRun) -> bool {
    match run.status {
        RunStatus::InProgress => false,
        RunStatus::Completed => run.next_retry_time.is_some(),
        RunStatus::Error => {
            run.next_retry_time.is_some()
                || run
                    .message
                    .as_deref()
                    .is_some_and(rate_limit::is_rate_limit_message)
        }
    }
}

/// Evaluate the gate and, when it passes, insert the new `in_progress` run in
/// the same immediate transaction. Returns the decision and the run id.
pub async fn claim(
    db: &Database,
    service: &str,
    sync_type: &str,
    now: DateTime<Utc>,
    policy: CooldownPolicy,
) -> Result<(GateDecision, Option<i64>)> {
    let service = service.to_string();
    let sync_type = sync_type.to_string();

    let (decision, run_id, abandoned) = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let cutoff = now - Duration::minutes(policy.stale_run_minutes);
            let abandoned = repository::abandon_stale_runs(&tx, &service, &cutoff, &now)?;

            let history = GateHistory::load(&tx, &service)?;
            let decision = evaluate(&history, now, &policy);

            let run_id = if decision.can_proceed() {
                Some(repository::insert_sync_run(
                    &tx,
                    &service,
                    &sync_type,
                    &now,
                    decision.retry_count,
                )?)
            } else {
                None
            };

            tx.commit()?;
            Ok::<_, rusqlite::Error>((decision, run_id, abandoned))
        })
        .await?;

    if abandoned > 0 {
        log::warn!("Marked {abandoned} stale in-progress sync run(s) as abandoned");
    }
    match run_id {
        Some(id) => log::info!(
            "Sync run {id} claimed (retry_count={})",
            decision.retry_count
        ),
        None => log::info!(
            "Sync blocked ({:?}): {}",
            decision.state,
            decision.message.as_deref().unwrap_or_default()
        ),
    }

    Ok((decision, run_id))
}
