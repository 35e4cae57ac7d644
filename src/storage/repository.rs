use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util;
use crate::sync::rate_limit::RateLimitSnapshot;

// ── Row types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub service: String,
    pub sync_type: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub items_count: i64,
    pub sync_duration_ms: Option<i64>,
    pub retry_count: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// Final state written to a run when it leaves `in_progress`.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub end_time: DateTime<Utc>,
    pub message: String,
    pub items_count: i64,
    pub sync_duration_ms: i64,
    pub next_retry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationHealth {
    pub provider: String,
    pub status: String,
    pub last_synced: Option<String>,
    pub last_error: Option<String>,
    pub remaining_requests: Option<i64>,
    pub rate_limit_reset: Option<String>,
    pub request_count: i64,
    pub is_rate_limited: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Listing fields taken from the remote payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub id: String,
    pub title: Option<String>,
    pub address: Option<String>,
    pub status: Option<String>,
    pub property_type: Option<String>,
    pub thumbnail_url: Option<String>,
    pub highres_url: Option<String>,
    pub raw_data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingRecord {
    pub id: String,
    pub title: Option<String>,
    pub address: Option<String>,
    pub status: Option<String>,
    pub property_type: Option<String>,
    pub thumbnail_url: Option<String>,
    pub highres_url: Option<String>,
    pub last_synced: String,
    pub sync_status: String,
    pub is_deleted: bool,
    pub first_synced_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingRecord {
    pub id: String,
    pub listing_id: String,
    pub guest_name: Option<String>,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    pub status: String,
    pub last_synced: String,
    #[serde(skip)]
    pub raw_data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HousekeepingTask {
    pub id: i64,
    pub booking_id: String,
    pub listing_id: String,
    pub task_type: String,
    pub due_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

fn ts(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    date_util::from_db(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        date_util::from_db(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(
    conn: &Connection,
    key: &str,
    value: &str,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
        params![key, value, now],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Runs ──────────────────────────────────────────────────────

const SYNC_RUN_COLUMNS: &str = "id, service, sync_type, status, start_time, end_time, message,
     items_count, sync_duration_ms, retry_count, next_retry_time";

fn sync_run_from_row(row: &Row<'_>) -> Result<SyncRun, rusqlite::Error> {
    let status: String = row.get(3)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown run status {status}").into(),
        )
    })?;
    Ok(SyncRun {
        id: row.get(0)?,
        service: row.get(1)?,
        sync_type: row.get(2)?,
        status,
        start_time: ts(row, 4)?,
        end_time: opt_ts(row, 5)?,
        message: row.get(6)?,
        items_count: row.get(7)?,
        sync_duration_ms: row.get(8)?,
        retry_count: row.get(9)?,
        next_retry_time: opt_ts(row, 10)?,
    })
}

pub fn insert_sync_run(
    conn: &Connection,
    service: &str,
    sync_type: &str,
    start_time: &DateTime<Utc>,
    retry_count: u32,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (service, sync_type, status, start_time, retry_count)
         VALUES (?1, ?2, 'in_progress', ?3, ?4)",
        params![service, sync_type, date_util::to_db(start_time), retry_count],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move an in-progress run to its final state. Returns false when the run
/// was not in progress (already finalised or abandoned).
pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    completion: &RunCompletion,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE sync_runs SET
            status = ?2, end_time = ?3, message = ?4, items_count = ?5,
            sync_duration_ms = ?6, next_retry_time = ?7
         WHERE id = ?1 AND status = 'in_progress'",
        params![
            run_id,
            completion.status.as_str(),
            date_util::to_db(&completion.end_time),
            completion.message,
            completion.items_count,
            completion.sync_duration_ms,
            completion.next_retry_time.as_ref().map(date_util::to_db),
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_sync_run(conn: &Connection, run_id: i64) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
        params![run_id],
        sync_run_from_row,
    )
    .optional()
}

/// Most recent run of any status for a service.
pub fn latest_sync_run(conn: &Connection, service: &str) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE service = ?1
             ORDER BY start_time DESC, id DESC LIMIT 1"
        ),
        params![service],
        sync_run_from_row,
    )
    .optional()
}

pub fn latest_completed_run(
    conn: &Connection,
    service: &str,
) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE service = ?1 AND status = 'completed'
             ORDER BY start_time DESC, id DESC LIMIT 1"
        ),
        params![service],
        sync_run_from_row,
    )
    .optional()
}

pub fn in_progress_run(conn: &Connection, service: &str) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE service = ?1 AND status = 'in_progress'
             ORDER BY start_time DESC, id DESC LIMIT 1"
        ),
        params![service],
        sync_run_from_row,
    )
    .optional()
}

/// Mark in-progress runs that started before `cutoff` as errored. Returns the count.
pub fn abandon_stale_runs(
    conn: &Connection,
    service: &str,
    cutoff: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET status = 'error', end_time = ?3,
            message = 'Sync run abandoned: no completion recorded'
         WHERE service = ?1 AND status = 'in_progress' AND start_time < ?2",
        params![service, date_util::to_db(cutoff), date_util::to_db(now)],
    )
}

pub fn recent_sync_runs(
    conn: &Connection,
    service: Option<&str>,
    limit: u32,
) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs
         WHERE (?1 IS NULL OR service = ?1)
         ORDER BY start_time DESC, id DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![service, limit], sync_run_from_row)?;
    rows.collect()
}

// ── Rate-limit snapshots ───────────────────────────────────────────

pub fn insert_rate_limit_snapshot(
    conn: &Connection,
    snapshot: &RateLimitSnapshot,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rate_limit_snapshots (endpoint, rate_limit, remaining, reset, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.endpoint,
            snapshot.rate_limit,
            snapshot.remaining,
            snapshot.reset.as_ref().map(date_util::to_db),
            date_util::to_db(&snapshot.captured_at),
        ],
    )?;
    Ok(())
}

pub fn latest_rate_limit_snapshot(
    conn: &Connection,
) -> Result<Option<RateLimitSnapshot>, rusqlite::Error> {
    conn.query_row(
        "SELECT endpoint, rate_limit, remaining, reset, captured_at
         FROM rate_limit_snapshots ORDER BY captured_at DESC, id DESC LIMIT 1",
        [],
        |row| {
            Ok(RateLimitSnapshot {
                endpoint: row.get(0)?,
                rate_limit: row.get(1)?,
                remaining: row.get(2)?,
                reset: opt_ts(row, 3)?,
                captured_at: ts(row, 4)?,
            })
        },
    )
    .optional()
}

// ── Integration health ─────────────────────────────────────────────

/// Upsert keyed by provider. `last_synced` is only overwritten with a
/// non-null value so failures keep the last successful sync time.
pub fn upsert_integration_health(
    conn: &Connection,
    health: &IntegrationHealth,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO integration_health (
            provider, status, last_synced, last_error, remaining_requests,
            rate_limit_reset, request_count, is_rate_limited, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(provider) DO UPDATE SET
            status = excluded.status,
            last_synced = COALESCE(excluded.last_synced, integration_health.last_synced),
            last_error = excluded.last_error,
            remaining_requests = COALESCE(excluded.remaining_requests, integration_health.remaining_requests),
            rate_limit_reset = COALESCE(excluded.rate_limit_reset, integration_health.rate_limit_reset),
            request_count = excluded.request_count,
            is_rate_limited = excluded.is_rate_limited,
            updated_at = excluded.updated_at",
        params![
            health.provider,
            health.status,
            health.last_synced,
            health.last_error,
            health.remaining_requests,
            health.rate_limit_reset,
            health.request_count,
            health.is_rate_limited as i32,
            health.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_integration_health(
    conn: &Connection,
    provider: &str,
) -> Result<Option<IntegrationHealth>, rusqlite::Error> {
    conn.query_row(
        "SELECT provider, status, last_synced, last_error, remaining_requests,
                rate_limit_reset, request_count, is_rate_limited, updated_at
         FROM integration_health WHERE provider = ?1",
        params![provider],
        |row| {
            Ok(IntegrationHealth {
                provider: row.get(0)?,
                status: row.get(1)?,
                last_synced: row.get(2)?,
                last_error: row.get(3)?,
                remaining_requests: row.get(4)?,
                rate_limit_reset: row.get(5)?,
                request_count: row.get(6)?,
                is_rate_limited: row.get::<_, i32>(7)? != 0,
                updated_at: row.get(8)?,
            })
        },
    )
    .optional()
}

// ── OAuth token cache ──────────────────────────────────────────────

pub fn get_cached_token(
    conn: &Connection,
    provider: &str,
) -> Result<Option<CachedToken>, rusqlite::Error> {
    conn.query_row(
        "SELECT access_token, expires_at FROM oauth_tokens WHERE provider = ?1",
        params![provider],
        |row| {
            Ok(CachedToken {
                access_token: row.get(0)?,
                expires_at: ts(row, 1)?,
            })
        },
    )
    .optional()
}

pub fn upsert_token(
    conn: &Connection,
    provider: &str,
    access_token: &str,
    expires_at: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO oauth_tokens (provider, access_token, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(provider) DO UPDATE SET
            access_token = excluded.access_token,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at",
        params![
            provider,
            access_token,
            date_util::to_db(expires_at),
            date_util::to_db(now)
        ],
    )?;
    Ok(())
}

// ── Listings ───────────────────────────────────────────────────────

const LISTING_COLUMNS: &str = "id, title, address, status, property_type, thumbnail_url,
     highres_url, last_synced, sync_status, is_deleted, first_synced_at";

fn listing_from_row(row: &Row<'_>) -> Result<ListingRecord, rusqlite::Error> {
    Ok(ListingRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        address: row.get(2)?,
        status: row.get(3)?,
        property_type: row.get(4)?,
        thumbnail_url: row.get(5)?,
        highres_url: row.get(6)?,
        last_synced: row.get(7)?,
        sync_status: row.get(8)?,
        is_deleted: row.get::<_, i32>(9)? != 0,
        first_synced_at: row.get(10)?,
    })
}

/// Insert a listing (setting `first_synced_at`) or update it in place.
/// Either way the listing ends up active and not deleted.
pub fn upsert_listing(
    conn: &Connection,
    listing: &NewListing,
    now: &str,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM listings WHERE id = ?1",
            params![listing.id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        conn.execute(
            "UPDATE listings SET
                title = ?2, address = ?3, status = ?4, property_type = ?5,
                thumbnail_url = ?6, highres_url = ?7, raw_data = ?8,
                last_synced = ?9, sync_status = 'active', is_deleted = 0
             WHERE id = ?1",
            params![
                listing.id,
                listing.title,
                listing.address,
                listing.status,
                listing.property_type,
                listing.thumbnail_url,
                listing.highres_url,
                listing.raw_data,
                now,
            ],
        )?;
        Ok(UpsertOutcome::Updated)
    } else {
        conn.execute(
            "INSERT INTO listings (
                id, title, address, status, property_type, thumbnail_url, highres_url,
                raw_data, last_synced, sync_status, is_deleted, first_synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', 0, ?9)",
            params![
                listing.id,
                listing.title,
                listing.address,
                listing.status,
                listing.property_type,
                listing.thumbnail_url,
                listing.highres_url,
                listing.raw_data,
                now,
            ],
        )?;
        Ok(UpsertOutcome::Created)
    }
}

pub fn get_listing(conn: &Connection, id: &str) -> Result<Option<ListingRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1"),
        params![id],
        listing_from_row,
    )
    .optional()
}

pub fn list_listings(
    conn: &Connection,
    include_archived: bool,
) -> Result<Vec<ListingRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LISTING_COLUMNS} FROM listings
         WHERE ?1 OR sync_status = 'active' ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![include_archived], listing_from_row)?;
    rows.collect()
}

/// Archive every active listing whose id is not in `seen`. Returns the archived ids.
pub fn archive_missing_listings(
    conn: &Connection,
    seen: &HashSet<String>,
    now: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let active: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM listings WHERE sync_status = 'active'")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut archived = Vec::new();
    let mut update = conn.prepare(
        "UPDATE listings SET sync_status = 'archived', is_deleted = 1, last_synced = ?2
         WHERE id = ?1",
    )?;
    for id in active.into_iter().filter(|id| !seen.contains(id)) {
        update.execute(params![id, now])?;
        archived.push(id);
    }
    Ok(archived)
}

// ── Bookings ───────────────────────────────────────────────────────

const BOOKING_COLUMNS: &str =
    "id, listing_id, guest_name, check_in, check_out, status, last_synced, raw_data";

fn booking_from_row(row: &Row<'_>) -> Result<BookingRecord, rusqlite::Error> {
    Ok(BookingRecord {
        id: row.get(0)?,
        listing_id: row.get(1)?,
        guest_name: row.get(2)?,
        check_in: row.get(3)?,
        check_out: row.get(4)?,
        status: row.get(5)?,
        last_synced: row.get(6)?,
        raw_data: row.get(7)?,
    })
}

/// Lookup-then-insert-or-update by remote reservation id.
pub fn upsert_booking(
    conn: &Connection,
    booking: &BookingRecord,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM bookings WHERE id = ?1",
            params![booking.id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        conn.execute(
            "UPDATE bookings SET
                listing_id = ?2, guest_name = ?3, check_in = ?4, check_out = ?5,
                status = ?6, last_synced = ?7, raw_data = ?8
             WHERE id = ?1",
            params![
                booking.id,
                booking.listing_id,
                booking.guest_name,
                booking.check_in,
                booking.check_out,
                booking.status,
                booking.last_synced,
                booking.raw_data,
            ],
        )?;
        Ok(UpsertOutcome::Updated)
    } else {
        conn.execute(
            "INSERT INTO bookings (
                id, listing_id, guest_name, check_in, check_out, status, last_synced, raw_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                booking.id,
                booking.listing_id,
                booking.guest_name,
                booking.check_in,
                booking.check_out,
                booking.status,
                booking.last_synced,
                booking.raw_data,
            ],
        )?;
        Ok(UpsertOutcome::Created)
    }
}

pub fn get_booking(conn: &Connection, id: &str) -> Result<Option<BookingRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
        params![id],
        booking_from_row,
    )
    .optional()
}

/// Non-cancelled bookings of a listing whose check-out is on or after `today`.
pub fn open_bookings_for_listing(
    conn: &Connection,
    listing_id: &str,
    today: &str,
) -> Result<Vec<BookingRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings
         WHERE listing_id = ?1 AND status != 'cancelled'
           AND check_out IS NOT NULL AND check_out >= ?2
         ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![listing_id, today], booking_from_row)?;
    rows.collect()
}

pub fn cancel_booking(conn: &Connection, id: &str, now: &str) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE bookings SET status = 'cancelled', last_synced = ?2
         WHERE id = ?1 AND status != 'cancelled'",
        params![id, now],
    )?;
    Ok(changed > 0)
}

pub fn list_bookings(
    conn: &Connection,
    listing_id: Option<&str>,
) -> Result<Vec<BookingRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings
         WHERE (?1 IS NULL OR listing_id = ?1)
         ORDER BY check_in, id"
    ))?;
    let rows = stmt.query_map(params![listing_id], booking_from_row)?;
    rows.collect()
}

// ── Housekeeping tasks ─────────────────────────────────────────────

pub fn upsert_housekeeping_task(
    conn: &Connection,
    booking_id: &str,
    listing_id: &str,
    task_type: &str,
    due_date: Option<&str>,
    now: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO housekeeping_tasks (
            booking_id, listing_id, task_type, due_date, status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
        ON CONFLICT(booking_id) DO UPDATE SET
            listing_id = excluded.listing_id,
            task_type = excluded.task_type,
            due_date = excluded.due_date,
            status = 'pending',
            updated_at = excluded.updated_at",
        params![booking_id, listing_id, task_type, due_date, now],
    )?;
    Ok(())
}

pub fn cancel_housekeeping_task(
    conn: &Connection,
    booking_id: &str,
    now: &str,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE housekeeping_tasks SET status = 'cancelled', updated_at = ?2
         WHERE booking_id = ?1 AND status = 'pending'",
        params![booking_id, now],
    )?;
    Ok(changed > 0)
}

pub fn list_housekeeping_tasks(
    conn: &Connection,
    include_cancelled: bool,
) -> Result<Vec<HousekeepingTask>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, booking_id, listing_id, task_type, due_date, status
         FROM housekeeping_tasks
         WHERE ?1 OR status = 'pending'
         ORDER BY due_date, id",
    )?;
    let rows = stmt.query_map(params![include_cancelled], |row| {
        Ok(HousekeepingTask {
            id: row.get(0)?,
            booking_id: row.get(1)?,
            listing_id: row.get(2)?,
            task_type: row.get(3)?,
            due_date: row.get(4)?,
            status: row.get(5)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::{Duration, TimeZone};

    const NOW: &str = "2026-05-01T12:00:00.000Z";

    fn listing(id: &str, title: &str) -> NewListing {
        NewListing {
            id: id.to_string(),
            title: Some(title.to_string()),
            address: Some("1 Beach Rd".to_string()),
            status: Some("available".to_string()),
            property_type: Some("villa".to_string()),
            thumbnail_url: None,
            highres_url: None,
            raw_data: "{}".to_string(),
        }
    }

    fn booking(id: &str, listing_id: &str, check_out: &str, status: &str) -> BookingRecord {
        BookingRecord {
            id: id.to_string(),
            listing_id: listing_id.to_string(),
            guest_name: Some("Guest".to_string()),
            check_in: Some("2026-04-28".to_string()),
            check_out: Some(check_out.to_string()),
            status: status.to_string(),
            last_synced: NOW.to_string(),
            raw_data: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "client_id", "abc", NOW)?;
                set_config(conn, "client_id", "def", NOW)?;
                assert_eq!(get_config(conn, "client_id")?, Some("def".to_string()));
                assert_eq!(get_config(conn, "nonexistent")?, None);
                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_run_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();

        db.writer()
            .call(move |conn| {
                let id = insert_sync_run(conn, "hostaway", "full", &start, 2)?;
                let run = in_progress_run(conn, "hostaway")?.unwrap();
                assert_eq!(run.id, id);
                assert_eq!(run.retry_count, 2);

                let completion = RunCompletion {
                    status: RunStatus::Completed,
                    end_time: start + Duration::seconds(30),
                    message: "done".into(),
                    items_count: 7,
                    sync_duration_ms: 30_000,
                    next_retry_time: None,
                };
                assert!(finish_sync_run(conn, id, &completion)?);
                // A second finalisation is a no-op
                assert!(!finish_sync_run(conn, id, &completion)?);

                let run = get_sync_run(conn, id)?.unwrap();
                assert_eq!(run.status, RunStatus::Completed);
                assert_eq!(run.items_count, 7);
                assert_eq!(run.end_time, Some(start + Duration::seconds(30)));
                assert!(in_progress_run(conn, "hostaway")?.is_none());
                assert_eq!(latest_completed_run(conn, "hostaway")?.unwrap().id, id);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_one_in_progress_run_per_service() {
        let db = Database::open_memory().await.unwrap();
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();

        let second = db
            .writer()
            .call(move |conn| {
                insert_sync_run(conn, "hostaway", "full", &start, 0)?;
                // Different service is independent
                insert_sync_run(conn, "other", "full", &start, 0)?;
                Ok::<_, rusqlite::Error>(insert_sync_run(conn, "hostaway", "full", &start, 0).is_err())
            })
            .await
            .unwrap();
        assert!(second, "unique index must reject a second in-progress run");
    }

    #[tokio::test]
    async fn test_abandon_stale_runs() {
        let db = Database::open_memory().await.unwrap();
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let now = start + Duration::hours(2);

        db.writer()
            .call(move |conn| {
                let id = insert_sync_run(conn, "hostaway", "full", &start, 0)?;
                let abandoned =
                    abandon_stale_runs(conn, "hostaway", &(now - Duration::hours(1)), &now)?;
                assert_eq!(abandoned, 1);
                let run = get_sync_run(conn, id)?.unwrap();
                assert_eq!(run.status, RunStatus::Error);
                assert!(run.message.unwrap().contains("abandoned"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_listing_upsert_preserves_first_synced_at() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert_eq!(
                    upsert_listing(conn, &listing("1", "Old"), "2026-01-01T00:00:00.000Z")?,
                    UpsertOutcome::Created
                );
                assert_eq!(
                    upsert_listing(conn, &listing("1", "New"), NOW)?,
                    UpsertOutcome::Updated
                );
                let stored = get_listing(conn, "1")?.unwrap();
                assert_eq!(stored.title.as_deref(), Some("New"));
                assert_eq!(stored.first_synced_at, "2026-01-01T00:00:00.000Z");
                assert_eq!(stored.last_synced, NOW);
                assert_eq!(stored.sync_status, "active");
                assert!(!stored.is_deleted);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_archive_missing_and_reactivate() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_listing(conn, &listing("a", "A"), NOW)?;
                upsert_listing(conn, &listing("b", "B"), NOW)?;

                let seen: HashSet<String> = ["a".to_string()].into_iter().collect();
                let archived = archive_missing_listings(conn, &seen, NOW)?;
                assert_eq!(archived, vec!["b".to_string()]);

                let b = get_listing(conn, "b")?.unwrap();
                assert_eq!(b.sync_status, "archived");
                assert!(b.is_deleted);
                assert_eq!(list_listings(conn, false)?.len(), 1);
                assert_eq!(list_listings(conn, true)?.len(), 2);

                // Reappearing remotely reactivates through the normal upsert
                upsert_listing(conn, &listing("b", "B"), NOW)?;
                let b = get_listing(conn, "b")?.unwrap();
                assert_eq!(b.sync_status, "active");
                assert!(!b.is_deleted);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_bookings_filter() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_listing(conn, &listing("l1", "L1"), NOW)?;
                upsert_booking(conn, &booking("future", "l1", "2026-05-10", "confirmed"))?;
                upsert_booking(conn, &booking("today", "l1", "2026-05-01", "pending"))?;
                upsert_booking(conn, &booking("past", "l1", "2026-04-30", "confirmed"))?;
                upsert_booking(conn, &booking("gone", "l1", "2026-05-10", "cancelled"))?;

                let open: Vec<String> = open_bookings_for_listing(conn, "l1", "2026-05-01")?
                    .into_iter()
                    .map(|b| b.id)
                    .collect();
                assert_eq!(open, vec!["future".to_string(), "today".to_string()]);

                assert!(cancel_booking(conn, "future", NOW)?);
                assert!(!cancel_booking(conn, "future", NOW)?);
                assert_eq!(get_booking(conn, "future")?.unwrap().status, "cancelled");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_failure_keeps_last_synced() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let ok = IntegrationHealth {
                    provider: "hostaway".into(),
                    status: "connected".into(),
                    last_synced: Some(NOW.into()),
                    last_error: None,
                    remaining_requests: Some(40),
                    rate_limit_reset: None,
                    request_count: 3,
                    is_rate_limited: false,
                    updated_at: NOW.into(),
                };
                upsert_integration_health(conn, &ok)?;

                let failed = IntegrationHealth {
                    status: "error".into(),
                    last_synced: None,
                    last_error: Some("boom".into()),
                    remaining_requests: None,
                    request_count: 1,
                    updated_at: "2026-05-01T13:00:00.000Z".into(),
                    ..ok.clone()
                };
                upsert_integration_health(conn, &failed)?;

                let stored = get_integration_health(conn, "hostaway")?.unwrap();
                assert_eq!(stored.status, "error");
                assert_eq!(stored.last_synced.as_deref(), Some(NOW));
                assert_eq!(stored.last_error.as_deref(), Some("boom"));
                assert_eq!(stored.remaining_requests, Some(40));
                assert_eq!(stored.request_count, 1);

                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM integration_health", [], |r| r.get(0))?;
                assert_eq!(count, 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_housekeeping_task_lifecycle() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_listing(conn, &listing("l1", "L1"), NOW)?;
                upsert_booking(conn, &booking("b1", "l1", "2026-05-10", "confirmed"))?;
                upsert_housekeeping_task(conn, "b1", "l1", "turnover_cleaning", Some("2026-05-10"), NOW)?;
                upsert_housekeeping_task(conn, "b1", "l1", "turnover_cleaning", Some("2026-05-11"), NOW)?;

                let tasks = list_housekeeping_tasks(conn, false)?;
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].due_date.as_deref(), Some("2026-05-11"));

                assert!(cancel_housekeeping_task(conn, "b1", NOW)?);
                assert!(list_housekeeping_tasks(conn, false)?.is_empty());
                assert_eq!(list_housekeeping_tasks(conn, true)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
