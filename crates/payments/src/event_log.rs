//! Inbound provider event log
//!
//! Each provider event id is claimed exactly once before processing. The raw
//! body is stored with the claim so failed events can be replayed without
//! asking the provider for them again.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PaymentsError, PaymentsResult};
use crate::events::VerifiedEvent;

/// Claims left in `processing` longer than this can be taken over.
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Success,
    Error,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Error => "error",
        }
    }
}

impl fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ProcessingResult::Processing),
            "success" => Ok(ProcessingResult::Success),
            "error" => Ok(ProcessingResult::Error),
            other => Err(format!("unknown processing result '{}'", other)),
        }
    }
}

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate { reason: &'static str },
}

/// Stored provider event, without its payload
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEventRecord {
    pub id: Uuid,
    /// Provider's event id (`evt_...`), unique in the log
    pub provider_event_id: String,
    /// Provider event type, e.g. `payment_intent.succeeded`
    pub event_type: String,
    pub processing_result: ProcessingResult,
    /// Last processing error, or a note about stale-claim recovery
    pub error_message: Option<String>,
    /// When the current claim was taken
    #[serde(with = "time::serde::rfc3339")]
    pub processing_started_at: OffsetDateTime,
    /// When the last processing attempt finished
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    /// First receipt of the event
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait ProviderEventLog: Send + Sync {
    /// Atomically claim `event`. Only one caller ever gets `Claimed` for a
    /// given event id, unless an earlier claim went stale.
    async fn claim(&self, event: &VerifiedEvent) -> PaymentsResult<ClaimOutcome>;

    /// Record the outcome of processing. `error` is `None` on success.
    async fn record_result(&self, provider_event_id: &str, error: Option<&str>)
        -> PaymentsResult<()>;

    async fn list(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> PaymentsResult<Vec<ProviderEventRecord>>;

    /// Move a stored event back to `processing` for a replay and return it
    /// with its raw payload.
    async fn begin_replay(
        &self,
        provider_event_id: &str,
    ) -> PaymentsResult<(ProviderEventRecord, String)>;

    /// Ids of failed events, oldest first
    async fn failed_event_ids(&self, limit: i64) -> PaymentsResult<Vec<String>>;

    /// Delete successfully processed events created before `cutoff`.
    async fn delete_processed_before(&self, cutoff: OffsetDateTime) -> PaymentsResult<u64>;
}

fn event_not_found(provider_event_id: &str) -> PaymentsError {
    PaymentsError::NotFound(format!("Provider event {}", provider_event_id))
}

// =============================================================================
// Postgres
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    provider_event_id: String,
    event_type: String,
    processing_result: String,
    error_message: Option<String>,
    processing_started_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for ProviderEventRecord {
    type Error = PaymentsError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(ProviderEventRecord {
            id: row.id,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            processing_result: row
                .processing_result
                .parse()
                .map_err(PaymentsError::Internal)?,
            error_message: row.error_message,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

/// Event log in the `provider_events` table
#[derive(Clone)]
pub struct PgProviderEventLog {
    pool: PgPool,
}

impl PgProviderEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderEventLog for PgProviderEventLog {
    async fn claim(&self, event: &VerifiedEvent) -> PaymentsResult<ClaimOutcome> {
        // INSERT ... ON CONFLICT ... RETURNING hands the claim to exactly one
        // caller. A conflicting row is only taken over when its claim is stale.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO provider_events
                (id, provider_event_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE provider_events.processing_result = 'processing'
              AND provider_events.processing_started_at < NOW() - make_interval(mins => $5)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.raw)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim provider event for processing"
            );
            PaymentsError::from(e)
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT processing_result FROM provider_events WHERE provider_event_id = $1")
                .bind(&event.id)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();

        Ok(ClaimOutcome::Duplicate {
            reason: duplicate_reason(existing.and_then(|(s,)| s.parse().ok())),
        })
    }

    async fn record_result(
        &self,
        provider_event_id: &str,
        error: Option<&str>,
    ) -> PaymentsResult<()> {
        let result = if error.is_some() {
            ProcessingResult::Error
        } else {
            ProcessingResult::Success
        };

        sqlx::query(
            r#"
            UPDATE provider_events
            SET processing_result = $1, error_message = $2, processed_at = NOW()
            WHERE provider_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error)
        .bind(provider_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> PaymentsResult<Vec<ProviderEventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, provider_event_id, event_type, processing_result, error_message,
                   processing_started_at, processed_at, created_at
            FROM provider_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProviderEventRecord::try_from).collect()
    }

    async fn begin_replay(
        &self,
        provider_event_id: &str,
    ) -> PaymentsResult<(ProviderEventRecord, String)> {
        #[derive(sqlx::FromRow)]
        struct ReplayRow {
            #[sqlx(flatten)]
            event: EventRow,
            payload: String,
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<ReplayRow> = sqlx::query_as(
            r#"
            SELECT id, provider_event_id, event_type, processing_result, error_message,
                   processing_started_at, processed_at, created_at, payload
            FROM provider_events
            WHERE provider_event_id = $1
            FOR UPDATE
            "#,
        )
        .bind(provider_event_id)
        .fetch_optional(&mut *tx)
        .await?;
        let ReplayRow {
            event: previous,
            payload,
        } = existing.ok_or_else(|| event_not_found(provider_event_id))?;

        sqlx::query(
            r#"
            UPDATE provider_events
            SET processing_result = 'processing',
                processing_started_at = NOW(),
                processed_at = NULL
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((ProviderEventRecord::try_from(previous)?, payload))
    }

    async fn failed_event_ids(&self, limit: i64) -> PaymentsResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT provider_event_id
            FROM provider_events
            WHERE processing_result = 'error'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_processed_before(&self, cutoff: OffsetDateTime) -> PaymentsResult<u64> {
        let result = sqlx::query(
            "DELETE FROM provider_events WHERE processing_result = 'success' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn duplicate_reason(existing: Option<ProcessingResult>) -> &'static str {
    match existing {
        Some(ProcessingResult::Success) => "already processed successfully",
        Some(ProcessingResult::Processing) => "currently being processed by another worker",
        Some(ProcessingResult::Error) => "previously failed; replay to retry",
        None => "unknown (concurrent cleanup?)",
    }
}

// =============================================================================
// In memory
// =============================================================================

struct StoredEvent {
    record: ProviderEventRecord,
    payload: String,
}

/// Event log kept in process memory
#[derive(Default)]
pub struct InMemoryProviderEventLog {
    events: Mutex<HashMap<String, StoredEvent>>,
}

impl InMemoryProviderEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn claim_at(
        &self,
        event: &VerifiedEvent,
        now: OffsetDateTime,
    ) -> PaymentsResult<ClaimOutcome> {
        let mut events = self.events.lock().await;

        if let Some(stored) = events.get_mut(&event.id) {
            let stale_before = now - Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));
            let record = &mut stored.record;
            if record.processing_result == ProcessingResult::Processing
                && record.processing_started_at < stale_before
            {
                record.processing_started_at = now;
                record.error_message = Some(format!("Recovered from stuck state at {}", now));
                return Ok(ClaimOutcome::Claimed);
            }
            return Ok(ClaimOutcome::Duplicate {
                reason: duplicate_reason(Some(record.processing_result)),
            });
        }

        events.insert(
            event.id.clone(),
            StoredEvent {
                record: ProviderEventRecord {
                    id: Uuid::new_v4(),
                    provider_event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    processing_result: ProcessingResult::Processing,
                    error_message: None,
                    processing_started_at: now,
                    processed_at: None,
                    created_at: now,
                },
                payload: event.raw.clone(),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }
}

#[async_trait]
impl ProviderEventLog for InMemoryProviderEventLog {
    async fn claim(&self, event: &VerifiedEvent) -> PaymentsResult<ClaimOutcome> {
        self.claim_at(event, OffsetDateTime::now_utc()).await
    }

    async fn record_result(
        &self,
        provider_event_id: &str,
        error: Option<&str>,
    ) -> PaymentsResult<()> {
        let mut events = self.events.lock().await;
        if let Some(stored) = events.get_mut(provider_event_id) {
            stored.record.processing_result = if error.is_some() {
                ProcessingResult::Error
            } else {
                ProcessingResult::Success
            };
            stored.record.error_message = error.map(str::to_string);
            stored.record.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> PaymentsResult<Vec<ProviderEventRecord>> {
        let events = self.events.lock().await;
        let mut records: Vec<ProviderEventRecord> = events
            .values()
            .map(|stored| stored.record.clone())
            .filter(|record| status.map_or(true, |s| record.processing_result == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn begin_replay(
        &self,
        provider_event_id: &str,
    ) -> PaymentsResult<(ProviderEventRecord, String)> {
        let mut events = self.events.lock().await;
        let stored = events
            .get_mut(provider_event_id)
            .ok_or_else(|| event_not_found(provider_event_id))?;

        let previous = stored.record.clone();
        stored.record.processing_result = ProcessingResult::Processing;
        stored.record.processing_started_at = OffsetDateTime::now_utc();
        stored.record.processed_at = None;

        Ok((previous, stored.payload.clone()))
    }

    async fn failed_event_ids(&self, limit: i64) -> PaymentsResult<Vec<String>> {
        let events = self.events.lock().await;
        let mut failed: Vec<&ProviderEventRecord> = events
            .values()
            .map(|stored| &stored.record)
            .filter(|record| record.processing_result == ProcessingResult::Error)
            .collect();
        failed.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(failed
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|record| record.provider_event_id.clone())
            .collect())
    }

    async fn delete_processed_before(&self, cutoff: OffsetDateTime) -> PaymentsResult<u64> {
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|_, stored| {
            !(stored.record.processing_result == ProcessingResult::Success
                && stored.record.created_at < cutoff)
        });
        Ok((before - events.len()) as u64)
    }
}
