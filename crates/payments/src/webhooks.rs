//! Provider webhook handling
//!
//! Verification runs synchronously on the raw request body. Processing goes
//! through the event log so every provider event id is reconciled once, and
//! failed events keep their payload for replay.

use std::sync::Arc;

use saasbill_shared::Readiness;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{PaymentsError, PaymentsResult};
use crate::event_log::{ClaimOutcome, ProcessingResult, ProviderEventLog, ProviderEventRecord};
use crate::events::{EventVerifier, ProviderEvent, VerifiedEvent};
use crate::reconciliation::{ReconcileOutcome, Reconciler};

/// Default number of failed events replayed per batch
pub const DEFAULT_REPLAY_BATCH: i64 = 100;

/// Result of replaying one stored event
#[derive(Debug, Clone, Serialize)]
pub struct EventReplayResult {
    pub provider_event_id: String,
    /// `unknown` when the stored event could not be loaded
    pub event_type: String,
    /// Processing result before the replay
    pub previous_status: String,
    /// Error recorded by the previous attempt
    pub previous_error: Option<String>,
    pub new_status: ProcessingResult,
    /// Error from this replay, if it failed again
    pub new_error: Option<String>,
    /// What the replay did to the ledger
    pub outcome: Option<ReconcileOutcome>,
    pub success: bool,
}

pub struct WebhookHandler {
    verifier: Readiness<Arc<dyn EventVerifier>>,
    events: Arc<dyn ProviderEventLog>,
    reconciler: Reconciler,
}

impl WebhookHandler {
    pub fn new(
        verifier: Readiness<Arc<dyn EventVerifier>>,
        events: Arc<dyn ProviderEventLog>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            verifier,
            events,
            reconciler,
        }
    }

    /// Verify a webhook body against its signature header.
    ///
    /// `payload` must be the exact bytes received.
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> PaymentsResult<VerifiedEvent> {
        let verifier = self.verifier.require()?;

        verifier.verify(payload, signature).map_err(|e| {
            // Never log payload contents for authenticity failures.
            tracing::warn!(error_code = e.code(), "Provider webhook verification failed");
            e
        })
    }

    /// Claim and process a verified event.
    ///
    /// Returns `Ok(None)` when the event was already claimed elsewhere.
    pub async fn handle_event(
        &self,
        event: VerifiedEvent,
    ) -> PaymentsResult<Option<ReconcileOutcome>> {
        if let ClaimOutcome::Duplicate { reason } = self.events.claim(&event).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate provider event, skipping"
            );
            return Ok(None);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing provider event"
        );

        let result = self.process_event(&event).await;
        let error = result.as_ref().err().map(ToString::to_string);
        self.record_result(&event, error.as_deref()).await;

        result.map(Some)
    }

    async fn process_event(&self, event: &VerifiedEvent) -> PaymentsResult<ReconcileOutcome> {
        let decoded = ProviderEvent::decode(event)?;
        self.reconciler.apply_provider_event(&decoded).await
    }

    /// Bookkeeping only: a failed write is logged, never surfaced.
    async fn record_result(&self, event: &VerifiedEvent, error: Option<&str>) {
        let Err(first) = self.events.record_result(&event.id, error).await else {
            return;
        };

        tracing::warn!(
            event_id = %event.id,
            error = %first,
            "First attempt to record provider event result failed, retrying"
        );

        if let Err(retry_err) = self.events.record_result(&event.id, error).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                processing_error = ?error,
                first_error = %first,
                retry_error = %retry_err,
                "Failed to record provider event result after retry; \
                 event stays in 'processing' until the claim goes stale"
            );
        }
    }

    pub async fn list_events(
        &self,
        status: Option<ProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> PaymentsResult<Vec<ProviderEventRecord>> {
        self.events.list(status, limit, offset).await
    }

    /// Re-process a stored event from its saved payload.
    pub async fn replay_event(&self, provider_event_id: &str) -> PaymentsResult<EventReplayResult> {
        tracing::info!(event_id = %provider_event_id, "Replaying provider event");

        let (previous, payload) = self.events.begin_replay(provider_event_id).await?;

        let result = match VerifiedEvent::from_raw(&payload) {
            Ok(event) => self.process_event(&event).await,
            Err(e) => Err(e),
        };
        let new_error = result.as_ref().err().map(ToString::to_string);
        self.events
            .record_result(provider_event_id, new_error.as_deref())
            .await?;

        let new_status = if result.is_ok() {
            ProcessingResult::Success
        } else {
            ProcessingResult::Error
        };

        tracing::info!(
            event_id = %provider_event_id,
            previous_status = %previous.processing_result,
            new_status = %new_status,
            success = result.is_ok(),
            "Provider event replay completed"
        );

        Ok(EventReplayResult {
            provider_event_id: provider_event_id.to_string(),
            event_type: previous.event_type,
            previous_status: previous.processing_result.to_string(),
            previous_error: previous.error_message,
            new_status,
            new_error,
            success: result.is_ok(),
            outcome: result.ok(),
        })
    }

    /// Replay failed events, oldest first
    pub async fn replay_failed(&self, max_events: Option<i64>) -> PaymentsResult<Vec<EventReplayResult>> {
        let ids = self
            .events
            .failed_event_ids(max_events.unwrap_or(DEFAULT_REPLAY_BATCH))
            .await?;

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.replay_event(&id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(event_id = %id, error = %e, "Failed to replay provider event");
                    results.push(EventReplayResult {
                        provider_event_id: id,
                        event_type: "unknown".to_string(),
                        previous_status: ProcessingResult::Error.to_string(),
                        previous_error: None,
                        new_status: ProcessingResult::Error,
                        new_error: Some(e.to_string()),
                        outcome: None,
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Delete successfully processed events older than `retention`.
    pub async fn cleanup_processed(&self, retention: Duration) -> PaymentsResult<u64> {
        if retention.is_negative() {
            return Err(PaymentsError::Internal(
                "event retention must not be negative".to_string(),
            ));
        }

        let removed = self
            .events
            .delete_processed_before(OffsetDateTime::now_utc() - retention)
            .await?;
        tracing::info!(removed = removed, "Provider event log cleanup complete");
        Ok(removed)
    }

    pub fn verifier_state(&self) -> &'static str {
        self.verifier.state_name()
    }
}
