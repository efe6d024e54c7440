//! Payment reconciliation
//!
//! Mirrors provider state onto the local ledger. Every transition is a "set
//! to the mapped status", so replays are harmless and out-of-order delivery
//! resolves to whichever event was applied last.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::PaymentsResult;
use crate::events::{
    tenant_from_metadata, ChargeObject, PaymentIntentObject, ProviderEvent, RefundObject,
};
use crate::ledger::{Ledger, PaymentUpdate};
use crate::models::{PaymentStatus, PaymentStatusUpdate, RefundStatus};

/// What applying one provider event did to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    RefundsApplied {
        updated: usize,
        skipped: usize,
    },
    /// The event carried no usable tenant id.
    SkippedNoTenant,
    /// No local payment for this tenant and intent id.
    SkippedUnknownPayment,
    /// Event class this system does not reconcile.
    Ignored,
}

/// Applies provider events to the ledger
#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn apply_provider_event(
        &self,
        event: &ProviderEvent,
    ) -> PaymentsResult<ReconcileOutcome> {
        match event {
            ProviderEvent::PaymentIntentUpdated(intent)
            | ProviderEvent::PaymentIntentSucceeded(intent)
            | ProviderEvent::PaymentIntentCanceled(intent) => {
                self.apply_intent(intent, PaymentStatus::from_provider(&intent.status))
                    .await
            }
            // The failed intent's own status is `requires_payment_method`;
            // the event class carries the outcome.
            ProviderEvent::PaymentIntentFailed(intent) => {
                self.apply_intent(intent, PaymentStatus::Failed).await
            }
            ProviderEvent::ChargeRefunded(charge) => self.apply_charge_refunds(charge).await,
            ProviderEvent::RefundUpdated(refund) => {
                self.apply_refunds(None, std::slice::from_ref(refund)).await
            }
            ProviderEvent::Unhandled { event_type } => {
                tracing::info!(event_type = %event_type, "Unhandled provider event type");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn apply_intent(
        &self,
        intent: &PaymentIntentObject,
        status: PaymentStatus,
    ) -> PaymentsResult<ReconcileOutcome> {
        let Some(tenant_id) = tenant_from_metadata(&intent.metadata) else {
            tracing::warn!(
                payment_intent_id = %intent.id,
                "Provider event has no tenant metadata, cannot reconcile"
            );
            return Ok(ReconcileOutcome::SkippedNoTenant);
        };

        let Some(payment) = self
            .ledger
            .find_payment_by_intent(tenant_id, &intent.id)
            .await?
        else {
            tracing::info!(
                tenant_id = %tenant_id,
                payment_intent_id = %intent.id,
                "No local payment for provider intent, skipping"
            );
            return Ok(ReconcileOutcome::SkippedUnknownPayment);
        };

        let error = intent.last_payment_error.clone().unwrap_or_default();
        let update = PaymentStatusUpdate {
            status,
            provider_charge_id: intent.charge_id(),
            receipt_url: intent.receipt_url(),
            failure_code: error.code.or(error.decline_code),
            failure_message: error.message,
        };

        match self
            .ledger
            .update_payment_status(tenant_id, payment.id, &update)
            .await?
        {
            PaymentUpdate::Changed { previous, payment } => {
                if previous.is_terminal() && previous != status {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        payment_id = %payment.id,
                        previous = %previous,
                        status = %status,
                        "Terminal payment status overwritten by a later event"
                    );
                } else {
                    tracing::info!(
                        tenant_id = %tenant_id,
                        payment_id = %payment.id,
                        previous = %previous,
                        status = %status,
                        "Payment status updated"
                    );
                }
            }
            PaymentUpdate::Unchanged(payment) => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    payment_id = %payment.id,
                    status = %status,
                    "Payment already in event state"
                );
            }
        }

        Ok(ReconcileOutcome::Applied {
            payment_id: payment.id,
            status,
        })
    }

    async fn apply_charge_refunds(&self, charge: &ChargeObject) -> PaymentsResult<ReconcileOutcome> {
        let refunds = charge
            .refunds
            .as_ref()
            .map(|list| list.data.as_slice())
            .unwrap_or_default();

        self.apply_refunds(tenant_from_metadata(&charge.metadata), refunds)
            .await
    }

    async fn apply_refunds(
        &self,
        charge_tenant: Option<Uuid>,
        refunds: &[RefundObject],
    ) -> PaymentsResult<ReconcileOutcome> {
        if charge_tenant.is_none()
            && refunds.iter().all(|r| tenant_from_metadata(&r.metadata).is_none())
        {
            tracing::warn!("Refund event has no tenant metadata, cannot reconcile");
            return Ok(ReconcileOutcome::SkippedNoTenant);
        }

        let mut updated = 0;
        let mut skipped = 0;

        for refund in refunds {
            let Some(tenant_id) = tenant_from_metadata(&refund.metadata).or(charge_tenant) else {
                skipped += 1;
                continue;
            };
            if self.apply_refund(tenant_id, refund).await? {
                updated += 1;
            } else {
                skipped += 1;
            }
        }

        Ok(ReconcileOutcome::RefundsApplied { updated, skipped })
    }

    /// Returns whether a local refund was found for `refund`.
    async fn apply_refund(&self, tenant_id: Uuid, refund: &RefundObject) -> PaymentsResult<bool> {
        let status = RefundStatus::from_provider(refund.status.as_deref().unwrap_or("pending"));

        if let Some(local) = self
            .ledger
            .find_refund_by_provider_id(tenant_id, &refund.id)
            .await?
        {
            if let Some(changed) = self
                .ledger
                .set_refund_status(tenant_id, local.id, status, None)
                .await?
            {
                tracing::info!(
                    tenant_id = %tenant_id,
                    refund_id = %changed.id,
                    status = %status,
                    "Refund status updated"
                );
            }
            return Ok(true);
        }

        // The provider can report a refund before its id has been attached to
        // the local reservation; the reservation id travels in the metadata.
        if let Some(local_id) = local_refund_id(&refund.metadata) {
            if let Some(local) = self.ledger.find_refund(tenant_id, local_id).await? {
                if local.provider_refund_id.is_none() {
                    self.ledger
                        .attach_provider_refund(tenant_id, local.id, &refund.id, status)
                        .await?;
                    tracing::info!(
                        tenant_id = %tenant_id,
                        refund_id = %local.id,
                        provider_refund_id = %refund.id,
                        status = %status,
                        "Refund reservation matched from provider event"
                    );
                    return Ok(true);
                }
            }
        }

        tracing::info!(
            tenant_id = %tenant_id,
            provider_refund_id = %refund.id,
            "Provider refund has no local record, skipping"
        );
        Ok(false)
    }
}

fn local_refund_id(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("refund_id")
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VerifiedEvent;
    use crate::ledger::{InMemoryLedger, RefundReservation};
    use crate::testing::new_payment;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn decode(event_type: &str, object: serde_json::Value) -> ProviderEvent {
        ProviderEvent::decode(&VerifiedEvent {
            id: "evt_test".to_string(),
            event_type: event_type.to_string(),
            created: 0,
            livemode: false,
            object,
            raw: String::new(),
        })
        .unwrap()
    }

    async fn setup() -> (Arc<InMemoryLedger>, Reconciler, Uuid, Uuid) {
        let ledger = Arc::new(InMemoryLedger::new());
        let tenant = Uuid::new_v4();
        let payment = ledger
            .insert_payment(new_payment(tenant, "pi_rec", Decimal::new(5000, 2)))
            .await
            .unwrap();
        let reconciler = Reconciler::new(ledger.clone());
        (ledger, reconciler, tenant, payment.id)
    }

    #[tokio::test]
    async fn test_processing_event_maps_status() {
        let (ledger, reconciler, tenant, payment_id) = setup().await;
        let event = decode(
            "payment_intent.processing",
            json!({"id": "pi_rec", "status": "requires_capture", "metadata": {"tenant_id": tenant.to_string()}}),
        );

        let outcome = reconciler.apply_provider_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                payment_id,
                status: PaymentStatus::Processing
            }
        );
        let stored = ledger.find_payment(tenant, payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_failed_event_records_failure_details() {
        let (ledger, reconciler, tenant, payment_id) = setup().await;
        let event = decode(
            "payment_intent.payment_failed",
            json!({
                "id": "pi_rec",
                "status": "requires_payment_method",
                "metadata": {"tenant_id": tenant.to_string()},
                "last_payment_error": {"code": "card_declined", "message": "Your card was declined."}
            }),
        );

        reconciler.apply_provider_event(&event).await.unwrap();
        let stored = ledger.find_payment(tenant, payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.failure_code.as_deref(), Some("card_declined"));
        assert_eq!(
            stored.failure_message.as_deref(),
            Some("Your card was declined.")
        );
    }

    #[tokio::test]
    async fn test_unknown_payment_is_skipped() {
        let (_, reconciler, tenant, _) = setup().await;
        let event = decode(
            "payment_intent.succeeded",
            json!({"id": "pi_elsewhere", "status": "succeeded", "metadata": {"tenant_id": tenant.to_string()}}),
        );
        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::SkippedUnknownPayment
        );
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_touch_payment() {
        let (ledger, reconciler, tenant, payment_id) = setup().await;
        let event = decode(
            "payment_intent.succeeded",
            json!({"id": "pi_rec", "status": "succeeded", "metadata": {"tenant_id": Uuid::new_v4().to_string()}}),
        );
        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::SkippedUnknownPayment
        );
        let stored = ledger.find_payment(tenant, payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_ignored() {
        let (_, reconciler, _, _) = setup().await;
        let event = decode("invoice.paid", json!({"id": "in_1"}));
        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_charge_refunded_updates_known_and_skips_unknown() {
        let (ledger, reconciler, tenant, payment_id) = setup().await;
        ledger
            .update_payment_status(
                tenant,
                payment_id,
                &PaymentStatusUpdate::status(PaymentStatus::Succeeded),
            )
            .await
            .unwrap();
        let reserved = ledger
            .reserve_refund(RefundReservation {
                tenant_id: tenant,
                payment_id,
                amount: Some(Decimal::new(1000, 2)),
                reason: None,
            })
            .await
            .unwrap();
        ledger
            .attach_provider_refund(tenant, reserved.refund.id, "re_known", RefundStatus::Pending)
            .await
            .unwrap();

        let event = decode(
            "charge.refunded",
            json!({
                "id": "ch_1",
                "metadata": {"tenant_id": tenant.to_string()},
                "refunds": {"data": [
                    {"id": "re_known", "status": "succeeded"},
                    {"id": "re_dashboard", "status": "succeeded"}
                ]}
            }),
        );

        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::RefundsApplied {
                updated: 1,
                skipped: 1
            }
        );
        let refunds = ledger.list_refunds(tenant, payment_id).await.unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].status, RefundStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_refund_event_matches_reservation_by_metadata() {
        let (ledger, reconciler, tenant, payment_id) = setup().await;
        ledger
            .update_payment_status(
                tenant,
                payment_id,
                &PaymentStatusUpdate::status(PaymentStatus::Succeeded),
            )
            .await
            .unwrap();
        let reserved = ledger
            .reserve_refund(RefundReservation {
                tenant_id: tenant,
                payment_id,
                amount: None,
                reason: None,
            })
            .await
            .unwrap();

        let event = decode(
            "charge.refund.updated",
            json!({
                "id": "re_early",
                "status": "succeeded",
                "metadata": {"tenant_id": tenant.to_string(), "refund_id": reserved.refund.id.to_string()}
            }),
        );

        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::RefundsApplied {
                updated: 1,
                skipped: 0
            }
        );
        let refund = ledger
            .find_refund_by_provider_id(tenant, "re_early")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refund.id, reserved.refund.id);
        assert_eq!(refund.status, RefundStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_refund_without_any_tenant_is_skipped() {
        let (_, reconciler, _, _) = setup().await;
        let event = decode(
            "charge.refunded",
            json!({"id": "ch_1", "refunds": {"data": [{"id": "re_1", "status": "succeeded"}]}}),
        );
        assert_eq!(
            reconciler.apply_provider_event(&event).await.unwrap(),
            ReconcileOutcome::SkippedNoTenant
        );
    }
}
