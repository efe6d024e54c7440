//! Refund creation and lookup
//!
//! A refund is reserved in the ledger before the provider is called, so the
//! refundable amount can never be spent twice. If the provider rejects the
//! refund the reservation is marked failed, which releases the amount.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use saasbill_shared::{validate_amount, ValidationErrors};
use uuid::Uuid;

use crate::client::{to_minor_units, PaymentProvider, ProviderHandle, ProviderRefund, RefundParams};
use crate::error::PaymentsResult;
use crate::ledger::{payment_not_found, Ledger, RefundReservation, ReservedRefund};
use crate::models::{
    available_to_refund, PaymentRefunds, RefundReason, RefundResponse, RefundStatus,
};

/// Refund service
#[derive(Clone)]
pub struct RefundService {
    ledger: Arc<dyn Ledger>,
    provider: ProviderHandle,
}

impl RefundService {
    pub fn new(ledger: Arc<dyn Ledger>, provider: ProviderHandle) -> Self {
        Self { ledger, provider }
    }

    /// Refund all or part of a succeeded payment.
    ///
    /// `amount` defaults to everything still refundable.
    pub async fn create_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: Option<Decimal>,
        reason: Option<RefundReason>,
    ) -> PaymentsResult<RefundResponse> {
        if let Some(amount) = amount {
            validate_amount(amount).map_err(|msg| ValidationErrors::field("amount", msg))?;
        }

        let provider = self.provider.get().await?;

        let reserved = self
            .ledger
            .reserve_refund(RefundReservation {
                tenant_id,
                payment_id,
                amount,
                reason,
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            payment_id = %payment_id,
            refund_id = %reserved.refund.id,
            amount = %reserved.refund.amount,
            "Refund reserved, submitting to provider"
        );

        match submit(provider.as_ref(), &reserved).await {
            Ok(provider_refund) => {
                let status = RefundStatus::from_provider(&provider_refund.status);
                let refund = self
                    .ledger
                    .attach_provider_refund(tenant_id, reserved.refund.id, &provider_refund.id, status)
                    .await?;

                tracing::info!(
                    tenant_id = %tenant_id,
                    refund_id = %refund.id,
                    provider_refund_id = %provider_refund.id,
                    status = %refund.status,
                    "Refund created"
                );
                Ok(RefundResponse::from(refund))
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    refund_id = %reserved.refund.id,
                    error = %e,
                    "Provider rejected refund, releasing reservation"
                );

                let message = e.to_string();
                if let Err(release_err) = self
                    .ledger
                    .set_refund_status(
                        tenant_id,
                        reserved.refund.id,
                        RefundStatus::Failed,
                        Some(&message),
                    )
                    .await
                {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        refund_id = %reserved.refund.id,
                        error = %release_err,
                        "Failed to release refund reservation; amount stays held until resolved"
                    );
                }

                Err(e)
            }
        }
    }

    /// Refunds for a payment, oldest first, with the amount still refundable
    pub async fn list_refunds(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentsResult<PaymentRefunds> {
        let payment = self
            .ledger
            .find_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| payment_not_found(payment_id))?;
        let refunds = self.ledger.list_refunds(tenant_id, payment_id).await?;
        let available = available_to_refund(&payment, &refunds);

        Ok(PaymentRefunds {
            payment_id,
            refunds: refunds.into_iter().map(RefundResponse::from).collect(),
            available,
        })
    }

    pub async fn available_to_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentsResult<Decimal> {
        Ok(self.list_refunds(tenant_id, payment_id).await?.available)
    }
}

async fn submit(
    provider: &dyn PaymentProvider,
    reserved: &ReservedRefund,
) -> PaymentsResult<ProviderRefund> {
    let amount_minor = to_minor_units(reserved.refund.amount)?;

    let mut metadata = HashMap::new();
    metadata.insert("tenant_id".to_string(), reserved.refund.tenant_id.to_string());
    metadata.insert("refund_id".to_string(), reserved.refund.id.to_string());
    metadata.insert("payment_id".to_string(), reserved.payment.id.to_string());

    provider
        .create_refund(RefundParams {
            payment_intent_id: reserved.payment.provider_payment_intent_id.clone(),
            amount_minor,
            reason: reserved.refund.reason,
            metadata,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::client::{IntentParams, ProviderIntent};
    use crate::error::PaymentsError;
    use crate::events::{ProviderEvent, RefundObject};
    use crate::ledger::InMemoryLedger;
    use crate::models::{PaymentStatus, PaymentStatusUpdate};
    use crate::reconciliation::Reconciler;
    use crate::testing::{new_payment, FakeProvider};

    async fn succeeded_payment(ledger: &InMemoryLedger, tenant: Uuid, amount: Decimal) -> Uuid {
        let payment = ledger
            .insert_payment(new_payment(tenant, &format!("pi_{}", Uuid::new_v4().simple()), amount))
            .await
            .unwrap();
        ledger
            .update_payment_status(
                tenant,
                payment.id,
                &PaymentStatusUpdate::status(PaymentStatus::Succeeded),
            )
            .await
            .unwrap();
        payment.id
    }

    #[tokio::test]
    async fn test_refund_sends_minor_units_and_metadata() {
        let ledger = Arc::new(InMemoryLedger::new());
        let provider = Arc::new(FakeProvider::new());
        let service = RefundService::new(ledger.clone(), ProviderHandle::ready(provider.clone()));
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(1999, 2)).await;

        let refund = service
            .create_refund(
                tenant,
                payment_id,
                Some(Decimal::new(999, 2)),
                Some(RefundReason::RequestedByCustomer),
            )
            .await
            .unwrap();

        assert_eq!(refund.amount, Decimal::new(999, 2));
        assert_eq!(refund.status, RefundStatus::Succeeded);
        assert_eq!(refund.provider_refund_id.as_deref(), Some("re_fake_1"));

        let calls = provider.refund_calls.lock().unwrap();
        assert_eq!(calls[0].amount_minor, 999);
        assert_eq!(calls[0].metadata["tenant_id"], tenant.to_string());
        assert_eq!(calls[0].metadata["refund_id"], refund.id.to_string());
    }

    #[tokio::test]
    async fn test_invalid_amount_rejected_before_provider() {
        let ledger = Arc::new(InMemoryLedger::new());
        let provider = Arc::new(FakeProvider::new());
        let service = RefundService::new(ledger.clone(), ProviderHandle::ready(provider.clone()));
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(1000, 2)).await;

        for amount in [Decimal::ZERO, Decimal::new(-100, 2), Decimal::new(1001, 3)] {
            let err = service
                .create_refund(tenant, payment_id, Some(amount), None)
                .await
                .unwrap_err();
            assert!(matches!(err, PaymentsError::Validation(_)), "{}", amount);
        }
        assert_eq!(provider.refund_call_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_fast() {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = RefundService::new(ledger.clone(), ProviderHandle::not_configured());
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(1000, 2)).await;

        let err = service
            .create_refund(tenant, payment_id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::ProviderUnavailable(_)));
        assert!(ledger.list_refunds(tenant, payment_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_payment_is_not_found() {
        let service = RefundService::new(
            Arc::new(InMemoryLedger::new()),
            ProviderHandle::ready(Arc::new(FakeProvider::new())),
        );
        let err = service
            .create_refund(Uuid::new_v4(), Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pending_provider_status_still_holds_amount() {
        let ledger = Arc::new(InMemoryLedger::new());
        let provider = Arc::new(FakeProvider::with_refund_status("pending"));
        let service = RefundService::new(ledger.clone(), ProviderHandle::ready(provider));
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(5000, 2)).await;

        let refund = service
            .create_refund(tenant, payment_id, Some(Decimal::new(3000, 2)), None)
            .await
            .unwrap();
        assert_eq!(refund.status, RefundStatus::Pending);
        assert_eq!(
            service.available_to_refund(tenant, payment_id).await.unwrap(),
            Decimal::new(2000, 2)
        );
    }

    /// Delivers the provider's own refund event before answering the create call.
    struct EventFirstProvider {
        reconciler: Reconciler,
    }

    #[async_trait]
    impl PaymentProvider for EventFirstProvider {
        async fn create_payment_intent(
            &self,
            _params: IntentParams,
        ) -> PaymentsResult<ProviderIntent> {
            Err(PaymentsError::ProviderApi("not used".to_string()))
        }

        async fn create_refund(&self, params: RefundParams) -> PaymentsResult<ProviderRefund> {
            let event = ProviderEvent::RefundUpdated(RefundObject {
                id: "re_early".to_string(),
                status: Some("succeeded".to_string()),
                metadata: params.metadata.clone(),
            });
            self.reconciler.apply_provider_event(&event).await?;

            Ok(ProviderRefund {
                id: "re_early".to_string(),
                status: "pending".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_refund_event_before_create_returns_keeps_event_status() {
        let ledger = Arc::new(InMemoryLedger::new());
        let provider = Arc::new(EventFirstProvider {
            reconciler: Reconciler::new(ledger.clone()),
        });
        let service = RefundService::new(ledger.clone(), ProviderHandle::ready(provider));
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(2000, 2)).await;

        let refund = service
            .create_refund(tenant, payment_id, Some(Decimal::new(500, 2)), None)
            .await
            .unwrap();
        assert_eq!(refund.status, RefundStatus::Succeeded);

        let stored = ledger.find_refund(tenant, refund.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RefundStatus::Succeeded);
        assert_eq!(stored.provider_refund_id.as_deref(), Some("re_early"));
    }

    #[tokio::test]
    async fn test_list_refunds_is_tenant_scoped() {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = RefundService::new(
            ledger.clone(),
            ProviderHandle::ready(Arc::new(FakeProvider::new())),
        );
        let tenant = Uuid::new_v4();
        let payment_id = succeeded_payment(&ledger, tenant, Decimal::new(5000, 2)).await;
        service
            .create_refund(tenant, payment_id, Some(Decimal::new(1000, 2)), None)
            .await
            .unwrap();

        let listed = service.list_refunds(tenant, payment_id).await.unwrap();
        assert_eq!(listed.refunds.len(), 1);
        assert_eq!(listed.available, Decimal::new(4000, 2));

        assert!(matches!(
            service.list_refunds(Uuid::new_v4(), payment_id).await,
            Err(PaymentsError::NotFound(_))
        ));
    }
}
