use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    payment_not_found, plan_refund, refund_not_found, Ledger, PaymentUpdate, RefundReservation,
    ReservedRefund,
};
use crate::error::{PaymentsError, PaymentsResult};
use crate::models::{NewPayment, Payment, PaymentStatusUpdate, Refund, RefundStatus};

#[derive(Default)]
struct State {
    payments: HashMap<Uuid, Payment>,
    /// Insertion order doubles as creation order.
    refunds: Vec<Refund>,
}

/// Ledger kept in process memory.
///
/// One mutex guards all state, so `reserve_refund` is serialized the same way
/// the row lock serializes it in Postgres.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert_payment(&self, new: NewPayment) -> PaymentsResult<Payment> {
        let mut state = self.state.lock().await;

        let duplicate = state.payments.values().any(|p| {
            p.tenant_id == new.tenant_id
                && p.provider_payment_intent_id == new.provider_payment_intent_id
        });
        if duplicate {
            return Err(PaymentsError::Database(format!(
                "payment intent {} already recorded for tenant",
                new.provider_payment_intent_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            provider_payment_intent_id: new.provider_payment_intent_id,
            provider_charge_id: None,
            amount: new.amount,
            currency: new.currency,
            status: new.status,
            invoice_id: new.invoice_id,
            subscription_id: new.subscription_id,
            payment_method_id: new.payment_method_id,
            description: new.description,
            failure_code: None,
            failure_message: None,
            receipt_url: None,
            created_at: now,
            updated_at: now,
        };
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentsResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .get(&payment_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_payment_by_intent(
        &self,
        tenant_id: Uuid,
        provider_payment_intent_id: &str,
    ) -> PaymentsResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| {
                p.tenant_id == tenant_id
                    && p.provider_payment_intent_id == provider_payment_intent_id
            })
            .cloned())
    }

    async fn update_payment_status(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        update: &PaymentStatusUpdate,
    ) -> PaymentsResult<PaymentUpdate> {
        let mut state = self.state.lock().await;
        let current = state
            .payments
            .get_mut(&payment_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| payment_not_found(payment_id))?;

        match current.apply_update(update) {
            Some(mut next) => {
                let previous = current.status;
                next.updated_at = OffsetDateTime::now_utc();
                *current = next.clone();
                Ok(PaymentUpdate::Changed {
                    previous,
                    payment: next,
                })
            }
            None => Ok(PaymentUpdate::Unchanged(current.clone())),
        }
    }

    async fn list_refunds(&self, tenant_id: Uuid, payment_id: Uuid) -> PaymentsResult<Vec<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn find_refund(&self, tenant_id: Uuid, refund_id: Uuid) -> PaymentsResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .find(|r| r.id == refund_id && r.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_refund_by_provider_id(
        &self,
        tenant_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentsResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .find(|r| {
                r.tenant_id == tenant_id
                    && r.provider_refund_id.as_deref() == Some(provider_refund_id)
            })
            .cloned())
    }

    async fn reserve_refund(
        &self,
        reservation: RefundReservation,
    ) -> PaymentsResult<ReservedRefund> {
        let mut state = self.state.lock().await;

        let payment = state
            .payments
            .get(&reservation.payment_id)
            .filter(|p| p.tenant_id == reservation.tenant_id)
            .cloned()
            .ok_or_else(|| payment_not_found(reservation.payment_id))?;

        let existing: Vec<Refund> = state
            .refunds
            .iter()
            .filter(|r| r.tenant_id == payment.tenant_id && r.payment_id == payment.id)
            .cloned()
            .collect();

        let amount = plan_refund(&payment, &existing, reservation.amount)?;

        let now = OffsetDateTime::now_utc();
        let refund = Refund {
            id: Uuid::new_v4(),
            tenant_id: payment.tenant_id,
            payment_id: payment.id,
            provider_refund_id: None,
            amount,
            currency: payment.currency.clone(),
            status: RefundStatus::Pending,
            reason: reservation.reason,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        state.refunds.push(refund.clone());

        Ok(ReservedRefund { refund, payment })
    }

    async fn attach_provider_refund(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        provider_refund_id: &str,
        status: RefundStatus,
    ) -> PaymentsResult<Refund> {
        let mut state = self.state.lock().await;

        let taken = state.refunds.iter().any(|r| {
            r.tenant_id == tenant_id
                && r.id != refund_id
                && r.provider_refund_id.as_deref() == Some(provider_refund_id)
        });
        if taken {
            return Err(PaymentsError::Database(format!(
                "provider refund {} already recorded for tenant",
                provider_refund_id
            )));
        }

        let refund = state
            .refunds
            .iter_mut()
            .find(|r| r.id == refund_id && r.tenant_id == tenant_id)
            .ok_or_else(|| refund_not_found(refund_id))?;

        if refund.provider_refund_id.is_some() {
            return Ok(refund.clone());
        }

        refund.provider_refund_id = Some(provider_refund_id.to_string());
        refund.status = status;
        refund.updated_at = OffsetDateTime::now_utc();
        Ok(refund.clone())
    }

    async fn set_refund_status(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        status: RefundStatus,
        failure_message: Option<&str>,
    ) -> PaymentsResult<Option<Refund>> {
        let mut state = self.state.lock().await;
        let refund = state
            .refunds
            .iter_mut()
            .find(|r| r.id == refund_id && r.tenant_id == tenant_id)
            .ok_or_else(|| refund_not_found(refund_id))?;

        if refund.status == status {
            return Ok(None);
        }

        refund.status = status;
        if let Some(message) = failure_message {
            refund.failure_message = Some(message.to_string());
        }
        refund.updated_at = OffsetDateTime::now_utc();
        Ok(Some(refund.clone()))
    }
}
