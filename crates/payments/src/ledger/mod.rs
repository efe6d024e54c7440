//! Payment and refund ledger
//!
//! Every read and write is tenant-scoped. Refund reservation is the one
//! cross-row operation: the available amount is computed and the pending row
//! inserted while the payment is locked, so concurrent refunds serialize.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{PaymentsError, PaymentsResult};
use crate::models::{
    available_to_refund, NewPayment, Payment, PaymentStatus, PaymentStatusUpdate, Refund,
    RefundReason, RefundStatus,
};

/// Outcome of a status write
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentUpdate {
    /// The row changed; `previous` is the status before the write.
    Changed {
        previous: PaymentStatus,
        payment: Payment,
    },
    /// The update matched the stored state and nothing was written.
    Unchanged(Payment),
}

impl PaymentUpdate {
    pub fn payment(&self) -> &Payment {
        match self {
            PaymentUpdate::Changed { payment, .. } | PaymentUpdate::Unchanged(payment) => payment,
        }
    }
}

/// Request to hold part of a payment for a refund
#[derive(Debug, Clone)]
pub struct RefundReservation {
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    /// `None` reserves everything still available.
    pub amount: Option<Decimal>,
    pub reason: Option<RefundReason>,
}

/// A pending refund row and the payment it was reserved against
#[derive(Debug, Clone)]
pub struct ReservedRefund {
    pub refund: Refund,
    pub payment: Payment,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert_payment(&self, payment: NewPayment) -> PaymentsResult<Payment>;

    async fn find_payment(&self, tenant_id: Uuid, payment_id: Uuid)
        -> PaymentsResult<Option<Payment>>;

    async fn find_payment_by_intent(
        &self,
        tenant_id: Uuid,
        provider_payment_intent_id: &str,
    ) -> PaymentsResult<Option<Payment>>;

    /// Apply a status update. Fails with `NotFound` when the payment is absent.
    async fn update_payment_status(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        update: &PaymentStatusUpdate,
    ) -> PaymentsResult<PaymentUpdate>;

    /// Refunds for a payment, oldest first
    async fn list_refunds(&self, tenant_id: Uuid, payment_id: Uuid) -> PaymentsResult<Vec<Refund>>;

    async fn find_refund(&self, tenant_id: Uuid, refund_id: Uuid) -> PaymentsResult<Option<Refund>>;

    async fn find_refund_by_provider_id(
        &self,
        tenant_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentsResult<Option<Refund>>;

    /// Atomically check the refundable amount and insert a pending refund.
    async fn reserve_refund(&self, reservation: RefundReservation)
        -> PaymentsResult<ReservedRefund>;

    /// Record the provider's id and status on a reserved refund.
    ///
    /// Only writes while no provider id is attached; otherwise returns the
    /// stored refund unchanged.
    async fn attach_provider_refund(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        provider_refund_id: &str,
        status: RefundStatus,
    ) -> PaymentsResult<Refund>;

    /// Set a refund's status. Returns `None` when it already had that status.
    async fn set_refund_status(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        status: RefundStatus,
        failure_message: Option<&str>,
    ) -> PaymentsResult<Option<Refund>>;
}

/// Decide how much a new refund may take from `payment`.
///
/// Only succeeded payments are refundable. A missing `requested` amount means
/// the full remainder; zero remaining is rejected the same as overspending.
pub fn plan_refund(
    payment: &Payment,
    refunds: &[Refund],
    requested: Option<Decimal>,
) -> PaymentsResult<Decimal> {
    if payment.status != PaymentStatus::Succeeded {
        return Err(PaymentsError::PaymentNotRefundable(
            payment.status.to_string(),
        ));
    }

    let available = available_to_refund(payment, refunds);
    let requested = requested.unwrap_or(available);

    if requested <= Decimal::ZERO || requested > available {
        return Err(PaymentsError::RefundExceedsAvailable {
            requested,
            available,
        });
    }

    Ok(requested)
}

pub(crate) fn payment_not_found(payment_id: Uuid) -> PaymentsError {
    PaymentsError::NotFound(format!("Payment {}", payment_id))
}

pub(crate) fn refund_not_found(refund_id: Uuid) -> PaymentsError {
    PaymentsError::NotFound(format!("Refund {}", refund_id))
}
