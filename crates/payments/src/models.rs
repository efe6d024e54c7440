//! Payment and refund ledger types
//!
//! Amounts are `Decimal` everywhere inside the crate. Response DTOs expose
//! them as plain JSON numbers at the edge.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Local payment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    RequiresAction,
    Succeeded,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// Map a provider payment intent status onto the local vocabulary.
    ///
    /// Matching is case-sensitive. Anything unrecognized maps to `Pending`.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "requires_payment_method" | "requires_confirmation" => PaymentStatus::Pending,
            "requires_action" => PaymentStatus::RequiresAction,
            "processing" | "requires_capture" => PaymentStatus::Processing,
            "canceled" => PaymentStatus::Cancelled,
            "succeeded" => PaymentStatus::Succeeded,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal for a given charge attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Failed | PaymentStatus::Cancelled
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "requires_action" => Ok(PaymentStatus::RequiresAction),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(format!("unknown payment status '{}'", other)),
        }
    }
}

/// Local refund lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl RefundStatus {
    /// Map a provider refund status. Unknown values map to `Pending`.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "succeeded" => RefundStatus::Succeeded,
            "failed" => RefundStatus::Failed,
            "canceled" => RefundStatus::Cancelled,
            _ => RefundStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Succeeded => "succeeded",
            RefundStatus::Failed => "failed",
            RefundStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a refund in this status holds part of the payment amount.
    pub fn counts_against_payment(&self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Succeeded)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "succeeded" => Ok(RefundStatus::Succeeded),
            "failed" => Ok(RefundStatus::Failed),
            "cancelled" => Ok(RefundStatus::Cancelled),
            other => Err(format!("unknown refund status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
    Other,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
            RefundReason::RequestedByCustomer => "requested_by_customer",
            RefundReason::Other => "other",
        }
    }
}

impl FromStr for RefundReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "duplicate" => Ok(RefundReason::Duplicate),
            "fraudulent" => Ok(RefundReason::Fraudulent),
            "requested_by_customer" => Ok(RefundReason::RequestedByCustomer),
            "other" => Ok(RefundReason::Other),
            other => Err(format!("unknown refund reason '{}'", other)),
        }
    }
}

/// A locally mirrored charge attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    /// Owning tenant; every ledger lookup is scoped by it
    pub tenant_id: Uuid,
    /// Provider payment intent id, unique per tenant
    pub provider_payment_intent_id: String,
    /// Set once the provider reports a charge
    pub provider_charge_id: Option<String>,
    /// Major units, two decimal places
    pub amount: Decimal,
    /// Lowercase ISO-4217 code
    pub currency: String,
    pub status: PaymentStatus,
    /// Invoice this payment settles, if any
    pub invoice_id: Option<Uuid>,
    /// Subscription this payment belongs to, if any
    pub subscription_id: Option<Uuid>,
    /// Provider payment method used for the charge
    pub payment_method_id: Option<String>,
    pub description: Option<String>,
    /// Provider error or decline code from the last failure
    pub failure_code: Option<String>,
    /// Provider message from the last failure
    pub failure_message: Option<String>,
    /// Provider-hosted receipt for a succeeded charge
    pub receipt_url: Option<String>,
    pub created_at: OffsetDateTime,
    /// Moves only when a field actually changes
    pub updated_at: OffsetDateTime,
}

/// Status change derived from a provider event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentStatusUpdate {
    pub status: PaymentStatus,
    pub provider_charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

impl PaymentStatusUpdate {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            provider_charge_id: None,
            receipt_url: None,
            failure_code: None,
            failure_message: None,
        }
    }
}

impl Payment {
    /// Compute the state after applying `update`.
    ///
    /// Returns `None` when nothing would change, so re-applying an event is a
    /// no-op and `updated_at` only moves on real changes. The returned value
    /// keeps the old `updated_at`; the ledger stamps it when persisting.
    pub fn apply_update(&self, update: &PaymentStatusUpdate) -> Option<Payment> {
        let mut next = self.clone();
        next.status = update.status;

        match update.status {
            PaymentStatus::Succeeded => {
                if update.provider_charge_id.is_some() {
                    next.provider_charge_id = update.provider_charge_id.clone();
                }
                if update.receipt_url.is_some() {
                    next.receipt_url = update.receipt_url.clone();
                }
                next.failure_code = None;
                next.failure_message = None;
            }
            PaymentStatus::Failed => {
                if update.failure_code.is_some() {
                    next.failure_code = update.failure_code.clone();
                }
                if update.failure_message.is_some() {
                    next.failure_message = update.failure_message.clone();
                }
            }
            _ => {}
        }

        if next == *self {
            None
        } else {
            Some(next)
        }
    }
}

/// A refund against a payment. Append-only: rows change status, never disappear.
#[derive(Debug, Clone, PartialEq)]
pub struct Refund {
    pub id: Uuid,
    /// Owning tenant, always the payment's tenant
    pub tenant_id: Uuid,
    /// Payment being refunded
    pub payment_id: Uuid,
    /// `None` between the local reservation and the provider's reply
    pub provider_refund_id: Option<String>,
    /// Major units; never more than what the payment has left
    pub amount: Decimal,
    /// Copied from the payment
    pub currency: String,
    /// `pending` and `succeeded` both hold their amount against the payment
    pub status: RefundStatus,
    pub reason: Option<RefundReason>,
    /// Why the provider rejected the refund
    pub failure_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Input for inserting a payment row
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: Uuid,
    pub provider_payment_intent_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub payment_method_id: Option<String>,
    pub description: Option<String>,
}

/// Request to create a payment
#[derive(Debug, Clone, Deserialize)]
pub struct NewPaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub invoice_id: Option<Uuid>,
    #[serde(default)]
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request to refund a payment
#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<RefundReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub provider_payment_intent_id: String,
    pub provider_charge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub description: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub receipt_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentResponse {
    pub fn from_payment(payment: Payment, client_secret: Option<String>) -> Self {
        Self {
            id: payment.id,
            provider_payment_intent_id: payment.provider_payment_intent_id,
            provider_charge_id: payment.provider_charge_id,
            client_secret,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            invoice_id: payment.invoice_id,
            subscription_id: payment.subscription_id,
            description: payment.description,
            failure_code: payment.failure_code,
            failure_message: payment.failure_message,
            receipt_url: payment.receipt_url,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self::from_payment(payment, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResponse {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub provider_refund_id: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: Option<RefundReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Refund> for RefundResponse {
    fn from(refund: Refund) -> Self {
        Self {
            id: refund.id,
            payment_id: refund.payment_id,
            provider_refund_id: refund.provider_refund_id,
            amount: refund.amount,
            currency: refund.currency,
            status: refund.status,
            reason: refund.reason,
            created_at: refund.created_at,
        }
    }
}

/// Refunds recorded against a payment and what remains refundable
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRefunds {
    pub payment_id: Uuid,
    pub refunds: Vec<RefundResponse>,
    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,
}

/// Amount still refundable: payment amount minus every pending or succeeded refund.
pub fn available_to_refund(payment: &Payment, refunds: &[Refund]) -> Decimal {
    let held: Decimal = refunds
        .iter()
        .filter(|r| r.payment_id == payment.id && r.status.counts_against_payment())
        .map(|r| r.amount)
        .sum();
    payment.amount - held
}
