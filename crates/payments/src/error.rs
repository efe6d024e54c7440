//! Payments error types

use rust_decimal::Decimal;
use saasbill_shared::{Unavailable, ValidationErrors};

pub type PaymentsResult<T> = Result<T, PaymentsError>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentsError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Refund amount {requested} exceeds available amount {available}")]
    RefundExceedsAvailable {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Payment with status '{0}' cannot be refunded")]
    PaymentNotRefundable(String),

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(#[from] Unavailable),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Payment provider error: {0}")]
    ProviderApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for PaymentsError {
    fn from(err: sqlx::Error) -> Self {
        PaymentsError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for PaymentsError {
    fn from(err: stripe::StripeError) -> Self {
        PaymentsError::ProviderApi(err.to_string())
    }
}

impl PaymentsError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentsError::Validation(_) => "VALIDATION_ERROR",
            PaymentsError::NotFound(_) => "NOT_FOUND",
            PaymentsError::RefundExceedsAvailable { .. } => "REFUND_EXCEEDS_AVAILABLE",
            PaymentsError::PaymentNotRefundable(_) => "PAYMENT_NOT_REFUNDABLE",
            PaymentsError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            PaymentsError::WebhookSignatureInvalid => "INVALID_SIGNATURE",
            PaymentsError::WebhookPayloadInvalid(_) => "INVALID_PAYLOAD",
            PaymentsError::ProviderApi(_) => "PROVIDER_ERROR",
            PaymentsError::Database(_) => "DATABASE_ERROR",
            PaymentsError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
