//! Payment provider client
//!
//! The rest of the crate talks to the provider through [`PaymentProvider`].
//! [`StripeGateway`] is the production implementation; it is held behind a
//! [`ProviderHandle`] so callers can fail fast while it is unconfigured or
//! still starting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use saasbill_shared::config::env_optional;
use saasbill_shared::{Readiness, ValidationErrors};
use serde::Serialize;
use stripe::{CreatePaymentIntent, CreateRefund, Currency, PaymentIntent, Refund, RefundReasonFilter};
use tokio::sync::RwLock;

use crate::error::{PaymentsError, PaymentsResult};
use crate::models::RefundReason;

/// Stripe credentials
#[derive(Clone, Default)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl StripeConfig {
    /// Read `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET`. Either may be unset.
    pub fn from_env() -> Self {
        Self {
            secret_key: env_optional("STRIPE_SECRET_KEY"),
            webhook_secret: env_optional("STRIPE_WEBHOOK_SECRET"),
        }
    }
}

/// Parameters for creating a provider payment intent
#[derive(Debug, Clone)]
pub struct IntentParams {
    pub amount_minor: i64,
    pub currency: String,
    pub description: Option<String>,
    pub payment_method_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIntent {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

/// Parameters for creating a provider refund
#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_intent_id: String,
    pub amount_minor: i64,
    pub reason: Option<RefundReason>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRefund {
    pub id: String,
    pub status: String,
}

/// Calls made against the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment_intent(&self, params: IntentParams) -> PaymentsResult<ProviderIntent>;

    async fn create_refund(&self, params: RefundParams) -> PaymentsResult<ProviderRefund>;
}

/// Stripe-backed provider
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeGateway {
    async fn create_payment_intent(&self, params: IntentParams) -> PaymentsResult<ProviderIntent> {
        let currency: Currency =
            serde_json::from_value(serde_json::Value::String(params.currency.clone()))
                .map_err(|_| ValidationErrors::field("currency", "unsupported currency"))?;

        let mut create = CreatePaymentIntent::new(params.amount_minor, currency);
        create.description = params.description.as_deref();
        create.metadata = Some(params.metadata);
        if let Some(method) = &params.payment_method_id {
            create.payment_method = Some(method.parse().map_err(|_| {
                ValidationErrors::field("payment_method_id", "invalid payment method id")
            })?);
        }

        let intent = PaymentIntent::create(&self.client, create).await?;

        Ok(ProviderIntent {
            id: intent.id.to_string(),
            status: wire_name(&intent.status).unwrap_or_default(),
            client_secret: intent.client_secret,
        })
    }

    async fn create_refund(&self, params: RefundParams) -> PaymentsResult<ProviderRefund> {
        let mut create = CreateRefund::new();
        create.payment_intent = Some(params.payment_intent_id.parse().map_err(|e| {
            PaymentsError::Internal(format!("Invalid payment intent id: {}", e))
        })?);
        create.amount = Some(params.amount_minor);
        create.reason = params.reason.and_then(reason_filter);
        create.metadata = Some(params.metadata);

        let refund = Refund::create(&self.client, create).await?;

        Ok(ProviderRefund {
            id: refund.id.to_string(),
            status: wire_name(&refund.status).unwrap_or_default(),
        })
    }
}

fn reason_filter(reason: RefundReason) -> Option<RefundReasonFilter> {
    match reason {
        RefundReason::Duplicate => Some(RefundReasonFilter::Duplicate),
        RefundReason::Fraudulent => Some(RefundReasonFilter::Fraudulent),
        RefundReason::RequestedByCustomer => Some(RefundReasonFilter::RequestedByCustomer),
        RefundReason::Other => None,
    }
}

/// String form of a provider enum as it appears on the wire
fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}

/// Convert a two-decimal amount into integer minor units (`round(amount * 100)`).
pub fn to_minor_units(amount: Decimal) -> PaymentsResult<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| PaymentsError::Internal(format!("Amount {} out of range", amount)))
}

/// Shared, swappable readiness of the payment provider
#[derive(Clone, Default)]
pub struct ProviderHandle(Arc<RwLock<Readiness<Arc<dyn PaymentProvider>>>>);

impl ProviderHandle {
    pub fn not_configured() -> Self {
        Self::default()
    }

    pub fn initializing() -> Self {
        Self(Arc::new(RwLock::new(Readiness::Initializing)))
    }

    pub fn ready(provider: Arc<dyn PaymentProvider>) -> Self {
        Self(Arc::new(RwLock::new(Readiness::Ready(provider))))
    }

    /// Replace the current state.
    pub async fn set(&self, state: Readiness<Arc<dyn PaymentProvider>>) {
        *self.0.write().await = state;
    }

    /// The provider, or `ProviderUnavailable` when it cannot be used yet.
    pub async fn get(&self) -> PaymentsResult<Arc<dyn PaymentProvider>> {
        let guard = self.0.read().await;
        Ok(Arc::clone(guard.require()?))
    }

    pub async fn state_name(&self) -> &'static str {
        self.0.read().await.state_name()
    }
}

/// Bring the Stripe gateway up in the background.
///
/// The handle starts `Initializing` and becomes `Ready`, or `NotConfigured`
/// when no secret key is set.
pub fn spawn_stripe_init(config: &StripeConfig) -> ProviderHandle {
    let handle = ProviderHandle::initializing();
    let secret_key = config.secret_key.clone();
    let task_handle = handle.clone();

    tokio::spawn(async move {
        match secret_key {
            Some(key) => {
                let gateway: Arc<dyn PaymentProvider> = Arc::new(StripeGateway::new(&key));
                task_handle.set(Readiness::Ready(gateway)).await;
                tracing::info!("Stripe payment provider ready");
            }
            None => {
                task_handle.set(Readiness::NotConfigured).await;
                tracing::warn!("STRIPE_SECRET_KEY not set - payment and refund creation disabled");
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_round_half_away_from_zero() {
        assert_eq!(to_minor_units(Decimal::new(1999, 2)).unwrap(), 1999);
        assert_eq!(to_minor_units(Decimal::new(40, 0)).unwrap(), 4000);
        assert_eq!(to_minor_units(Decimal::new(10005, 3)).unwrap(), 1001);
        assert_eq!(to_minor_units(Decimal::new(10004, 3)).unwrap(), 1000);
        assert_eq!(to_minor_units(Decimal::new(99_999_999, 2)).unwrap(), 99_999_999);
    }

    #[test]
    fn test_reason_filter() {
        assert!(matches!(
            reason_filter(RefundReason::RequestedByCustomer),
            Some(RefundReasonFilter::RequestedByCustomer)
        ));
        assert!(reason_filter(RefundReason::Other).is_none());
    }

    #[test]
    fn test_wire_name() {
        assert_eq!(
            wire_name(&stripe::PaymentIntentStatus::RequiresPaymentMethod).as_deref(),
            Some("requires_payment_method")
        );
        assert_eq!(wire_name(&Some("succeeded".to_string())).as_deref(), Some("succeeded"));
        assert_eq!(wire_name(&None::<String>), None);
    }

    #[test]
    fn test_config_debug_redacts_secrets() {
        let config = StripeConfig {
            secret_key: Some("sk_test_abc".to_string()),
            webhook_secret: None,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk_test_abc"));
        assert!(rendered.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_handle_states() {
        let handle = ProviderHandle::not_configured();
        assert!(matches!(
            handle.get().await,
            Err(PaymentsError::ProviderUnavailable(_))
        ));
        assert_eq!(handle.state_name().await, "not_configured");

        let initializing = ProviderHandle::initializing();
        assert_eq!(initializing.state_name().await, "initializing");
    }

    #[tokio::test]
    async fn test_init_without_key_ends_not_configured() {
        let handle = spawn_stripe_init(&StripeConfig::default());
        for _ in 0..50 {
            if handle.state_name().await != "initializing" {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.state_name().await, "not_configured");
    }
}
