//! Payment creation and lookup

use std::collections::HashMap;
use std::sync::Arc;

use saasbill_shared::{is_supported_currency, validate_amount, ValidationErrors};
use uuid::Uuid;

use crate::client::{to_minor_units, IntentParams, ProviderHandle};
use crate::error::PaymentsResult;
use crate::ledger::{payment_not_found, Ledger};
use crate::models::{NewPayment, NewPaymentRequest, PaymentResponse, PaymentStatus};

const MAX_DESCRIPTION_LEN: usize = 1000;

#[derive(Clone)]
pub struct PaymentService {
    ledger: Arc<dyn Ledger>,
    provider: ProviderHandle,
}

impl PaymentService {
    pub fn new(ledger: Arc<dyn Ledger>, provider: ProviderHandle) -> Self {
        Self { ledger, provider }
    }

    /// Create a provider payment intent and record it as a local payment.
    ///
    /// The intent carries the tenant id in its metadata; reconciliation keys
    /// on it when the provider reports back.
    pub async fn create_payment(
        &self,
        tenant_id: Uuid,
        request: NewPaymentRequest,
    ) -> PaymentsResult<PaymentResponse> {
        let currency = request.currency.trim().to_ascii_lowercase();
        validate_request(&request, &currency)?;

        let provider = self.provider.get().await?;

        let mut metadata = HashMap::new();
        metadata.insert("tenant_id".to_string(), tenant_id.to_string());
        if let Some(invoice_id) = request.invoice_id {
            metadata.insert("invoice_id".to_string(), invoice_id.to_string());
        }
        if let Some(subscription_id) = request.subscription_id {
            metadata.insert("subscription_id".to_string(), subscription_id.to_string());
        }

        let intent = provider
            .create_payment_intent(IntentParams {
                amount_minor: to_minor_units(request.amount)?,
                currency: currency.clone(),
                description: request.description.clone(),
                payment_method_id: request.payment_method_id.clone(),
                metadata,
            })
            .await?;

        let payment = self
            .ledger
            .insert_payment(NewPayment {
                tenant_id,
                provider_payment_intent_id: intent.id.clone(),
                amount: request.amount,
                currency,
                status: PaymentStatus::from_provider(&intent.status),
                invoice_id: request.invoice_id,
                subscription_id: request.subscription_id,
                payment_method_id: request.payment_method_id,
                description: request.description,
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    tenant_id = %tenant_id,
                    payment_intent_id = %intent.id,
                    error = %e,
                    "Provider intent created but local payment insert failed"
                );
                e
            })?;

        tracing::info!(
            tenant_id = %tenant_id,
            payment_id = %payment.id,
            payment_intent_id = %intent.id,
            status = %payment.status,
            "Payment created"
        );

        Ok(PaymentResponse::from_payment(payment, intent.client_secret))
    }

    pub async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentsResult<PaymentResponse> {
        self.ledger
            .find_payment(tenant_id, payment_id)
            .await?
            .map(PaymentResponse::from)
            .ok_or_else(|| payment_not_found(payment_id))
    }
}

fn validate_request(request: &NewPaymentRequest, currency: &str) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if let Err(msg) = validate_amount(request.amount) {
        errors.add("amount", msg);
    }
    if !is_supported_currency(currency) {
        errors.add("currency", "Unsupported currency");
    }
    if let Some(description) = &request.description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            errors.add(
                "description",
                format!("Must be at most {} characters", MAX_DESCRIPTION_LEN),
            );
        }
    }

    errors.into_result()
}
