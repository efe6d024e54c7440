//! Test fixtures: ledger rows, a scriptable payment provider and signed events

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{
    IntentParams, PaymentProvider, ProviderIntent, ProviderRefund, RefundParams,
};
use crate::error::{PaymentsError, PaymentsResult};
use crate::models::{NewPayment, Payment, PaymentStatus, Refund, RefundStatus};

pub fn payment_fixture(amount: Decimal, status: PaymentStatus) -> Payment {
    let now = OffsetDateTime::now_utc();
    Payment {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        provider_payment_intent_id: format!("pi_{}", Uuid::new_v4().simple()),
        provider_charge_id: None,
        amount,
        currency: "usd".to_string(),
        status,
        invoice_id: None,
        subscription_id: None,
        payment_method_id: None,
        description: None,
        failure_code: None,
        failure_message: None,
        receipt_url: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn refund_fixture(payment: &Payment, amount: Decimal, status: RefundStatus) -> Refund {
    let now = OffsetDateTime::now_utc();
    Refund {
        id: Uuid::new_v4(),
        tenant_id: payment.tenant_id,
        payment_id: payment.id,
        provider_refund_id: None,
        amount,
        currency: payment.currency.clone(),
        status,
        reason: None,
        failure_message: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn new_payment(tenant_id: Uuid, intent_id: &str, amount: Decimal) -> NewPayment {
    NewPayment {
        tenant_id,
        provider_payment_intent_id: intent_id.to_string(),
        amount,
        currency: "usd".to_string(),
        status: PaymentStatus::Pending,
        invoice_id: None,
        subscription_id: None,
        payment_method_id: None,
        description: None,
    }
}

/// Payment provider double that records every call
#[derive(Default)]
pub struct FakeProvider {
    counter: AtomicUsize,
    pub refund_calls: Mutex<Vec<RefundParams>>,
    pub intent_calls: Mutex<Vec<IntentParams>>,
    fail_refunds: bool,
    refund_status: Option<String>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every refund call fails with a provider error.
    pub fn failing_refunds() -> Self {
        Self {
            fail_refunds: true,
            ..Self::default()
        }
    }

    /// Refund calls report `status` instead of `succeeded`.
    pub fn with_refund_status(status: &str) -> Self {
        Self {
            refund_status: Some(status.to_string()),
            ..Self::default()
        }
    }

    pub fn refund_call_count(&self) -> usize {
        self.refund_calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_payment_intent(&self, params: IntentParams) -> PaymentsResult<ProviderIntent> {
        let n = self.next_id();
        self.intent_calls.lock().unwrap().push(params);
        Ok(ProviderIntent {
            id: format!("pi_fake_{}", n),
            status: "requires_payment_method".to_string(),
            client_secret: Some(format!("pi_fake_{}_secret_abc", n)),
        })
    }

    async fn create_refund(&self, params: RefundParams) -> PaymentsResult<ProviderRefund> {
        let n = self.next_id();
        self.refund_calls.lock().unwrap().push(params);
        if self.fail_refunds {
            return Err(PaymentsError::ProviderApi("card_declined".to_string()));
        }
        Ok(ProviderRefund {
            id: format!("re_fake_{}", n),
            status: self
                .refund_status
                .clone()
                .unwrap_or_else(|| "succeeded".to_string()),
        })
    }
}

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// `Stripe-Signature` header value for `payload` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
