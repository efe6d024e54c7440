// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! saasbill payments
//!
//! Mirrors payment provider state into a tenant-scoped ledger.
//!
//! ## Features
//!
//! - **Payments**: create provider payment intents and record them locally
//! - **Refunds**: reserve-then-submit refunds that can never overspend a payment
//! - **Webhooks**: verify provider signatures, claim each event once, reconcile
//! - **Replay**: failed events keep their payload and can be re-processed
//! - **Invariants**: read-only ledger consistency checks

pub mod client;
pub mod error;
pub mod event_log;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod payment;
pub mod reconciliation;
pub mod refund;
pub mod webhooks;

#[cfg(test)]
mod testing;

// Client
pub use client::{
    spawn_stripe_init, to_minor_units, PaymentProvider, ProviderHandle, StripeConfig,
    StripeGateway,
};

// Error
pub use error::{PaymentsError, PaymentsResult};

// Events
pub use event_log::{
    ClaimOutcome, InMemoryProviderEventLog, PgProviderEventLog, ProcessingResult,
    ProviderEventLog, ProviderEventRecord,
};
pub use events::{EventVerifier, ProviderEvent, StripeSignatureVerifier, VerifiedEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{InMemoryLedger, Ledger, PgLedger};

// Models
pub use models::{
    NewPaymentRequest, Payment, PaymentRefunds, PaymentResponse, PaymentStatus, Refund,
    RefundReason, RefundRequest, RefundResponse, RefundStatus,
};

// Services
pub use payment::PaymentService;
pub use reconciliation::{ReconcileOutcome, Reconciler};
pub use refund::RefundService;
pub use webhooks::{EventReplayResult, WebhookHandler};

use std::sync::Arc;

use saasbill_shared::Readiness;
use sqlx::PgPool;

/// All payment functionality over one ledger and provider
pub struct PaymentsService {
    pub payments: PaymentService,
    pub refunds: RefundService,
    pub webhooks: WebhookHandler,
    pub provider: ProviderHandle,
}

impl PaymentsService {
    /// Create the service from `STRIPE_*` environment variables.
    ///
    /// Must be called inside a tokio runtime; the provider client starts in
    /// the background.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(StripeConfig::from_env(), pool)
    }

    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let provider = spawn_stripe_init(&config);
        let verifier = Readiness::from_option(config.webhook_secret.map(|secret| {
            Arc::new(StripeSignatureVerifier::new(secret)) as Arc<dyn EventVerifier>
        }));
        if !verifier.is_ready() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - provider webhooks will be rejected");
        }

        Self::with_components(
            Arc::new(PgLedger::new(pool.clone())),
            Arc::new(PgProviderEventLog::new(pool)),
            provider,
            verifier,
        )
    }

    /// Assemble from explicit parts.
    pub fn with_components(
        ledger: Arc<dyn Ledger>,
        events: Arc<dyn ProviderEventLog>,
        provider: ProviderHandle,
        verifier: Readiness<Arc<dyn EventVerifier>>,
    ) -> Self {
        Self {
            payments: PaymentService::new(ledger.clone(), provider.clone()),
            refunds: RefundService::new(ledger.clone(), provider.clone()),
            webhooks: WebhookHandler::new(verifier, events, Reconciler::new(ledger)),
            provider,
        }
    }
}
