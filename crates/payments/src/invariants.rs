//! Ledger invariants
//!
//! Read-only consistency checks over payments and refunds. They run on a
//! schedule and after event replays; a violation carries enough context to
//! find the rows involved.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentsError, PaymentsResult};

/// Pending refunds without a provider id older than this are flagged.
pub const STALE_RESERVATION_MINUTES: i32 = 60;

const CHECKS: [&str; 4] = [
    "refunds_within_payment_amount",
    "refunds_only_on_succeeded_payments",
    "succeeded_payment_has_charge",
    "stale_pending_refunds",
];

/// One failed ledger invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Name of the check that failed
    pub invariant: String,
    /// Tenants whose ledger rows are involved
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Offending ids and amounts
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may have been refunded twice
    Critical,
    /// Ledger state contradicts itself
    High,
    /// Worth investigating
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Outcome of one full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the run started
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    /// Number of checks executed
    pub checks_run: usize,
    /// Checks that found nothing
    pub checks_passed: usize,
    /// Checks that reported at least one violation
    pub checks_failed: usize,
    /// Every violation found, across all checks
    pub violations: Vec<InvariantViolation>,
    /// `true` when no check failed
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OverRefundedRow {
    payment_id: Uuid,
    tenant_id: Uuid,
    amount: Decimal,
    held: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundOnUnsettledRow {
    refund_id: Uuid,
    payment_id: Uuid,
    tenant_id: Uuid,
    payment_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingChargeRow {
    payment_id: Uuid,
    tenant_id: Uuid,
    provider_payment_intent_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleReservationRow {
    refund_id: Uuid,
    payment_id: Uuid,
    tenant_id: Uuid,
    amount: Decimal,
    created_at: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> PaymentsResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_refunds_within_payment_amount().await?);
        violations.extend(self.check_refunds_only_on_succeeded_payments().await?);
        violations.extend(self.check_succeeded_payment_has_charge().await?);
        violations.extend(self.check_stale_pending_refunds().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            CHECKS.len(),
            violations,
        ))
    }

    /// Pending and succeeded refunds never exceed the payment amount.
    async fn check_refunds_within_payment_amount(&self) -> PaymentsResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRefundedRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.tenant_id, p.amount, SUM(r.amount) AS held
            FROM payments p
            JOIN refunds r ON r.payment_id = p.id AND r.tenant_id = p.tenant_id
            WHERE r.status IN ('pending', 'succeeded')
            GROUP BY p.id, p.tenant_id, p.amount
            HAVING SUM(r.amount) > p.amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_within_payment_amount".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Payment {} has {} refunded or held against an amount of {}",
                    row.payment_id, row.held, row.amount
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "amount": row.amount.to_string(),
                    "held": row.held.to_string(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_refunds_only_on_succeeded_payments(
        &self,
    ) -> PaymentsResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundOnUnsettledRow> = sqlx::query_as(
            r#"
            SELECT r.id AS refund_id, p.id AS payment_id, p.tenant_id, p.status AS payment_status
            FROM refunds r
            JOIN payments p ON p.id = r.payment_id AND p.tenant_id = r.tenant_id
            WHERE r.status = 'succeeded'
              AND p.status <> 'succeeded'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_only_on_succeeded_payments".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Refund {} succeeded against payment {} in status '{}'",
                    row.refund_id, row.payment_id, row.payment_status
                ),
                context: serde_json::json!({
                    "refund_id": row.refund_id,
                    "payment_id": row.payment_id,
                    "payment_status": row.payment_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_succeeded_payment_has_charge(&self) -> PaymentsResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingChargeRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, tenant_id, provider_payment_intent_id
            FROM payments
            WHERE status = 'succeeded'
              AND provider_charge_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "succeeded_payment_has_charge".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Succeeded payment {} (intent {}) has no provider charge id",
                    row.payment_id, row.provider_payment_intent_id
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "provider_payment_intent_id": row.provider_payment_intent_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Reservations the provider never acknowledged still hold their amount.
    async fn check_stale_pending_refunds(&self) -> PaymentsResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleReservationRow> = sqlx::query_as(
            r#"
            SELECT id AS refund_id, payment_id, tenant_id, amount, created_at
            FROM refunds
            WHERE status = 'pending'
              AND provider_refund_id IS NULL
              AND created_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(STALE_RESERVATION_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_pending_refunds".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Refund reservation {} for {} has had no provider id since {}",
                    row.refund_id, row.amount, row.created_at
                ),
                context: serde_json::json!({
                    "refund_id": row.refund_id,
                    "payment_id": row.payment_id,
                    "amount": row.amount.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> PaymentsResult<Vec<InvariantViolation>> {
        match name {
            "refunds_within_payment_amount" => self.check_refunds_within_payment_amount().await,
            "refunds_only_on_succeeded_payments" => {
                self.check_refunds_only_on_succeeded_payments().await
            }
            "succeeded_payment_has_charge" => self.check_succeeded_payment_has_charge().await,
            "stale_pending_refunds" => self.check_stale_pending_refunds().await,
            other => Err(PaymentsError::NotFound(format!("Invariant check '{}'", other))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
