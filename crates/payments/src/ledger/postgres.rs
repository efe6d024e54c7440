use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    payment_not_found, plan_refund, refund_not_found, Ledger, PaymentUpdate, RefundReservation,
    ReservedRefund,
};
use crate::error::{PaymentsError, PaymentsResult};
use crate::models::{NewPayment, Payment, PaymentStatusUpdate, Refund, RefundStatus};

/// Row type for the payments table
#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    tenant_id: Uuid,
    provider_payment_intent_id: String,
    provider_charge_id: Option<String>,
    amount: Decimal,
    currency: String,
    status: String,
    invoice_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    payment_method_id: Option<String>,
    description: Option<String>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    receipt_url: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = PaymentsError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            tenant_id: row.tenant_id,
            provider_payment_intent_id: row.provider_payment_intent_id,
            provider_charge_id: row.provider_charge_id,
            amount: row.amount,
            currency: row.currency.trim().to_string(),
            status: row.status.parse().map_err(PaymentsError::Internal)?,
            invoice_id: row.invoice_id,
            subscription_id: row.subscription_id,
            payment_method_id: row.payment_method_id,
            description: row.description,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            receipt_url: row.receipt_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for the refunds table
#[derive(Debug, sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    tenant_id: Uuid,
    payment_id: Uuid,
    provider_refund_id: Option<String>,
    amount: Decimal,
    currency: String,
    status: String,
    reason: Option<String>,
    failure_message: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<RefundRow> for Refund {
    type Error = PaymentsError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            tenant_id: row.tenant_id,
            payment_id: row.payment_id,
            provider_refund_id: row.provider_refund_id,
            amount: row.amount,
            currency: row.currency.trim().to_string(),
            status: row.status.parse().map_err(PaymentsError::Internal)?,
            reason: row
                .reason
                .map(|r| r.parse())
                .transpose()
                .map_err(PaymentsError::Internal)?,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn refunds_from_rows(rows: Vec<RefundRow>) -> PaymentsResult<Vec<Refund>> {
    rows.into_iter().map(Refund::try_from).collect()
}

/// Ledger backed by Postgres
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_payment(&self, new: NewPayment) -> PaymentsResult<Payment> {
        let row: PaymentRow = sqlx::query_as(
            r#"
            INSERT INTO payments (
                id, tenant_id, provider_payment_intent_id, amount, currency, status,
                invoice_id, subscription_id, payment_method_id, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, tenant_id, provider_payment_intent_id, provider_charge_id,
                      amount, currency, status, invoice_id, subscription_id,
                      payment_method_id, description, failure_code, failure_message,
                      receipt_url, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(&new.provider_payment_intent_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.status.as_str())
        .bind(new.invoice_id)
        .bind(new.subscription_id)
        .bind(&new.payment_method_id)
        .bind(&new.description)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> PaymentsResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, provider_payment_intent_id, provider_charge_id,
                   amount, currency, status, invoice_id, subscription_id,
                   payment_method_id, description, failure_code, failure_message,
                   receipt_url, created_at, updated_at
            FROM payments
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(payment_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_intent(
        &self,
        tenant_id: Uuid,
        provider_payment_intent_id: &str,
    ) -> PaymentsResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, provider_payment_intent_id, provider_charge_id,
                   amount, currency, status, invoice_id, subscription_id,
                   payment_method_id, description, failure_code, failure_message,
                   receipt_url, created_at, updated_at
            FROM payments
            WHERE tenant_id = $1 AND provider_payment_intent_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(provider_payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn update_payment_status(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        update: &PaymentStatusUpdate,
    ) -> PaymentsResult<PaymentUpdate> {
        let mut tx = self.pool.begin().await?;

        let current: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, provider_payment_intent_id, provider_charge_id,
                   amount, currency, status, invoice_id, subscription_id,
                   payment_method_id, description, failure_code, failure_message,
                   receipt_url, created_at, updated_at
            FROM payments
            WHERE id = $1 AND tenant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(payment_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current: Payment = current
            .ok_or_else(|| payment_not_found(payment_id))?
            .try_into()?;

        let Some(next) = current.apply_update(update) else {
            tx.commit().await?;
            return Ok(PaymentUpdate::Unchanged(current));
        };

        let row: PaymentRow = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = $3,
                provider_charge_id = $4,
                receipt_url = $5,
                failure_code = $6,
                failure_message = $7,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, provider_payment_intent_id, provider_charge_id,
                      amount, currency, status, invoice_id, subscription_id,
                      payment_method_id, description, failure_code, failure_message,
                      receipt_url, created_at, updated_at
            "#,
        )
        .bind(payment_id)
        .bind(tenant_id)
        .bind(next.status.as_str())
        .bind(&next.provider_charge_id)
        .bind(&next.receipt_url)
        .bind(&next.failure_code)
        .bind(&next.failure_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PaymentUpdate::Changed {
            previous: current.status,
            payment: row.try_into()?,
        })
    }

    async fn list_refunds(&self, tenant_id: Uuid, payment_id: Uuid) -> PaymentsResult<Vec<Refund>> {
        let rows: Vec<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, payment_id, provider_refund_id, amount, currency,
                   status, reason, failure_message, created_at, updated_at
            FROM refunds
            WHERE tenant_id = $1 AND payment_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        refunds_from_rows(rows)
    }

    async fn find_refund(&self, tenant_id: Uuid, refund_id: Uuid) -> PaymentsResult<Option<Refund>> {
        let row: Option<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, payment_id, provider_refund_id, amount, currency,
                   status, reason, failure_message, created_at, updated_at
            FROM refunds
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(refund_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Refund::try_from).transpose()
    }

    async fn find_refund_by_provider_id(
        &self,
        tenant_id: Uuid,
        provider_refund_id: &str,
    ) -> PaymentsResult<Option<Refund>> {
        let row: Option<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, payment_id, provider_refund_id, amount, currency,
                   status, reason, failure_message, created_at, updated_at
            FROM refunds
            WHERE tenant_id = $1 AND provider_refund_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(provider_refund_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Refund::try_from).transpose()
    }

    async fn reserve_refund(
        &self,
        reservation: RefundReservation,
    ) -> PaymentsResult<ReservedRefund> {
        let mut tx = self.pool.begin().await?;

        // Lock the payment row; concurrent reservations queue here.
        let payment: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, provider_payment_intent_id, provider_charge_id,
                   amount, currency, status, invoice_id, subscription_id,
                   payment_method_id, description, failure_code, failure_message,
                   receipt_url, created_at, updated_at
            FROM payments
            WHERE id = $1 AND tenant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(reservation.payment_id)
        .bind(reservation.tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let payment: Payment = payment
            .ok_or_else(|| payment_not_found(reservation.payment_id))?
            .try_into()?;

        let existing: Vec<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, payment_id, provider_refund_id, amount, currency,
                   status, reason, failure_message, created_at, updated_at
            FROM refunds
            WHERE tenant_id = $1 AND payment_id = $2
            "#,
        )
        .bind(payment.tenant_id)
        .bind(payment.id)
        .fetch_all(&mut *tx)
        .await?;

        let amount = plan_refund(&payment, &refunds_from_rows(existing)?, reservation.amount)?;

        let row: RefundRow = sqlx::query_as(
            r#"
            INSERT INTO refunds (id, tenant_id, payment_id, amount, currency, status, reason)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING id, tenant_id, payment_id, provider_refund_id, amount, currency,
                      status, reason, failure_message, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.tenant_id)
        .bind(payment.id)
        .bind(amount)
        .bind(&payment.currency)
        .bind(reservation.reason.map(|r| r.as_str()))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReservedRefund {
            refund: row.try_into()?,
            payment,
        })
    }

    async fn attach_provider_refund(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        provider_refund_id: &str,
        status: RefundStatus,
    ) -> PaymentsResult<Refund> {
        let row: Option<RefundRow> = sqlx::query_as(
            r#"
            UPDATE refunds
            SET provider_refund_id = $3,
                status = $4,
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND provider_refund_id IS NULL
            RETURNING id, tenant_id, payment_id, provider_refund_id, amount, currency,
                      status, reason, failure_message, created_at, updated_at
            "#,
        )
        .bind(refund_id)
        .bind(tenant_id)
        .bind(provider_refund_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            // Already attached, usually by a provider event that won the race.
            None => self
                .find_refund(tenant_id, refund_id)
                .await?
                .ok_or_else(|| refund_not_found(refund_id)),
        }
    }

    async fn set_refund_status(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        status: RefundStatus,
        failure_message: Option<&str>,
    ) -> PaymentsResult<Option<Refund>> {
        let row: Option<RefundRow> = sqlx::query_as(
            r#"
            UPDATE refunds
            SET status = $3,
                failure_message = COALESCE($4, failure_message),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status <> $3
            RETURNING id, tenant_id, payment_id, provider_refund_id, amount, currency,
                      status, reason, failure_message, created_at, updated_at
            "#,
        )
        .bind(refund_id)
        .bind(tenant_id)
        .bind(status.as_str())
        .bind(failure_message)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(row.try_into()?));
        }

        // Distinguish "already in that status" from "no such refund".
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM refunds WHERE id = $1 AND tenant_id = $2")
                .bind(refund_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Ok(None),
            None => Err(refund_not_found(refund_id)),
        }
    }
}
