//! Payment endpoints

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use saasbill_payments::{NewPaymentRequest, PaymentRefunds, PaymentResponse};
use uuid::Uuid;

use super::{ok, ApiResponse};
use crate::auth::TenantContext;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn create_payment(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    payload: Result<Json<NewPaymentRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<PaymentResponse>>)> {
    let Json(request) = payload?;
    let payment = state
        .payments
        .payments
        .create_payment(ctx.tenant_id, request)
        .await?;

    Ok((StatusCode::CREATED, ok(payment)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<PaymentResponse>>> {
    let payment = state
        .payments
        .payments
        .get_payment(ctx.tenant_id, payment_id)
        .await?;

    Ok(ok(payment))
}

/// Refunds for a payment and the amount still refundable
pub async fn list_refunds(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<PaymentRefunds>>> {
    let refunds = state
        .payments
        .refunds
        .list_refunds(ctx.tenant_id, payment_id)
        .await?;

    Ok(ok(refunds))
}
