use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use saasbill_payments::{RefundRequest, RefundResponse};

use super::{ok, ApiResponse};
use crate::auth::TenantContext;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn create_refund(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<RefundResponse>>)> {
    let Json(request) = payload?;
    let refund = state
        .payments
        .refunds
        .create_refund(ctx.tenant_id, request.payment_id, request.amount, request.reason)
        .await?;

    Ok((StatusCode::CREATED, ok(refund)))
}
