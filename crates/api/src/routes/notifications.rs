//! Outbound notification endpoints

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{Extension, Json};
use saasbill_notifications::{
    is_valid_url, sanitize_url, DeliveryResult, DispatchOutcome, Notification, RetriedDelivery,
    WebhookTarget,
};
use saasbill_shared::ValidationErrors;
use serde::Deserialize;

use super::{ok, ApiResponse};
use crate::auth::TenantContext;
use crate::error::ApiResult;
use crate::state::AppState;

/// Upper bound on caller-requested retries
const MAX_REQUESTED_RETRIES: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct RetryWebhookRequest {
    #[serde(flatten)]
    pub target: WebhookTarget,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn validate_target(target: &WebhookTarget) -> Result<(), ValidationErrors> {
    if is_valid_url(&target.url) {
        Ok(())
    } else {
        Err(ValidationErrors::field("url", "Must be an http or https URL"))
    }
}

/// Single delivery attempt
pub async fn send_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    payload: Result<Json<WebhookTarget>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<DeliveryResult>>> {
    let Json(target) = payload?;
    validate_target(&target)?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        url = %sanitize_url(&target.url),
        "Sending webhook"
    );
    let result = state.notifications.webhooks().send_once(&target).await;

    Ok(ok(result))
}

pub async fn send_webhook_with_retry(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    payload: Result<Json<RetryWebhookRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<RetriedDelivery>>> {
    let Json(request) = payload?;
    validate_target(&request.target)?;
    if request.max_retries.is_some_and(|n| n > MAX_REQUESTED_RETRIES) {
        return Err(ValidationErrors::field(
            "max_retries",
            format!("Must be at most {}", MAX_REQUESTED_RETRIES),
        )
        .into());
    }

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        url = %sanitize_url(&request.target.url),
        max_retries = ?request.max_retries,
        "Sending webhook with retry"
    );
    let retried = state
        .notifications
        .webhooks()
        .send_with_retry(&request.target, request.max_retries)
        .await;

    Ok(ok(retried))
}

/// Typed notification on any channel
pub async fn send_notification(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    payload: Result<Json<Notification>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<DispatchOutcome>>> {
    let Json(notification) = payload?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        channel = notification.channel(),
        "Dispatching notification"
    );
    let outcome = state.notifications.dispatch(notification).await?;

    Ok(ok(outcome))
}
