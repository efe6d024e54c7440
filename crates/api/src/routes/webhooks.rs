//! Inbound payment provider webhooks

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify the signature over the raw body, acknowledge, then reconcile in the
/// background so slow processing never triggers provider retries.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Provider webhook missing signature header");
            ApiError::InvalidSignature
        })?;

    let event = state.payments.webhooks.verify_event(&body, signature)?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Provider webhook accepted"
    );

    let payments = state.payments.clone();
    tokio::spawn(async move {
        let event_id = event.id.clone();
        if let Err(e) = payments.webhooks.handle_event(event).await {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Provider event processing failed"
            );
        }
    });

    Ok(Json(json!({ "received": true })))
}
