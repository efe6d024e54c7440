//! HTTP routes

mod health;
mod notifications;
mod payments;
mod refunds;
mod webhooks;

#[cfg(test)]
mod route_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::auth::require_auth;
use crate::rate_limit::rate_limit;
use crate::state::AppState;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

pub fn create_router(state: AppState) -> Router {
    // Layers run bottom-up: authenticate first, then count against the tenant.
    let tenant_routes = Router::new()
        .route("/v1/payments", post(payments::create_payment))
        .route("/v1/payments/{id}", get(payments::get_payment))
        .route("/v1/payments/{id}/refunds", get(payments::list_refunds))
        .route("/v1/refunds", post(refunds::create_refund))
        .route("/v1/notifications", post(notifications::send_notification))
        .route("/v1/notifications/webhooks", post(notifications::send_webhook))
        .route(
            "/v1/notifications/webhooks/retry",
            post(notifications::send_webhook_with_retry),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(tenant_routes)
        .with_state(state)
}
