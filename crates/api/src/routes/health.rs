use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness plus the readiness of optional dependencies
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "payment_provider": state.payments.provider.state_name().await,
        "webhook_verifier": state.payments.webhooks.verifier_state(),
        "rate_limiter": state.rate_limiter.backend_name(),
    }))
}
