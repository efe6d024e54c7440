//! Per-tenant rate limiting middleware

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

use crate::auth::TenantContext;
use crate::error::ApiError;
use crate::state::AppState;

/// Must run after `require_auth`. Backend errors fail open.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(tenant_id) = request
        .extensions()
        .get::<TenantContext>()
        .map(|ctx| ctx.tenant_id)
    else {
        return Err(ApiError::Unauthorized);
    };
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let limit = state.rate_limit_per_minute;
    let decision = match state.rate_limiter.check_tenant(tenant_id, &route, limit).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(
                tenant_id = %tenant_id,
                route = %route,
                error = %e,
                "Rate limiter backend failed, allowing request"
            );
            saasbill_shared::RateLimitResult::fail_open(limit)
        }
    };

    if !decision.allowed {
        tracing::info!(
            tenant_id = %tenant_id,
            route = %route,
            retry_after = decision.retry_after_seconds,
            "Rate limit exceeded"
        );
        return Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        });
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    Ok(response)
}
