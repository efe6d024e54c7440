//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use super::jwt::AuthError;
use crate::error::ApiError;
use crate::state::AppState;

/// Tenant on whose behalf the request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub subject: String,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Signing(detail) => ApiError::Internal(detail),
            _ => ApiError::Unauthorized,
        }
    }
}

fn extract_bearer_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?;
    let value = header.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

/// Require a valid tenant JWT and attach a [`TenantContext`] to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    let claims = extract_bearer_token(&request)
        .and_then(|token| state.jwt_manager.verify(token))
        .map_err(|e| {
            tracing::debug!(path = %path, reason = %e, "require_auth: rejected");
            e
        })?;

    tracing::debug!(
        path = %path,
        tenant_id = %claims.tenant_id,
        subject = %claims.sub,
        "require_auth: authenticated"
    );

    request.extensions_mut().insert(TenantContext {
        tenant_id: claims.tenant_id,
        subject: claims.sub,
    });
    Ok(next.run(request).await)
}
