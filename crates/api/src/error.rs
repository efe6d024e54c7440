//! API error type and its JSON envelope

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use saasbill_notifications::NotificationError;
use saasbill_payments::PaymentsError;
use saasbill_shared::ValidationErrors;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{message}")]
    Unprocessable { code: &'static str, message: String },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) | ApiError::InvalidSignature => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Unprocessable { code, .. } => *code,
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return to the caller
    fn public_message(&self) -> String {
        match self {
            ApiError::Upstream(_) => "Payment provider request failed".to_string(),
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ApiError::Upstream(detail) => {
                tracing::error!(error = %detail, "Upstream provider error");
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
            }
            _ => {}
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.public_message(),
        });
        if let ApiError::Validation(errors) = &self {
            error["fields"] = json!(errors.fields());
        }

        let mut response = (status, Json(json!({ "success": false, "error": error }))).into_response();
        if let ApiError::RateLimited {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<PaymentsError> for ApiError {
    fn from(err: PaymentsError) -> Self {
        match err {
            PaymentsError::Validation(errors) => ApiError::Validation(errors),
            PaymentsError::NotFound(what) => ApiError::NotFound(what),
            e @ PaymentsError::RefundExceedsAvailable { .. } => ApiError::Unprocessable {
                code: e.code(),
                message: e.to_string(),
            },
            e @ PaymentsError::PaymentNotRefundable(_) => ApiError::Unprocessable {
                code: e.code(),
                message: e.to_string(),
            },
            PaymentsError::ProviderUnavailable(reason) => {
                ApiError::ServiceUnavailable(format!("Payment provider unavailable: {}", reason))
            }
            PaymentsError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            PaymentsError::WebhookPayloadInvalid(msg) => ApiError::BadRequest(msg),
            PaymentsError::ProviderApi(msg) => ApiError::Upstream(msg),
            PaymentsError::Database(msg) | PaymentsError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<NotificationError> for ApiError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::Validation(errors) => ApiError::Validation(errors),
            NotificationError::ChannelUnavailable(reason) => {
                ApiError::ServiceUnavailable(format!("Notification channel unavailable: {}", reason))
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use saasbill_shared::Unavailable;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_payments_error_status_mapping() {
        let cases = [
            (
                PaymentsError::Validation(ValidationErrors::field("amount", "bad")),
                StatusCode::BAD_REQUEST,
            ),
            (PaymentsError::NotFound("Payment x".into()), StatusCode::NOT_FOUND),
            (
                PaymentsError::RefundExceedsAvailable {
                    requested: Decimal::new(4100, 2),
                    available: Decimal::new(4000, 2),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                PaymentsError::PaymentNotRefundable("pending".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                PaymentsError::ProviderUnavailable(Unavailable::Initializing),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (PaymentsError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (PaymentsError::ProviderApi("card_declined".into()), StatusCode::BAD_GATEWAY),
            (
                PaymentsError::Database("connection reset".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_validation_envelope_includes_fields() {
        let mut errors = ValidationErrors::new();
        errors.add("amount", "must be greater than zero");
        errors.add("currency", "Unsupported currency");

        let response = ApiError::Validation(errors).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["fields"]["amount"], "must be greater than zero");
        assert_eq!(body["error"]["fields"]["currency"], "Unsupported currency");
    }

    #[tokio::test]
    async fn test_internal_details_never_returned() {
        let response = ApiError::from(PaymentsError::Database(
            "relation \"payments\" does not exist".into(),
        ))
        .into_response();
        let body = body_json(response).await;

        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(!body.to_string().contains("relation"));
    }

    #[tokio::test]
    async fn test_exceeds_available_keeps_exact_amounts() {
        let response = ApiError::from(PaymentsError::RefundExceedsAvailable {
            requested: Decimal::new(4100, 2),
            available: Decimal::new(4000, 2),
        })
        .into_response();
        let body = body_json(response).await;

        assert_eq!(body["error"]["code"], "REFUND_EXCEEDS_AVAILABLE");
        assert_eq!(
            body["error"]["message"],
            "Refund amount 41.00 exceeds available amount 40.00"
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 17,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
    }
}
