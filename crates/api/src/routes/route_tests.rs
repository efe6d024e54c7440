//! Router tests over in-memory payments components
//!
//! Tests cover:
//! - tenant authentication and isolation
//! - payment creation, signed provider webhooks and refunds end to end
//! - error envelope and status mapping
//! - rate limiting
//! - outbound webhook endpoints

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use saasbill_notifications::{NotificationDispatcher, WebhookDelivery};
use saasbill_payments::client::{IntentParams, ProviderIntent, ProviderRefund, RefundParams};
use saasbill_payments::{
    EventVerifier, InMemoryLedger, InMemoryProviderEventLog, PaymentProvider, PaymentsResult,
    PaymentsService, ProviderHandle, StripeSignatureVerifier,
};
use saasbill_shared::{DeliveryConfig, RateLimiter, Readiness};
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use crate::auth::JwtManager;
use crate::routes::create_router;
use crate::state::AppState;

const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only";
const WEBHOOK_SECRET: &str = "whsec_route_tests";

#[derive(Default)]
struct StubProvider {
    intents: AtomicUsize,
    refunds: AtomicUsize,
}

#[async_trait]
impl PaymentProvider for StubProvider {
    async fn create_payment_intent(&self, _params: IntentParams) -> PaymentsResult<ProviderIntent> {
        let n = self.intents.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderIntent {
            id: format!("pi_route_{}", n),
            status: "requires_payment_method".to_string(),
            client_secret: Some(format!("pi_route_{}_secret", n)),
        })
    }

    async fn create_refund(&self, _params: RefundParams) -> PaymentsResult<ProviderRefund> {
        let n = self.refunds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderRefund {
            id: format!("re_route_{}", n),
            status: "succeeded".to_string(),
        })
    }
}

struct Harness {
    app: Router,
    jwt: JwtManager,
}

impl Harness {
    fn new() -> Self {
        Self::build(120, ProviderHandle::ready(Arc::new(StubProvider::default())))
    }

    fn build(rate_limit_per_minute: u32, provider: ProviderHandle) -> Self {
        let verifier: Arc<dyn EventVerifier> = Arc::new(StripeSignatureVerifier::new(WEBHOOK_SECRET));
        let payments = PaymentsService::with_components(
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryProviderEventLog::new()),
            provider,
            Readiness::Ready(verifier),
        );
        let delivery = WebhookDelivery::new(DeliveryConfig {
            timeout: Duration::from_millis(500),
            retry_base_delay: Duration::from_millis(5),
            ..DeliveryConfig::default()
        })
        .unwrap();
        let jwt = JwtManager::new(JWT_SECRET);

        let state = AppState::new(
            payments,
            NotificationDispatcher::new(delivery, Readiness::NotConfigured),
            jwt.clone(),
            RateLimiter::in_memory(),
            rate_limit_per_minute,
        );

        Self {
            app: create_router(state),
            jwt,
        }
    }

    fn token(&self, tenant: Uuid) -> String {
        self.jwt
            .issue("user_route_tests", tenant, time::Duration::hours(1))
            .unwrap()
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body, headers)
    }

    async fn get(&self, tenant: Uuid, uri: &str) -> (StatusCode, Value) {
        let request = Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(tenant)))
            .body(Body::empty())
            .unwrap();
        let (status, body, _) = self.call(request).await;
        (status, body)
    }

    async fn post(&self, tenant: Uuid, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(tenant)))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body, _) = self.call(request).await;
        (status, body)
    }

    async fn provider_webhook(&self, body: &str, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::post("/v1/webhooks/stripe");
        if let Some(signature) = signature {
            request = request.header("Stripe-Signature", signature);
        }
        let (status, body, _) = self
            .call(request.body(Body::from(body.to_string())).unwrap())
            .await;
        (status, body)
    }

    async fn create_payment(&self, tenant: Uuid, amount: f64) -> Value {
        let (status, body) = self
            .post(
                tenant,
                "/v1/payments",
                json!({"amount": amount, "currency": "usd", "description": "Pro plan"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"].clone()
    }

    /// Deliver a signed `payment_intent.succeeded` and wait until it is applied.
    async fn settle_payment(&self, tenant: Uuid, payment: &Value) {
        let intent_id = payment["provider_payment_intent_id"].as_str().unwrap();
        let event = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": "payment_intent.succeeded",
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "livemode": false,
            "data": {"object": {
                "id": intent_id,
                "object": "payment_intent",
                "status": "succeeded",
                "latest_charge": "ch_route_1",
                "metadata": {"tenant_id": tenant.to_string()}
            }}
        })
        .to_string();

        let (status, body) = self.provider_webhook(&event, Some(sign(&event))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));

        let uri = format!("/v1/payments/{}", payment["id"].as_str().unwrap());
        for _ in 0..100 {
            let (_, body) = self.get(tenant, &uri).await;
            if body["data"]["status"] == "succeeded" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("payment {} was never reconciled", uri);
    }
}

fn sign(payload: &str) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload.as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

// =============================================================================
// Health and authentication
// =============================================================================

#[tokio::test]
async fn test_health_reports_dependency_state() {
    let harness = Harness::new();
    let (status, body, _) = harness
        .call(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["payment_provider"], "ready");
    assert_eq!(body["webhook_verifier"], "ready");
    assert_eq!(body["rate_limiter"], "memory");
}

#[tokio::test]
async fn test_tenant_routes_require_a_valid_token() {
    let harness = Harness::new();

    let (status, body, _) = harness
        .call(Request::get("/v1/payments/00000000-0000-0000-0000-000000000000").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let forged = JwtManager::new("some-other-secret-0000000000000000")
        .issue("attacker", Uuid::new_v4(), time::Duration::hours(1))
        .unwrap();
    let (status, _, _) = harness
        .call(
            Request::post("/v1/refunds")
                .header(header::AUTHORIZATION, format!("Bearer {}", forged))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"payment_id": Uuid::new_v4()}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Payments and refunds
// =============================================================================

#[tokio::test]
async fn test_create_and_fetch_payment() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();

    let payment = harness.create_payment(tenant, 49.99).await;
    assert_eq!(payment["status"], "pending");
    assert_eq!(payment["amount"], json!(49.99));
    assert_eq!(payment["currency"], "usd");
    assert!(payment["client_secret"].is_string());

    let uri = format!("/v1/payments/{}", payment["id"].as_str().unwrap());
    let (status, body) = harness.get(tenant, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], payment["id"]);
    assert!(body["data"].get("client_secret").is_none());

    let (status, body) = harness.get(Uuid::new_v4(), &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_invalid_payment_returns_field_errors() {
    let harness = Harness::new();
    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/payments",
            json!({"amount": -5, "currency": "xyz"}),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["error"]["fields"]["amount"].is_string());
    assert!(body["error"]["fields"]["currency"].is_string());
}

#[tokio::test]
async fn test_malformed_json_uses_error_envelope() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let request = Request::post("/v1/payments")
        .header(header::AUTHORIZATION, format!("Bearer {}", harness.token(tenant)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"amount\": "))
        .unwrap();

    let (status, body, _) = harness.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unconfigured_provider_is_503() {
    let harness = Harness::build(120, ProviderHandle::not_configured());
    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/payments",
            json!({"amount": 10, "currency": "usd"}),
        )
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_refund_before_settlement_is_unprocessable() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let payment = harness.create_payment(tenant, 20.0).await;

    let (status, body) = harness
        .post(tenant, "/v1/refunds", json!({"payment_id": payment["id"]}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "PAYMENT_NOT_REFUNDABLE");
}

#[tokio::test]
async fn test_webhook_settles_payment_then_refunds_are_bounded() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let payment = harness.create_payment(tenant, 49.99).await;
    harness.settle_payment(tenant, &payment).await;

    let (status, body) = harness
        .post(
            tenant,
            "/v1/refunds",
            json!({"payment_id": payment["id"], "amount": 30, "reason": "requested_by_customer"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["amount"], json!(30.0));

    let (status, body) = harness
        .post(
            tenant,
            "/v1/refunds",
            json!({"payment_id": payment["id"], "amount": 30}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "REFUND_EXCEEDS_AVAILABLE");

    let uri = format!("/v1/payments/{}/refunds", payment["id"].as_str().unwrap());
    let (status, body) = harness.get(tenant, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["refunds"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["available"], json!(19.99));

    // Another tenant cannot see or refund it
    let stranger = Uuid::new_v4();
    let (status, _) = harness.get(stranger, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = harness
        .post(stranger, "/v1/refunds", json!({"payment_id": payment["id"]}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Provider webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_signature_failures_are_rejected() {
    let harness = Harness::new();
    let event = json!({
        "id": "evt_bad_sig",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_x", "status": "succeeded"}}
    })
    .to_string();

    let (status, body) = harness.provider_webhook(&event, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

    let mut tampered = sign(&event);
    tampered.push('0');
    let (status, _) = harness.provider_webhook(&event, Some(tampered)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let signature = sign(&event);
    let reserialized = event.replace("\"id\":\"evt_bad_sig\"", "\"id\": \"evt_bad_sig\"");
    let (status, _) = harness.provider_webhook(&reserialized, Some(signature)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unhandled_event_types_are_acknowledged() {
    let harness = Harness::new();
    let event = json!({
        "id": "evt_customer_created",
        "type": "customer.created",
        "data": {"object": {"id": "cus_1"}}
    })
    .to_string();

    let (status, body) = harness.provider_webhook(&event, Some(sign(&event))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_is_per_tenant() {
    let harness = Harness::build(2, ProviderHandle::ready(Arc::new(StubProvider::default())));
    let tenant = Uuid::new_v4();
    let uri = format!("/v1/payments/{}", Uuid::new_v4());

    for _ in 0..2 {
        let (status, _) = harness.get(tenant, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let request = Request::get(&uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", harness.token(tenant)))
        .body(Body::empty())
        .unwrap();
    let (status, body, headers) = harness.call(request).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert!(headers.contains_key(header::RETRY_AFTER));

    let (status, _) = harness.get(Uuid::new_v4(), &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Outbound notifications
// =============================================================================

#[tokio::test]
async fn test_send_webhook_reports_delivery_result() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hooks/in")
        .with_status(200)
        .with_body(r#"{"received":1}"#)
        .expect(1)
        .create_async()
        .await;

    let harness = Harness::new();
    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/notifications/webhooks",
            json!({"url": format!("{}/hooks/in", server.url()), "body": {"event": "invoice.paid"}}),
        )
        .await;

    mock.assert_async().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["success"], true);
    assert_eq!(body["data"]["statusCode"], 200);
    assert_eq!(body["data"]["response"], json!({"received": 1}));
}

#[tokio::test]
async fn test_send_webhook_with_retry_stops_on_client_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hooks/in")
        .with_status(422)
        .expect(1)
        .create_async()
        .await;

    let harness = Harness::new();
    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/notifications/webhooks/retry",
            json!({"url": format!("{}/hooks/in", server.url()), "body": {}, "max_retries": 5}),
        )
        .await;

    mock.assert_async().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["success"], false);
    assert_eq!(body["data"]["statusCode"], 422);
    assert_eq!(body["data"]["attempts"], 1);
}

#[tokio::test]
async fn test_send_webhook_validates_request() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();

    let (status, body) = harness
        .post(
            tenant,
            "/v1/notifications/webhooks",
            json!({"url": "ftp://example.com/hook", "body": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["fields"]["url"].is_string());

    let (status, body) = harness
        .post(
            tenant,
            "/v1/notifications/webhooks/retry",
            json!({"url": "https://example.com/hook", "body": {}, "max_retries": 50}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["fields"]["max_retries"].is_string());
}

#[tokio::test]
async fn test_send_webhook_without_body_is_rejected() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();

    for uri in ["/v1/notifications/webhooks", "/v1/notifications/webhooks/retry"] {
        let (status, body) = harness
            .post(tenant, uri, json!({"url": "https://example.com/hook"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }
}

#[tokio::test]
async fn test_email_without_transport_is_503() {
    let harness = Harness::new();
    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/notifications",
            json!({
                "channel": "email",
                "to": "billing@example.com",
                "subject": "Receipt",
                "body": "Thanks!"
            }),
        )
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);

    let (status, body) = harness
        .post(
            Uuid::new_v4(),
            "/v1/notifications",
            json!({"channel": "sms", "to": "12", "message": "hi"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["fields"]["to"].is_string());
}
