//! Outbound webhook delivery engine
//!
//! Sends a JSON body to a third-party URL and reports what happened as data.
//! Network failures, timeouts and bad URLs never surface as `Err`; they are
//! classified into [`DeliveryFailure`] on the returned [`DeliveryResult`].
//!
//! Retries follow a fixed policy: stop on a 2xx, stop on a 4xx (client errors
//! are not transient), stop on an invalid URL, otherwise retry up to
//! `max_retries` more times with exponential backoff between attempts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use saasbill_shared::{is_valid_http_url, next_delay, ConfigError, DeliveryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

/// Request headers callers may not set
const DISALLOWED_HEADERS: [&str; 3] = ["host", "connection", "transfer-encoding"];

/// Longest non-JSON response body kept in a result
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[serde(alias = "get")]
    Get,
    #[default]
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl From<WebhookMethod> for reqwest::Method {
    fn from(method: WebhookMethod) -> Self {
        match method {
            WebhookMethod::Get => reqwest::Method::GET,
            WebhookMethod::Post => reqwest::Method::POST,
            WebhookMethod::Put => reqwest::Method::PUT,
            WebhookMethod::Patch => reqwest::Method::PATCH,
            WebhookMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Where and what to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Sent as JSON; required, an explicit `null` is allowed
    pub body: Value,
}

impl WebhookTarget {
    /// POST `body` to `url` with default headers.
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: WebhookMethod::Post,
            headers: HashMap::new(),
            body,
        }
    }
}

/// Why a delivery attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// Rejected before any network call
    InvalidUrl,
    Timeout,
    /// DNS failure or connection refused
    Connect,
    /// Redirect limit exceeded
    Redirect,
    /// Any other transport error
    Request,
    /// A response arrived with a non-2xx status
    HttpStatus,
}

impl DeliveryFailure {
    fn is_retryable(self) -> bool {
        !matches!(self, DeliveryFailure::InvalidUrl)
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DeliveryFailure>,
}

impl DeliveryResult {
    fn failed(failure: DeliveryFailure, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            response: None,
            error: Some(error.into()),
            failure: Some(failure),
        }
    }

    fn received(status: u16, response: Option<Value>) -> Self {
        let success = (200..300).contains(&status);
        Self {
            success,
            status_code: Some(status),
            response,
            error: None,
            failure: (!success).then_some(DeliveryFailure::HttpStatus),
        }
    }

    /// Whether another attempt could change the outcome.
    fn is_retryable(&self) -> bool {
        if self.success {
            return false;
        }
        if let Some(status) = self.status_code {
            return !(400..500).contains(&status);
        }
        self.failure.map_or(true, DeliveryFailure::is_retryable)
    }
}

/// Last attempt's result plus the number of attempts made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetriedDelivery {
    #[serde(flatten)]
    pub result: DeliveryResult,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Webhook sender bound to one [`DeliveryConfig`]
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    config: DeliveryConfig,
}

impl WebhookDelivery {
    pub fn new(config: DeliveryConfig) -> Result<Self, DeliveryError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Make a single delivery attempt.
    pub async fn send_once(&self, target: &WebhookTarget) -> DeliveryResult {
        let safe_url = sanitize_url(&target.url);

        if !is_valid_url(&target.url) {
            tracing::warn!(url = %safe_url, "Rejected webhook target: URL must be http or https");
            return DeliveryResult::failed(
                DeliveryFailure::InvalidUrl,
                "URL must use the http or https scheme",
            );
        }

        let body = match serde_json::to_vec(&target.body) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryResult::failed(
                    DeliveryFailure::Request,
                    format!("Failed to serialize body: {}", e),
                )
            }
        };

        let started = Instant::now();
        let sent = self
            .client
            .request(target.method.into(), target.url.as_str())
            .headers(merge_headers(&self.config.user_agent, &target.headers))
            .body(body)
            .send()
            .await;

        match sent {
            Ok(response) => {
                let status = response.status().as_u16();
                let payload = read_payload(response).await;
                let result = DeliveryResult::received(status, payload);

                tracing::debug!(
                    url = %safe_url,
                    method = ?target.method,
                    status = status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Webhook delivered"
                );
                result
            }
            Err(e) => {
                let failure = classify(&e);
                let e = e.without_url();

                tracing::warn!(
                    url = %safe_url,
                    failure = ?failure,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Webhook delivery got no response"
                );
                DeliveryResult::failed(failure, e.to_string())
            }
        }
    }

    /// Deliver with retries; `max_retries` defaults to the configured value.
    pub async fn send_with_retry(
        &self,
        target: &WebhookTarget,
        max_retries: Option<u32>,
    ) -> RetriedDelivery {
        let (_keep_open, shutdown) = watch::channel(false);
        self.send_with_retry_until(
            target,
            max_retries.unwrap_or(self.config.max_retries),
            shutdown,
        )
        .await
    }

    /// Deliver with retries, giving up early once `shutdown` turns true.
    ///
    /// Shutdown is only observed between attempts; an in-flight attempt runs
    /// to completion or timeout.
    pub async fn send_with_retry_until(
        &self,
        target: &WebhookTarget,
        max_retries: u32,
        mut shutdown: watch::Receiver<bool>,
    ) -> RetriedDelivery {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let result = self.send_once(target).await;

            if !result.is_retryable() || attempts > max_retries {
                if !result.success && attempts > 1 {
                    tracing::warn!(
                        url = %sanitize_url(&target.url),
                        attempts = attempts,
                        status = ?result.status_code,
                        "Webhook delivery gave up"
                    );
                }
                return RetriedDelivery { result, attempts };
            }

            let delay = next_delay(
                attempts - 1,
                self.config.retry_base_delay,
                self.config.retry_multiplier,
            );
            tracing::info!(
                url = %sanitize_url(&target.url),
                attempt = attempts,
                status = ?result.status_code,
                failure = ?result.failure,
                delay_ms = delay.as_millis() as u64,
                "Webhook delivery failed, retrying"
            );

            if sleep_or_shutdown(delay, &mut shutdown).await {
                tracing::info!(
                    url = %sanitize_url(&target.url),
                    attempts = attempts,
                    "Shutdown requested, abandoning webhook retries"
                );
                return RetriedDelivery { result, attempts };
            }
        }
    }
}

/// Strip the query string, fragment and password for logging and display.
///
/// Unparseable input is returned unchanged. Applying it twice gives the same
/// result as applying it once.
pub fn sanitize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Only `http` and `https` URLs with a host are deliverable.
pub fn is_valid_url(raw: &str) -> bool {
    is_valid_http_url(raw)
}

/// Defaults first, then caller headers over them, minus the disallowed ones.
fn merge_headers(user_agent: &str, custom: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }

    for (name, value) in custom {
        let Ok(header_name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            tracing::warn!(header = %name, "Dropping webhook header with invalid name");
            continue;
        };
        if DISALLOWED_HEADERS.contains(&header_name.as_str()) {
            tracing::warn!(header = %header_name, "Dropping disallowed webhook header");
            continue;
        }
        let Ok(header_value) = HeaderValue::from_str(value) else {
            tracing::warn!(header = %header_name, "Dropping webhook header with invalid value");
            continue;
        };
        headers.insert(header_name, header_value);
    }

    headers
}

fn classify(error: &reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        DeliveryFailure::Timeout
    } else if error.is_redirect() {
        DeliveryFailure::Redirect
    } else if error.is_connect() {
        DeliveryFailure::Connect
    } else {
        DeliveryFailure::Request
    }
}

async fn read_payload(response: reqwest::Response) -> Option<Value> {
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e.without_url(), "Failed to read webhook response body");
            return None;
        }
    };

    if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
        return Some(json);
    }

    let end = bytes.len().min(MAX_RESPONSE_BYTES);
    let text = String::from_utf8_lossy(&bytes[..end]);
    if text.trim().is_empty() {
        None
    } else {
        Some(Value::String(text.into_owned()))
    }
}

/// Returns true if shutdown was requested before `delay` elapsed.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone; nobody can request shutdown any more.
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}
