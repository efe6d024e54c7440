//! Inbound provider events
//!
//! Signature verification works on the raw request bytes. Verified events are
//! then decoded into [`ProviderEvent`], one variant per event class this
//! system reconciles, so handling is an exhaustive match.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentsError, PaymentsResult};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now (5 minutes)
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// An authenticated provider event, before type-specific decoding
#[derive(Debug, Clone)]
pub struct VerifiedEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub livemode: bool,
    pub object: serde_json::Value,
    /// Body exactly as received
    pub raw: String,
}

impl VerifiedEvent {
    /// Parse a previously verified body (stored event log entries).
    pub fn from_raw(raw: &str) -> PaymentsResult<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            id: String,
            #[serde(rename = "type")]
            event_type: String,
            #[serde(default)]
            created: i64,
            #[serde(default)]
            livemode: bool,
            data: EnvelopeData,
        }

        #[derive(Deserialize)]
        struct EnvelopeData {
            object: serde_json::Value,
        }

        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| PaymentsError::WebhookPayloadInvalid(e.to_string()))?;

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created: envelope.created,
            livemode: envelope.livemode,
            object: envelope.data.object,
            raw: raw.to_string(),
        })
    }
}

/// Authenticates inbound provider webhooks
pub trait EventVerifier: Send + Sync {
    fn verify(&self, raw_body: &[u8], signature_header: &str) -> PaymentsResult<VerifiedEvent>;
}

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    v1_signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    /// Format: `t=<timestamp>,v1=<hex>[,v1=<hex>...]`. Unknown keys are ignored.
    fn parse(header: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut v1_signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            match key {
                "t" => timestamp = Some(value.parse().ok()?),
                "v1" => v1_signatures.push(hex::decode(value).ok()?),
                _ => {}
            }
        }

        if v1_signatures.is_empty() {
            return None;
        }

        Some(Self {
            timestamp: timestamp?,
            v1_signatures,
        })
    }
}

/// HMAC-SHA256 verifier for Stripe webhooks
pub struct StripeSignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl StripeSignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    fn verify_at(
        &self,
        raw_body: &[u8],
        signature_header: &str,
        now: i64,
    ) -> PaymentsResult<VerifiedEvent> {
        let header =
            SignatureHeader::parse(signature_header).ok_or(PaymentsError::WebhookSignatureInvalid)?;

        let tolerance = u64::try_from(self.tolerance_secs).unwrap_or(0);
        if now.abs_diff(header.timestamp) > tolerance {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(PaymentsError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| PaymentsError::WebhookSignatureInvalid)?;
        mac.update(header.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        let expected = mac.finalize().into_bytes();

        let matched = header
            .v1_signatures
            .iter()
            .any(|candidate| candidate.len() == expected.len() && bool::from(candidate.ct_eq(&expected)));
        if !matched {
            return Err(PaymentsError::WebhookSignatureInvalid);
        }

        let raw = std::str::from_utf8(raw_body)
            .map_err(|e| PaymentsError::WebhookPayloadInvalid(e.to_string()))?;
        VerifiedEvent::from_raw(raw)
    }
}

impl EventVerifier for StripeSignatureVerifier {
    fn verify(&self, raw_body: &[u8], signature_header: &str) -> PaymentsResult<VerifiedEvent> {
        self.verify_at(
            raw_body,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }
}

/// Charge reference on a payment intent: an id or an expanded charge
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChargeRef {
    Id(String),
    Object(ChargeSummary),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeSummary {
    pub id: String,
    #[serde(default)]
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentErrorObject {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChargeList {
    #[serde(default)]
    data: Vec<ChargeSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub latest_charge: Option<ChargeRef>,
    #[serde(default)]
    charges: Option<ChargeList>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentErrorObject>,
}

impl PaymentIntentObject {
    /// Charge id, from `latest_charge` or the legacy embedded charge list
    pub fn charge_id(&self) -> Option<String> {
        match &self.latest_charge {
            Some(ChargeRef::Id(id)) => Some(id.clone()),
            Some(ChargeRef::Object(charge)) => Some(charge.id.clone()),
            None => self.first_charge().map(|c| c.id.clone()),
        }
    }

    pub fn receipt_url(&self) -> Option<String> {
        match &self.latest_charge {
            Some(ChargeRef::Object(charge)) if charge.receipt_url.is_some() => {
                charge.receipt_url.clone()
            }
            _ => self.first_charge().and_then(|c| c.receipt_url.clone()),
        }
    }

    fn first_charge(&self) -> Option<&ChargeSummary> {
        self.charges.as_ref().and_then(|list| list.data.first())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub refunds: Option<RefundList>,
}

/// Provider events this system understands
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Non-terminal intent changes; the local status comes from the object.
    PaymentIntentUpdated(PaymentIntentObject),
    PaymentIntentSucceeded(PaymentIntentObject),
    PaymentIntentFailed(PaymentIntentObject),
    PaymentIntentCanceled(PaymentIntentObject),
    ChargeRefunded(ChargeObject),
    RefundUpdated(RefundObject),
    Unhandled { event_type: String },
}

impl ProviderEvent {
    pub fn decode(event: &VerifiedEvent) -> PaymentsResult<Self> {
        let decoded = match event.event_type.as_str() {
            "payment_intent.created"
            | "payment_intent.processing"
            | "payment_intent.requires_action"
            | "payment_intent.amount_capturable_updated" => {
                ProviderEvent::PaymentIntentUpdated(object(event)?)
            }
            "payment_intent.succeeded" => ProviderEvent::PaymentIntentSucceeded(object(event)?),
            "payment_intent.payment_failed" => ProviderEvent::PaymentIntentFailed(object(event)?),
            "payment_intent.canceled" => ProviderEvent::PaymentIntentCanceled(object(event)?),
            "charge.refunded" => ProviderEvent::ChargeRefunded(object(event)?),
            "charge.refund.updated" => ProviderEvent::RefundUpdated(object(event)?),
            other => ProviderEvent::Unhandled {
                event_type: other.to_string(),
            },
        };
        Ok(decoded)
    }
}

fn object<T: DeserializeOwned>(event: &VerifiedEvent) -> PaymentsResult<T> {
    serde_json::from_value(event.object.clone()).map_err(|e| {
        PaymentsError::WebhookPayloadInvalid(format!(
            "{} object did not decode: {}",
            event.event_type, e
        ))
    })
}

/// Tenant id from provider metadata. Missing or malformed ids yield `None`.
pub fn tenant_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("tenant_id")
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}
