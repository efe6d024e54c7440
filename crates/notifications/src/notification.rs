//! Typed notifications
//!
//! One variant per channel, each carrying only the fields that channel needs.
//! Webhooks go through [`WebhookDelivery`]; email and SMS are handed to a
//! [`ChannelSender`] owned by whoever runs the mail and SMS vendors.

use std::sync::Arc;

use async_trait::async_trait;
use saasbill_shared::{is_valid_email, is_valid_phone, Readiness, Unavailable, ValidationErrors};
use serde::{Deserialize, Serialize};

use crate::delivery::{is_valid_url, RetriedDelivery, WebhookDelivery, WebhookTarget};

pub const MAX_SMS_LEN: usize = 1600;
pub const MAX_SUBJECT_LEN: usize = 998;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Notification {
    Email {
        to: String,
        subject: String,
        body: String,
    },
    Sms {
        to: String,
        message: String,
    },
    Webhook(WebhookTarget),
}

impl Notification {
    pub fn channel(&self) -> &'static str {
        match self {
            Notification::Email { .. } => "email",
            Notification::Sms { .. } => "sms",
            Notification::Webhook(_) => "webhook",
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match self {
            Notification::Email { to, subject, body } => {
                if !is_valid_email(to) {
                    errors.add("to", "Invalid email address");
                }
                if subject.trim().is_empty() {
                    errors.add("subject", "Must not be empty");
                } else if subject.chars().count() > MAX_SUBJECT_LEN {
                    errors.add(
                        "subject",
                        format!("Must be at most {} characters", MAX_SUBJECT_LEN),
                    );
                }
                if body.trim().is_empty() {
                    errors.add("body", "Must not be empty");
                }
            }
            Notification::Sms { to, message } => {
                if !is_valid_phone(to) {
                    errors.add("to", "Must be an E.164 phone number");
                }
                if message.trim().is_empty() {
                    errors.add("message", "Must not be empty");
                } else if message.chars().count() > MAX_SMS_LEN {
                    errors.add(
                        "message",
                        format!("Must be at most {} characters", MAX_SMS_LEN),
                    );
                }
            }
            Notification::Webhook(target) => {
                if !is_valid_url(&target.url) {
                    errors.add("url", "Must be an http or https URL");
                }
            }
        }

        errors.into_result()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Recipient rejected: {0}")]
    Rejected(String),

    #[error("Channel vendor error: {0}")]
    Vendor(String),
}

/// Email and SMS transport
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;

    async fn send_sms(&self, to: &str, message: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("Notification channel unavailable: {0}")]
    ChannelUnavailable(#[from] Unavailable),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Email {
        delivered: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Sms {
        delivered: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Webhook(RetriedDelivery),
}

impl DispatchOutcome {
    pub fn delivered(&self) -> bool {
        match self {
            DispatchOutcome::Email { delivered, .. } | DispatchOutcome::Sms { delivered, .. } => {
                *delivered
            }
            DispatchOutcome::Webhook(retried) => retried.result.success,
        }
    }
}

pub struct NotificationDispatcher {
    webhooks: WebhookDelivery,
    channels: Readiness<Arc<dyn ChannelSender>>,
}

impl NotificationDispatcher {
    pub fn new(webhooks: WebhookDelivery, channels: Readiness<Arc<dyn ChannelSender>>) -> Self {
        Self { webhooks, channels }
    }

    pub fn webhooks(&self) -> &WebhookDelivery {
        &self.webhooks
    }

    /// Validate and send. Delivery failures are reported in the outcome;
    /// only invalid input or a missing email/SMS transport is an `Err`.
    pub async fn dispatch(
        &self,
        notification: Notification,
    ) -> Result<DispatchOutcome, NotificationError> {
        notification.validate()?;

        let outcome = match &notification {
            Notification::Email { to, subject, body } => {
                let sender = self.channels.require()?;
                let (delivered, error) = settle(sender.send_email(to, subject, body).await);
                DispatchOutcome::Email { delivered, error }
            }
            Notification::Sms { to, message } => {
                let sender = self.channels.require()?;
                let (delivered, error) = settle(sender.send_sms(to, message).await);
                DispatchOutcome::Sms { delivered, error }
            }
            Notification::Webhook(target) => {
                DispatchOutcome::Webhook(self.webhooks.send_with_retry(target, None).await)
            }
        };

        if outcome.delivered() {
            tracing::info!(channel = notification.channel(), "Notification delivered");
        } else {
            tracing::warn!(channel = notification.channel(), "Notification not delivered");
        }

        Ok(outcome)
    }
}

fn settle(sent: Result<(), ChannelError>) -> (bool, Option<String>) {
    match sent {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}
