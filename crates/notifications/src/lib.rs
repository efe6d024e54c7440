// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! saasbill notifications
//!
//! Outbound webhook delivery with bounded retries, plus typed email, SMS and
//! webhook notifications dispatched through one entry point.

pub mod delivery;
pub mod notification;

pub use delivery::{
    is_valid_url, sanitize_url, DeliveryError, DeliveryFailure, DeliveryResult, RetriedDelivery,
    WebhookDelivery, WebhookMethod, WebhookTarget,
};
pub use notification::{
    ChannelError, ChannelSender, DispatchOutcome, Notification, NotificationDispatcher,
    NotificationError,
};
