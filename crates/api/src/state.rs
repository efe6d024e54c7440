//! Application state

use std::sync::Arc;

use saasbill_notifications::{ChannelSender, NotificationDispatcher, WebhookDelivery};
use saasbill_payments::PaymentsService;
use saasbill_shared::{RateLimiter, Readiness};
use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentsService>,
    pub notifications: Arc<NotificationDispatcher>,
    pub jwt_manager: JwtManager,
    pub rate_limiter: RateLimiter,
    pub rate_limit_per_minute: u32,
}

impl AppState {
    /// Build production state. Must run inside the tokio runtime.
    pub async fn from_config(config: &Config, pool: PgPool) -> anyhow::Result<Self> {
        let rate_limiter = match &config.redis_url {
            Some(url) => match RateLimiter::redis(url).await {
                Ok(limiter) => {
                    tracing::info!("Rate limiter using Redis");
                    limiter
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Failed to connect rate limiter to Redis, falling back to in-memory"
                    );
                    RateLimiter::in_memory()
                }
            },
            None => {
                tracing::info!("REDIS_URL not set, rate limiter using in-memory windows");
                RateLimiter::in_memory()
            }
        };

        let payments = PaymentsService::new(config.stripe.clone(), pool);

        // Email and SMS vendors are wired by the deployment; only webhooks ship here.
        let channels: Readiness<Arc<dyn ChannelSender>> = Readiness::NotConfigured;
        tracing::info!(
            email_sms = channels.state_name(),
            "Notification channels configured"
        );
        let notifications =
            NotificationDispatcher::new(WebhookDelivery::new(config.delivery.clone())?, channels);

        Ok(Self::new(
            payments,
            notifications,
            JwtManager::new(&config.jwt_secret),
            rate_limiter,
            config.rate_limit_per_minute,
        ))
    }

    pub fn new(
        payments: PaymentsService,
        notifications: NotificationDispatcher,
        jwt_manager: JwtManager,
        rate_limiter: RateLimiter,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self {
            payments: Arc::new(payments),
            notifications: Arc::new(notifications),
            jwt_manager,
            rate_limiter,
            rate_limit_per_minute,
        }
    }
}
