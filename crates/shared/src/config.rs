//! Typed configuration loaded from the environment
//!
//! Every service builds its configuration once at startup and passes it down
//! explicitly. Nothing here is global.

use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Read a required variable.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

/// Read an optional variable, treating empty values as unset.
pub fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a variable, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Outbound webhook delivery settings
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Maximum redirects followed per attempt
    pub max_redirects: usize,
    /// Additional attempts after the first one
    pub max_retries: u32,
    /// Delay before the second attempt
    pub retry_base_delay: Duration,
    /// Growth factor between consecutive delays
    pub retry_multiplier: f64,
    /// Value of the User-Agent header sent with every delivery
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            max_redirects: 5,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2_000),
            retry_multiplier: 2.0,
            user_agent: format!("saasbill-webhooks/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            timeout: Duration::from_millis(env_parse(
                "WEBHOOK_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            max_redirects: env_parse("WEBHOOK_MAX_REDIRECTS", defaults.max_redirects)?,
            max_retries: env_parse("WEBHOOK_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(env_parse(
                "WEBHOOK_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            retry_multiplier: env_parse("WEBHOOK_RETRY_MULTIPLIER", defaults.retry_multiplier)?,
            user_agent: defaults.user_agent,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "WEBHOOK_TIMEOUT_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "WEBHOOK_RETRY_MULTIPLIER".to_string(),
                message: "must be a finite number >= 1".to_string(),
            });
        }
        Ok(())
    }
}
