//! Gateway configuration

use std::str::FromStr;

use saasbill_payments::StripeConfig;
use saasbill_shared::config::{env_optional, env_parse, env_required};
use saasbill_shared::{ConfigError, DeliveryConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    /// Unset means an in-memory rate limiter
    pub redis_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub rate_limit_per_minute: u32,
    pub log_format: LogFormat,
    pub allowed_origins: Vec<String>,
    pub delivery: DeliveryConfig,
    pub stripe: StripeConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("bind_address", &self.bind_address)
            .field("jwt_secret", &"[REDACTED]")
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("log_format", &self.log_format)
            .field("allowed_origins", &self.allowed_origins)
            .field("delivery", &self.delivery)
            .field("stripe", &self.stripe)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let rate_limit_per_minute = env_parse("RATE_LIMIT_PER_MINUTE", 120u32)?;
        if rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_PER_MINUTE".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let jwt_secret = env_required("JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                key: "JWT_SECRET".to_string(),
                message: "must be at least 32 characters".to_string(),
            });
        }

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            redis_url: env_optional("REDIS_URL"),
            bind_address: env_optional("BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret,
            rate_limit_per_minute,
            log_format: env_parse("LOG_FORMAT", LogFormat::Text)?,
            allowed_origins: env_optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            delivery: DeliveryConfig::from_env()?,
            stripe: StripeConfig::from_env(),
        })
    }
}
