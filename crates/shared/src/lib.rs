// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! saasbill shared building blocks
//!
//! Pieces used by more than one service:
//!
//! - **Backoff**: pure exponential backoff calculator with a fixed cap
//! - **Config**: typed, explicitly constructed configuration read from the environment
//! - **Validation**: URL, amount, currency, email and phone predicates
//! - **Readiness**: three-state readiness for optional external dependencies
//! - **Rate limiting**: sliding-window limiter over memory or Redis
//! - **Database**: Postgres pool creation and embedded migrations

pub mod backoff;
pub mod config;
pub mod db;
pub mod rate_limit;
pub mod readiness;
pub mod validation;

pub use backoff::{next_delay, BACKOFF_CAP};
pub use config::{ConfigError, DeliveryConfig};
pub use db::{create_pool, run_migrations, PoolSettings};
pub use rate_limit::{RateLimitError, RateLimitResult, RateLimiter};
pub use readiness::{Readiness, Unavailable};
pub use validation::{
    is_supported_currency, is_valid_email, is_valid_http_url, is_valid_phone, validate_amount,
    ValidationErrors, SUPPORTED_CURRENCIES,
};
