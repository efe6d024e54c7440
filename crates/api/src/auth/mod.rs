//! Tenant authentication for the gateway

pub mod jwt;
pub mod middleware;

pub use jwt::{AuthError, Claims, JwtManager};
pub use middleware::{require_auth, TenantContext};
