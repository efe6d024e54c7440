//! Per-tenant sliding-window rate limiter
//!
//! Each `(tenant, route)` key keeps a log of request timestamps covering the
//! last window. A request is allowed while fewer than `limit` entries remain
//! in the window. Two backends share one interface:
//!
//! - in-memory (`VecDeque` of instants per key), for single-node and tests
//! - Redis sorted sets, for multi-node deployments

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Decision for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until a slot frees up; zero when allowed.
    pub retry_after_seconds: u64,
}

impl RateLimitResult {
    /// Result used when the backend cannot be reached and the limiter fails open.
    pub fn fail_open(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            retry_after_seconds: 0,
        }
    }
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<Mutex<HashMap<String, VecDeque<Instant>>>>),
    Redis(ConnectionManager),
}

/// Sliding-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    backend: Backend,
    window: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Redis(_) => "redis",
        };
        f.debug_struct("RateLimiter")
            .field("backend", &backend)
            .field("window", &self.window)
            .finish()
    }
}

impl RateLimiter {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
            window: DEFAULT_WINDOW,
        }
    }

    /// Connect to Redis at `url`.
    pub async fn redis(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(manager),
            window: DEFAULT_WINDOW,
        })
    }

    /// Override the window length (defaults to one minute).
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Redis(_) => "redis",
        }
    }

    /// Check and record one request for a tenant on a route.
    pub async fn check_tenant(
        &self,
        tenant_id: Uuid,
        route: &str,
        limit: u32,
    ) -> Result<RateLimitResult, RateLimitError> {
        self.check(&format!("ratelimit:{}:{}", tenant_id, route), limit)
            .await
    }

    /// Check and record one request for an arbitrary key.
    pub async fn check(&self, key: &str, limit: u32) -> Result<RateLimitResult, RateLimitError> {
        match &self.backend {
            Backend::Memory(windows) => Ok(self.check_memory(windows, key, limit).await),
            Backend::Redis(manager) => self.check_redis(manager.clone(), key, limit).await,
        }
    }

    async fn check_memory(
        &self,
        windows: &Mutex<HashMap<String, VecDeque<Instant>>>,
        key: &str,
        limit: u32,
    ) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = windows.lock().await;
        let log = windows.entry(key.to_string()).or_default();

        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        let used = u32::try_from(log.len()).unwrap_or(u32::MAX);
        if used >= limit {
            let retry_after = log
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_seconds: ceil_secs(retry_after),
            };
        }

        log.push_back(now);
        RateLimitResult {
            allowed: true,
            limit,
            remaining: limit - used - 1,
            retry_after_seconds: 0,
        }
    }

    async fn check_redis(
        &self,
        mut conn: ConnectionManager,
        key: &str,
        limit: u32,
    ) -> Result<RateLimitResult, RateLimitError> {
        let now_ms = unix_millis();
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let ttl_secs = i64::try_from(ceil_secs(self.window)).unwrap_or(i64::MAX);

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(key, 0, cutoff)
            .ignore()
            .zadd(key, &member, now_ms)
            .ignore()
            .zcard(key)
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count > u64::from(limit) {
            // Rejected requests do not consume a slot.
            let _: () = redis::cmd("ZREM")
                .arg(key)
                .arg(&member)
                .query_async(&mut conn)
                .await?;

            let oldest: Vec<(String, u64)> = redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;
            let retry_after_ms = oldest
                .first()
                .map(|(_, score)| (score + window_ms).saturating_sub(now_ms))
                .unwrap_or(window_ms);

            tracing::debug!(key = %key, limit = limit, "Rate limit exceeded");
            return Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_seconds: ceil_secs(Duration::from_millis(retry_after_ms)),
            });
        }

        let used = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(RateLimitResult {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(used),
            retry_after_seconds: 0,
        })
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_limit_then_rejects() {
        let limiter = RateLimiter::in_memory();
        let tenant = Uuid::new_v4();

        for expected_remaining in (0..3).rev() {
            let result = limiter.check_tenant(tenant, "refunds", 3).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let rejected = limiter.check_tenant(tenant, "refunds", 3).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_seconds >= 1);
        assert!(rejected.retry_after_seconds <= 60);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::in_memory();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        assert!(limiter.check_tenant(tenant_a, "payments", 1).await.unwrap().allowed);
        assert!(!limiter.check_tenant(tenant_a, "payments", 1).await.unwrap().allowed);

        assert!(limiter.check_tenant(tenant_b, "payments", 1).await.unwrap().allowed);
        assert!(limiter.check_tenant(tenant_a, "refunds", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::in_memory().with_window(Duration::from_millis(50));

        assert!(limiter.check("k", 1).await.unwrap().allowed);
        assert!(!limiter.check("k", 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check("k", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::in_memory();
        let result = limiter.check("k", 0).await.unwrap();
        assert!(!result.allowed);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
    }
}
