//! Rate limiting middleware.
//!
//! Production deployments share rate-limit state across worker processes,
//! so they require a Redis-backed limiter; a single-process in-memory
//! fallback is only permitted outside production, and logs a warning when
//! it is used (spec.md §9's rate-limiter Open Question resolution).

use crate::config::AppConfig;
use crate::error::{AppError, ResourceError};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Configuration for rate limiting.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Burst allowance (extra requests above limit before hard reject).
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    BurstUsed { remaining: u32 },
    Exceeded { retry_after_secs: u64 },
}

/// Shared rate-limiting contract so the middleware doesn't care whether
/// state lives in-process or in Redis.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError>;
}

/// In-memory sliding-window limiter. Not safe to share across processes —
/// dev-only, and the fallback path that selects it always warns.
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<String, WindowEntry>>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl InMemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Periodic cleanup of stale entries (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        let remaining = limit.saturating_sub(entry.count);
        let reset_at = entry.window_start + self.config.window;

        Ok(if entry.count > limit {
            RateLimitDecision::Exceeded {
                retry_after_secs: reset_at.duration_since(now).as_secs(),
            }
        } else if entry.count > self.config.max_requests {
            RateLimitDecision::BurstUsed { remaining }
        } else {
            RateLimitDecision::Allowed { remaining }
        })
    }
}

/// Redis-backed fixed-window limiter: `INCR` the window key, set its TTL
/// only the first time it is created so the window rolls forward exactly
/// once per `config.window`.
pub struct CacheRateLimiter {
    manager: redis::aio::ConnectionManager,
    config: RateLimitConfig,
}

impl CacheRateLimiter {
    pub async fn connect(redis_url: &str, config: RateLimitConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::ResourceError(ResourceError::Cache(e.to_string())))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::ResourceError(ResourceError::Cache(e.to_string())))?;
        Ok(Self { manager, config })
    }
}

#[async_trait]
impl RateLimiter for CacheRateLimiter {
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        let redis_key = format!("rate_limit:{key}");
        let mut conn = self.manager.clone();

        let count: u32 = conn
            .incr(&redis_key, 1u32)
            .await
            .map_err(|e| AppError::ResourceError(ResourceError::Cache(e.to_string())))?;

        if count == 1 {
            let _: () = conn
                .expire(&redis_key, self.config.window.as_secs() as i64)
                .await
                .map_err(|e| AppError::ResourceError(ResourceError::Cache(e.to_string())))?;
        }

        let limit = self.config.max_requests + self.config.burst;
        let remaining = limit.saturating_sub(count);

        Ok(if count > limit {
            let ttl: i64 = conn
                .ttl(&redis_key)
                .await
                .map_err(|e| AppError::ResourceError(ResourceError::Cache(e.to_string())))?;
            RateLimitDecision::Exceeded {
                retry_after_secs: ttl.max(0) as u64,
            }
        } else if count > self.config.max_requests {
            RateLimitDecision::BurstUsed { remaining }
        } else {
            RateLimitDecision::Allowed { remaining }
        })
    }
}

/// Selects the limiter backend per the resolved Open Question: Redis is
/// mandatory in production, falls back to in-process state elsewhere.
pub async fn build_rate_limiter(
    app_config: &AppConfig,
    rate_limit_config: RateLimitConfig,
) -> Result<Arc<dyn RateLimiter>, AppError> {
    if let Some(redis_url) = &app_config.redis_url {
        match CacheRateLimiter::connect(redis_url, rate_limit_config).await {
            Ok(limiter) => return Ok(Arc::new(limiter)),
            Err(e) if app_config.rate_limit_require_redis => return Err(e),
            Err(e) => {
                warn!(error = %e, "Redis rate limiter unavailable, falling back to in-memory (dev only)");
            }
        }
    } else if app_config.rate_limit_require_redis {
        return Err(AppError::InvariantViolation(
            "RATE_LIMIT_REQUIRE_REDIS is set but no REDIS_URL is configured".to_string(),
        ));
    } else {
        warn!("No REDIS_URL configured; using in-memory rate limiter (dev only)");
    }

    Ok(Arc::new(InMemoryRateLimiter::new(rate_limit_config)))
}

/// Rate limiting middleware function.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<Arc<dyn RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();

    match limiter.check(&ip.to_string()).await {
        Ok(RateLimitDecision::Allowed { .. }) | Ok(RateLimitDecision::BurstUsed { .. }) => {
            next.run(request).await
        }
        Ok(RateLimitDecision::Exceeded { retry_after_secs }) => {
            warn!(ip = %ip, retry_after_secs, "Rate limit exceeded");

            let body = serde_json::json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please slow down.",
                "retry_after_seconds": retry_after_secs,
            });

            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
        Err(e) => {
            // Fail open: a broken rate limiter must not take the API down.
            warn!(error = %e, "rate limiter check failed, allowing request");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_allows_under_limit() {
        let config = RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(60),
            burst: 5,
        };
        let limiter = InMemoryRateLimiter::new(config);

        for _ in 0..10 {
            match limiter.check("127.0.0.1").await.unwrap() {
                RateLimitDecision::Allowed { .. } => {}
                other => panic!("expected Allowed, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn in_memory_allows_burst_then_exceeds() {
        let config = RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(60),
            burst: 3,
        };
        let limiter = InMemoryRateLimiter::new(config);

        for _ in 0..5 {
            match limiter.check("1.2.3.4").await.unwrap() {
                RateLimitDecision::Allowed { .. } => {}
                other => panic!("expected Allowed, got {other:?}"),
            }
        }

        for _ in 0..3 {
            match limiter.check("1.2.3.4").await.unwrap() {
                RateLimitDecision::BurstUsed { .. } => {}
                other => panic!("expected BurstUsed, got {other:?}"),
            }
        }

        match limiter.check("1.2.3.4").await.unwrap() {
            RateLimitDecision::Exceeded { .. } => {}
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_memory_tracks_keys_independently() {
        let config = RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        };
        let limiter = InMemoryRateLimiter::new(config);

        assert!(matches!(
            limiter.check("a").await.unwrap(),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("b").await.unwrap(),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("a").await.unwrap(),
            RateLimitDecision::Exceeded { .. }
        ));
    }
}
