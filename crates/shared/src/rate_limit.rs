//! Request rate limiting.
//!
//! Fixed-window counters keyed by `(user, scope)`. The Redis backend is the
//! production path: check-and-increment runs as a single atomic INCR with a
//! window TTL, so the bucket state survives process restarts and is shared
//! across horizontally scaled instances. The in-memory backend exists for
//! tests and single-process development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

const WINDOW_SECONDS: u64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests remaining in the current window.
    pub remaining: u32,
    /// Seconds until the window resets, when the request was rejected.
    pub retry_after_seconds: Option<u64>,
}

#[derive(Clone)]
enum Backend {
    Redis(redis::aio::ConnectionManager),
    InMemory(Arc<Mutex<HashMap<String, WindowState>>>),
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    window_started: Instant,
}

/// Fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Backend,
}

impl RateLimiter {
    /// Connect the Redis-backed limiter.
    pub async fn new_redis(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("Rate limiter connected to Redis");
        Ok(Self {
            backend: Backend::Redis(manager),
        })
    }

    /// In-memory limiter for tests and single-process development.
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Atomic check-and-increment for one `(user, scope)` bucket.
    ///
    /// The increment happens whether or not the request is allowed; a
    /// rejected request still consumed an attempt, which keeps the check a
    /// single round trip.
    pub async fn check(
        &self,
        user_id: Uuid,
        scope: &str,
        limit_per_minute: u32,
    ) -> Result<RateLimitResult, RateLimitError> {
        let key = format!("ratelimit:{scope}:{user_id}");

        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let count: u32 = conn.incr(&key, 1u32).await?;
                if count == 1 {
                    // First hit opens the window.
                    let _: bool = conn.expire(&key, WINDOW_SECONDS as i64).await?;
                }

                if count > limit_per_minute {
                    let ttl: i64 = conn.ttl(&key).await?;
                    Ok(RateLimitResult {
                        allowed: false,
                        remaining: 0,
                        retry_after_seconds: Some(ttl.max(1) as u64),
                    })
                } else {
                    Ok(RateLimitResult {
                        allowed: true,
                        remaining: limit_per_minute - count,
                        retry_after_seconds: None,
                    })
                }
            }
            Backend::InMemory(buckets) => {
                let mut buckets = buckets.lock().await;
                let now = Instant::now();
                let state = buckets.entry(key).or_insert(WindowState {
                    count: 0,
                    window_started: now,
                });

                if now.duration_since(state.window_started) >= Duration::from_secs(WINDOW_SECONDS)
                {
                    state.count = 0;
                    state.window_started = now;
                }

                state.count += 1;
                if state.count > limit_per_minute {
                    let elapsed = now.duration_since(state.window_started).as_secs();
                    Ok(RateLimitResult {
                        allowed: false,
                        remaining: 0,
                        retry_after_seconds: Some(WINDOW_SECONDS.saturating_sub(elapsed).max(1)),
                    })
                } else {
                    Ok(RateLimitResult {
                        allowed: true,
                        remaining: limit_per_minute - state.count,
                        retry_after_seconds: None,
                    })
                }
            }
        }
    }

    /// Drop expired in-memory windows. No-op on the Redis backend, where
    /// TTLs do this for us.
    pub async fn cleanup(&self) {
        if let Backend::InMemory(buckets) = &self.backend {
            let mut buckets = buckets.lock().await;
            let now = Instant::now();
            buckets.retain(|_, state| {
                now.duration_since(state.window_started) < Duration::from_secs(WINDOW_SECONDS * 2)
            });
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
