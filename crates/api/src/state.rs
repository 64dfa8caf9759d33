//! Application state

use std::sync::Arc;

use flowline_billing::BillingService;
use flowline_shared::RateLimiter;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    /// Rate limiter for the synchronous verify endpoint
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::from_env(pool.clone()));

        let rate_limiter = match config.redis_url.as_deref() {
            Some(url) => match RateLimiter::new_redis(url).await {
                Ok(limiter) => limiter,
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable - falling back to in-memory rate limiting");
                    RateLimiter::new_in_memory()
                }
            },
            None => {
                tracing::info!("REDIS_URL not set - using in-memory rate limiting");
                RateLimiter::new_in_memory()
            }
        };

        Self {
            pool,
            config,
            billing,
            rate_limiter,
        }
    }
}
