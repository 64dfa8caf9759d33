//! API configuration.

use flowline_shared::Environment;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_address: String,
    pub environment: Environment,
    /// Per-user request ceiling for the synchronous verify endpoint, which
    /// triggers an outbound provider call and must not be a free amplifier.
    pub verify_rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            database_url,
            redis_url: std::env::var("REDIS_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            environment: Environment::from_env(),
            verify_rate_limit_per_minute: std::env::var("VERIFY_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        })
    }
}
