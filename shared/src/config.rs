//! Configuration management for Lambda functions.

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database host
    pub db_host: String,
    /// Database name
    pub db_name: String,
    /// ARN of the secret containing database credentials
    pub db_secret_arn: String,
    /// Maximum pooled database connections per container
    pub db_max_connections: u32,
    /// ARN of the HS256 secret used to verify bearer session tokens (function URLs)
    pub session_secret_arn: Option<String>,
    /// Timeout applied to every call to an external AI endpoint
    pub upstream_timeout: Duration,
    /// Delay between simulated chunks for webhook endpoints
    pub simulated_chunk_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            db_host: env::var("DATABASE_HOST")?,
            db_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "chat_gateway".to_string()),
            db_secret_arn: env::var("DATABASE_URL_SECRET_ARN")?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 5),
            session_secret_arn: env::var("SESSION_SECRET_ARN").ok(),
            upstream_timeout: Duration::from_secs(parse_or("UPSTREAM_TIMEOUT_SECS", 120)),
            simulated_chunk_delay: Duration::from_millis(parse_or("SIMULATED_CHUNK_DELAY_MS", 30)),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
