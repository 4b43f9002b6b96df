//! Configuration module
//!
//! All configuration comes from the environment; DATABASE_URL and
//! JWT_SECRET are required, everything else has a default.

use std::env;
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Secret for signing session tokens
    pub jwt_secret: String,

    /// Session token lifetime in hours
    pub token_ttl_hours: i64,

    /// Rate limit: requests per minute per user
    pub rate_limit_per_minute: i64,

    /// Bound on compare-and-swap retries per account per operation
    pub transfer_max_retries: u32,

    /// Retention window for idempotency keys, in hours
    pub idempotency_retention_hours: i64,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn parsed_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10)?,
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parsed_or("PORT", 3000)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            token_ttl_hours: parsed_or("TOKEN_TTL_HOURS", 24)?,
            rate_limit_per_minute: parsed_or("RATE_LIMIT_PER_MINUTE", 100)?,
            transfer_max_retries: parsed_or("TRANSFER_MAX_RETRIES", 5)?,
            idempotency_retention_hours: parsed_or("IDEMPOTENCY_RETENTION_HOURS", 24)?,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
