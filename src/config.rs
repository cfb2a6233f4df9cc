//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into a
//! type-safe struct. Missing or inconsistent configuration is fatal: the
//! server refuses to start rather than guess.

use serde::Deserialize;
use std::time::Duration;

use crate::models::quota::QuotaSettings;

/// Which [`Store`](crate::store::Store) implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL`: PostgreSQL connection string (required for the postgres backend)
/// - `SERVER_PORT`: HTTP server port, defaults to 3000
/// - `STORE_BACKEND`: `postgres` (default) or `memory`
/// - `SESSION_SECRET` (required): HMAC key for session token fingerprints
/// - `DEFAULT_DAILY_LIMIT` / `DEFAULT_CYCLE_LIMIT`: system default quotas
/// - `MIN_LIMIT` / `MAX_DAILY_LIMIT` / `MAX_CYCLE_LIMIT`: clamping bounds
/// - `STORE_TIMEOUT_MS`: deadline for every store call
/// - `ACCOUNT_CACHE_TTL_SECS` / `SETTINGS_CACHE_TTL_SECS`: cache lifetimes
/// - `REDEEM_MAX_ATTEMPTS` / `RETRY_BACKOFF_MS`: bounded retry on lost races
/// - `QUOTA_SERIALIZE_PER_ACCOUNT`: per-account lock around check+record
/// - `ADMIN_API_KEY`: admin key registered at startup by the memory backend
///   (the postgres backend reads `admin_api_keys` and ignores it)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_backend")]
    pub store_backend: StoreBackend,

    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    pub session_secret: String,

    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: i64,

    #[serde(default = "default_cycle_limit")]
    pub default_cycle_limit: i64,

    #[serde(default = "default_min_limit")]
    pub min_limit: i64,

    #[serde(default = "default_max_daily_limit")]
    pub max_daily_limit: i64,

    #[serde(default = "default_max_cycle_limit")]
    pub max_cycle_limit: i64,

    #[serde(default = "default_account_cache_ttl_secs")]
    pub account_cache_ttl_secs: i64,

    #[serde(default = "default_settings_cache_ttl_secs")]
    pub settings_cache_ttl_secs: i64,

    #[serde(default = "default_redeem_max_attempts")]
    pub redeem_max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub quota_serialize_per_account: bool,

    #[serde(default)]
    pub admin_api_key: Option<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Postgres
}

fn default_max_connections() -> u32 {
    5
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_daily_limit() -> i64 {
    10
}

fn default_cycle_limit() -> i64 {
    120
}

fn default_min_limit() -> i64 {
    1
}

fn default_max_daily_limit() -> i64 {
    10_000
}

fn default_max_cycle_limit() -> i64 {
    300_000
}

fn default_account_cache_ttl_secs() -> i64 {
    120
}

fn default_settings_cache_ttl_secs() -> i64 {
    300
}

fn default_redeem_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

/// Shortest accepted `SESSION_SECRET`.
pub const MIN_SESSION_SECRET_LEN: usize = 16;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_backend == StoreBackend::Postgres
            && self.database_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "DATABASE_URL is required when STORE_BACKEND=postgres".to_string(),
            ));
        }
        if self.session_secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "SESSION_SECRET must be at least {MIN_SESSION_SECRET_LEN} bytes"
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "STORE_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        if self.redeem_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "REDEEM_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self
            .admin_api_key
            .as_deref()
            .is_some_and(|key| key.len() < MIN_SESSION_SECRET_LEN)
        {
            return Err(ConfigError::Invalid(format!(
                "ADMIN_API_KEY must be at least {MIN_SESSION_SECRET_LEN} bytes"
            )));
        }
        if self.account_cache_ttl_secs < 0 || self.settings_cache_ttl_secs < 0 {
            return Err(ConfigError::Invalid(
                "cache TTLs cannot be negative".to_string(),
            ));
        }
        self.quota_settings()
            .validate()
            .map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Environment-level quota settings, before any runtime override.
    pub fn quota_settings(&self) -> QuotaSettings {
        QuotaSettings {
            default_daily_limit: self.default_daily_limit,
            default_cycle_limit: self.default_cycle_limit,
            min_limit: self.min_limit,
            max_daily_limit: self.max_daily_limit,
            max_cycle_limit: self.max_cycle_limit,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn account_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.account_cache_ttl_secs)
    }

    pub fn settings_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings_cache_ttl_secs)
    }

    /// Configuration suitable for the in-memory backend; used by tests and
    /// local experiments.
    pub fn for_memory(session_secret: &str) -> Self {
        Self {
            database_url: None,
            server_port: default_port(),
            store_backend: StoreBackend::Memory,
            db_max_connections: default_max_connections(),
            store_timeout_ms: default_store_timeout_ms(),
            session_secret: session_secret.to_string(),
            default_daily_limit: default_daily_limit(),
            default_cycle_limit: default_cycle_limit(),
            min_limit: default_min_limit(),
            max_daily_limit: default_max_daily_limit(),
            max_cycle_limit: default_max_cycle_limit(),
            account_cache_ttl_secs: default_account_cache_ttl_secs(),
            settings_cache_ttl_secs: default_settings_cache_ttl_secs(),
            redeem_max_attempts: default_redeem_max_attempts(),
            retry_backoff_ms: 1,
            quota_serialize_per_account: false,
            admin_api_key: None,
        }
    }
}
