//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use std::time::Duration;

use serde::Deserialize;

use crate::services::{
    fees::{FeeRule, FeeSchedule, FeeSettlement},
    idempotency::AmountTolerance,
    reconciliation::{EngineSettings, SideEffectDispatch},
    risk::DeclinePolicy,
};

/// Which distributed lock implementation guards balance mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// PostgreSQL advisory locks, shared across instances
    #[default]
    Postgres,
    /// In-process locks, single instance only
    Local,
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `WEBHOOK_SIGNING_SECRET` (required): HMAC secret shared with the card provider
/// - `PROVIDER_API_URL`, `PROVIDER_API_KEY` (required): card provider REST API
/// - `NOTIFICATION_URL`, `NOTIFICATION_SECRET` (optional): signed notification endpoint
/// - `LOCK_BACKEND` (optional): `postgres` or `local`, defaults to `postgres`
/// - `LOCK_WAIT_MS` (optional): lock acquisition timeout, defaults to 10000
/// - `AMOUNT_TOLERANCE_BPS` (optional): amount tolerance, defaults to 500
/// - `DECLINE_BLOCK_THRESHOLD` (optional): declines before auto-block, defaults to 5
/// - `DEPOSIT_FEE_BPS`, `DEPOSIT_FEE_FLAT_MINOR`, `DECLINE_FEE_MINOR` (optional): fee table
/// - `FEE_SETTLEMENT` (optional): `provider_charge` or `inline`
/// - `FEE_RETRY_INTERVAL_SECS` (optional): unsettled fee sweep period, 0 disables it
/// - `CURRENCY` (optional): ledger currency, defaults to `USD`
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub webhook_signing_secret: String,

    pub provider_api_url: String,
    pub provider_api_key: String,

    pub notification_url: Option<String>,
    pub notification_secret: Option<String>,

    #[serde(default)]
    pub lock_backend: LockBackend,

    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    #[serde(default = "default_amount_tolerance_bps")]
    pub amount_tolerance_bps: u32,

    #[serde(default = "default_decline_block_threshold")]
    pub decline_block_threshold: i32,

    #[serde(default = "default_deposit_fee_bps")]
    pub deposit_fee_bps: u32,

    #[serde(default)]
    pub deposit_fee_flat_minor: i64,

    #[serde(default)]
    pub decline_fee_minor: i64,

    #[serde(default)]
    pub fee_settlement: FeeSettlement,

    #[serde(default = "default_fee_retry_interval_secs")]
    pub fee_retry_interval_secs: u64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_lock_wait_ms() -> u64 {
    10_000
}

fn default_amount_tolerance_bps() -> u32 {
    500
}

fn default_decline_block_threshold() -> i32 {
    5
}

fn default_deposit_fee_bps() -> u32 {
    100
}

fn default_fee_retry_interval_secs() -> u64 {
    300
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Configuration values that parse but cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    /// - A URL or threshold fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_service_url("PROVIDER_API_URL", &self.provider_api_url)?;
        if let Some(url) = &self.notification_url {
            validate_service_url("NOTIFICATION_URL", url)?;
        }
        if self.webhook_signing_secret.is_empty() {
            return Err(ConfigError::Invalid {
                name: "WEBHOOK_SIGNING_SECRET",
                reason: "must not be empty".to_string(),
            });
        }
        if self.decline_block_threshold < 1 {
            return Err(ConfigError::Invalid {
                name: "DECLINE_BLOCK_THRESHOLD",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.deposit_fee_flat_minor < 0 || self.decline_fee_minor < 0 {
            return Err(ConfigError::Invalid {
                name: "DEPOSIT_FEE_FLAT_MINOR / DECLINE_FEE_MINOR",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// `None` when the sweep is disabled.
    pub fn fee_retry_interval(&self) -> Option<Duration> {
        (self.fee_retry_interval_secs > 0).then(|| Duration::from_secs(self.fee_retry_interval_secs))
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            deposit: FeeRule {
                bps: self.deposit_fee_bps,
                flat_minor: self.deposit_fee_flat_minor,
            },
            insufficient_funds_decline: FeeRule::flat(self.decline_fee_minor),
            settlement: self.fee_settlement,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            tolerance: AmountTolerance::from_bps(self.amount_tolerance_bps),
            decline_policy: DeclinePolicy {
                block_threshold: self.decline_block_threshold,
            },
            currency: self.currency.clone(),
            side_effects: SideEffectDispatch::Background,
        }
    }
}

/// Validate an outbound service URL.
///
/// # Rules
///
/// - Must be valid URL
/// - Must be HTTPS (HTTP localhost allowed for development)
/// - Maximum 2048 characters
fn validate_service_url(name: &'static str, url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    };

    if url.len() > 2048 {
        return Err(invalid("URL exceeds 2048 characters"));
    }

    let parsed = url::Url::parse(url).map_err(|_| invalid("Invalid URL format"))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            // Allow HTTP for localhost/127.0.0.1 (testing)
            if matches!(
                parsed.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0")
            ) {
                Ok(())
            } else {
                Err(invalid(
                    "HTTP is only allowed for localhost. Use HTTPS for production.",
                ))
            }
        }
        _ => Err(invalid("URL must use HTTP or HTTPS")),
    }
}
