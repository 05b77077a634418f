//! Runtime configuration.
//!
//! Everything the bot reads from the environment is collected once at
//! startup into an immutable [`Config`] that is passed to components at
//! construction. Nothing reads `std::env` after `Config::from_env`.

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::errors::{AppError, AppResult};

/// Default values for optional environment variables.
pub mod defaults {
    /// Shared State Store connection string.
    pub const REDIS_URL: &str = "redis://localhost:6379";

    /// Requests allowed per quota window.
    pub const QUOTA_MAX_PER_WINDOW: u32 = 3;

    /// Quota window length in seconds.
    pub const QUOTA_WINDOW_SECS: u64 = 3600;

    /// TTL on the per-user in-flight lock, so a crashed instance cannot
    /// lock a user out forever.
    pub const INFLIGHT_TTL_SECS: u64 = 120;

    /// Per-attempt timeout for provisioning API calls, in seconds.
    pub const REQUEST_TIMEOUT_SECS: u64 = 15;

    /// Retries after the first failed provisioning attempt.
    pub const PROVISION_MAX_RETRIES: u32 = 2;

    /// Base delay for provisioning retry backoff, in milliseconds.
    pub const PROVISION_RETRY_BASE_MS: u64 = 500;

    /// Port the liveness endpoint listens on.
    pub const HEALTH_PORT: u16 = 8000;

    /// Log file path.
    pub const LOG_FILE_PATH: &str = "bot.log";
}

/// Per-user quota policy. Loaded once, immutable thereafter.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    /// Maximum requests counted within one window.
    pub max_per_window: u32,
    /// Rolling window length.
    pub window: Duration,
    /// Upper bound on how long the in-flight lock may exist.
    pub inflight_ttl: Duration,
}

/// Provisioning client knobs: per-call timeout and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
}

/// Immutable application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (`BOT_TOKEN`, with `TELOXIDE_TOKEN` accepted
    /// as a fallback).
    pub bot_token: String,
    /// Base URL of the external SSH provisioning API (`API_URL`).
    pub api_url: String,
    /// Shared State Store connection string (`REDIS_URL`).
    pub redis_url: String,
    pub quota: Quota,
    pub provision: ProvisionConfig,
    /// Port for the liveness endpoint (`HEALTH_PORT`).
    pub health_port: u16,
    /// User ids allowed to run `/admin` (`ADMIN_USERS`, comma-separated).
    pub admin_users: HashSet<i64>,
    /// Log file path (`LOG_FILE_PATH`).
    pub log_file_path: String,
}

impl Config {
    /// Builds the configuration from the process environment.
    ///
    /// # Errors
    /// Returns `AppError::Config` when a required variable is missing or
    /// a value fails to parse.
    pub fn from_env() -> AppResult<Self> {
        let bot_token = env::var("BOT_TOKEN")
            .or_else(|_| env::var("TELOXIDE_TOKEN"))
            .map_err(|_| AppError::Config("BOT_TOKEN is not set".to_string()))?;
        if bot_token.trim().is_empty() {
            return Err(AppError::Config("BOT_TOKEN is empty".to_string()));
        }

        let api_url =
            env::var("API_URL").map_err(|_| AppError::Config("API_URL is not set".to_string()))?;
        Url::parse(&api_url)
            .map_err(|e| AppError::Config(format!("API_URL is not a valid URL: {}", e)))?;

        let quota = Quota {
            max_per_window: parse_or("QUOTA_MAX_PER_WINDOW", defaults::QUOTA_MAX_PER_WINDOW)?,
            window: Duration::from_secs(parse_or("QUOTA_WINDOW_SECS", defaults::QUOTA_WINDOW_SECS)?),
            inflight_ttl: Duration::from_secs(parse_or(
                "INFLIGHT_TTL_SECS",
                defaults::INFLIGHT_TTL_SECS,
            )?),
        };

        let provision = ProvisionConfig {
            timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT_SECS",
                defaults::REQUEST_TIMEOUT_SECS,
            )?),
            max_retries: parse_or("PROVISION_MAX_RETRIES", defaults::PROVISION_MAX_RETRIES)?,
            retry_base: Duration::from_millis(parse_or(
                "PROVISION_RETRY_BASE_MS",
                defaults::PROVISION_RETRY_BASE_MS,
            )?),
        };

        Ok(Self {
            bot_token,
            api_url,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| defaults::REDIS_URL.to_string()),
            quota,
            provision,
            health_port: parse_or("HEALTH_PORT", defaults::HEALTH_PORT)?,
            admin_users: parse_admin_users(env::var("ADMIN_USERS").ok().as_deref())?,
            log_file_path: env::var("LOG_FILE_PATH")
                .unwrap_or_else(|_| defaults::LOG_FILE_PATH.to_string()),
        })
    }

    /// Is this requester allowed to use admin commands?
    pub fn is_admin(&self, requester_id: i64) -> bool {
        self.admin_users.contains(&requester_id)
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> AppResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_admin_users(raw: Option<&str>) -> AppResult<HashSet<i64>> {
    let Some(raw) = raw else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| {
                AppError::Config(format!("ADMIN_USERS contains a non-numeric id: {:?}", part))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_users_parses_comma_separated_ids() {
        let ids = parse_admin_users(Some("1, 42,,  7")).unwrap();
        assert!(ids.contains(&1));
        assert!(ids.contains(&42));
        assert!(ids.contains(&7));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn admin_users_defaults_to_empty() {
        assert!(parse_admin_users(None).unwrap().is_empty());
    }

    #[test]
    fn admin_users_rejects_garbage() {
        assert!(parse_admin_users(Some("1,bob")).is_err());
    }
}
