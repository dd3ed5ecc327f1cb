//! Process-wide configuration, loaded from environment variables.
//!
//! Mirrors `users-core`'s `UsersConfig::from_env` posture: required settings
//! (the database URL, the voice provider credentials) fail fast at startup
//! rather than lazily at first use.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_bind_addr: String,

    pub voice_provider_base_url: String,
    pub voice_provider_api_key: String,

    pub system_concurrent_calls_limit: i64,
    pub default_user_concurrent_calls_limit: i64,
    pub queue_processor_interval: Duration,
    pub max_call_duration: Duration,
    pub queue_retry_max_attempts: i32,
    pub provider_api_timeout: Duration,
    pub stale_slot_reaper_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            http_bind_addr: env_or("HTTP_BIND_ADDR", "0.0.0.0:8080"),

            voice_provider_base_url: require_env("VOICE_PROVIDER_BASE_URL")?,
            voice_provider_api_key: require_env("VOICE_PROVIDER_API_KEY")?,

            system_concurrent_calls_limit: env_parse("SYSTEM_CONCURRENT_CALLS_LIMIT", 10)?,
            default_user_concurrent_calls_limit: env_parse(
                "DEFAULT_USER_CONCURRENT_CALLS_LIMIT",
                2,
            )?,
            queue_processor_interval: Duration::from_millis(env_parse(
                "QUEUE_PROCESSOR_INTERVAL_MS",
                10_000,
            )?),
            max_call_duration: Duration::from_secs(env_parse("MAX_CALL_DURATION_SECONDS", 7200)?),
            queue_retry_max_attempts: env_parse("QUEUE_RETRY_MAX_ATTEMPTS", 3)?,
            provider_api_timeout: Duration::from_millis(env_parse(
                "PROVIDER_API_TIMEOUT_MS",
                30_000,
            )?),
            stale_slot_reaper_interval: Duration::from_millis(env_parse(
                "STALE_SLOT_REAPER_INTERVAL_MS",
                300_000,
            )?),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("missing required env var {key}")))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(val) => val
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {key}: {val}"))),
        Err(_) => Ok(default),
    }
}
