//! Application configuration loaded from environment variables.
//!
//! Configuration is read once at startup and immutable for the life of
//! the process; changing it requires a restart.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::clock::DEFAULT_TZ_OFFSET_HOURS;
use crate::store::{DEFAULT_LEASE_TTL_SECONDS, DEFAULT_RETRY_BACKOFF_SECONDS};

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub view_path: PathBuf,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    pub tz_offset_hours: i32,
    pub lease_ttl_seconds: i64,
    pub retry_backoff_seconds: Vec<i64>,
    pub max_attempts: i64,
    pub token_soft_limit: i64,
    pub token_hard_limit: i64,
    pub dispatch_interval_seconds: u64,
    pub watchdog_interval_minutes: u64,
    pub view_read_only: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_backoff_csv(raw: &str) -> Result<Vec<i64>> {
    let values: Result<Vec<i64>> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("invalid backoff entry: {s:?}"))
        })
        .collect();
    let values = values?;
    if values.is_empty() {
        anyhow::bail!("ORCH_RETRY_BACKOFF_SECONDS must contain at least one entry");
    }
    Ok(values)
}

impl Config {
    /// Load configuration from environment variables (and `.env` in
    /// development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let base_dir = PathBuf::from(
            env::var("ORCH_BASE_DIR").unwrap_or_else(|_| "orchestrator".to_string()),
        );
        let view_path = env::var("ORCH_VIEW_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("QUEUE.md"));
        let store_path = env::var("ORCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("db").join("queue.db"));
        let log_path = env::var("ORCH_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("logs").join("orch_runs.jsonl"));

        let retry_backoff_seconds = match env::var("ORCH_RETRY_BACKOFF_SECONDS") {
            Ok(raw) => parse_backoff_csv(&raw)?,
            Err(_) => DEFAULT_RETRY_BACKOFF_SECONDS.to_vec(),
        };

        Ok(Self {
            base_dir,
            view_path,
            store_path,
            log_path,
            tz_offset_hours: env_or("ORCH_TZ_OFFSET_HOURS", DEFAULT_TZ_OFFSET_HOURS)?,
            lease_ttl_seconds: env_or("ORCH_LEASE_TTL_SECONDS", DEFAULT_LEASE_TTL_SECONDS)?,
            retry_backoff_seconds,
            max_attempts: env_or("ORCH_MAX_ATTEMPTS", 3)?,
            token_soft_limit: env_or("ORCH_TOKEN_SOFT_LIMIT", 2000)?,
            token_hard_limit: env_or("ORCH_TOKEN_HARD_LIMIT", 3500)?,
            dispatch_interval_seconds: env_or("ORCH_DISPATCH_INTERVAL_SECONDS", 600)?,
            watchdog_interval_minutes: env_or("ORCH_WATCHDOG_INTERVAL_MINUTES", 120)?,
            view_read_only: env::var("ORCH_VIEW_READ_ONLY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}
