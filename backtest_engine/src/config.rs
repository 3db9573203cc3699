/// config.rs — Backtesting engine configuration loaded from .env
use std::env;

use anyhow::Result;
use quotes_service::config::QuotesConfig;

pub const DEFAULT_TASKS_PREFIX: &str = "backtesting_tasks";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redis_url: String,
    /// Key prefix for the task object store, its index, pub/sub channels and
    /// result streams.
    pub tasks_prefix: String,
    /// Wall-clock period between result snapshots and stop-flag polls.
    pub save_period_secs: f64,
    /// Market-data client settings (shared env keys with the quotes service).
    pub quotes: QuotesConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // ignore missing .env

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into()),
            tasks_prefix: env::var("TASKS_PREFIX")
                .unwrap_or_else(|_| DEFAULT_TASKS_PREFIX.into()),
            save_period_secs: parse_env("RESULTS_SAVE_PERIOD_SECS", 1.0f64)?,
            quotes: QuotesConfig::from_env()?,
        })
    }

    /// Append stream for one backtesting run.
    pub fn results_stream_key(&self, result_id: &str) -> String {
        format!("{}:results:{}", self.tasks_prefix, result_id)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}
