/// config.rs — Market-data service configuration loaded from .env
///
/// Loading happens once at startup; the service and client borrow
/// &QuotesConfig.
use std::env;
use std::path::PathBuf;

use anyhow::Result;

pub const DEFAULT_REQUEST_LIST: &str = "quotes:requests";
pub const DEFAULT_RESPONSE_PREFIX: &str = "quotes:responses";

#[derive(Debug, Clone)]
pub struct QuotesConfig {
    // ── Redis bus ────────────────────────────────────────────────────
    pub redis_url: String,
    /// Inbound request queue (BRPOP side).
    pub request_list: String,
    /// Prefix for per-request reply slots: `{response_prefix}:{request_id}`.
    pub response_prefix: String,
    /// TTL applied to reply slots so abandoned replies are collected.
    pub response_ttl_secs: u64,

    // ── Bar store ────────────────────────────────────────────────────
    pub data_dir: PathBuf,

    // ── Upstream exchange ────────────────────────────────────────────
    pub exchange_rest_url: String,
    /// Max bars per upstream request.
    pub fetch_limit: usize,

    // ── Client side ──────────────────────────────────────────────────
    /// Blocking reply wait before giving up with DataNotReceived.
    pub client_timeout_secs: u64,
}

impl QuotesConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // ignore missing .env

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into()),
            request_list: env::var("QUOTES_REQUEST_LIST")
                .unwrap_or_else(|_| DEFAULT_REQUEST_LIST.into()),
            response_prefix: env::var("QUOTES_RESPONSE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RESPONSE_PREFIX.into()),
            response_ttl_secs: parse_env("QUOTES_RESPONSE_TTL_SECS", 300u64)?,

            data_dir: PathBuf::from(
                env::var("QUOTES_DATA_DIR").unwrap_or_else(|_| "data/quotes".into()),
            ),

            exchange_rest_url: env::var("EXCHANGE_REST_URL")
                .unwrap_or_else(|_| "https://api.binance.com".into()),
            fetch_limit: parse_env("QUOTES_FETCH_LIMIT", 1000usize)?,

            client_timeout_secs: parse_env("QUOTES_CLIENT_TIMEOUT_SECS", 30u64)?,
        })
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
