/// exchange.rs — Upstream exchange OHLCV client
///
/// The service depends on one narrow operation:
/// `fetch_ohlcv(symbol, timeframe, since, limit) -> bars`. The trait keeps
/// the fetcher testable with a mock; `BinanceClient` is the production
/// implementation against the spot klines endpoint.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::QuotesError;
use crate::series::Bar;
use crate::timeframe::Timeframe;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Closed bars starting at or after `since_ms`, at most `limit`,
    /// chronological order.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, QuotesError>;
}

// ── Binance spot klines ───────────────────────────────────────────────────

/// Raw kline array (12-element JSON array per bar).
/// Index layout: [open_time, open, high, low, close, volume, close_time,
///                quote_vol, n_trades, taker_buy_base, taker_buy_quote, ignore]
#[derive(Deserialize)]
struct RawKline(
    serde_json::Value, // 0: open_time (i64)
    serde_json::Value, // 1: open      (str)
    serde_json::Value, // 2: high      (str)
    serde_json::Value, // 3: low       (str)
    serde_json::Value, // 4: close     (str)
    serde_json::Value, // 5: volume    (str)
    #[allow(dead_code)] serde_json::Value, // 6: close_time
    #[allow(dead_code)] serde_json::Value, // 7: quote_vol
    #[allow(dead_code)] serde_json::Value, // 8: n_trades
    #[allow(dead_code)] serde_json::Value, // 9: taker_buy_base
    #[allow(dead_code)] serde_json::Value, // 10: taker_buy_quote
    #[allow(dead_code)] serde_json::Value, // 11: ignore
);

fn parse_f64(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_i64(v: &serde_json::Value) -> i64 {
    v.as_i64().unwrap_or(0)
}

impl From<RawKline> for Bar {
    fn from(r: RawKline) -> Self {
        Bar {
            time: parse_i64(&r.0),
            open: parse_f64(&r.1),
            high: parse_f64(&r.2),
            low: parse_f64(&r.3),
            close: parse_f64(&r.4),
            volume: parse_f64(&r.5),
        }
    }
}

/// Venue error body, e.g. {"code": -1121, "msg": "Invalid symbol."}
#[derive(Deserialize)]
struct VenueError {
    code: i64,
    msg: String,
}

const INVALID_SYMBOL_CODE: i64 = -1121;

pub struct BinanceClient {
    client: Client,
    base_url: String,
}

impl BinanceClient {
    pub fn new(base_url: &str) -> Result<Self, QuotesError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, QuotesError> {
        // "BTC/USDT" -> "BTCUSDT"
        let venue_symbol = symbol.replace('/', "").to_uppercase();
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url, venue_symbol, timeframe, since_ms, limit
        );

        debug!("Fetching klines: {}", url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<VenueError>(&body) {
                if err.code == INVALID_SYMBOL_CODE {
                    return Err(QuotesError::NoMarket(symbol.to_owned()));
                }
                return Err(QuotesError::Exchange(format!(
                    "{venue_symbol}: {} (code {})",
                    err.msg, err.code
                )));
            }
            return Err(QuotesError::Exchange(format!(
                "{venue_symbol}: HTTP {status}"
            )));
        }

        let raw: Vec<RawKline> = serde_json::from_slice(&body)
            .map_err(|e| QuotesError::Exchange(format!("kline parse: {e}")))?;
        Ok(raw.into_iter().map(Bar::from).collect())
    }
}
