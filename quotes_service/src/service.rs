/// service.rs — Quotes Service worker
///
/// Serves bar-range requests from a durable Redis list. Each request is
/// handled by its own task; a per-`(source, symbol, timeframe)` mutex
/// serializes gap filling so two requests on the same key never duplicate
/// upstream fetches, while distinct keys proceed in parallel. Lock entries
/// are never removed: the key cardinality is bounded by the traded universe.
///
/// Startup clears the inbound list and all reply slots: requests in flight
/// across a restart are deliberately dropped (at-most-once).
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QuotesConfig;
use crate::error::QuotesError;
use crate::exchange::ExchangeClient;
use crate::fetch::BarFetcher;
use crate::gaps::find_gaps;
use crate::proto::{pack, unpack, QuotesReply, QuotesRequest};
use crate::series::BarSeries;
use crate::store::BarStore;
use crate::timeframe::Timeframe;
use crate::timeutil::{now_ms, parse_utc_ms};

type LockKey = (String, String, String);

pub struct QuotesService {
    cfg: QuotesConfig,
    store: Arc<BarStore>,
    fetcher: BarFetcher,
    redis: redis::Client,
    locks: Mutex<AHashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuotesService {
    pub fn new(
        cfg: QuotesConfig,
        store: Arc<BarStore>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Result<Self, QuotesError> {
        let redis = redis::Client::open(cfg.redis_url.as_str())?;
        let fetcher = BarFetcher::new(Arc::clone(&store), exchange, cfg.fetch_limit);
        Ok(Self {
            cfg,
            store,
            fetcher,
            redis,
            locks: Mutex::new(AHashMap::new()),
        })
    }

    /// Dense series for `[t0, t1]`: read the store, fill every gap from the
    /// exchange, read again. Callers that need cross-request exclusion take
    /// the per-key lock first; this method itself is lock-free so tests can
    /// drive it without a bus.
    pub async fn get_quotes(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        t0: i64,
        t1: i64,
    ) -> Result<BarSeries, QuotesError> {
        if t0 > t1 {
            return Err(QuotesError::BadRange(format!(
                "history_start {t0} after history_end {t1}"
            )));
        }

        let series = self.store_get(source, symbol, tf, t0, t1).await?;
        let gaps = find_gaps(&series.time, tf.duration_ms(), t0, t1);
        if gaps.is_empty() {
            return Ok(series);
        }

        for (gap_start, gap_end) in gaps {
            info!(
                "Filling gap for {}/{}/{} from {} to {}",
                source, symbol, tf, gap_start, gap_end
            );
            self.fetcher
                .fetch_range(source, symbol, tf, gap_start, gap_end)
                .await?;
        }

        self.store_get(source, symbol, tf, t0, t1).await
    }

    async fn store_get(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        t0: i64,
        t1: i64,
    ) -> Result<BarSeries, QuotesError> {
        let store = Arc::clone(&self.store);
        let source = source.to_owned();
        let symbol = symbol.to_owned();
        tokio::task::spawn_blocking(move || store.get(&source, &symbol, tf, t0, t1))
            .await
            .map_err(|e| QuotesError::Internal(format!("store read task: {e}")))?
    }

    fn lock_for(&self, source: &str, symbol: &str, timeframe: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = (source.to_owned(), symbol.to_owned(), timeframe.to_owned());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key).or_default())
    }

    /// Main dispatch loop. Returns when `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), QuotesError> {
        self.cleanup_bus().await?;
        info!("Quotes service started. Listening on list: {}", self.cfg.request_list);

        let mut conn = self.redis.get_async_connection().await?;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            // 1s BRPOP timeout doubles as the shutdown poll interval.
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
                .arg(&self.cfg.request_list)
                .arg(1)
                .query_async(&mut conn)
                .await?;
            let Some((_, request_bytes)) = popped else {
                continue;
            };

            match unpack::<QuotesRequest>(&request_bytes) {
                Ok(request) if request.request_id.is_empty() => {
                    error!("Request missing request_id, skipping");
                }
                Ok(request) => {
                    debug!("Dispatching request {}", request.request_id);
                    let service = Arc::clone(&self);
                    tokio::spawn(async move { service.process_request(request).await });
                }
                Err(e) => error!("Error parsing request: {e}"),
            }
        }

        info!("Quotes service finished");
        Ok(())
    }

    async fn process_request(self: Arc<Self>, request: QuotesRequest) {
        let reply = match self.handle_request(&request).await {
            Ok(series) => {
                info!(
                    "Processed request {} for {}:{}:{} ({} bars)",
                    request.request_id,
                    request.source,
                    request.symbol,
                    request.timeframe,
                    series.len()
                );
                QuotesReply::success(&request.request_id, &series)
            }
            Err(e) => {
                warn!("Request {} failed: {e}", request.request_id);
                QuotesReply::error(&request.request_id, &e.to_string())
            }
        };

        if let Err(e) = self.send_reply(&request.request_id, &reply).await {
            error!("Failed to deliver reply for {}: {e}", request.request_id);
        }
    }

    async fn handle_request(&self, request: &QuotesRequest) -> Result<BarSeries, QuotesError> {
        let tf: Timeframe = request.timeframe.parse()?;
        let t0 = parse_utc_ms(&request.history_start)?;
        let t1 = match &request.history_end {
            Some(end) => parse_utc_ms(end)?,
            None => now_ms(),
        };

        let lock = self.lock_for(&request.source, &request.symbol, &request.timeframe);
        let _guard = lock.lock().await;
        debug!(
            "Processing request {} for {}:{}:{} (locked)",
            request.request_id, request.source, request.symbol, request.timeframe
        );
        self.get_quotes(&request.source, &request.symbol, tf, t0, t1)
            .await
    }

    async fn send_reply(&self, request_id: &str, reply: &QuotesReply) -> Result<(), QuotesError> {
        let slot = format!("{}:{}", self.cfg.response_prefix, request_id);
        let bytes = pack(reply)?;
        let mut conn = self.redis.get_async_connection().await?;
        redis::cmd("LPUSH")
            .arg(&slot)
            .arg(bytes)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&slot)
            .arg(self.cfg.response_ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Drop the inbound queue and any stale reply slots from a previous run.
    async fn cleanup_bus(&self) -> Result<(), QuotesError> {
        let mut conn = self.redis.get_async_connection().await?;
        for pattern in [
            self.cfg.request_list.clone(),
            format!("{}:*", self.cfg.response_prefix),
        ] {
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                info!("Cleaned {} keys matching pattern: {}", keys.len(), pattern);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::{MockExchange, H1};

    fn test_config(dir: &std::path::Path) -> QuotesConfig {
        QuotesConfig {
            redis_url: "redis://127.0.0.1:6399/15".into(), // never connected in these tests
            request_list: "quotes:requests".into(),
            response_prefix: "quotes:responses".into(),
            response_ttl_secs: 300,
            data_dir: dir.to_path_buf(),
            exchange_rest_url: String::new(),
            fetch_limit: 1000,
            client_timeout_secs: 30,
        }
    }

    fn service_with(dir: &std::path::Path, exchange: Arc<MockExchange>) -> QuotesService {
        let store = Arc::new(BarStore::new(dir));
        QuotesService::new(test_config(dir), store, exchange).unwrap()
    }

    #[tokio::test]
    async fn gap_fill_then_reuse_without_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::hourly(30));
        let service = service_with(dir.path(), Arc::clone(&exchange));

        // Empty store: one gap, fetched from upstream.
        let first = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();
        assert_eq!(first.len(), 24);
        assert_eq!(first.time, (0..24).map(|i| i * H1).collect::<Vec<_>>());
        let calls_after_first = exchange.call_count();
        assert!(calls_after_first > 0);

        // Same request again: dense store, no upstream traffic.
        let second = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(exchange.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn overlapping_requests_merge_into_one_series() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::hourly(30));
        let service = service_with(dir.path(), Arc::clone(&exchange));

        // A small window first...
        let small = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 2 * H1, 4 * H1)
            .await
            .unwrap();
        assert_eq!(small.time, vec![2 * H1, 3 * H1, 4 * H1]);

        // ...then the full day: leading and trailing gaps fill around it.
        let full = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();
        assert_eq!(full.len(), 24);
        let calls_after_full = exchange.call_count();

        // Repeat of the full request is served entirely from the store.
        let again = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();
        assert_eq!(again, full);
        assert_eq!(exchange.call_count(), calls_after_full);
    }

    #[tokio::test]
    async fn misordered_range_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::hourly(5));
        let service = service_with(dir.path(), exchange);

        let err = service
            .get_quotes("binance", "BTC/USDT", Timeframe::H1, 2 * H1, H1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotesError::BadRange(_)));
    }

    #[test]
    fn lock_map_reuses_entries_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::hourly(1));
        let service = service_with(dir.path(), exchange);

        let a = service.lock_for("binance", "BTC/USDT", "1h");
        let b = service.lock_for("binance", "BTC/USDT", "1h");
        let c = service.lock_for("binance", "ETH/USDT", "1h");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(service.locks.lock().unwrap().len(), 2);
    }
}
