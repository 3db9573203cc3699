/// fetch.rs — Gap-filling bar fetcher
///
/// Pulls a missing `[t0, t1]` range from the upstream exchange in paginated
/// batches and persists it into the bar store. The most recently received
/// batch is held back unwritten: its last bar may still be an open candle.
/// When the next batch arrives the held one is known-closed and is saved;
/// at termination the last bar of the held batch is dropped before saving.
///
/// A batch error aborts the whole fetch and propagates. No retry here: the
/// caller owns the retry policy.
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::QuotesError;
use crate::exchange::ExchangeClient;
use crate::series::{Bar, BarSeries};
use crate::store::BarStore;
use crate::timeframe::Timeframe;

pub struct BarFetcher {
    store: Arc<BarStore>,
    exchange: Arc<dyn ExchangeClient>,
    fetch_limit: usize,
}

impl BarFetcher {
    pub fn new(store: Arc<BarStore>, exchange: Arc<dyn ExchangeClient>, fetch_limit: usize) -> Self {
        Self {
            store,
            exchange,
            fetch_limit,
        }
    }

    /// Fetch and persist all closed bars of `[t0, t1]` (inclusive, epoch ms).
    pub async fn fetch_range(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        t0: i64,
        t1: i64,
    ) -> Result<(), QuotesError> {
        if t0 > t1 {
            return Err(QuotesError::BadRange(format!("t0 {t0} > t1 {t1}")));
        }

        let tf_ms = tf.duration_ms();
        let mut since = t0;
        let mut held: Vec<Bar> = Vec::new();

        loop {
            if since > t1 {
                break;
            }

            // +2 bars of slack so the final batch always covers the closing
            // edge of the range plus the possibly-open candle.
            let bars_needed = ((t1 - since) as u64).div_ceil(tf_ms as u64) as usize + 2;
            let limit = bars_needed.min(self.fetch_limit);

            let batch = self
                .exchange
                .fetch_ohlcv(symbol, tf, since, limit)
                .await?;
            let Some(last) = batch.last() else {
                break; // exchange has nothing more for this range
            };
            debug!(
                "Fetched {} bars for {}/{}/{} since {}",
                batch.len(),
                source,
                symbol,
                tf,
                since
            );

            if !held.is_empty() {
                self.persist(source, symbol, tf, std::mem::take(&mut held))
                    .await?;
            }
            since = last.time + tf_ms;
            held = batch;
        }

        // The tail of the held batch may be an open candle; drop it.
        if !held.is_empty() {
            held.pop();
            if !held.is_empty() {
                self.persist(source, symbol, tf, held).await?;
            }
        }

        info!("Gap fill complete for {}/{}/{} [{}, {}]", source, symbol, tf, t0, t1);
        Ok(())
    }

    /// Store writes are file IO; keep them off the event loop.
    async fn persist(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        bars: Vec<Bar>,
    ) -> Result<(), QuotesError> {
        let store = Arc::clone(&self.store);
        let source = source.to_owned();
        let symbol = symbol.to_owned();
        tokio::task::spawn_blocking(move || {
            let series: BarSeries = bars.into_iter().collect();
            store.insert(&source, &symbol, tf, &series)
        })
        .await
        .map_err(|e| QuotesError::Internal(format!("store write task: {e}")))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    pub const H1: i64 = 3_600_000;

    /// Exchange stub backed by a fixed history, counting upstream calls.
    pub struct MockExchange {
        pub history: Vec<Bar>,
        pub calls: AtomicUsize,
    }

    impl MockExchange {
        pub fn hourly(n: usize) -> Self {
            let history = (0..n)
                .map(|i| Bar {
                    time: i as i64 * H1,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    volume: 1.0,
                })
                .collect();
            Self {
                history,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            since_ms: i64,
            limit: usize,
        ) -> Result<Vec<Bar>, QuotesError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .history
                .iter()
                .filter(|b| b.time >= since_ms)
                .take(limit)
                .copied()
                .collect())
        }
    }

    #[tokio::test]
    async fn paginated_fetch_drops_open_candle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BarStore::new(dir.path()));
        let exchange = Arc::new(MockExchange::hourly(30));
        let fetcher = BarFetcher::new(
            Arc::clone(&store),
            Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
            10,
        );

        fetcher
            .fetch_range("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();

        let got = store
            .get("binance", "BTC/USDT", Timeframe::H1, 0, 30 * H1)
            .unwrap();
        // 24 requested bars persisted; the held batch's final (open) candle
        // was dropped, not written.
        assert_eq!(got.time.first(), Some(&0));
        assert_eq!(got.time.last(), Some(&(23 * H1)));
        assert_eq!(got.len(), 24);
        // 25 bars of slack over a 10-bar cap: three upstream pages.
        assert_eq!(exchange.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_exchange_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BarStore::new(dir.path()));
        let exchange = Arc::new(MockExchange::hourly(0));
        let fetcher = BarFetcher::new(Arc::clone(&store), exchange, 10);

        fetcher
            .fetch_range("binance", "BTC/USDT", Timeframe::H1, 0, 23 * H1)
            .await
            .unwrap();

        let got = store
            .get("binance", "BTC/USDT", Timeframe::H1, 0, 30 * H1)
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BarStore::new(dir.path()));
        let exchange = Arc::new(MockExchange::hourly(5));
        let fetcher = BarFetcher::new(store, exchange, 10);

        let err = fetcher
            .fetch_range("binance", "BTC/USDT", Timeframe::H1, H1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotesError::BadRange(_)));
    }
}
