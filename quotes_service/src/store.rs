/// store.rs — Parquet-backed Bar Store
///
/// Durable, queryable storage of closed OHLCV bars keyed by
/// `(source, symbol, timeframe, time)`. One parquet file per key triple under
/// the data directory; the time column keys rows inside a file.
///
/// Exchanges only emit immutable closed bars, so insertion rejects any
/// collision with an existing `(.., time)` row and gap-fill retries stay
/// safe.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, info};

use crate::error::QuotesError;
use crate::series::BarSeries;
use crate::timeframe::Timeframe;

pub struct BarStore {
    data_dir: PathBuf,
}

impl BarStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn file_path(&self, source: &str, symbol: &str, tf: Timeframe) -> PathBuf {
        let sanitized = symbol.replace(['/', ':'], "-");
        self.data_dir
            .join(source)
            .join(format!("{sanitized}_{tf}.parquet"))
    }

    /// Bars in `[t0, t1]` (inclusive, epoch ms), ordered by time ascending.
    /// Missing file or empty range yields an empty series.
    pub fn get(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        t0: i64,
        t1: i64,
    ) -> Result<BarSeries, QuotesError> {
        let path = self.file_path(source, symbol, tf);
        if !path.exists() || t0 > t1 {
            return Ok(BarSeries::new());
        }

        let df = read_frame(&path)?;
        let filtered = df
            .lazy()
            .filter(col("time").gt_eq(lit(t0)).and(col("time").lt_eq(lit(t1))))
            .sort(["time"], Default::default())
            .collect()?;

        let series = frame_to_series(&filtered)?;
        debug!(
            "Store read {} bars for {}:{}:{} in [{}, {}]",
            series.len(),
            source,
            symbol,
            tf,
            t0,
            t1
        );
        Ok(series)
    }

    /// Append bars, rejecting the whole batch if any incoming time collides
    /// with an existing row.
    pub fn insert(
        &self,
        source: &str,
        symbol: &str,
        tf: Timeframe,
        bars: &BarSeries,
    ) -> Result<(), QuotesError> {
        if bars.is_empty() {
            return Ok(());
        }

        let path = self.file_path(source, symbol, tf);
        let mut merged = if path.exists() {
            let existing = frame_to_series(&read_frame(&path)?)?;
            let known: HashSet<i64> = existing.time.iter().copied().collect();
            let duplicates: Vec<i64> = bars
                .time
                .iter()
                .copied()
                .filter(|t| known.contains(t))
                .collect();
            if !duplicates.is_empty() {
                return Err(QuotesError::DuplicateBars(format!(
                    "{source}/{symbol}/{tf}: {} colliding bar times (first {})",
                    duplicates.len(),
                    duplicates[0]
                )));
            }
            existing
        } else {
            BarSeries::new()
        };

        for bar in bars.iter() {
            merged.push(bar);
        }
        sort_by_time(&mut merged);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut df = series_to_frame(&merged)?;
        let mut file = fs::File::create(&path)?;
        ParquetWriter::new(&mut file).finish(&mut df)?;

        info!(
            "Saved {} bars to store ({}/{}/{}), file now holds {}",
            bars.len(),
            source,
            symbol,
            tf,
            merged.len()
        );
        Ok(())
    }
}

fn read_frame(path: &Path) -> Result<DataFrame, QuotesError> {
    let file = fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

fn series_to_frame(series: &BarSeries) -> Result<DataFrame, QuotesError> {
    Ok(df!(
        "time" => series.time.clone(),
        "open" => series.open.clone(),
        "high" => series.high.clone(),
        "low" => series.low.clone(),
        "close" => series.close.clone(),
        "volume" => series.volume.clone(),
    )?)
}

fn frame_to_series(df: &DataFrame) -> Result<BarSeries, QuotesError> {
    Ok(BarSeries {
        time: df.column("time")?.i64()?.into_no_null_iter().collect(),
        open: df.column("open")?.f64()?.into_no_null_iter().collect(),
        high: df.column("high")?.f64()?.into_no_null_iter().collect(),
        low: df.column("low")?.f64()?.into_no_null_iter().collect(),
        close: df.column("close")?.f64()?.into_no_null_iter().collect(),
        volume: df.column("volume")?.f64()?.into_no_null_iter().collect(),
    })
}

fn sort_by_time(series: &mut BarSeries) {
    let mut order: Vec<usize> = (0..series.len()).collect();
    order.sort_by_key(|&i| series.time[i]);
    let reindex_i64 = |v: &[i64]| order.iter().map(|&i| v[i]).collect::<Vec<_>>();
    let reindex_f64 = |v: &[f64]| order.iter().map(|&i| v[i]).collect::<Vec<_>>();
    series.time = reindex_i64(&series.time);
    series.open = reindex_f64(&series.open);
    series.high = reindex_f64(&series.high);
    series.low = reindex_f64(&series.low);
    series.close = reindex_f64(&series.close);
    series.volume = reindex_f64(&series.volume);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Bar;

    const H1: i64 = 3_600_000;

    fn hourly(times: &[i64]) -> BarSeries {
        times
            .iter()
            .map(|&t| Bar {
                time: t,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 5.0,
            })
            .collect()
    }

    #[test]
    fn get_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::new(dir.path());
        let got = store
            .get("binance", "BTC/USDT", Timeframe::H1, 0, 10 * H1)
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn insert_then_get_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::new(dir.path());
        store
            .insert("binance", "BTC/USDT", Timeframe::H1, &hourly(&[0, H1, 2 * H1, 3 * H1]))
            .unwrap();

        let got = store
            .get("binance", "BTC/USDT", Timeframe::H1, H1, 2 * H1)
            .unwrap();
        assert_eq!(got.time, vec![H1, 2 * H1]);

        // Inclusive at both ends
        let all = store
            .get("binance", "BTC/USDT", Timeframe::H1, 0, 3 * H1)
            .unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn colliding_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::new(dir.path());
        store
            .insert("binance", "BTC/USDT", Timeframe::H1, &hourly(&[0, H1]))
            .unwrap();

        let err = store
            .insert("binance", "BTC/USDT", Timeframe::H1, &hourly(&[H1, 2 * H1]))
            .unwrap_err();
        assert!(matches!(err, QuotesError::DuplicateBars(_)));

        // Nothing from the rejected batch leaked into the file
        let got = store
            .get("binance", "BTC/USDT", Timeframe::H1, 0, 3 * H1)
            .unwrap();
        assert_eq!(got.time, vec![0, H1]);
    }

    #[test]
    fn disjoint_inserts_merge_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::new(dir.path());
        store
            .insert("binance", "ETH/USDT", Timeframe::H1, &hourly(&[2 * H1, 3 * H1]))
            .unwrap();
        store
            .insert("binance", "ETH/USDT", Timeframe::H1, &hourly(&[0, H1]))
            .unwrap();

        let got = store
            .get("binance", "ETH/USDT", Timeframe::H1, 0, 3 * H1)
            .unwrap();
        assert_eq!(got.time, vec![0, H1, 2 * H1, 3 * H1]);
    }

    #[test]
    fn keys_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarStore::new(dir.path());
        store
            .insert("binance", "BTC/USDT", Timeframe::H1, &hourly(&[0]))
            .unwrap();
        store
            .insert("binance", "BTC/USDT", Timeframe::M1, &hourly(&[0]))
            .unwrap();

        let h1 = store.get("binance", "BTC/USDT", Timeframe::H1, 0, H1).unwrap();
        let m1 = store.get("binance", "BTC/USDT", Timeframe::M1, 0, H1).unwrap();
        assert_eq!(h1.len(), 1);
        assert_eq!(m1.len(), 1);
    }
}
