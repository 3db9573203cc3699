/// series.rs — OHLCV bars and their column-oriented container
///
/// Bars are immutable once closed; a `BarSeries` keeps the six columns as
/// parallel vectors, which is the shape both the parquet store and the wire
/// protocol want.
use serde::{Deserialize, Serialize};

/// One closed OHLCV bar. `time` is the bar open in epoch milliseconds,
/// aligned to the timeframe boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// `low <= open, close <= high` and non-negative volume.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// Column-oriented bar sequence, ordered by time ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarSeries {
    pub time: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            time: Vec::with_capacity(n),
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn push(&mut self, bar: Bar) {
        self.time.push(bar.time);
        self.open.push(bar.open);
        self.high.push(bar.high);
        self.low.push(bar.low);
        self.close.push(bar.close);
        self.volume.push(bar.volume);
    }

    pub fn bar(&self, i: usize) -> Bar {
        Bar {
            time: self.time[i],
            open: self.open[i],
            high: self.high[i],
            low: self.low[i],
            close: self.close[i],
            volume: self.volume[i],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Bar> + '_ {
        (0..self.len()).map(|i| self.bar(i))
    }

    /// Check per-bar OHLC sanity plus strictly increasing times aligned to
    /// the given bar length.
    pub fn is_valid(&self, tf_ms: i64) -> bool {
        for i in 0..self.len() {
            if !self.bar(i).is_valid() {
                return false;
            }
            if self.time[i] % tf_ms != 0 {
                return false;
            }
            if i > 0 && self.time[i] <= self.time[i - 1] {
                return false;
            }
        }
        true
    }
}

impl FromIterator<Bar> for BarSeries {
    fn from_iter<I: IntoIterator<Item = Bar>>(iter: I) -> Self {
        let mut series = BarSeries::new();
        for bar in iter {
            series.push(bar);
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(time: i64, price: f64) -> Bar {
        Bar {
            time,
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 10.0,
        }
    }

    #[test]
    fn push_and_read_back() {
        let mut series = BarSeries::new();
        series.push(bar(0, 100.0));
        series.push(bar(60_000, 101.0));
        assert_eq!(series.len(), 2);
        assert_eq!(series.bar(1).close, 101.0);
    }

    #[test]
    fn validity_checks_order_and_alignment() {
        let series: BarSeries = [bar(0, 100.0), bar(60_000, 101.0)].into_iter().collect();
        assert!(series.is_valid(60_000));

        let unaligned: BarSeries = [bar(1, 100.0)].into_iter().collect();
        assert!(!unaligned.is_valid(60_000));

        let out_of_order: BarSeries =
            [bar(60_000, 100.0), bar(0, 101.0)].into_iter().collect();
        assert!(!out_of_order.is_valid(60_000));
    }

    #[test]
    fn bad_ohlc_is_invalid() {
        let broken = Bar {
            time: 0,
            open: 100.0,
            high: 99.0, // high below open
            low: 98.0,
            close: 98.5,
            volume: 1.0,
        };
        assert!(!broken.is_valid());
    }
}
