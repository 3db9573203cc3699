/// ta.rs — Technical-analysis accessors for strategies
///
/// Indicators are computed once over the full OHLCV columns, memoized by
/// `(name, sorted parameters)`, and handed to the strategy as the slice up to
/// the current bar. Each indicator declares its positional inputs; lookback
/// bars are NaN-padded so output series stay aligned with the bar series.
use std::collections::BTreeMap;

use ahash::AHashMap;
use anyhow::{anyhow, bail, Result};

use quotes_service::series::BarSeries;

pub type TaParams = BTreeMap<String, f64>;

/// A single- or multi-series indicator result over the full history.
#[derive(Debug, Clone)]
pub enum TaOutput {
    Single(Vec<f64>),
    Multi(Vec<Vec<f64>>),
}

impl TaOutput {
    fn slice_to(&self, upto: usize) -> Vec<Vec<f64>> {
        let end = upto + 1;
        match self {
            TaOutput::Single(series) => vec![series[..end.min(series.len())].to_vec()],
            TaOutput::Multi(series) => series
                .iter()
                .map(|s| s[..end.min(s.len())].to_vec())
                .collect(),
        }
    }
}

struct Inputs<'a> {
    high: &'a [f64],
    low: &'a [f64],
    close: &'a [f64],
    volume: &'a [f64],
}

struct IndicatorSpec {
    /// Positional inputs drawn from the OHLCV columns plus declared
    /// parameters ("periods" style names).
    inputs: &'static [&'static str],
    compute: fn(&Inputs, &TaParams) -> Result<TaOutput>,
}

static REGISTRY: &[(&str, IndicatorSpec)] = &[
    ("SMA", IndicatorSpec { inputs: &["close", "periods"], compute: calc_sma }),
    ("EMA", IndicatorSpec { inputs: &["close", "periods"], compute: calc_ema }),
    ("RSI", IndicatorSpec { inputs: &["close", "periods"], compute: calc_rsi }),
    ("ROC", IndicatorSpec { inputs: &["close", "periods"], compute: calc_roc }),
    ("ATR", IndicatorSpec { inputs: &["high", "low", "close", "periods"], compute: calc_atr }),
    ("OBV", IndicatorSpec { inputs: &["close", "volume"], compute: calc_obv }),
    ("MACD", IndicatorSpec { inputs: &["close", "periods"], compute: calc_macd }),
    ("BBANDS", IndicatorSpec { inputs: &["close", "periods"], compute: calc_bbands }),
];

fn registry() -> &'static [(&'static str, IndicatorSpec)] {
    REGISTRY
}

/// Indicator accessor bound to one bar series.
pub struct TaProxy {
    series: BarSeries,
    cache: AHashMap<String, TaOutput>,
}

impl TaProxy {
    pub fn new(series: &BarSeries) -> Self {
        Self {
            series: series.clone(),
            cache: AHashMap::new(),
        }
    }

    /// Names of every indicator this proxy can compute.
    pub fn available() -> Vec<&'static str> {
        registry().iter().map(|(name, _)| *name).collect()
    }

    /// Declared positional inputs of one indicator.
    pub fn inputs(name: &str) -> Option<&'static [&'static str]> {
        registry()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, spec)| spec.inputs)
    }

    /// Indicator series sliced to `[0, upto]`. Multi-output indicators
    /// return one vector per output series.
    pub fn call(&mut self, name: &str, params: &TaParams, upto: usize) -> Result<Vec<Vec<f64>>> {
        if upto >= self.series.len() {
            bail!("bar index {upto} out of range ({} bars)", self.series.len());
        }
        let key = cache_key(name, params);
        if !self.cache.contains_key(&key) {
            let spec = registry()
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, spec)| spec)
                .ok_or_else(|| anyhow!("unknown indicator '{name}'"))?;
            let inputs = Inputs {
                high: &self.series.high,
                low: &self.series.low,
                close: &self.series.close,
                volume: &self.series.volume,
            };
            let output = (spec.compute)(&inputs, params)?;
            self.cache.insert(key.clone(), output);
        }
        Ok(self.cache[&key].slice_to(upto))
    }

    /// Convenience: the last value of a single-output indicator at `upto`.
    pub fn value(&mut self, name: &str, params: &TaParams, upto: usize) -> Result<f64> {
        let sliced = self.call(name, params, upto)?;
        sliced
            .first()
            .and_then(|s| s.last().copied())
            .ok_or_else(|| anyhow!("indicator '{name}' returned no data"))
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

fn cache_key(name: &str, params: &TaParams) -> String {
    // BTreeMap iterates sorted, so equal parameter sets collide.
    let mut key = name.to_owned();
    for (k, v) in params {
        key.push_str(&format!(";{k}={v}"));
    }
    key
}

pub fn params(pairs: &[(&str, f64)]) -> TaParams {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), *v))
        .collect()
}

fn period_param(params: &TaParams, key: &str, default: f64) -> Result<usize> {
    let raw = params.get(key).copied().unwrap_or(default);
    if raw < 1.0 || raw.fract() != 0.0 {
        bail!("parameter {key} must be a positive integer, got {raw}");
    }
    Ok(raw as usize)
}

// ── Rolling computations ──────────────────────────────────────────────────

fn calc_sma(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 30.0)?;
    Ok(TaOutput::Single(sma(inputs.close, period)))
}

fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = sum / period as f64;
        }
    }
    out
}

fn calc_ema(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 30.0)?;
    Ok(TaOutput::Single(ema(inputs.close, period)))
}

/// Seeded with the SMA of the first `period` values, then recursive.
fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < period {
        return out;
    }
    let mut value: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = value;
    let multiplier = 2.0 / (period as f64 + 1.0);
    for i in period..values.len() {
        value = (values[i] - value) * multiplier + value;
        out[i] = value;
    }
    out
}

fn calc_rsi(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 14.0)?;
    let close = inputs.close;
    let mut out = vec![f64::NAN; close.len()];
    if close.len() <= period {
        return Ok(TaOutput::Single(out));
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = close[i] - close[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    // Wilder smoothing from there on.
    for i in period + 1..close.len() {
        let delta = close[i] - close[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    Ok(TaOutput::Single(out))
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

fn calc_roc(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 10.0)?;
    let close = inputs.close;
    let mut out = vec![f64::NAN; close.len()];
    for i in period..close.len() {
        if close[i - period] != 0.0 {
            out[i] = (close[i] / close[i - period] - 1.0) * 100.0;
        }
    }
    Ok(TaOutput::Single(out))
}

fn calc_atr(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 14.0)?;
    let n = inputs.close.len();
    let mut out = vec![f64::NAN; n];
    if n <= period {
        return Ok(TaOutput::Single(out));
    }

    let true_range = |i: usize| -> f64 {
        let hl = inputs.high[i] - inputs.low[i];
        if i == 0 {
            return hl;
        }
        let hc = (inputs.high[i] - inputs.close[i - 1]).abs();
        let lc = (inputs.low[i] - inputs.close[i - 1]).abs();
        hl.max(hc).max(lc)
    };

    let mut atr: f64 = (1..=period).map(true_range).sum::<f64>() / period as f64;
    out[period] = atr;
    for i in period + 1..n {
        atr = (atr * (period as f64 - 1.0) + true_range(i)) / period as f64;
        out[i] = atr;
    }
    Ok(TaOutput::Single(out))
}

fn calc_obv(inputs: &Inputs, _params: &TaParams) -> Result<TaOutput> {
    let close = inputs.close;
    let mut out = vec![0.0; close.len()];
    let mut obv = 0.0;
    for i in 0..close.len() {
        if i > 0 {
            if close[i] > close[i - 1] {
                obv += inputs.volume[i];
            } else if close[i] < close[i - 1] {
                obv -= inputs.volume[i];
            }
        } else {
            obv = inputs.volume[0];
        }
        out[i] = obv;
    }
    Ok(TaOutput::Single(out))
}

fn calc_macd(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let fast = period_param(params, "fastperiod", 12.0)?;
    let slow = period_param(params, "slowperiod", 26.0)?;
    let signal_period = period_param(params, "signalperiod", 9.0)?;
    if fast >= slow {
        bail!("fastperiod must be below slowperiod");
    }

    let fast_ema = ema(inputs.close, fast);
    let slow_ema = ema(inputs.close, slow);
    let macd: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect();

    // Signal line: EMA over the defined region of the MACD line.
    let defined_from = slow - 1;
    let defined: Vec<f64> = macd[defined_from..].to_vec();
    let signal_defined = ema(&defined, signal_period);
    let mut signal = vec![f64::NAN; macd.len()];
    signal[defined_from..].copy_from_slice(&signal_defined);

    let hist: Vec<f64> = macd.iter().zip(&signal).map(|(m, s)| m - s).collect();
    Ok(TaOutput::Multi(vec![macd, signal, hist]))
}

fn calc_bbands(inputs: &Inputs, params: &TaParams) -> Result<TaOutput> {
    let period = period_param(params, "timeperiod", 20.0)?;
    let nbdev = params.get("nbdev").copied().unwrap_or(2.0);
    let close = inputs.close;

    let middle = sma(close, period);
    let mut upper = vec![f64::NAN; close.len()];
    let mut lower = vec![f64::NAN; close.len()];
    for i in (period - 1)..close.len() {
        let window = &close[i + 1 - period..=i];
        let mean = middle[i];
        let variance =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let dev = variance.sqrt() * nbdev;
        upper[i] = mean + dev;
        lower[i] = mean - dev;
    }
    Ok(TaOutput::Multi(vec![upper, middle, lower]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotes_service::series::Bar;

    fn series(closes: &[f64]) -> BarSeries {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                time: i as i64 * 60_000,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn sma_values_and_lookback() {
        let mut ta = TaProxy::new(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        let out = ta.call("SMA", &params(&[("timeperiod", 3.0)]), 4).unwrap();
        let s = &out[0];
        assert!(s[0].is_nan() && s[1].is_nan());
        assert_eq!(s[2], 2.0);
        assert_eq!(s[3], 3.0);
        assert_eq!(s[4], 4.0);
    }

    #[test]
    fn slicing_stops_at_current_bar() {
        let mut ta = TaProxy::new(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        let out = ta.call("SMA", &params(&[("timeperiod", 2.0)]), 2).unwrap();
        assert_eq!(out[0].len(), 3);
        assert!(ta
            .call("SMA", &params(&[("timeperiod", 2.0)]), 10)
            .is_err());
    }

    #[test]
    fn results_are_memoized_per_parameter_set() {
        let mut ta = TaProxy::new(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        ta.call("SMA", &params(&[("timeperiod", 2.0)]), 4).unwrap();
        ta.call("SMA", &params(&[("timeperiod", 2.0)]), 2).unwrap();
        assert_eq!(ta.cached_count(), 1);
        ta.call("SMA", &params(&[("timeperiod", 3.0)]), 4).unwrap();
        assert_eq!(ta.cached_count(), 2);
    }

    #[test]
    fn ema_seeds_with_sma() {
        let mut ta = TaProxy::new(&series(&[2.0, 4.0, 6.0, 8.0]));
        let out = ta.call("EMA", &params(&[("timeperiod", 2.0)]), 3).unwrap();
        let s = &out[0];
        assert!(s[0].is_nan());
        assert_eq!(s[1], 3.0); // SMA seed
        // multiplier 2/3: 3 + (6-3)*2/3 = 5
        assert!((s[2] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_is_100_on_monotonic_rise() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let mut ta = TaProxy::new(&series(&closes));
        let value = ta
            .value("RSI", &params(&[("timeperiod", 14.0)]), 19)
            .unwrap();
        assert!((value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn macd_has_three_series() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let mut ta = TaProxy::new(&series(&closes));
        let out = ta.call("MACD", &TaParams::new(), 59).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), 60);
        // Histogram is macd - signal wherever both are defined.
        let (macd, signal, hist) = (&out[0], &out[1], &out[2]);
        for i in 0..60 {
            if !macd[i].is_nan() && !signal[i].is_nan() {
                assert!((hist[i] - (macd[i] - signal[i])).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn bbands_are_symmetric_around_middle() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let mut ta = TaProxy::new(&series(&closes));
        let out = ta
            .call("BBANDS", &params(&[("timeperiod", 5.0), ("nbdev", 2.0)]), 29)
            .unwrap();
        let (upper, middle, lower) = (&out[0], &out[1], &out[2]);
        for i in 4..30 {
            assert!((upper[i] - middle[i] - (middle[i] - lower[i])).abs() < 1e-9);
            assert!(upper[i] >= lower[i]);
        }
    }

    #[test]
    fn registry_declares_inputs() {
        assert!(TaProxy::available().contains(&"ATR"));
        assert_eq!(
            TaProxy::inputs("ATR").unwrap(),
            &["high", "low", "close", "periods"]
        );
        assert!(TaProxy::inputs("NOPE").is_none());
    }

    #[test]
    fn unknown_indicator_is_an_error() {
        let mut ta = TaProxy::new(&series(&[1.0, 2.0]));
        assert!(ta.call("WAGMI", &TaParams::new(), 1).is_err());
    }
}
