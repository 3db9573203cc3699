/// strategy.rs — Strategy ABI and the compile-time strategy registry
///
/// Strategies are plugins compiled into the worker and selected by the
/// task's `file_name`. Each one exposes a static parameters description
/// (`name -> (default, description)`) so the outside world can render and
/// validate the `parameters` dictionary before a run starts.
use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

use crate::broker::BacktestBroker;
use crate::ta::{params, TaProxy};
use crate::task::{MessageLevel, TaskStore};

/// OHLCV prefix and run state handed to the strategy on every bar.
pub struct BarContext<'a> {
    pub index: usize,
    /// Bar open time, epoch ms.
    pub time: i64,
    /// Current price (the bar close).
    pub price: f64,
    pub times: &'a [i64],
    pub open: &'a [f64],
    pub high: &'a [f64],
    pub low: &'a [f64],
    pub close: &'a [f64],
    pub volume: &'a [f64],
    pub equity_usd: f64,
    pub equity_symbol: f64,
    /// Control channel, absent in standalone runs.
    pub store: Option<&'a TaskStore>,
    pub task_id: u64,
}

impl BarContext<'_> {
    /// Send a MESSAGE envelope to the task's subscribers. A no-op without a
    /// connected store; delivery failures are logged, never raised.
    pub fn log(&self, level: MessageLevel, message: &str) {
        if let Some(store) = self.store {
            if let Err(e) = store.send_message(self.task_id, level, message) {
                tracing::error!("Strategy log delivery failed: {e}");
            }
        }
    }
}

pub struct StartContext<'a> {
    pub parameters: &'a Map<String, Value>,
    pub ta: &'a mut TaProxy,
}

pub type ParamsDescription = BTreeMap<&'static str, (Value, &'static str)>;

pub trait Strategy: Send {
    fn on_start(&mut self, _ctx: &mut StartContext) -> Result<()> {
        Ok(())
    }

    fn on_bar(
        &mut self,
        broker: &mut BacktestBroker,
        ta: &mut TaProxy,
        bar: &BarContext,
    ) -> Result<()>;

    fn on_finish(&mut self, _broker: &mut BacktestBroker) -> Result<()> {
        Ok(())
    }
}

/// Instantiate a strategy by its registered name.
pub fn create_strategy(file_name: &str) -> Result<Box<dyn Strategy>> {
    match file_name {
        SmaCross::NAME => Ok(Box::new(SmaCross::default())),
        BreakoutSltp::NAME => Ok(Box::new(BreakoutSltp::default())),
        other => Err(anyhow!("unknown strategy '{other}'")),
    }
}

pub fn available_strategies() -> &'static [&'static str] {
    &[SmaCross::NAME, BreakoutSltp::NAME]
}

pub fn strategy_parameters(file_name: &str) -> Result<ParamsDescription> {
    match file_name {
        SmaCross::NAME => Ok(SmaCross::parameters_description()),
        BreakoutSltp::NAME => Ok(BreakoutSltp::parameters_description()),
        other => Err(anyhow!("unknown strategy '{other}'")),
    }
}

fn param_f64(parameters: &Map<String, Value>, key: &str, default: f64) -> f64 {
    parameters.get(key).and_then(Value::as_f64).unwrap_or(default)
}

// ── sma_cross ─────────────────────────────────────────────────────────────

/// Classic two-average crossover on automatic deals: long above, short
/// below, flipping through the broker's split logic.
pub struct SmaCross {
    fast: f64,
    slow: f64,
    quantity: f64,
    position: f64,
}

impl Default for SmaCross {
    fn default() -> Self {
        Self {
            fast: 10.0,
            slow: 20.0,
            quantity: 1.0,
            position: 0.0,
        }
    }
}

impl SmaCross {
    pub const NAME: &'static str = "sma_cross";

    pub fn parameters_description() -> ParamsDescription {
        BTreeMap::from([
            ("fast", (Value::from(10.0), "Fast moving average period")),
            ("slow", (Value::from(20.0), "Slow moving average period")),
            ("quantity", (Value::from(1.0), "Position size in symbol units")),
        ])
    }
}

impl Strategy for SmaCross {
    fn on_start(&mut self, ctx: &mut StartContext) -> Result<()> {
        self.fast = param_f64(ctx.parameters, "fast", self.fast);
        self.slow = param_f64(ctx.parameters, "slow", self.slow);
        self.quantity = param_f64(ctx.parameters, "quantity", self.quantity);
        self.position = 0.0;
        Ok(())
    }

    fn on_bar(
        &mut self,
        broker: &mut BacktestBroker,
        ta: &mut TaProxy,
        bar: &BarContext,
    ) -> Result<()> {
        if (bar.index as f64) < self.slow {
            return Ok(());
        }

        let fast = ta.call("SMA", &params(&[("timeperiod", self.fast)]), bar.index)?;
        let slow = ta.call("SMA", &params(&[("timeperiod", self.slow)]), bar.index)?;
        let (fast, slow) = (&fast[0], &slow[0]);
        let i = bar.index;
        if fast[i].is_nan() || slow[i].is_nan() || fast[i - 1].is_nan() || slow[i - 1].is_nan() {
            return Ok(());
        }

        let crossed_up = fast[i] > slow[i] && fast[i - 1] <= slow[i - 1];
        let crossed_down = fast[i] < slow[i] && fast[i - 1] >= slow[i - 1];

        if crossed_up && self.position <= 0.0 {
            let quantity = broker.round_amount(self.quantity + self.position.abs());
            broker.buy(quantity, None, None)?;
            self.position += quantity;
        } else if crossed_down && self.position >= 0.0 {
            let quantity = broker.round_amount(self.quantity + self.position);
            broker.sell(quantity, None, None)?;
            self.position -= quantity;
        }
        Ok(())
    }
}

// ── breakout_sltp ─────────────────────────────────────────────────────────

/// Enters long at market on a breakout above the lookback high, protected by
/// a two-leg stop-loss and a single take-profit.
pub struct BreakoutSltp {
    lookback: f64,
    quantity: f64,
    stop_frac: f64,
    take_frac: f64,
    open_deal: Option<u64>,
}

impl Default for BreakoutSltp {
    fn default() -> Self {
        Self {
            lookback: 24.0,
            quantity: 1.0,
            stop_frac: 0.02,
            take_frac: 0.04,
            open_deal: None,
        }
    }
}

impl BreakoutSltp {
    pub const NAME: &'static str = "breakout_sltp";

    pub fn parameters_description() -> ParamsDescription {
        BTreeMap::from([
            ("lookback", (Value::from(24.0), "Breakout lookback window in bars")),
            ("quantity", (Value::from(1.0), "Entry size in symbol units")),
            ("stop_frac", (Value::from(0.02), "Stop-loss distance as a fraction of entry price")),
            ("take_frac", (Value::from(0.04), "Take-profit distance as a fraction of entry price")),
        ])
    }
}

impl Strategy for BreakoutSltp {
    fn on_start(&mut self, ctx: &mut StartContext) -> Result<()> {
        self.lookback = param_f64(ctx.parameters, "lookback", self.lookback);
        self.quantity = param_f64(ctx.parameters, "quantity", self.quantity);
        self.stop_frac = param_f64(ctx.parameters, "stop_frac", self.stop_frac);
        self.take_frac = param_f64(ctx.parameters, "take_frac", self.take_frac);
        self.open_deal = None;
        Ok(())
    }

    fn on_bar(
        &mut self,
        broker: &mut BacktestBroker,
        _ta: &mut TaProxy,
        bar: &BarContext,
    ) -> Result<()> {
        // Only one protected deal at a time.
        if let Some(deal_id) = self.open_deal {
            if !broker.deal(deal_id)?.is_closed {
                return Ok(());
            }
            self.open_deal = None;
        }

        let lookback = self.lookback as usize;
        if bar.index < lookback {
            return Ok(());
        }
        let window = &bar.high[bar.index - lookback..bar.index];
        let breakout_level = window.iter().copied().fold(f64::MIN, f64::max);
        if bar.price <= breakout_level {
            return Ok(());
        }

        let near_stop = broker.round_price(bar.price * (1.0 - self.stop_frac));
        let far_stop = broker.round_price(bar.price * (1.0 - 2.0 * self.stop_frac));
        let take = broker.round_price(bar.price * (1.0 + self.take_frac));
        self.open_deal = broker.buy_sltp(
            &[(broker.round_amount(self.quantity), None)],
            &[(Some(0.5), near_stop), (None, far_stop)],
            &[(None, take)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_known_strategies() {
        assert!(create_strategy("sma_cross").is_ok());
        assert!(create_strategy("breakout_sltp").is_ok());
        assert!(create_strategy("mystery").is_err());
        assert_eq!(available_strategies().len(), 2);
    }

    #[test]
    fn parameter_descriptions_carry_defaults() {
        let desc = strategy_parameters("sma_cross").unwrap();
        let (default, description) = &desc["fast"];
        assert_eq!(default.as_f64(), Some(10.0));
        assert!(!description.is_empty());
        assert!(strategy_parameters("mystery").is_err());
    }

    #[test]
    fn on_start_reads_parameters() {
        let mut parameters = Map::new();
        parameters.insert("fast".into(), Value::from(3.0));
        parameters.insert("slow".into(), Value::from(5.0));

        let series: quotes_service::series::BarSeries = (0..10)
            .map(|i| quotes_service::series::Bar {
                time: i * 60_000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let mut ta = TaProxy::new(&series);
        let mut strategy = SmaCross::default();
        strategy
            .on_start(&mut StartContext {
                parameters: &parameters,
                ta: &mut ta,
            })
            .unwrap();
        assert_eq!(strategy.fast, 3.0);
        assert_eq!(strategy.slow, 5.0);
    }
}
