/// stats.rs — Running trading statistics
///
/// Fed one trade / one closed deal at a time by the broker. Equity follows
/// the same bookkeeping as the broker itself: buys add to the symbol leg and
/// subtract cost plus fee from the USD leg, sells do the reverse. Profit at
/// any tick is `equity_symbol * price + equity_usd - initial_equity_usd`.
use serde::Serialize;

use crate::types::{Deal, DealType, OrderSide, Trade};

#[derive(Debug, Clone, Serialize)]
pub struct TradingStats {
    pub initial_equity_usd: f64,
    #[serde(skip)]
    equity_symbol: f64,
    #[serde(skip)]
    equity_usd: f64,

    // ── Trades ───────────────────────────────────────────────────────
    pub total_trades: u64,
    pub buy_trades: u64,
    pub sell_trades: u64,
    /// Peak |equity_symbol| over the run.
    pub max_market_volume: f64,
    pub total_fees: f64,

    // ── Profit curve ─────────────────────────────────────────────────
    pub profit: f64,
    #[serde(skip)]
    profit_max: f64,
    pub drawdown_max: f64,

    // ── Deals ────────────────────────────────────────────────────────
    pub total_deals: u64,
    pub long_deals: u64,
    pub short_deals: u64,
    pub profit_deals: u64,
    pub loss_deals: u64,
    pub profit_long: f64,
    pub profit_short: f64,
    pub avg_profit_per_winning_deal: Option<f64>,
    pub avg_loss_per_losing_deal: Option<f64>,
    #[serde(skip)]
    total_profit_winning: f64,
    #[serde(skip)]
    total_loss_losing: f64,

    // ── Derived (calc_stat) ──────────────────────────────────────────
    pub profit_per_deal: Option<f64>,
    pub profit_gross: Option<f64>,

    // ── Run parameters, echoed into the results stream ───────────────
    pub fee_taker: f64,
    pub fee_maker: f64,
    pub slippage: f64,
    pub price_step: f64,
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    pub date_start: String,
    pub date_end: String,
}

pub struct StatsParams {
    pub initial_equity_usd: f64,
    pub fee_taker: f64,
    pub fee_maker: f64,
    pub slippage: f64,
    pub price_step: f64,
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    pub date_start: String,
    pub date_end: String,
}

impl TradingStats {
    pub fn new(params: StatsParams) -> Self {
        Self {
            initial_equity_usd: params.initial_equity_usd,
            equity_symbol: 0.0,
            equity_usd: params.initial_equity_usd,
            total_trades: 0,
            buy_trades: 0,
            sell_trades: 0,
            max_market_volume: 0.0,
            total_fees: 0.0,
            profit: 0.0,
            profit_max: 0.0,
            drawdown_max: 0.0,
            total_deals: 0,
            long_deals: 0,
            short_deals: 0,
            profit_deals: 0,
            loss_deals: 0,
            profit_long: 0.0,
            profit_short: 0.0,
            avg_profit_per_winning_deal: None,
            avg_loss_per_losing_deal: None,
            total_profit_winning: 0.0,
            total_loss_losing: 0.0,
            profit_per_deal: None,
            profit_gross: None,
            fee_taker: params.fee_taker,
            fee_maker: params.fee_maker,
            slippage: params.slippage,
            price_step: params.price_step,
            source: params.source,
            symbol: params.symbol,
            timeframe: params.timeframe,
            date_start: params.date_start,
            date_end: params.date_end,
        }
    }

    pub fn add_trade(&mut self, trade: &Trade) {
        self.total_trades += 1;
        match trade.side {
            OrderSide::Buy => {
                self.buy_trades += 1;
                self.equity_symbol += trade.quantity;
                self.equity_usd -= trade.sum + trade.fee;
            }
            OrderSide::Sell => {
                self.sell_trades += 1;
                self.equity_symbol -= trade.quantity;
                self.equity_usd += trade.sum - trade.fee;
            }
        }

        let abs_position = self.equity_symbol.abs();
        if abs_position > self.max_market_volume {
            self.max_market_volume = abs_position;
        }
        self.total_fees += trade.fee;

        // Mark the profit curve at the trade price.
        let profit =
            self.equity_symbol * trade.price + self.equity_usd - self.initial_equity_usd;
        self.profit = profit;
        if profit > self.profit_max {
            self.profit_max = profit;
        }
        let drawdown = self.profit_max - profit;
        if drawdown > self.drawdown_max {
            self.drawdown_max = drawdown;
        }
    }

    /// Register a closed deal. Empty deals (no trades) are ignored.
    pub fn add_deal(&mut self, deal: &Deal) {
        if deal.trade_ids.is_empty() {
            return;
        }
        self.total_deals += 1;

        match deal.deal_type {
            Some(DealType::Long) => self.long_deals += 1,
            Some(DealType::Short) => self.short_deals += 1,
            None => return,
        }

        let Some(profit) = deal.profit.filter(|_| deal.is_closed) else {
            return;
        };
        match deal.deal_type {
            Some(DealType::Long) => self.profit_long += profit,
            Some(DealType::Short) => self.profit_short += profit,
            None => {}
        }

        if profit > 0.0 {
            self.profit_deals += 1;
            self.total_profit_winning += profit;
            self.avg_profit_per_winning_deal =
                Some(self.total_profit_winning / self.profit_deals as f64);
        } else if profit < 0.0 {
            self.loss_deals += 1;
            self.total_loss_losing += profit;
            self.avg_loss_per_losing_deal =
                Some(self.total_loss_losing / self.loss_deals as f64);
        }
    }

    /// Derived aggregates, refreshed before each snapshot.
    pub fn calc_stat(&mut self) {
        self.profit_per_deal =
            (self.total_deals > 0).then(|| self.profit / self.total_deals as f64);
        self.profit_gross = Some(self.profit + self.total_fees);
    }

    pub fn equity_symbol(&self) -> f64 {
        self.equity_symbol
    }

    pub fn equity_usd(&self) -> f64 {
        self.equity_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> TradingStats {
        TradingStats::new(StatsParams {
            initial_equity_usd: 0.0,
            fee_taker: 0.001,
            fee_maker: 0.001,
            slippage: 0.0,
            price_step: 0.01,
            source: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "1h".into(),
            date_start: "2024-01-01T00:00:00".into(),
            date_end: "2024-01-02T00:00:00".into(),
        })
    }

    fn trade(side: OrderSide, quantity: f64, price: f64, fee: f64) -> Trade {
        Trade {
            trade_id: 1,
            deal_id: 0,
            order_id: 0,
            time: 0,
            side,
            price,
            quantity,
            fee,
            sum: quantity * price,
        }
    }

    #[test]
    fn equity_identity_after_each_trade() {
        let mut s = stats();
        s.add_trade(&trade(OrderSide::Buy, 2.0, 100.0, 0.2));
        // profit = 2*100 + (-200.2) - 0 = -0.2
        assert!((s.profit + 0.2).abs() < 1e-9);
        assert_eq!(s.max_market_volume, 2.0);

        s.add_trade(&trade(OrderSide::Sell, 2.0, 110.0, 0.22));
        // equity_usd = -200.2 + 219.78 = 19.58, symbol flat
        assert!((s.profit - 19.58).abs() < 1e-9);
        assert_eq!(s.total_trades, 2);
        assert_eq!(s.buy_trades, 1);
        assert_eq!(s.sell_trades, 1);
        assert!((s.total_fees - 0.42).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_profit_peak() {
        let mut s = stats();
        s.add_trade(&trade(OrderSide::Buy, 1.0, 100.0, 0.0));
        s.add_trade(&trade(OrderSide::Sell, 1.0, 120.0, 0.0)); // profit 20
        s.add_trade(&trade(OrderSide::Buy, 1.0, 120.0, 0.0));
        s.add_trade(&trade(OrderSide::Sell, 1.0, 105.0, 0.0)); // profit 5
        assert!((s.profit - 5.0).abs() < 1e-9);
        assert!((s.drawdown_max - 15.0).abs() < 1e-9);
    }

    #[test]
    fn winner_loser_split_by_deal_type() {
        let mut s = stats();
        let mut winner = Deal::new(1, true);
        winner.trade_ids.push(1);
        winner.deal_type = Some(DealType::Long);
        winner.is_closed = true;
        winner.profit = Some(10.0);

        let mut loser = Deal::new(2, true);
        loser.trade_ids.push(2);
        loser.deal_type = Some(DealType::Short);
        loser.is_closed = true;
        loser.profit = Some(-4.0);

        s.add_deal(&winner);
        s.add_deal(&loser);

        assert_eq!(s.total_deals, 2);
        assert_eq!((s.long_deals, s.short_deals), (1, 1));
        assert_eq!((s.profit_deals, s.loss_deals), (1, 1));
        assert_eq!(s.profit_long, 10.0);
        assert_eq!(s.profit_short, -4.0);
        assert_eq!(s.avg_profit_per_winning_deal, Some(10.0));
        assert_eq!(s.avg_loss_per_losing_deal, Some(-4.0));
    }

    #[test]
    fn empty_deals_are_ignored() {
        let mut s = stats();
        s.add_deal(&Deal::new(1, true));
        assert_eq!(s.total_deals, 0);
    }

    #[test]
    fn calc_stat_derives_gross_and_per_deal() {
        let mut s = stats();
        s.add_trade(&trade(OrderSide::Buy, 1.0, 100.0, 1.0));
        s.add_trade(&trade(OrderSide::Sell, 1.0, 110.0, 1.0));
        let mut deal = Deal::new(1, true);
        deal.trade_ids.push(1);
        deal.deal_type = Some(DealType::Long);
        deal.is_closed = true;
        deal.profit = Some(8.0);
        s.add_deal(&deal);

        s.calc_stat();
        assert_eq!(s.profit_per_deal, Some(s.profit));
        assert_eq!(s.profit_gross, Some(s.profit + 2.0));
    }
}
