/// broker.rs — Order matching, deal tracking and position accounting
///
/// The broker owns the trade/order/deal arenas for one backtest run and is
/// driven bar by bar: `set_bar` fixes the current time/price, `match_bar`
/// fills resting orders against the bar's high/low and reconciles stop-loss /
/// take-profit volumes, and the strategy places new orders in between.
///
/// Ordering rules inside one bar: stop orders match before limit orders, and
/// a take-profit is deferred for the bar whenever a stop of the same deal
/// executed on it. Market orders always fill at the current price adjusted by
/// slippage and pay the taker fee; filled limit orders pay the maker fee.
use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Result};
use tracing::warn;

use crate::stats::{StatsParams, TradingStats};
use crate::task::BacktestingTask;
use crate::types::{
    Deal, DealId, DealType, Order, OrderGroup, OrderId, OrderSide, OrderStatus, OrderType, Trade,
    TradeId,
};
use quotes_service::timeutil::ms_to_iso;

const DEFAULT_FEE: f64 = 0.001;

#[derive(Debug)]
pub struct BacktestBroker {
    // ── Simulation parameters ────────────────────────────────────────
    pub fee_taker: f64,
    pub fee_maker: f64,
    /// Absolute price offset applied against market/stop fills.
    pub slippage: f64,
    pub precision_amount: f64,
    pub precision_price: f64,

    // ── Current bar state ────────────────────────────────────────────
    pub price: Option<f64>,
    pub current_time: Option<i64>,
    pub bar_index: usize,
    /// Percentage of the backtest date range covered, 0..100.
    pub progress: f64,

    // ── Equity ───────────────────────────────────────────────────────
    pub equity_usd: f64,
    pub equity_symbol: f64,

    // ── Arenas (id = index + 1) ──────────────────────────────────────
    pub trades: Vec<Trade>,
    pub orders: Vec<Order>,
    pub deals: Vec<Deal>,

    pub active_deals: BTreeSet<DealId>,
    last_auto_deal_id: Option<DealId>,

    pub stats: TradingStats,

    // Resting-order lookup tables: (order_id, limit price / trigger price).
    long_limits: Vec<(OrderId, f64)>,
    short_limits: Vec<(OrderId, f64)>,
    long_stops: Vec<(OrderId, f64)>,
    short_stops: Vec<(OrderId, f64)>,
}

impl BacktestBroker {
    pub fn new(task: &BacktestingTask) -> Result<Self> {
        if task.precision_amount <= 0.0 {
            bail!("precision_amount must be greater than 0");
        }
        if task.precision_price <= 0.0 {
            bail!("precision_price must be greater than 0");
        }

        let fee_taker = if task.fee_taker > 0.0 { task.fee_taker } else { DEFAULT_FEE };
        let fee_maker = if task.fee_maker > 0.0 { task.fee_maker } else { DEFAULT_FEE };
        let slippage = if task.price_step > 0.0 {
            task.slippage_in_steps * task.price_step
        } else {
            0.0
        };

        let stats = TradingStats::new(StatsParams {
            initial_equity_usd: 0.0,
            fee_taker,
            fee_maker,
            slippage,
            price_step: task.price_step,
            source: task.source.clone(),
            symbol: task.symbol.clone(),
            timeframe: task.timeframe.clone(),
            date_start: task.date_start.clone(),
            date_end: task.date_end.clone(),
        });

        Ok(Self {
            fee_taker,
            fee_maker,
            slippage,
            precision_amount: task.precision_amount,
            precision_price: task.precision_price,
            price: None,
            current_time: None,
            bar_index: 0,
            progress: 0.0,
            equity_usd: 0.0,
            equity_symbol: 0.0,
            trades: Vec::new(),
            orders: Vec::new(),
            deals: Vec::new(),
            active_deals: BTreeSet::new(),
            last_auto_deal_id: None,
            stats,
            long_limits: Vec::new(),
            short_limits: Vec::new(),
            long_stops: Vec::new(),
            short_stops: Vec::new(),
        })
    }

    // ── Precision helpers ────────────────────────────────────────────

    pub fn round_to_precision(value: f64, precision: f64) -> f64 {
        (value / precision).round() * precision
    }

    pub fn floor_to_precision(value: f64, precision: f64) -> f64 {
        (value / precision).floor() * precision
    }

    pub fn round_price(&self, value: f64) -> f64 {
        Self::round_to_precision(value, self.precision_price)
    }

    pub fn round_amount(&self, value: f64) -> f64 {
        Self::round_to_precision(value, self.precision_amount)
    }

    fn price_eps(&self) -> f64 {
        self.precision_price / 10.0
    }

    fn amount_eps(&self) -> f64 {
        self.precision_amount / 10.0
    }

    /// Position smaller than a tenth of the amount precision is flat.
    pub fn is_zero_amount(&self, value: f64) -> bool {
        value.abs() <= self.amount_eps()
    }

    // Price comparisons within a tenth of the price precision.
    pub fn eq(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.price_eps()
    }

    pub fn gt(&self, a: f64, b: f64) -> bool {
        a - b > self.price_eps()
    }

    pub fn lt(&self, a: f64, b: f64) -> bool {
        b - a > self.price_eps()
    }

    pub fn gteq(&self, a: f64, b: f64) -> bool {
        self.gt(a, b) || self.eq(a, b)
    }

    pub fn lteq(&self, a: f64, b: f64) -> bool {
        self.lt(a, b) || self.eq(a, b)
    }

    // ── Bar state ────────────────────────────────────────────────────

    pub fn set_bar(&mut self, index: usize, time: i64, close: f64) {
        self.bar_index = index;
        self.current_time = Some(time);
        self.price = Some(close);
    }

    fn require_time(&self) -> Result<i64> {
        self.current_time
            .ok_or_else(|| anyhow!("current_time is not set"))
    }

    fn require_price(&self) -> Result<f64> {
        self.price.ok_or_else(|| anyhow!("current price is not set"))
    }

    // ── Arena accessors ──────────────────────────────────────────────

    pub fn deal(&self, deal_id: DealId) -> Result<&Deal> {
        self.deals
            .get(deal_id.checked_sub(1).ok_or_else(|| anyhow!("deal id 0"))? as usize)
            .ok_or_else(|| anyhow!("deal {deal_id} does not exist"))
    }

    fn deal_mut(&mut self, deal_id: DealId) -> Result<&mut Deal> {
        self.deals
            .get_mut(deal_id.checked_sub(1).ok_or_else(|| anyhow!("deal id 0"))? as usize)
            .ok_or_else(|| anyhow!("deal {deal_id} does not exist"))
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<&Order> {
        if order_id == 0 {
            return None;
        }
        self.orders.get((order_id - 1) as usize)
    }

    fn order_mut(&mut self, order_id: OrderId) -> Result<&mut Order> {
        self.orders
            .get_mut(order_id.checked_sub(1).ok_or_else(|| anyhow!("order id 0"))? as usize)
            .ok_or_else(|| anyhow!("order {order_id} does not exist"))
    }

    /// Insert into the orders arena, linking to its deal when one is set.
    fn add_order(&mut self, mut order: Order) -> Result<OrderId> {
        let order_id = self.orders.len() as OrderId + 1;
        order.order_id = order_id;
        if order.deal_id != 0 {
            let deal_id = order.deal_id;
            self.deal_mut(deal_id)?.order_ids.push(order_id);
        }
        self.orders.push(order);
        Ok(order_id)
    }

    fn create_deal(&mut self, auto: bool) -> DealId {
        let deal_id = self.deals.len() as DealId + 1;
        self.deals.push(Deal::new(deal_id, auto));
        if auto {
            self.last_auto_deal_id = Some(deal_id);
        }
        deal_id
    }

    fn last_open_auto_deal(&self) -> Option<DealId> {
        let deal_id = self.last_auto_deal_id?;
        let deal = self.deals.get((deal_id - 1) as usize)?;
        (!deal.is_closed).then_some(deal_id)
    }

    // ── Resting-order tables ─────────────────────────────────────────

    fn add_to_tables(&mut self, order_id: OrderId) -> Result<()> {
        let order = self
            .get_order(order_id)
            .ok_or_else(|| anyhow!("order {order_id} does not exist"))?;
        match (order.order_type, order.side) {
            (OrderType::Limit, OrderSide::Buy) => {
                let price = order.price.ok_or_else(|| anyhow!("limit order without price"))?;
                self.long_limits.push((order_id, price));
            }
            (OrderType::Limit, OrderSide::Sell) => {
                let price = order.price.ok_or_else(|| anyhow!("limit order without price"))?;
                self.short_limits.push((order_id, price));
            }
            (OrderType::Stop, OrderSide::Buy) => {
                let trigger = order
                    .trigger_price
                    .ok_or_else(|| anyhow!("stop order without trigger"))?;
                self.long_stops.push((order_id, trigger));
            }
            (OrderType::Stop, OrderSide::Sell) => {
                let trigger = order
                    .trigger_price
                    .ok_or_else(|| anyhow!("stop order without trigger"))?;
                self.short_stops.push((order_id, trigger));
            }
            (OrderType::Market, _) => bail!("market order {order_id} cannot rest"),
        }
        Ok(())
    }

    fn remove_from_tables(&mut self, order_id: OrderId) {
        self.long_limits.retain(|(id, _)| *id != order_id);
        self.short_limits.retain(|(id, _)| *id != order_id);
        self.long_stops.retain(|(id, _)| *id != order_id);
        self.short_stops.retain(|(id, _)| *id != order_id);
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Per-order validation. `check_placement` applies the current-price
    /// placement rules; take-profit orders skip them since they activate
    /// only after the entry fills, possibly far from today's price.
    fn validate_order(&self, order: &mut Order, check_placement: bool) -> Result<()> {
        let price_now = self.require_price()?;

        if order.volume <= 0.0 {
            order.fail(format!(
                "Order quantity must be greater than 0, got {}",
                order.volume
            ));
        }
        if order.price.is_some() && order.trigger_price.is_some() {
            order.fail("Cannot specify both price and trigger_price");
        }
        if !self.is_zero_amount(order.volume - self.round_amount(order.volume)) {
            order.fail(format!(
                "Order volume {} is not aligned to precision {}",
                order.volume, self.precision_amount
            ));
        }

        match order.order_type {
            OrderType::Market => {
                if order.price.is_some() {
                    order.fail("Market order cannot have price set");
                }
                if order.trigger_price.is_some() {
                    order.fail("Market order cannot have trigger_price set");
                }
            }
            OrderType::Limit => {
                if order.trigger_price.is_some() {
                    order.fail("Limit order cannot have trigger_price set");
                }
                match order.price {
                    None => order.fail("Limit order must have price set"),
                    Some(price) => {
                        if !self.eq(price, self.round_price(price)) {
                            order.fail(format!(
                                "Limit price {price} is not aligned to precision {}",
                                self.precision_price
                            ));
                        }
                        if check_placement {
                            match order.side {
                                OrderSide::Buy if self.lt(price_now, price) => {
                                    order.fail(format!(
                                        "BUY limit order price ({price}) must be below or equal \
                                         to current price ({price_now}) at time {}",
                                        ms_to_iso(order.create_time)
                                    ));
                                }
                                OrderSide::Sell if self.gt(price_now, price) => {
                                    order.fail(format!(
                                        "SELL limit order price ({price}) must be above or equal \
                                         to current price ({price_now}) at time {}",
                                        ms_to_iso(order.create_time)
                                    ));
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            OrderType::Stop => {
                if order.price.is_some() {
                    order.fail("Stop order cannot have price set");
                }
                match order.trigger_price {
                    None => order.fail("Stop order must have trigger_price set"),
                    Some(trigger) => {
                        if !self.eq(trigger, self.round_price(trigger)) {
                            order.fail(format!(
                                "Stop trigger price {trigger} is not aligned to precision {}",
                                self.precision_price
                            ));
                        }
                        if check_placement {
                            match order.side {
                                OrderSide::Buy if self.gteq(price_now, trigger) => {
                                    order.fail(format!(
                                        "BUY stop order trigger_price ({trigger}) must be above \
                                         current price ({price_now}) at time {}",
                                        ms_to_iso(order.create_time)
                                    ));
                                }
                                OrderSide::Sell if self.lteq(price_now, trigger) => {
                                    order.fail(format!(
                                        "SELL stop order trigger_price ({trigger}) must be below \
                                         current price ({price_now}) at time {}",
                                        ms_to_iso(order.create_time)
                                    ));
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ── Order placement primitives ───────────────────────────────────

    /// Buy `quantity`: market order when neither price is given, limit when
    /// `price` is set, stop when `trigger_price` is set. Returns a snapshot
    /// of the resulting order; validation failures come back with status
    /// `Error` and are not recorded in the arena.
    pub fn buy(
        &mut self,
        quantity: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Result<Order> {
        self.submit(OrderSide::Buy, quantity, price, trigger_price)
    }

    /// Sell counterpart of [`buy`](Self::buy).
    pub fn sell(
        &mut self,
        quantity: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Result<Order> {
        self.submit(OrderSide::Sell, quantity, price, trigger_price)
    }

    /// Side-parameterized form of [`buy`](Self::buy) / [`sell`](Self::sell).
    pub fn order(
        &mut self,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Result<Order> {
        self.submit(side, quantity, price, trigger_price)
    }

    fn submit(
        &mut self,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
    ) -> Result<Order> {
        let now = self.require_time()?;
        let order_type = if trigger_price.is_some() {
            OrderType::Stop
        } else if price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let mut order = Order::new(order_type, side, quantity, price, trigger_price, now);
        self.validate_order(&mut order, true)?;
        if order.status == OrderStatus::Error {
            return Ok(order);
        }

        let order_id = self.add_order(order)?;
        self.process_order(order_id)?;
        Ok(self
            .get_order(order_id)
            .ok_or_else(|| anyhow!("order {order_id} vanished"))?
            .clone())
    }

    /// Execute a market order now or put a limit/stop order to rest.
    fn process_order(&mut self, order_id: OrderId) -> Result<()> {
        let order_type = self
            .get_order(order_id)
            .ok_or_else(|| anyhow!("order {order_id} does not exist"))?
            .order_type;
        match order_type {
            OrderType::Market => self.execute_market_order(order_id),
            OrderType::Limit | OrderType::Stop => self.activate_order(order_id),
        }
    }

    fn activate_order(&mut self, order_id: OrderId) -> Result<()> {
        let now = self.require_time()?;
        {
            let order = self.order_mut(order_id)?;
            order.status = OrderStatus::Active;
            order.modify_time = now;
        }
        self.add_to_tables(order_id)
    }

    fn execute_market_order(&mut self, order_id: OrderId) -> Result<()> {
        let now = self.require_time()?;
        let price_now = self.require_price()?;
        let (side, volume, deal_id) = {
            let order = self
                .get_order(order_id)
                .ok_or_else(|| anyhow!("order {order_id} does not exist"))?;
            (order.side, order.volume, order.deal_id)
        };

        self.execute_trade(side, volume, price_now, deal_id, order_id, true)?;

        let fill_price = self.trades.last().map(|t| t.price);
        let order = self.order_mut(order_id)?;
        order.price = fill_price;
        order.filled_volume = order.volume;
        order.status = OrderStatus::Executed;
        order.modify_time = now;
        Ok(())
    }

    /// Common fill path: apply slippage and fees, update equity, create the
    /// trade and register it into a deal (flip-aware when `deal_id` is 0).
    fn execute_trade(
        &mut self,
        side: OrderSide,
        quantity: f64,
        price: f64,
        deal_id: DealId,
        order_id: OrderId,
        is_market: bool,
    ) -> Result<()> {
        let now = self.require_time()?;

        // Slippage is always adverse.
        let execution_price = if is_market && self.slippage > 0.0 {
            match side {
                OrderSide::Buy => price + self.slippage,
                OrderSide::Sell => price - self.slippage,
            }
        } else {
            price
        };
        let fee_rate = if is_market { self.fee_taker } else { self.fee_maker };
        let amount = quantity * execution_price;
        let fee = amount * fee_rate;

        match side {
            OrderSide::Buy => {
                self.equity_symbol += quantity;
                self.equity_usd -= amount + fee;
            }
            OrderSide::Sell => {
                self.equity_symbol -= quantity;
                self.equity_usd += amount - fee;
            }
        }

        let trade = Trade {
            trade_id: self.trades.len() as TradeId + 1,
            deal_id: 0,
            order_id,
            time: now,
            side,
            price: execution_price,
            quantity,
            fee,
            sum: amount,
        };
        self.trades.push(trade.clone());
        self.register_trade(trade, deal_id)
    }

    // ── Deal registration and flip handling ──────────────────────────

    /// Attach a just-created trade to a deal. `deal_id == 0` routes through
    /// the automatic-deal logic: extend the open auto deal, or split the
    /// trade in two when it would flip the position's sign.
    fn register_trade(&mut self, trade: Trade, deal_id: DealId) -> Result<()> {
        if deal_id > 0 {
            return self.add_trade_to_deal(deal_id, trade.trade_id);
        }

        let Some(last_deal_id) = self.last_open_auto_deal() else {
            let new_deal = self.create_deal(true);
            return self.add_trade_to_deal(new_deal, trade.trade_id);
        };

        let current_qty = self.deal(last_deal_id)?.quantity;
        let new_qty = match trade.side {
            OrderSide::Buy => current_qty + trade.quantity,
            OrderSide::Sell => current_qty - trade.quantity,
        };

        let no_flip = self.is_zero_amount(current_qty)
            || self.is_zero_amount(new_qty)
            || current_qty.signum() == new_qty.signum();
        if no_flip {
            return self.add_trade_to_deal(last_deal_id, trade.trade_id);
        }

        // Flip: replace the trade with a closing part for the current deal
        // and an opening part for a fresh one. Fees prorate by volume; trade
        // ids are reassigned to the two new records.
        self.trades.pop();

        let close_volume = current_qty.abs();
        let remainder = trade.quantity - close_volume;
        let close_ratio = close_volume / trade.quantity;
        let remainder_ratio = remainder / trade.quantity;

        let closing = Trade {
            trade_id: self.trades.len() as TradeId + 1,
            quantity: close_volume,
            fee: trade.fee * close_ratio,
            sum: trade.price * close_volume,
            ..trade.clone()
        };
        self.trades.push(closing.clone());
        self.add_trade_to_deal(last_deal_id, closing.trade_id)?;

        let new_deal = self.create_deal(true);
        let opening = Trade {
            trade_id: self.trades.len() as TradeId + 1,
            quantity: remainder,
            fee: trade.fee * remainder_ratio,
            sum: trade.price * remainder,
            ..trade
        };
        self.trades.push(opening.clone());
        self.add_trade_to_deal(new_deal, opening.trade_id)
    }

    /// The single entry point for putting a trade into a deal: updates the
    /// deal aggregates, the running statistics and the closed state.
    fn add_trade_to_deal(&mut self, deal_id: DealId, trade_id: TradeId) -> Result<()> {
        let idx = (trade_id - 1) as usize;
        let mut trade = self
            .trades
            .get(idx)
            .ok_or_else(|| anyhow!("trade {trade_id} does not exist"))?
            .clone();
        // The deal finalizes profit with the same flatness tolerance that
        // deal_check_closed uses, so a closed deal always carries a profit.
        let flat_tolerance = self.amount_eps();
        self.deal_mut(deal_id)?.apply_trade(&mut trade, flat_tolerance);
        self.trades[idx] = trade.clone();
        self.stats.add_trade(&trade);
        self.deal_check_closed(deal_id)
    }

    /// Close the deal when its position is flat and no entry orders remain
    /// active; on closure cancel its other orders and feed the statistics.
    fn deal_check_closed(&mut self, deal_id: DealId) -> Result<()> {
        let (quantity, was_closed, order_ids) = {
            let deal = self.deal(deal_id)?;
            (deal.quantity, deal.is_closed, deal.order_ids.clone())
        };
        if was_closed {
            return Ok(());
        }

        let has_active_entries = order_ids.iter().any(|&oid| {
            self.get_order(oid).is_some_and(|o| {
                o.order_group == OrderGroup::None && o.status == OrderStatus::Active
            })
        });
        if !self.is_zero_amount(quantity) || has_active_entries {
            // Still open; keep it under SLTP reconciliation.
            self.active_deals.insert(deal_id);
            return Ok(());
        }

        let close_type = self.closing_group(deal_id)?;
        {
            let deal = self.deal_mut(deal_id)?;
            deal.is_closed = true;
            deal.close_type = close_type;
        }

        self.active_deals.remove(&deal_id);
        self.cancel_deal_orders(deal_id)?;
        let snapshot = self.deal(deal_id)?.clone();
        self.stats.add_deal(&snapshot);
        if self.last_auto_deal_id == Some(deal_id) {
            self.last_auto_deal_id = None;
        }
        Ok(())
    }

    /// Order group of the last (by time, then id) trade's order, `None` when
    /// the deal closed through a bare market/limit fill.
    fn closing_group(&self, deal_id: DealId) -> Result<OrderGroup> {
        let deal = self.deal(deal_id)?;
        let last_trade = deal
            .trade_ids
            .iter()
            .filter_map(|&tid| self.trades.get((tid - 1) as usize))
            .max_by_key(|t| (t.time, t.trade_id));
        Ok(last_trade
            .filter(|t| t.order_id != 0)
            .and_then(|t| self.get_order(t.order_id))
            .map(|o| o.order_group)
            .unwrap_or(OrderGroup::None))
    }

    fn cancel_deal_orders(&mut self, deal_id: DealId) -> Result<()> {
        let now = self.require_time()?;
        let order_ids = self.deal(deal_id)?.order_ids.clone();
        for oid in order_ids {
            let status = self
                .get_order(oid)
                .ok_or_else(|| anyhow!("order {oid} does not exist"))?
                .status;
            if matches!(status, OrderStatus::Active | OrderStatus::New) {
                let order = self.order_mut(oid)?;
                order.status = OrderStatus::Canceled;
                order.modify_time = now;
                self.remove_from_tables(oid);
            }
        }
        Ok(())
    }

    // ── SLTP deals ───────────────────────────────────────────────────

    /// Open a long deal with explicit stop-loss / take-profit legs.
    /// `entries`: `(volume, price)`, `price = None` meaning one market entry.
    /// `stop_losses` / `take_profits`: `(fraction, price)`; the fraction may
    /// be `None` only on the extreme order ("all remaining").
    pub fn buy_sltp(
        &mut self,
        entries: &[(f64, Option<f64>)],
        stop_losses: &[(Option<f64>, f64)],
        take_profits: &[(Option<f64>, f64)],
    ) -> Result<Option<DealId>> {
        self.execute_deal(OrderSide::Buy, entries, stop_losses, take_profits)
    }

    /// Short counterpart of [`buy_sltp`](Self::buy_sltp).
    pub fn sell_sltp(
        &mut self,
        entries: &[(f64, Option<f64>)],
        stop_losses: &[(Option<f64>, f64)],
        take_profits: &[(Option<f64>, f64)],
    ) -> Result<Option<DealId>> {
        self.execute_deal(OrderSide::Sell, entries, stop_losses, take_profits)
    }

    pub fn execute_deal(
        &mut self,
        side: OrderSide,
        entries: &[(f64, Option<f64>)],
        stop_losses: &[(Option<f64>, f64)],
        take_profits: &[(Option<f64>, f64)],
    ) -> Result<Option<DealId>> {
        let now = self.require_time()?;
        let deal_id = self.create_deal(false);
        {
            let deal = self.deal_mut(deal_id)?;
            deal.deal_type = Some(match side {
                OrderSide::Buy => DealType::Long,
                OrderSide::Sell => DealType::Short,
            });
        }

        // Structural validation; any failure abandons the deal as a whole.
        let market_entries = entries.iter().filter(|(_, p)| p.is_none()).count();
        let total_entry_volume: f64 = entries.iter().map(|(v, _)| v).sum();
        let structurally_ok = !entries.is_empty()
            && (market_entries == 0 || entries.len() == 1)
            && total_entry_volume > 0.0
            && stop_losses
                .iter()
                .chain(take_profits)
                .all(|&(fraction, _)| fraction.map_or(true, |f| f > 0.0 && f <= 1.0));
        if !structurally_ok {
            warn!("Rejecting SLTP deal {deal_id}: malformed entries or fractions");
            self.close_deal(deal_id)?;
            return Ok(None);
        }
        let is_market_entry = market_entries > 0;
        self.deal_mut(deal_id)?.enter_volume = total_entry_volume;

        // Entry orders.
        let mut entry_ids = Vec::with_capacity(entries.len());
        for &(volume, price) in entries {
            let order_type = if price.is_none() { OrderType::Market } else { OrderType::Limit };
            let mut order = Order::new(order_type, side, volume, price, None, now);
            order.deal_id = deal_id;
            entry_ids.push(self.add_order(order)?);
        }

        // Stop-loss orders: created with volume 0, sized by distribution.
        let exit_side = side.opposite();
        let mut stop_ids = Vec::with_capacity(stop_losses.len());
        for &(fraction, price) in stop_losses {
            let mut order = Order::new(OrderType::Stop, exit_side, 0.0, None, Some(price), now);
            order.deal_id = deal_id;
            order.order_group = OrderGroup::StopLoss;
            order.fraction = fraction;
            stop_ids.push(self.add_order(order)?);
        }

        // Take-profit orders: stay NEW until the first entry fill.
        let mut take_ids = Vec::with_capacity(take_profits.len());
        for &(fraction, price) in take_profits {
            let mut order = Order::new(OrderType::Limit, exit_side, 0.0, Some(price), None, now);
            order.deal_id = deal_id;
            order.order_group = OrderGroup::TakeProfit;
            order.fraction = fraction;
            take_ids.push(self.add_order(order)?);
        }

        // Size both exit groups against the declared entry volume.
        let distributed = self
            .update_stop_volumes(deal_id, total_entry_volume)
            .and_then(|_| self.update_take_volumes(deal_id, total_entry_volume).map(|_| ()));
        if distributed.is_err() {
            warn!("Rejecting SLTP deal {deal_id}: exit volume distribution failed");
            self.close_deal(deal_id)?;
            return Ok(None);
        }

        // Per-order validation: entries and stops act now, takes later.
        let mut failed = false;
        for &oid in entry_ids.iter().chain(&stop_ids) {
            let mut order = self
                .get_order(oid)
                .ok_or_else(|| anyhow!("order {oid} does not exist"))?
                .clone();
            self.validate_order(&mut order, true)?;
            failed |= order.status == OrderStatus::Error;
            *self.order_mut(oid)? = order;
        }
        for &oid in &take_ids {
            let mut order = self
                .get_order(oid)
                .ok_or_else(|| anyhow!("order {oid} does not exist"))?
                .clone();
            self.validate_order(&mut order, false)?;
            failed |= order.status == OrderStatus::Error;
            *self.order_mut(oid)? = order;
        }
        if failed {
            warn!("Rejecting SLTP deal {deal_id}: order validation failed");
            self.close_deal(deal_id)?;
            return Ok(None);
        }

        // Execute: entries first (a market entry establishes the position),
        // then stops; takes only when the position already exists.
        for oid in entry_ids {
            self.process_order(oid)?;
        }
        for oid in stop_ids {
            self.activate_order(oid)?;
        }
        if is_market_entry {
            for oid in take_ids {
                self.activate_order(oid)?;
            }
        }

        Ok(Some(deal_id))
    }

    /// Extreme stop: farthest trigger from the entry (lowest for a long
    /// deal, highest for a short one). Only non-final orders count.
    fn find_extreme_stop(&self, deal_id: DealId) -> Result<Option<OrderId>> {
        let deal = self.deal(deal_id)?;
        let candidates = deal.order_ids.iter().filter_map(|&oid| {
            let order = self.get_order(oid)?;
            (order.order_group == OrderGroup::StopLoss && !order.status.is_final())
                .then_some((oid, order.trigger_price?))
        });
        let extreme = match deal.deal_type {
            Some(DealType::Short) => {
                candidates.max_by(|a, b| a.1.total_cmp(&b.1))
            }
            _ => candidates.min_by(|a, b| a.1.total_cmp(&b.1)),
        };
        Ok(extreme.map(|(oid, _)| oid))
    }

    /// Extreme take: farthest price from the entry (highest for a long
    /// deal, lowest for a short one).
    fn find_extreme_take(&self, deal_id: DealId) -> Result<Option<OrderId>> {
        let deal = self.deal(deal_id)?;
        let candidates = deal.order_ids.iter().filter_map(|&oid| {
            let order = self.get_order(oid)?;
            (order.order_group == OrderGroup::TakeProfit && !order.status.is_final())
                .then_some((oid, order.price?))
        });
        let extreme = match deal.deal_type {
            Some(DealType::Short) => {
                candidates.min_by(|a, b| a.1.total_cmp(&b.1))
            }
            _ => candidates.max_by(|a, b| a.1.total_cmp(&b.1)),
        };
        Ok(extreme.map(|(oid, _)| oid))
    }

    /// Entry limit volume still waiting between the current price and the
    /// extreme stop trigger (inclusive); it shares the stop cover.
    fn unexecuted_entry_limit_volume(
        &self,
        deal_id: DealId,
        current_price: f64,
        extreme_stop_price: f64,
    ) -> Result<f64> {
        let deal = self.deal(deal_id)?;
        let mut volume = 0.0;
        for &oid in &deal.order_ids {
            let Some(order) = self.get_order(oid) else { continue };
            if order.order_group != OrderGroup::None
                || order.order_type != OrderType::Limit
                || order.status.is_final()
            {
                continue;
            }
            let Some(price) = order.price else { continue };
            let in_range = match deal.deal_type {
                Some(DealType::Short) => current_price <= price && price <= extreme_stop_price,
                _ => extreme_stop_price <= price && price <= current_price,
            };
            if in_range {
                volume += order.volume;
            }
        }
        Ok(volume)
    }

    /// Redistribute stop-loss volumes: every stop except the extreme one
    /// gets its precision-rounded fraction of the target; the extreme stop
    /// absorbs the remainder so the group sums exactly.
    fn update_stop_volumes(&mut self, deal_id: DealId, target_volume: f64) -> Result<()> {
        let Some(extreme_id) = self.find_extreme_stop(deal_id)? else {
            return Ok(());
        };
        self.distribute_group(deal_id, OrderGroup::StopLoss, extreme_id, target_volume)
            .map(|_| ())
    }

    /// Same remainder rule for take-profits. Returns the take orders still
    /// in NEW status so the caller can activate them once a position exists.
    fn update_take_volumes(
        &mut self,
        deal_id: DealId,
        target_volume: f64,
    ) -> Result<Vec<OrderId>> {
        let Some(extreme_id) = self.find_extreme_take(deal_id)? else {
            return Ok(Vec::new());
        };
        self.distribute_group(deal_id, OrderGroup::TakeProfit, extreme_id, target_volume)
    }

    fn distribute_group(
        &mut self,
        deal_id: DealId,
        group: OrderGroup,
        extreme_id: OrderId,
        target_volume: f64,
    ) -> Result<Vec<OrderId>> {
        let now = self.require_time()?;
        let member_ids: Vec<OrderId> = self
            .deal(deal_id)?
            .order_ids
            .iter()
            .copied()
            .filter(|&oid| {
                self.get_order(oid)
                    .is_some_and(|o| o.order_group == group && !o.status.is_final())
            })
            .collect();

        let mut remainder = target_volume;
        let mut assignments = Vec::with_capacity(member_ids.len());
        let mut new_members = Vec::new();
        for &oid in &member_ids {
            let order = self
                .get_order(oid)
                .ok_or_else(|| anyhow!("order {oid} does not exist"))?;
            if order.status == OrderStatus::New {
                new_members.push(oid);
            }
            if oid == extreme_id {
                continue;
            }
            let fraction = order.fraction.ok_or_else(|| {
                anyhow!("non-extreme order {oid} in group {group:?} has no fraction")
            })?;
            let volume = Self::round_to_precision(fraction * target_volume, self.precision_amount);
            assignments.push((oid, volume));
            remainder -= volume;
        }

        if remainder < -self.amount_eps() {
            bail!(
                "exit volumes for deal {deal_id} exceed target {target_volume} \
                 (extreme remainder {remainder})"
            );
        }
        assignments.push((extreme_id, remainder.max(0.0)));

        for (oid, volume) in assignments {
            let order = self.order_mut(oid)?;
            order.volume = volume;
            order.modify_time = now;
        }
        Ok(new_members)
    }

    /// Reconcile exit orders of every active deal against its current
    /// position: stops also cover entry limits resting between the price and
    /// the extreme stop; takes cover exactly the open position and wake up
    /// from NEW as soon as a position exists.
    fn update_sltp_orders(&mut self) -> Result<()> {
        let price_now = self.require_price()?;
        let active: Vec<DealId> = self.active_deals.iter().copied().collect();

        for deal_id in active {
            let quantity = {
                let deal = self.deal(deal_id)?;
                debug_assert!(!deal.is_closed, "closed deal {deal_id} in active set");
                deal.quantity
            };

            if let Some(extreme_id) = self.find_extreme_stop(deal_id)? {
                if let Some(trigger) = self
                    .get_order(extreme_id)
                    .and_then(|o| o.trigger_price)
                {
                    let unexecuted =
                        self.unexecuted_entry_limit_volume(deal_id, price_now, trigger)?;
                    self.update_stop_volumes(deal_id, quantity.abs() + unexecuted)?;
                }
            }

            if !self.is_zero_amount(quantity) {
                let new_takes = self.update_take_volumes(deal_id, quantity.abs())?;
                for oid in new_takes {
                    self.activate_order(oid)?;
                }
            }
        }
        Ok(())
    }

    // ── Per-bar matching ─────────────────────────────────────────────

    /// Match resting orders against one bar, then reconcile SLTP volumes.
    /// Stops fire before limits; a take-profit whose deal had a stop fire on
    /// this bar is deferred to a later one.
    pub fn match_bar(&mut self, high: f64, low: f64) -> Result<()> {
        let stop_deals = self.execute_triggered_stops(high, low)?;
        self.execute_triggered_limits(high, low, &stop_deals)?;
        self.update_sltp_orders()
    }

    fn execute_triggered_stops(&mut self, high: f64, low: f64) -> Result<BTreeSet<DealId>> {
        let mut stop_deals = BTreeSet::new();

        // BUY stop: breakout up.
        let triggered: Vec<OrderId> = self
            .long_stops
            .iter()
            .filter(|(_, trigger)| high >= *trigger)
            .map(|(id, _)| *id)
            .collect();
        for oid in triggered {
            if let Some(deal_id) = self.execute_triggered_order(oid)? {
                stop_deals.insert(deal_id);
            }
        }

        // SELL stop: breakout down.
        let triggered: Vec<OrderId> = self
            .short_stops
            .iter()
            .filter(|(_, trigger)| low <= *trigger)
            .map(|(id, _)| *id)
            .collect();
        for oid in triggered {
            if let Some(deal_id) = self.execute_triggered_order(oid)? {
                stop_deals.insert(deal_id);
            }
        }

        Ok(stop_deals)
    }

    fn execute_triggered_limits(
        &mut self,
        high: f64,
        low: f64,
        stop_deals: &BTreeSet<DealId>,
    ) -> Result<()> {
        // BUY limit: bar traded at or below the limit.
        let triggered: Vec<OrderId> = self
            .long_limits
            .iter()
            .filter(|(_, price)| low <= *price)
            .map(|(id, _)| *id)
            .collect();
        for oid in triggered {
            if self.is_deferred_take(oid, stop_deals) {
                continue;
            }
            self.execute_triggered_order(oid)?;
        }

        // SELL limit: bar traded strictly above the limit.
        let triggered: Vec<OrderId> = self
            .short_limits
            .iter()
            .filter(|(_, price)| high > *price)
            .map(|(id, _)| *id)
            .collect();
        for oid in triggered {
            if self.is_deferred_take(oid, stop_deals) {
                continue;
            }
            self.execute_triggered_order(oid)?;
        }
        Ok(())
    }

    fn is_deferred_take(&self, order_id: OrderId, stop_deals: &BTreeSet<DealId>) -> bool {
        self.get_order(order_id).is_some_and(|o| {
            o.order_group == OrderGroup::TakeProfit && stop_deals.contains(&o.deal_id)
        })
    }

    /// Fill one triggered resting order. Returns the owning deal id when an
    /// execution actually happened. Orders canceled earlier in the same bar
    /// (a deal closed, say) are skipped by the status check.
    fn execute_triggered_order(&mut self, order_id: OrderId) -> Result<Option<DealId>> {
        let now = self.require_time()?;
        let (status, order_type, side, volume, deal_id, price, trigger) = {
            let order = self
                .get_order(order_id)
                .ok_or_else(|| anyhow!("order {order_id} does not exist"))?;
            (
                order.status,
                order.order_type,
                order.side,
                order.volume,
                order.deal_id,
                order.price,
                order.trigger_price,
            )
        };
        if status != OrderStatus::Active {
            return Ok(None);
        }
        // A reconciled exit can sit at zero volume (nothing left to cover);
        // it rests until resized or canceled.
        if volume <= self.amount_eps() {
            return Ok(None);
        }

        let (execution_price, is_market) = match order_type {
            // Stop: fills like a market order off its trigger.
            OrderType::Stop => (
                trigger.ok_or_else(|| anyhow!("stop order {order_id} without trigger"))?,
                true,
            ),
            // Limit: fills at its own price, maker side.
            OrderType::Limit => (
                price.ok_or_else(|| anyhow!("limit order {order_id} without price"))?,
                false,
            ),
            OrderType::Market => {
                warn!("Unexpected market order {order_id} in the resting tables");
                return Ok(None);
            }
        };

        self.execute_trade(side, volume, execution_price, deal_id, order_id, is_market)?;

        let order = self.order_mut(order_id)?;
        order.filled_volume = order.volume;
        order.price = Some(execution_price);
        order.status = OrderStatus::Executed;
        order.modify_time = now;
        self.remove_from_tables(order_id);

        Ok((deal_id != 0).then_some(deal_id))
    }

    // ── Cancellation and close-out ───────────────────────────────────

    /// Cancel ACTIVE orders by id; final orders are returned untouched and
    /// unknown ids are skipped.
    pub fn cancel_orders(&mut self, order_ids: &[OrderId]) -> Result<Vec<Order>> {
        let now = self.require_time()?;
        let mut result = Vec::new();
        for &oid in order_ids {
            if oid == 0 || oid as usize > self.orders.len() {
                continue;
            }
            if self
                .get_order(oid)
                .is_some_and(|o| o.status == OrderStatus::Active)
            {
                let order = self.order_mut(oid)?;
                order.status = OrderStatus::Canceled;
                order.modify_time = now;
                self.remove_from_tables(oid);
            }
            if let Some(order) = self.get_order(oid) {
                result.push(order.clone());
            }
        }
        Ok(result)
    }

    /// Cancel all of a deal's pending orders and close its residual position
    /// with a market order.
    pub fn close_deal(&mut self, deal_id: DealId) -> Result<()> {
        let now = self.require_time()?;
        self.cancel_deal_orders(deal_id)?;

        let (quantity, deal_type) = {
            let deal = self.deal(deal_id)?;
            (deal.quantity, deal.deal_type)
        };
        if quantity.abs() > self.amount_eps() {
            let close_side = match deal_type {
                Some(DealType::Long) => OrderSide::Sell,
                Some(DealType::Short) => OrderSide::Buy,
                None if quantity > 0.0 => OrderSide::Sell,
                None => OrderSide::Buy,
            };
            let mut order = Order::new(
                OrderType::Market,
                close_side,
                quantity.abs(),
                None,
                None,
                now,
            );
            order.deal_id = deal_id;
            let order_id = self.add_order(order)?;
            self.execute_market_order(order_id)?;
        }

        // Flat deals with nothing pending (e.g. an abandoned SLTP shell)
        // must still end up closed.
        self.deal_check_closed(deal_id)
    }

    /// Close every deal that is not yet closed, open position or not.
    pub fn close_deals(&mut self) -> Result<()> {
        let open: Vec<DealId> = self
            .deals
            .iter()
            .filter(|d| !d.is_closed)
            .map(|d| d.deal_id)
            .collect();
        for deal_id in open {
            self.close_deal(deal_id)?;
        }
        Ok(())
    }

    // ── Post-run self-check ──────────────────────────────────────────

    /// Consistency audit over the finished arenas. Returns human-readable
    /// problems; empty means clean.
    pub fn check_trading_results(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.deals.is_empty() {
            return errors;
        }

        // Deal ids are contiguous 1..N.
        for (i, deal) in self.deals.iter().enumerate() {
            if deal.deal_id != i as DealId + 1 {
                errors.push(format!(
                    "Deal at index {i} has deal_id={}, expected {}",
                    deal.deal_id,
                    i + 1
                ));
            }
        }

        // Trade ids are positive and unique across all deals.
        let all_trade_ids: Vec<TradeId> = self
            .deals
            .iter()
            .flat_map(|d| d.trade_ids.iter().copied())
            .collect();
        if all_trade_ids.is_empty() {
            return errors;
        }
        if all_trade_ids.iter().any(|&tid| tid == 0) {
            errors.push("Found trade_id = 0 in a deal".into());
        }
        let unique: BTreeSet<TradeId> = all_trade_ids.iter().copied().collect();
        if unique.len() != all_trade_ids.len() {
            errors.push("Duplicate trade_id across deals".into());
        }

        // Within each automatic deal, trade ids are monotonic in time.
        for deal in self.deals.iter().filter(|d| d.auto) {
            let times: Vec<i64> = deal
                .trade_ids
                .iter()
                .filter_map(|&tid| self.trades.get((tid - 1) as usize))
                .map(|t| t.time)
                .collect();
            if times.windows(2).any(|w| w[0] > w[1]) {
                errors.push(format!(
                    "trade ids of automatic deal {} are not in time order",
                    deal.deal_id
                ));
            }
        }

        // Every deal is closed.
        let unclosed: Vec<DealId> = self
            .deals
            .iter()
            .filter(|d| !d.is_closed)
            .map(|d| d.deal_id)
            .collect();
        if !unclosed.is_empty() {
            errors.push(format!("Unclosed deals found: {unclosed:?}"));
        }

        // Aggregates recomputed from raw trades match the stored values.
        let volume_tolerance = self.amount_eps();
        let price_tolerance = self.price_eps();
        for deal in &self.deals {
            if deal.trade_ids.is_empty() {
                continue;
            }
            let trades: Vec<&Trade> = deal
                .trade_ids
                .iter()
                .filter_map(|&tid| self.trades.get((tid - 1) as usize))
                .collect();
            let buy_quantity: f64 = trades
                .iter()
                .filter(|t| t.side == OrderSide::Buy)
                .map(|t| t.quantity)
                .sum();
            let buy_cost: f64 = trades
                .iter()
                .filter(|t| t.side == OrderSide::Buy)
                .map(|t| t.sum)
                .sum();
            let sell_quantity: f64 = trades
                .iter()
                .filter(|t| t.side == OrderSide::Sell)
                .map(|t| t.quantity)
                .sum();
            let sell_proceeds: f64 = trades
                .iter()
                .filter(|t| t.side == OrderSide::Sell)
                .map(|t| t.sum)
                .sum();
            let fee: f64 = trades.iter().map(|t| t.fee).sum();

            let volume_checks = [
                ("buy_quantity", deal.buy_quantity, buy_quantity),
                ("sell_quantity", deal.sell_quantity, sell_quantity),
            ];
            for (field, stored, recalc) in volume_checks {
                if (stored - recalc).abs() > volume_tolerance {
                    errors.push(format!(
                        "Deal {}: {field} mismatch (stored={stored}, recalc={recalc})",
                        deal.deal_id
                    ));
                }
            }
            let price_checks = [
                ("buy_cost", deal.buy_cost, buy_cost),
                ("sell_proceeds", deal.sell_proceeds, sell_proceeds),
                ("fee", deal.fee, fee),
            ];
            for (field, stored, recalc) in price_checks {
                if (stored - recalc).abs() > price_tolerance {
                    errors.push(format!(
                        "Deal {}: {field} mismatch (stored={stored}, recalc={recalc})",
                        deal.deal_id
                    ));
                }
            }

            let avg_buy = (buy_quantity > 0.0).then(|| buy_cost / buy_quantity);
            let avg_sell = (sell_quantity > 0.0).then(|| sell_proceeds / sell_quantity);
            for (field, stored, recalc) in [
                ("avg_buy_price", deal.avg_buy_price, avg_buy),
                ("avg_sell_price", deal.avg_sell_price, avg_sell),
            ] {
                let mismatch = match (stored, recalc) {
                    (Some(a), Some(b)) => (a - b).abs() > price_tolerance,
                    (a, b) => a.is_some() != b.is_some(),
                };
                if mismatch {
                    errors.push(format!(
                        "Deal {}: {field} mismatch (stored={stored:?}, recalc={recalc:?})",
                        deal.deal_id
                    ));
                }
            }

            if deal.is_closed {
                let recalc_profit = sell_proceeds - buy_cost - fee;
                match deal.profit {
                    Some(stored) if (stored - recalc_profit).abs() > price_tolerance => {
                        errors.push(format!(
                            "Deal {}: profit mismatch (stored={stored}, recalc={recalc_profit})",
                            deal.deal_id
                        ));
                    }
                    None => {
                        errors.push(format!("Deal {}: closed without profit", deal.deal_id));
                    }
                    _ => {}
                }
            }
        }

        errors
    }
}

// ── Published view ────────────────────────────────────────────────────────

/// Tracked properties for the results publisher: the three arenas stream as
/// growing lists, everything else snapshots as scalars.
impl crate::publisher::GrowingSource for BacktestBroker {
    fn property_names(&self) -> &'static [&'static str] {
        &[
            "trades",
            "orders",
            "deals",
            "stats",
            "equity_usd",
            "equity_symbol",
            "progress",
            "price",
            "current_time",
        ]
    }

    fn scalar(&self, name: &str) -> Option<serde_json::Value> {
        use serde_json::Value;
        match name {
            "stats" => serde_json::to_value(&self.stats).ok(),
            "equity_usd" => Some(Value::from(self.equity_usd)),
            "equity_symbol" => Some(Value::from(self.equity_symbol)),
            "progress" => Some(Value::from(self.progress)),
            "price" => Some(self.price.map_or(Value::Null, Value::from)),
            "current_time" => Some(
                self.current_time
                    .map_or(serde_json::Value::Null, |ms| Value::String(ms_to_iso(ms))),
            ),
            _ => None,
        }
    }

    fn list_len(&self, name: &str) -> Option<usize> {
        match name {
            "trades" => Some(self.trades.len()),
            "orders" => Some(self.orders.len()),
            "deals" => Some(self.deals.len()),
            _ => None,
        }
    }

    fn list_tail(&self, name: &str, from: usize) -> Vec<serde_json::Value> {
        fn serialize_tail<T: serde::Serialize>(items: &[T], from: usize) -> Vec<serde_json::Value> {
            items[from.min(items.len())..]
                .iter()
                .map(|item| serde_json::to_value(item).unwrap_or(serde_json::Value::Null))
                .collect()
        }
        match name {
            "trades" => serialize_tail(&self.trades, from),
            "orders" => serialize_tail(&self.orders, from),
            "deals" => serialize_tail(&self.deals, from),
            _ => Vec::new(),
        }
    }
}
