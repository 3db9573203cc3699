/// types.rs — Trading data model: orders, trades, deals
///
/// The broker owns three arenas (`trades`, `orders`, `deals`); records refer
/// to each other through 1-based integer ids, never through pointers. Ids are
/// assigned on insertion and are equal to index + 1 in their arena.
use serde::{Serialize, Serializer};

use quotes_service::timeutil::ms_to_iso;

pub type TradeId = u64;
pub type OrderId = u64;
pub type DealId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

/// Serialized as its numeric code, matching the external results contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Only created, not processed.
    New,
    /// Validated and resting (limit and stop orders only).
    Active,
    Executed,
    Canceled,
    /// Failed validation.
    Error,
}

impl OrderStatus {
    pub fn code(self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Active => 1,
            OrderStatus::Executed => 2,
            OrderStatus::Canceled => 3,
            OrderStatus::Error => 4,
        }
    }

    /// Executed / canceled / errored orders never change again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            OrderStatus::Executed | OrderStatus::Canceled | OrderStatus::Error
        )
    }
}

impl Serialize for OrderStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Serialized as its numeric code, matching the external results contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderGroup {
    None,
    StopLoss,
    TakeProfit,
}

impl OrderGroup {
    pub fn code(self) -> u8 {
        match self {
            OrderGroup::None => 0,
            OrderGroup::StopLoss => 1,
            OrderGroup::TakeProfit => 2,
        }
    }
}

impl Serialize for OrderGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DealType {
    Long,
    Short,
}

fn ser_ms_as_iso<S: Serializer>(ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ms_to_iso(*ms))
}

/// One fill. Immutable once registered in a deal.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub trade_id: TradeId,
    /// Set when the trade is added to a deal.
    pub deal_id: DealId,
    /// 0 for trades not born from a resting order.
    pub order_id: OrderId,
    #[serde(serialize_with = "ser_ms_as_iso")]
    pub time: i64,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub sum: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    /// 0 means the order belongs to no explicit deal.
    pub deal_id: DealId,
    pub order_type: OrderType,
    #[serde(serialize_with = "ser_ms_as_iso")]
    pub create_time: i64,
    /// Updated on every state change; lets readers refresh by modification
    /// time.
    #[serde(serialize_with = "ser_ms_as_iso")]
    pub modify_time: i64,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub volume: f64,
    pub filled_volume: f64,
    pub status: OrderStatus,
    pub order_group: OrderGroup,
    /// Fraction of the position this exit order liquidates; set iff
    /// `order_group != None`. `None` on the extreme order means "all
    /// remaining".
    pub fraction: Option<f64>,
    pub errors: Vec<String>,
}

impl Order {
    pub fn new(
        order_type: OrderType,
        side: OrderSide,
        volume: f64,
        price: Option<f64>,
        trigger_price: Option<f64>,
        time: i64,
    ) -> Self {
        Self {
            order_id: 0,
            deal_id: 0,
            order_type,
            create_time: time,
            modify_time: time,
            side,
            price,
            trigger_price,
            volume,
            filled_volume: 0.0,
            status: OrderStatus::New,
            order_group: OrderGroup::None,
            fraction: None,
            errors: Vec::new(),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
        self.status = OrderStatus::Error;
    }
}

/// A set of trades and orders grouped as one logical position.
#[derive(Debug, Clone, Serialize)]
pub struct Deal {
    pub deal_id: DealId,
    pub trade_ids: Vec<TradeId>,
    pub order_ids: Vec<OrderId>,

    /// Long/short, fixed by the first trade's side.
    #[serde(rename = "type")]
    pub deal_type: Option<DealType>,

    pub avg_buy_price: Option<f64>,
    pub avg_sell_price: Option<f64>,

    /// Signed net position; 0 when fully closed.
    pub quantity: f64,
    pub fee: f64,
    pub profit: Option<f64>,

    pub is_closed: bool,
    /// Group of the order behind the last closing trade, `None` otherwise.
    pub close_type: OrderGroup,

    /// True for deals created implicitly by bare buy/sell calls.
    pub auto: bool,
    /// Total entry order volume of an SLTP deal; exit volumes are derived
    /// from it until fills start.
    pub enter_volume: f64,

    // Side-specific accumulators for incremental aggregate updates.
    pub buy_quantity: f64,
    pub buy_cost: f64,
    pub sell_quantity: f64,
    pub sell_proceeds: f64,
}

impl Deal {
    pub fn new(deal_id: DealId, auto: bool) -> Self {
        Self {
            deal_id,
            trade_ids: Vec::new(),
            order_ids: Vec::new(),
            deal_type: None,
            avg_buy_price: None,
            avg_sell_price: None,
            quantity: 0.0,
            fee: 0.0,
            profit: None,
            is_closed: false,
            close_type: OrderGroup::None,
            auto,
            enter_volume: 0.0,
            buy_quantity: 0.0,
            buy_cost: 0.0,
            sell_quantity: 0.0,
            sell_proceeds: 0.0,
        }
    }

    /// Fold a trade into the aggregates: assigns the trade's deal id, fixes
    /// the deal type on first contact, and recomputes averages and (on flat)
    /// profit. `flat_tolerance` is the same amount epsilon the broker uses
    /// to decide closure, so profit is finalized exactly when the deal can
    /// close; prorated splits and rounded exit fractions leave f64 dust.
    pub fn apply_trade(&mut self, trade: &mut Trade, flat_tolerance: f64) {
        trade.deal_id = self.deal_id;
        self.trade_ids.push(trade.trade_id);

        if self.deal_type.is_none() {
            self.deal_type = Some(match trade.side {
                OrderSide::Buy => DealType::Long,
                OrderSide::Sell => DealType::Short,
            });
        }

        self.fee += trade.fee;
        match trade.side {
            OrderSide::Buy => {
                self.buy_quantity += trade.quantity;
                self.buy_cost += trade.sum;
                self.quantity += trade.quantity;
            }
            OrderSide::Sell => {
                self.sell_quantity += trade.quantity;
                self.sell_proceeds += trade.sum;
                self.quantity -= trade.quantity;
            }
        }

        self.avg_buy_price = (self.buy_quantity > 0.0).then(|| self.buy_cost / self.buy_quantity);
        self.avg_sell_price =
            (self.sell_quantity > 0.0).then(|| self.sell_proceeds / self.sell_quantity);

        self.profit = (self.quantity.abs() <= flat_tolerance)
            .then(|| self.sell_proceeds - self.buy_cost - self.fee);
    }

    /// PnL if the open remainder were liquidated at `current_price`; equals
    /// the realized profit once flat.
    pub fn unrealized_profit(&self, current_price: f64) -> f64 {
        self.sell_proceeds + self.quantity * current_price - self.buy_cost - self.fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: TradeId, side: OrderSide, quantity: f64, price: f64, fee: f64) -> Trade {
        Trade {
            trade_id: id,
            deal_id: 0,
            order_id: 0,
            time: id as i64 * 60_000,
            side,
            price,
            quantity,
            fee,
            sum: quantity * price,
        }
    }

    // precision_amount 0.001 / 10, as the broker passes it
    const FLAT_TOLERANCE: f64 = 1e-4;

    #[test]
    fn long_round_trip_aggregates() {
        let mut deal = Deal::new(1, true);
        let mut opening = trade(1, OrderSide::Buy, 2.0, 100.0, 0.2);
        let mut closing = trade(2, OrderSide::Sell, 2.0, 110.0, 0.22);

        deal.apply_trade(&mut opening, FLAT_TOLERANCE);
        assert_eq!(deal.deal_type, Some(DealType::Long));
        assert_eq!(deal.quantity, 2.0);
        assert_eq!(deal.avg_buy_price, Some(100.0));
        assert!(deal.profit.is_none());

        deal.apply_trade(&mut closing, FLAT_TOLERANCE);
        assert_eq!(deal.quantity, 0.0);
        assert_eq!(deal.avg_sell_price, Some(110.0));
        // 220 - 200 - 0.42
        assert!((deal.profit.unwrap() - 19.58).abs() < 1e-9);
        assert_eq!(closing.deal_id, 1);
    }

    #[test]
    fn short_deal_type_from_first_trade() {
        let mut deal = Deal::new(2, true);
        let mut opening = trade(1, OrderSide::Sell, 1.0, 50.0, 0.0);
        deal.apply_trade(&mut opening, FLAT_TOLERANCE);
        assert_eq!(deal.deal_type, Some(DealType::Short));
        assert_eq!(deal.quantity, -1.0);
        assert_eq!(deal.unrealized_profit(45.0), 5.0);
    }

    #[test]
    fn dust_within_tolerance_still_finalizes_profit() {
        let mut deal = Deal::new(3, false);
        let mut opening = trade(1, OrderSide::Buy, 0.2, 96.0, 0.0);
        // Exit volume carries rounding dust from a fractional split.
        let mut closing = trade(2, OrderSide::Sell, 0.200_000_000_000_000_04, 90.0, 0.0);

        deal.apply_trade(&mut opening, FLAT_TOLERANCE);
        deal.apply_trade(&mut closing, FLAT_TOLERANCE);
        assert!(deal.quantity != 0.0);
        assert!(deal.quantity.abs() <= FLAT_TOLERANCE);
        assert!(deal.profit.is_some());
    }

    #[test]
    fn status_and_group_serialize_as_codes() {
        assert_eq!(serde_json::to_value(OrderStatus::Active).unwrap(), 1);
        assert_eq!(serde_json::to_value(OrderGroup::TakeProfit).unwrap(), 2);
        assert_eq!(serde_json::to_value(OrderSide::Buy).unwrap(), "buy");
        assert_eq!(serde_json::to_value(DealType::Short).unwrap(), "short");
    }

    #[test]
    fn trade_times_serialize_as_iso() {
        let value = serde_json::to_value(trade(1, OrderSide::Buy, 1.0, 10.0, 0.0)).unwrap();
        assert_eq!(value["time"], "1970-01-01T00:01:00");
    }
}
