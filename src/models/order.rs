use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use crate::error::CoreError;
use crate::precision::{self, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_side", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLimit,
    TrailingStop,
    Oco,
    Iceberg,
    Twap,
    Vwap,
    PerpetualLimit,
    PerpetualMarket,
}

impl OrderType {
    /// Orders that wait in the trigger set instead of the ladder.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss | OrderType::StopLimit | OrderType::TrailingStop
        )
    }

    /// Parent orders decomposed into child slices.
    pub fn is_sliced(&self) -> bool {
        matches!(self, OrderType::Twap | OrderType::Vwap)
    }

    pub fn is_perpetual(&self) -> bool {
        matches!(self, OrderType::PerpetualLimit | OrderType::PerpetualMarket)
    }

    /// Whether a limit price is required at ingress.
    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            OrderType::Limit
                | OrderType::StopLimit
                | OrderType::Oco
                | OrderType::Iceberg
                | OrderType::Twap
                | OrderType::Vwap
                | OrderType::PerpetualLimit
        )
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss | OrderType::StopLimit | OrderType::TrailingStop | OrderType::Oco
        )
    }

    /// The behavior the order takes once it is live in the ladder.
    pub fn matches_as_market(&self) -> bool {
        matches!(
            self,
            OrderType::Market | OrderType::StopLoss | OrderType::PerpetualMarket
        )
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopLoss => "stop_loss",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
            OrderType::Oco => "oco",
            OrderType::Iceberg => "iceberg",
            OrderType::Twap => "twap",
            OrderType::Vwap => "vwap",
            OrderType::PerpetualLimit => "perpetual_limit",
            OrderType::PerpetualMarket => "perpetual_market",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good Till Cancel
    #[default]
    Gtc,
    /// Valid for the trading day session
    Day,
    /// Immediate or Cancel
    Ioc,
    /// Fill or Kill
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Day => write!(f, "DAY"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Triggered,
    Rejected,
}

impl OrderStatus {
    /// Terminal orders leave in-memory state and persist in the warm tier
    /// until archived.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Triggered => "triggered",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// An order: immutable identity, mutable fill state.
///
/// `filled + remaining == quantity` at all times; status becomes `Filled`
/// exactly when `remaining` reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: String,
    pub pair: String,
    pub order_type: OrderType,
    pub side: Side,
    pub quantity: Amount,
    pub price: Option<Amount>,
    pub stop_price: Option<Amount>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
    pub leverage: u32,
    pub status: OrderStatus,
    pub filled: Amount,
    pub remaining: Amount,
    pub average_price: Option<Amount>,
    pub fees: Amount,
    /// Arrival time, milliseconds; monotonic per pair.
    pub timestamp: i64,
    pub updated_at: i64,
    pub linked_order_id: Option<Uuid>,
    pub parent_order_id: Option<Uuid>,
    pub visible_amount: Option<Amount>,
    pub total_amount: Option<Amount>,
    /// Cold-tier locator once archived.
    pub archive_ref: Option<String>,
    /// Reason recorded alongside a REJECTED status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    /// Trailing distance for trailing stops, in price units.
    pub trail_distance: Option<Amount>,
    /// Child-slice count for TWAP/VWAP parents.
    pub slices: Option<u32>,
    /// Execution window for TWAP/VWAP parents, milliseconds.
    pub duration_ms: Option<i64>,
    /// Quote volume filled so far; backs the running average price.
    pub quote_filled: Amount,
}

impl Order {
    pub fn new(
        user_id: &str,
        pair: &str,
        order_type: OrderType,
        side: Side,
        quantity: Amount,
        timestamp: i64,
    ) -> Self {
        Order {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            pair: pair.to_string(),
            order_type,
            side,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::default(),
            post_only: false,
            reduce_only: false,
            leverage: 1,
            status: OrderStatus::Pending,
            filled: Amount::ZERO,
            remaining: quantity,
            average_price: None,
            fees: Amount::ZERO,
            timestamp,
            updated_at: timestamp,
            linked_order_id: None,
            parent_order_id: None,
            visible_amount: None,
            total_amount: None,
            archive_ref: None,
            reject_reason: None,
            trail_distance: None,
            slices: None,
            duration_ms: None,
            quote_filled: Amount::ZERO,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Price cap used by the immediate-match pass and the price-band guard.
    /// Market-style orders have no cap.
    pub fn effective_price(&self) -> Option<Amount> {
        if self.order_type.matches_as_market() {
            None
        } else {
            self.price
        }
    }

    /// Apply a fill, maintaining `filled + remaining == quantity`, the
    /// running volume-weighted average price, and the status transition to
    /// `Filled` exactly when the order is exhausted.
    pub fn apply_fill(&mut self, qty: Amount, price: Amount, fee: Amount, now: i64) -> Result<(), CoreError> {
        if qty.is_zero() {
            return Err(CoreError::Fatal("zero-quantity fill".into()));
        }
        if qty > self.remaining {
            return Err(CoreError::Fatal(format!(
                "fill {qty} exceeds remaining {} on order {}",
                self.remaining, self.id
            )));
        }

        self.filled += qty;
        self.remaining -= qty;
        self.fees = self.fees.saturating_add(fee);

        let quote = precision::quote_quantity(price, qty)?;
        self.quote_filled = self.quote_filled.saturating_add(quote);
        if !self.filled.is_zero() {
            self.average_price = Some(precision::mul_div_amount(
                self.quote_filled,
                Amount::ONE,
                self.filled,
            )?);
        }

        self.status = if self.remaining.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
        Ok(())
    }

    /// Move to a terminal or trigger state without touching fill progress.
    pub fn transition(&mut self, status: OrderStatus, now: i64) {
        self.status = status;
        self.updated_at = now;
    }
}

// ============================================================================
// Ingress request / response shapes
// ============================================================================

fn default_leverage() -> u32 {
    1
}

/// `placeOrder` request, as handed over by the transport layer.
///
/// Amounts and prices arrive as base-unit decimal strings already parsed
/// into [`Amount`] by serde; human-decimal entry points are the transport's
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 3))]
    pub pair: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: Side,
    pub quantity: Amount,
    #[serde(default)]
    pub price: Option<Amount>,
    #[serde(default)]
    pub stop_price: Option<Amount>,
    /// Limit price of the stop leg for OCO orders.
    #[serde(default)]
    pub stop_limit_price: Option<Amount>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub reduce_only: bool,
    #[validate(range(min = 1))]
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Visible tranche for iceberg orders.
    #[serde(default)]
    pub visible_amount: Option<Amount>,
    /// Child count for TWAP/VWAP parents.
    #[serde(default)]
    pub slices: Option<u32>,
    /// Execution window for TWAP/VWAP parents, seconds.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Trailing distance for trailing stops, in price units.
    #[serde(default)]
    pub trail_distance: Option<Amount>,
    /// Client idempotency key; replays return the original outcome.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub success: bool,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled: Amount,
    pub remaining: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<Amount>,
    pub fees: Amount,
}

impl PlaceOrderResponse {
    pub fn from_order(order: &Order) -> Self {
        PlaceOrderResponse {
            success: true,
            order_id: order.id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining,
            average_price: order.average_price,
            fees: order.fees,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderResponse {
    pub success: bool,
    pub order_id: Uuid,
    pub status: OrderStatus,
}

/// `getUserOrders` filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserOrdersQuery {
    pub pair: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl UserOrdersQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, order: &Order) -> bool {
        if let Some(pair) = &self.pair {
            if &order.pair != pair {
                return false;
            }
        }
        if let Some(status) = self.status {
            if order.status != status {
                return false;
            }
        }
        true
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::from_decimal_str(s).unwrap()
    }

    fn test_order(qty: &str) -> Order {
        Order::new("alice", "XOM/USDT", OrderType::Limit, Side::Buy, amt(qty), 1)
    }

    #[test]
    fn fill_maintains_quantity_invariant() {
        let mut order = test_order("150");
        order.apply_fill(amt("100"), amt("1.26"), Amount::ZERO, 2).unwrap();

        assert_eq!(order.filled, amt("100"));
        assert_eq!(order.remaining, amt("50"));
        assert_eq!(order.filled + order.remaining, order.quantity);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        order.apply_fill(amt("50"), amt("1.27"), Amount::ZERO, 3).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.remaining.is_zero());
    }

    #[test]
    fn fill_beyond_remaining_is_fatal() {
        let mut order = test_order("10");
        let err = order
            .apply_fill(amt("11"), amt("1"), Amount::ZERO, 2)
            .unwrap_err();
        assert_eq!(err.code(), "FATAL");
    }

    #[test]
    fn average_price_is_volume_weighted() {
        let mut order = test_order("300");
        order.apply_fill(amt("100"), amt("1.20"), Amount::ZERO, 2).unwrap();
        order.apply_fill(amt("200"), amt("1.50"), Amount::ZERO, 3).unwrap();
        // (100*1.20 + 200*1.50) / 300 = 1.40
        assert_eq!(order.average_price, Some(amt("1.40")));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Triggered.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn conditional_and_sliced_classification() {
        assert!(OrderType::StopLimit.is_conditional());
        assert!(OrderType::Twap.is_sliced());
        assert!(OrderType::PerpetualMarket.is_perpetual());
        assert!(OrderType::Market.matches_as_market());
        assert!(!OrderType::Limit.is_conditional());
    }

    #[test]
    fn request_validation() {
        let req = PlaceOrderRequest {
            user_id: String::new(),
            pair: "XOM/USDT".into(),
            order_type: OrderType::Limit,
            side: Side::Buy,
            quantity: amt("1"),
            price: Some(amt("1.26")),
            stop_price: None,
            stop_limit_price: None,
            time_in_force: TimeInForce::Gtc,
            post_only: false,
            reduce_only: false,
            leverage: 1,
            visible_amount: None,
            slices: None,
            duration_secs: None,
            trail_distance: None,
            idempotency_key: None,
        };
        assert!(validator::Validate::validate(&req).is_err());
    }

    #[test]
    fn user_orders_query_filters() {
        let order = test_order("1");
        let q = UserOrdersQuery {
            pair: Some("XOM/USDT".into()),
            status: Some(OrderStatus::Pending),
            ..Default::default()
        };
        assert!(q.matches(&order));
        let q = UserOrdersQuery {
            pair: Some("ETH/USDT".into()),
            ..Default::default()
        };
        assert!(!q.matches(&order));
    }
}
