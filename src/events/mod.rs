//! Live-update bus.
//!
//! Typed broadcast channels fan committed state out to subscribers: order
//! lifecycle, trades, book updates, and perpetual events. Events are
//! published from the per-pair matching task in commit order, so per-pair
//! sequence ordering is preserved within every subscription.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::book::BookSnapshot;
use crate::models::position::SignedAmount;
use crate::models::{Order, OrderStatus, Position, Trade};
use crate::precision::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderEventKind {
    OrderPlaced,
    OrderUpdated,
    OrderCancelled,
    OrderFilled,
    OrderRejected,
    OrderTriggered,
    OrderExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: Uuid,
    pub user_id: String,
    pub pair: String,
    pub status: OrderStatus,
    pub filled: Amount,
    pub remaining: Amount,
    pub sequence: u64,
    pub timestamp: i64,
}

impl OrderEvent {
    pub fn from_order(kind: OrderEventKind, order: &Order, sequence: u64) -> Self {
        OrderEvent {
            kind,
            order_id: order.id,
            user_id: order.user_id.clone(),
            pair: order.pair.clone(),
            status: order.status,
            filled: order.filled,
            remaining: order.remaining,
            sequence,
            timestamp: order.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub pair: String,
    pub trade_id: Uuid,
    pub price: Amount,
    pub quantity: Amount,
    pub buyer_is_maker: bool,
    pub timestamp: i64,
    pub sequence: u64,
}

impl From<&Trade> for TradeEvent {
    fn from(t: &Trade) -> Self {
        TradeEvent {
            pair: t.pair.clone(),
            trade_id: t.id,
            price: t.price,
            quantity: t.quantity,
            buyer_is_maker: t.buyer_is_maker,
            timestamp: t.timestamp,
            sequence: t.sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEventKind {
    Position,
    Liquidation,
    Funding,
    AutoDeleverage,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub kind: PositionEventKind,
    pub user_id: String,
    pub contract: String,
    pub size: Amount,
    pub mark_price: Amount,
    pub unrealized_pnl: SignedAmount,
    pub timestamp: i64,
}

impl PositionEvent {
    pub fn from_position(kind: PositionEventKind, p: &Position) -> Self {
        PositionEvent {
            kind,
            user_id: p.user_id.clone(),
            contract: p.contract.clone(),
            size: p.size,
            mark_price: p.mark_price,
            unrealized_pnl: p.unrealized_pnl,
            timestamp: p.updated_at,
        }
    }
}

/// Broadcast hub handed to subscribers and to the per-pair workers.
///
/// Senders never block; a lagging subscriber observes
/// `RecvError::Lagged` rather than stalling the matching path.
pub struct EventBus {
    orders: broadcast::Sender<OrderEvent>,
    trades: broadcast::Sender<TradeEvent>,
    books: broadcast::Sender<BookSnapshot>,
    positions: broadcast::Sender<PositionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (orders, _) = broadcast::channel(capacity);
        let (trades, _) = broadcast::channel(capacity);
        let (books, _) = broadcast::channel(capacity);
        let (positions, _) = broadcast::channel(capacity);
        EventBus {
            orders,
            trades,
            books,
            positions,
        }
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<OrderEvent> {
        self.orders.subscribe()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeEvent> {
        self.trades.subscribe()
    }

    pub fn subscribe_books(&self) -> broadcast::Receiver<BookSnapshot> {
        self.books.subscribe()
    }

    pub fn subscribe_positions(&self) -> broadcast::Receiver<PositionEvent> {
        self.positions.subscribe()
    }

    pub fn publish_order(&self, event: OrderEvent) {
        metrics::counter!("dex_events_order_total").increment(1);
        let _ = self.orders.send(event);
    }

    pub fn publish_trade(&self, event: TradeEvent) {
        metrics::counter!("dex_events_trade_total").increment(1);
        let _ = self.trades.send(event);
    }

    pub fn publish_book(&self, snapshot: BookSnapshot) {
        let _ = self.books.send(snapshot);
    }

    pub fn publish_position(&self, event: PositionEvent) {
        let _ = self.positions.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, Side};

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_trades();

        for seq in 1..=3u64 {
            bus.publish_trade(TradeEvent {
                pair: "XOM/USDT".into(),
                trade_id: Uuid::new_v4(),
                price: Amount::from_u64(1),
                quantity: Amount::from_u64(1),
                buyer_is_maker: false,
                timestamp: seq as i64,
                sequence: seq,
            });
        }

        for expected in 1..=3u64 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.sequence, expected);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        let order = Order::new(
            "alice",
            "XOM/USDT",
            OrderType::Limit,
            Side::Buy,
            Amount::from_u64(1),
            1,
        );
        bus.publish_order(OrderEvent::from_order(OrderEventKind::OrderPlaced, &order, 1));
    }
}
