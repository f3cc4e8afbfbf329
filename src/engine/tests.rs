//! End-to-end matching scenarios against a hot-only store.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::models::{OrderStatus, OrderType, Side, TimeInForce, UserOrdersQuery};
use crate::perp::{MarginLedger, PositionBook};
use crate::precision::Amount;

const PAIR: &str = "XOM/USDT";

struct Harness {
    engine: Arc<MatchingEngine>,
    store: Arc<TieredStore>,
    margin: Arc<MarginLedger>,
    positions: Arc<PositionBook>,
}

async fn harness() -> Harness {
    let config = Arc::new(AppConfig::for_tests(vec![PAIR.to_string()]));
    let store = TieredStore::start(&config).await.unwrap();
    let bus = Arc::new(EventBus::new(4096));
    let margin = Arc::new(MarginLedger::new());
    let positions = Arc::new(PositionBook::new(config.perp.maintenance_margin_bps));
    let engine = MatchingEngine::start(
        config,
        store.clone(),
        bus,
        margin.clone(),
        positions.clone(),
        None,
    )
    .await
    .unwrap();
    Harness {
        engine,
        store,
        margin,
        positions,
    }
}

fn amt(s: &str) -> Amount {
    Amount::from_decimal_str(s).unwrap()
}

fn request(user: &str, order_type: OrderType, side: Side, qty: &str) -> PlaceOrderRequest {
    PlaceOrderRequest {
        user_id: user.to_string(),
        pair: PAIR.to_string(),
        order_type,
        side,
        quantity: amt(qty),
        price: None,
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
    }
}

fn limit(user: &str, side: Side, price: &str, qty: &str) -> PlaceOrderRequest {
    let mut req = request(user, OrderType::Limit, side, qty);
    req.price = Some(amt(price));
    req
}

#[tokio::test]
async fn basic_limit_match() {
    let h = harness().await;
    // Seed asks [(1.26, 100), (1.27, 200)], empty bids.
    h.engine.place_order(limit("m1", Side::Sell, "1.26", "100")).await.unwrap();
    h.engine.place_order(limit("m2", Side::Sell, "1.27", "200")).await.unwrap();

    let response = h
        .engine
        .place_order(limit("taker", Side::Buy, "1.26", "150"))
        .await
        .unwrap();

    assert_eq!(response.status, OrderStatus::PartiallyFilled);
    assert_eq!(response.filled, amt("100"));
    assert_eq!(response.remaining, amt("50"));
    assert_eq!(response.average_price, Some(amt("1.26")));

    // The remainder rests as a bid at 1.26; 1.27 never traded.
    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert_eq!(book.bids.len(), 1);
    assert_eq!(book.bids[0].price, amt("1.26"));
    assert_eq!(book.bids[0].quantity, amt("50"));
    assert_eq!(book.asks.len(), 1);
    assert_eq!(book.asks[0].price, amt("1.27"));
    assert_eq!(book.asks[0].quantity, amt("200"));
}

#[tokio::test]
async fn price_time_priority_across_levels() {
    let h = harness().await;
    h.engine.place_order(limit("t1", Side::Buy, "1.25", "100")).await.unwrap();
    let second = h.engine.place_order(limit("t2", Side::Buy, "1.26", "100")).await.unwrap();
    let third = h.engine.place_order(limit("t3", Side::Buy, "1.26", "100")).await.unwrap();

    let response = h
        .engine
        .place_order(limit("seller", Side::Sell, "1.25", "150"))
        .await
        .unwrap();
    assert_eq!(response.status, OrderStatus::Filled);
    // Both fills at 1.26 (price improvement to the seller).
    assert_eq!(response.average_price, Some(amt("1.26")));

    // t2 fully filled, t3 half filled, t1 untouched.
    let t2 = h.store.get_order(&second.order_id).await.unwrap().unwrap();
    assert_eq!(t2.status, OrderStatus::Filled);
    let t3 = h.store.get_order(&third.order_id).await.unwrap().unwrap();
    assert_eq!(t3.status, OrderStatus::PartiallyFilled);
    assert_eq!(t3.remaining, amt("50"));

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert_eq!(book.bids[0].price, amt("1.26"));
    assert_eq!(book.bids[0].quantity, amt("50"));
    assert_eq!(book.bids[1].price, amt("1.25"));
    assert_eq!(book.bids[1].quantity, amt("100"));
}

#[tokio::test]
async fn fok_rejects_without_touching_the_book() {
    let h = harness().await;
    h.engine.place_order(limit("maker", Side::Sell, "1.26", "50")).await.unwrap();
    let before = h.engine.order_book(PAIR, 10).await.unwrap();

    let mut req = limit("taker", Side::Buy, "1.26", "100");
    req.time_in_force = TimeInForce::Fok;
    let err = h.engine.place_order(req).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_LIQUIDITY");

    let after = h.engine.order_book(PAIR, 10).await.unwrap();
    assert_eq!(after.asks, before.asks);
    assert_eq!(after.bids, before.bids);
    assert_eq!(after.sequence, before.sequence);
}

#[tokio::test]
async fn ioc_fills_what_it_can_and_rests_nothing() {
    let h = harness().await;
    h.engine.place_order(limit("maker", Side::Sell, "1.26", "50")).await.unwrap();

    let mut req = limit("taker", Side::Buy, "1.26", "100");
    req.time_in_force = TimeInForce::Ioc;
    let response = h.engine.place_order(req).await.unwrap();
    assert_eq!(response.status, OrderStatus::Cancelled);
    assert_eq!(response.filled, amt("50"));

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert!(book.bids.is_empty());
    assert!(book.asks.is_empty());
}

#[tokio::test]
async fn post_only_at_best_opposite_is_rejected() {
    let h = harness().await;
    h.engine.place_order(limit("maker", Side::Sell, "1.26", "50")).await.unwrap();

    let mut req = limit("taker", Side::Buy, "1.26", "10");
    req.post_only = true;
    let err = h.engine.place_order(req).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");

    // One tick below the best ask it rests.
    let mut req = limit("taker", Side::Buy, "1.25", "10");
    req.post_only = true;
    let response = h.engine.place_order(req).await.unwrap();
    assert_eq!(response.status, OrderStatus::Open);
    assert_eq!(response.filled, Amount::ZERO);
}

#[tokio::test]
async fn market_into_empty_side_is_a_liquidity_error() {
    let h = harness().await;
    let err = h
        .engine
        .place_order(request("taker", OrderType::Market, Side::Buy, "10"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_LIQUIDITY");
}

#[tokio::test]
async fn market_order_never_rests() {
    let h = harness().await;
    h.engine.place_order(limit("maker", Side::Sell, "1.26", "50")).await.unwrap();

    let response = h
        .engine
        .place_order(request("taker", OrderType::Market, Side::Buy, "80"))
        .await
        .unwrap();
    // Filled 50, remainder 30 cancelled.
    assert_eq!(response.filled, amt("50"));
    assert_eq!(response.status, OrderStatus::Cancelled);

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert!(book.bids.is_empty());
}

#[tokio::test]
async fn cancel_restores_the_book_and_rejects_foreign_cancels() {
    let h = harness().await;
    let placed = h.engine.place_order(limit("alice", Side::Buy, "1.20", "10")).await.unwrap();

    let err = h.engine.cancel_order(placed.order_id, "mallory").await.unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    let cancelled = h.engine.cancel_order(placed.order_id, "alice").await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert!(book.bids.is_empty());

    // Cancelling again is a conflict: the order is no longer open.
    let err = h.engine.cancel_order(placed.order_id, "alice").await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn idempotent_replay_returns_the_original_outcome() {
    let h = harness().await;
    h.engine.place_order(limit("maker", Side::Sell, "1.26", "100")).await.unwrap();

    let mut req = limit("taker", Side::Buy, "1.26", "100");
    req.idempotency_key = Some("replay-1".into());

    let first = h.engine.place_order(req.clone()).await.unwrap();
    let second = h.engine.place_order(req).await.unwrap();
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(first.filled, second.filled);

    // No duplicate trades: the maker filled exactly once.
    let trades = h.store.get_trades(PAIR, 100).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, amt("100"));
}

#[tokio::test]
async fn price_band_guard_rejects_outliers() {
    let h = harness().await;
    h.engine.place_order(limit("m", Side::Sell, "1.00", "10")).await.unwrap();
    // Establish a last trade at 1.00.
    h.engine.place_order(limit("t", Side::Buy, "1.00", "10")).await.unwrap();

    // 1.60 is 60% above the last trade; the default band is 50%.
    let err = h.engine.place_order(limit("t", Side::Buy, "1.60", "1")).await.unwrap_err();
    assert_eq!(err.code(), "RISK_REJECTED");

    // The rejection is persisted with its reason.
    let q = UserOrdersQuery {
        status: Some(OrderStatus::Rejected),
        ..Default::default()
    };
    let rejected = h.store.get_user_orders("t", &q).await.unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].reject_reason.is_some());
}

#[tokio::test]
async fn stop_loss_triggers_on_last_trade() {
    let h = harness().await;
    // Standing bid to absorb the triggered sell.
    h.engine.place_order(limit("bidder", Side::Buy, "1.10", "100")).await.unwrap();

    let mut stop = request("alice", OrderType::StopLoss, Side::Sell, "10");
    stop.stop_price = Some(amt("1.15"));
    let placed = h.engine.place_order(stop).await.unwrap();
    assert_eq!(placed.status, OrderStatus::Pending);

    // Trade prints at 1.10 <= stop 1.15: the stop fires and sells into the
    // standing bid.
    h.engine.place_order(limit("m", Side::Sell, "1.10", "5")).await.unwrap();

    let order = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled, amt("10"));

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    // 100 - 5 (print) - 10 (stop) left at 1.10.
    assert_eq!(book.bids[0].quantity, amt("85"));
}

#[tokio::test]
async fn oco_fill_of_one_leg_cancels_the_other() {
    let h = harness().await;
    // Seed a last trade near the target so the band guard stays quiet.
    h.engine.place_order(limit("m", Side::Sell, "1.28", "1")).await.unwrap();
    h.engine.place_order(limit("m", Side::Buy, "1.28", "1")).await.unwrap();

    let mut oco = request("alice", OrderType::Oco, Side::Sell, "100");
    oco.price = Some(amt("1.30"));
    oco.stop_price = Some(amt("1.20"));
    oco.stop_limit_price = Some(amt("1.19"));
    let placed = h.engine.place_order(oco).await.unwrap();
    assert_eq!(placed.status, OrderStatus::Open);

    let limit_leg = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    let stop_leg_id = limit_leg.linked_order_id.expect("linked leg");
    let stop_leg = h.store.get_order(&stop_leg_id).await.unwrap().unwrap();
    assert_eq!(stop_leg.linked_order_id, Some(limit_leg.id));

    // The market lifts the limit leg at 1.30.
    let buy = h.engine.place_order(limit("buyer", Side::Buy, "1.30", "100")).await.unwrap();
    assert_eq!(buy.status, OrderStatus::Filled);

    let limit_leg = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(limit_leg.status, OrderStatus::Filled);
    let stop_leg = h.store.get_order(&stop_leg_id).await.unwrap().unwrap();
    assert_eq!(stop_leg.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn iceberg_shows_only_the_visible_slice_and_refills() {
    let h = harness().await;
    let mut iceberg = request("alice", OrderType::Iceberg, Side::Buy, "1000");
    iceberg.price = Some(amt("1.25"));
    iceberg.visible_amount = Some(amt("100"));
    let placed = h.engine.place_order(iceberg).await.unwrap();

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert_eq!(book.bids[0].quantity, amt("100"));

    // Consume the visible slice; a fresh one appears.
    h.engine.place_order(limit("seller", Side::Sell, "1.25", "100")).await.unwrap();

    let book = h.engine.order_book(PAIR, 10).await.unwrap();
    assert_eq!(book.bids[0].price, amt("1.25"));
    assert_eq!(book.bids[0].quantity, amt("100"));

    let parent = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(parent.filled, amt("100"));
    assert_eq!(parent.remaining, amt("900"));
    assert_eq!(parent.status, OrderStatus::PartiallyFilled);
}

#[tokio::test]
async fn twap_parent_decomposes_and_aggregates() {
    let h = harness().await;
    // Resting liquidity for the children to take.
    h.engine.place_order(limit("maker", Side::Sell, "1.25", "1000")).await.unwrap();

    let mut twap = request("alice", OrderType::Twap, Side::Buy, "100");
    twap.price = Some(amt("1.25"));
    twap.slices = Some(2);
    twap.duration_secs = Some(1);
    let placed = h.engine.place_order(twap).await.unwrap();

    // The first child goes out immediately.
    let parent = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(parent.filled, amt("50"));

    // The wheel paces the second child.
    tokio::time::sleep(Duration::from_millis(1400)).await;
    let parent = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(parent.filled, amt("100"));
    assert_eq!(parent.status, OrderStatus::Filled);
}

#[tokio::test]
async fn trailing_stop_ratchets_and_fires() {
    let h = harness().await;

    let mut trail = request("alice", OrderType::TrailingStop, Side::Sell, "10");
    trail.stop_price = Some(amt("0.95"));
    trail.trail_distance = Some(amt("0.05"));
    let placed = h.engine.place_order(trail).await.unwrap();

    // Print 1.20: the stop ratchets to 1.15.
    h.engine.place_order(limit("m", Side::Sell, "1.20", "5")).await.unwrap();
    h.engine.place_order(limit("t", Side::Buy, "1.20", "5")).await.unwrap();

    // Standing bid, then a print at 1.15 fires the stop into it.
    h.engine.place_order(limit("bidder", Side::Buy, "1.15", "50")).await.unwrap();
    h.engine.place_order(limit("m", Side::Sell, "1.15", "5")).await.unwrap();

    let order = h.store.get_order(&placed.order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled, amt("10"));
}

#[tokio::test]
async fn perpetual_margin_admission_and_liquidation() {
    let h = harness().await;
    h.margin.deposit("long", amt("1000"));
    h.margin.deposit("short", amt("1000"));

    // Short maker provides the other side at 1.50.
    let mut maker = request("short", OrderType::PerpetualLimit, Side::Sell, "10");
    maker.price = Some(amt("1.50"));
    maker.leverage = 10;
    h.engine.place_order(maker).await.unwrap();

    // Long taker: size 10 x 1.50 at 10x costs 1.5 margin.
    let mut taker = request("long", OrderType::PerpetualLimit, Side::Buy, "10");
    taker.price = Some(amt("1.50"));
    taker.leverage = 10;
    let response = h.engine.place_order(taker).await.unwrap();
    assert_eq!(response.status, OrderStatus::Filled);

    let position = h.positions.get("long", PAIR).expect("open long");
    assert_eq!(position.size, amt("10"));
    assert_eq!(position.margin, amt("1.5"));
    assert_eq!(h.margin.balance("long"), amt("998.5"));

    // Mark collapses: equity hits zero, below maintenance.
    h.engine.update_mark_price(PAIR, amt("1.35")).await.unwrap();
    // Stats round-trip drains the command queue.
    h.engine.pair_stats(PAIR).await.unwrap();

    assert!(h.positions.get("long", PAIR).is_none());
    // Realized loss never exceeds the deposited margin.
    assert_eq!(h.margin.balance("long"), amt("998.5"));
    // The short absorbed the close via ADL and realized its profit.
    assert!(h.positions.get("short", PAIR).is_none());
    assert_eq!(h.margin.balance("short"), amt("1001.5"));
}

#[tokio::test]
async fn insufficient_margin_is_rejected() {
    let h = harness().await;
    h.margin.deposit("trader", amt("1"));

    let mut req = request("trader", OrderType::PerpetualLimit, Side::Buy, "10");
    req.price = Some(amt("1.50"));
    req.leverage = 10;
    // Requires 1.5 > 1 free.
    let err = h.engine.place_order(req).await.unwrap_err();
    assert_eq!(err.code(), "RISK_REJECTED");
}

#[tokio::test]
async fn unknown_pair_is_rejected() {
    let h = harness().await;
    let err = h
        .engine
        .place_order(limit("alice", Side::Buy, "1.0", "1").pair_override("NOPE/USDT"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_PAIR");
}

impl PlaceOrderRequest {
    fn pair_override(mut self, pair: &str) -> Self {
        self.pair = pair.to_string();
        self
    }
}

#[tokio::test]
async fn sequences_are_gap_free_per_pair() {
    let h = harness().await;
    h.engine.place_order(limit("a", Side::Buy, "1.20", "10")).await.unwrap();
    h.engine.place_order(limit("b", Side::Sell, "1.30", "10")).await.unwrap();
    let placed = h.engine.place_order(limit("c", Side::Buy, "1.21", "10")).await.unwrap();
    h.engine.cancel_order(placed.order_id, "c").await.unwrap();

    // 3 inserts + 1 removal = 4 committed mutations.
    let stats = h.engine.pair_stats(PAIR).await.unwrap();
    assert_eq!(stats.sequence, 4);
    assert!(!stats.halted);
}

#[tokio::test]
async fn conservation_of_filled_quantity() {
    let h = harness().await;
    h.engine.place_order(limit("m1", Side::Sell, "1.25", "60")).await.unwrap();
    h.engine.place_order(limit("m2", Side::Sell, "1.26", "60")).await.unwrap();
    h.engine.place_order(limit("t", Side::Buy, "1.26", "100")).await.unwrap();

    let trades = h.store.get_trades(PAIR, 100).await.unwrap();
    let traded: Amount = trades
        .iter()
        .fold(Amount::ZERO, |acc, t| acc.saturating_add(t.quantity));
    assert_eq!(traded, amt("100"));
}
