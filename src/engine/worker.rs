//! Per-pair single-writer matching task.
//!
//! Each trading pair is owned by exactly one of these tasks: every ladder
//! mutation for the pair flows through its command channel, giving a strict
//! total order of mutations and gap-free sequence numbers. The inner
//! matching loop is synchronous from validation through book commit;
//! storage and event I/O is handed off and never awaited on that path.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::book::{BookEntry, BookSnapshot, OrderBook};
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::events::{
    EventBus, OrderEvent, OrderEventKind, PositionEvent, PositionEventKind, TradeEvent,
};
use crate::models::order::now_millis;
use crate::models::position::SignedAmount;
use crate::models::{
    CancelOrderResponse, Order, OrderStatus, OrderType, PlaceOrderRequest, PlaceOrderResponse,
    PositionSide, Side, TimeInForce, Trade,
};
use crate::perp::{
    margin_required, LiquidationEngine, LiquidationOutcome, MarginLedger, PositionBook,
};
use crate::precision::{self, Amount};
use crate::settlement::BatchPlanner;
use crate::storage::TieredStore;

use super::conditional::TriggerSet;
use super::matching::{match_incoming, Fill};
use super::slicer::{SliceParent, SlicerState};
use super::validate::{check_price_band, validate_request};
use super::wheel::{WheelEvent, WheelHandle};

const SNAPSHOT_DEPTH: usize = 50;

/// Commands accepted by a pair's single-writer task.
pub enum PairCommand {
    Place {
        request: PlaceOrderRequest,
        resp: oneshot::Sender<Result<PlaceOrderResponse, CoreError>>,
    },
    Cancel {
        order_id: Uuid,
        user_id: String,
        resp: oneshot::Sender<Result<CancelOrderResponse, CoreError>>,
    },
    Snapshot {
        depth: usize,
        resp: oneshot::Sender<Result<BookSnapshot, CoreError>>,
    },
    GetOpenOrder {
        order_id: Uuid,
        resp: oneshot::Sender<Option<Order>>,
    },
    ReleaseSlice {
        parent_id: Uuid,
    },
    ExpireOrder {
        order_id: Uuid,
    },
    MarkUpdate {
        mark: Amount,
    },
    Stats {
        resp: oneshot::Sender<PairStats>,
    },
    Flush {
        resp: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PairStats {
    pub pair: String,
    pub orders_accepted: u64,
    pub orders_rejected: u64,
    pub trades: u64,
    pub resting_orders: usize,
    pub sequence: u64,
    pub halted: bool,
}

/// Shared services handed to every pair worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub config: Arc<AppConfig>,
    pub store: Arc<TieredStore>,
    pub bus: Arc<EventBus>,
    pub wheel: WheelHandle,
    pub margin: Arc<MarginLedger>,
    pub positions: Arc<PositionBook>,
    pub planner: Option<Arc<BatchPlanner>>,
    /// Global order id -> pair routing index.
    pub order_pairs: Arc<DashMap<Uuid, String>>,
}

pub struct PairWorker {
    pair: String,
    deps: WorkerDeps,
    book: OrderBook,
    /// Every non-terminal order on this pair, including parked conditionals
    /// and slice parents.
    orders: HashMap<Uuid, Order>,
    triggers: TriggerSet,
    slicer: SlicerState,
    /// Margin reserved (not yet consumed into a position) per order.
    reserved: HashMap<Uuid, Amount>,
    /// Idempotent replays of `placeOrder` return the original outcome.
    idempotency: HashMap<String, PlaceOrderResponse>,
    liquidation: LiquidationEngine,
    stats: PairStats,
    last_ts: i64,
    halted: bool,
}

impl PairWorker {
    pub fn new(pair: &str, sequence: u64, deps: WorkerDeps) -> Self {
        let maintenance_bps = deps.config.perp.maintenance_margin_bps;
        PairWorker {
            pair: pair.to_string(),
            book: OrderBook::with_sequence(pair, sequence),
            orders: HashMap::new(),
            triggers: TriggerSet::new(),
            slicer: SlicerState::new(),
            reserved: HashMap::new(),
            idempotency: HashMap::new(),
            liquidation: LiquidationEngine::new(maintenance_bps),
            stats: PairStats {
                pair: pair.to_string(),
                ..PairStats::default()
            },
            last_ts: 0,
            halted: false,
            deps,
        }
    }

    /// Replay recovered open orders into the worker before ingress opens.
    /// Orders must arrive in (timestamp, id) order.
    pub fn recover(&mut self, orders: Vec<Order>) {
        for order in orders {
            self.deps.order_pairs.insert(order.id, self.pair.clone());
            match order.order_type {
                t if t.is_conditional() => {
                    self.triggers.insert(&order);
                }
                t if t.is_sliced() => {
                    if let Ok(parent) = SliceParent::from_order(&order) {
                        let interval = parent.interval_ms;
                        self.slicer.track_parent(parent);
                        self.deps.wheel.schedule_in(
                            interval,
                            WheelEvent::ReleaseSlice {
                                pair: self.pair.clone(),
                                parent_id: order.id,
                            },
                        );
                    }
                }
                _ => {
                    if let Some(price) = order.price {
                        let visible = match order.visible_amount {
                            Some(v) => {
                                self.slicer.track_iceberg(order.id, v, order.remaining);
                                v.min(order.remaining)
                            }
                            None => order.remaining,
                        };
                        self.book.insert(
                            order.side,
                            BookEntry {
                                order_id: order.id,
                                user_id: order.user_id.clone(),
                                price,
                                remaining: visible,
                                timestamp: order.timestamp,
                            },
                        );
                    }
                }
            }
            self.orders.insert(order.id, order);
        }
        self.stats.resting_orders = self.book.order_count();
        tracing::info!(pair = %self.pair, orders = self.orders.len(), "recovered open orders");
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<PairCommand>) {
        tracing::info!(pair = %self.pair, "pair worker started");
        while let Some(command) = rx.recv().await {
            match command {
                PairCommand::Place { request, resp } => {
                    let result = self.handle_place(request);
                    let _ = resp.send(result);
                }
                PairCommand::Cancel {
                    order_id,
                    user_id,
                    resp,
                } => {
                    let result = self.handle_cancel(&order_id, &user_id);
                    let _ = resp.send(result);
                }
                PairCommand::Snapshot { depth, resp } => {
                    let _ = resp.send(self.handle_snapshot(depth));
                }
                PairCommand::GetOpenOrder { order_id, resp } => {
                    let _ = resp.send(self.orders.get(&order_id).cloned());
                }
                PairCommand::ReleaseSlice { parent_id } => {
                    self.with_commit(|w| w.handle_release_slice(parent_id));
                }
                PairCommand::ExpireOrder { order_id } => {
                    self.with_commit(|w| w.handle_expiry(order_id));
                }
                PairCommand::MarkUpdate { mark } => {
                    self.handle_mark_update(mark);
                }
                PairCommand::Stats { resp } => {
                    let mut stats = self.stats.clone();
                    stats.resting_orders = self.book.order_count();
                    stats.sequence = self.book.sequence();
                    stats.halted = self.halted;
                    let _ = resp.send(stats);
                }
                PairCommand::Flush { resp } => {
                    self.flush_open_state();
                    let _ = resp.send(());
                    break;
                }
            }
        }
        tracing::info!(pair = %self.pair, "pair worker stopped");
    }

    /// Monotonic per-pair milliseconds.
    fn next_ts(&mut self) -> i64 {
        let now = now_millis();
        self.last_ts = if now > self.last_ts { now } else { self.last_ts + 1 };
        self.last_ts
    }

    /// Run a mutation, then cascade triggers and publish the committed book
    /// state if anything changed.
    fn with_commit<F: FnOnce(&mut Self)>(&mut self, f: F) {
        let before = self.book.sequence();
        f(self);
        if self.book.sequence() != before {
            self.after_commit();
        }
    }

    // ========================================================================
    // Place
    // ========================================================================

    fn handle_place(&mut self, request: PlaceOrderRequest) -> Result<PlaceOrderResponse, CoreError> {
        if self.halted {
            return Err(CoreError::Fatal(format!("pair {} is halted", self.pair)));
        }

        if let Some(key) = &request.idempotency_key {
            if let Some(prior) = self.idempotency.get(key) {
                return Ok(prior.clone());
            }
        }

        let before = self.book.sequence();
        let result = self.place_inner(&request);
        if self.book.sequence() != before {
            self.after_commit();
        }

        match &result {
            Ok(response) => {
                self.stats.orders_accepted += 1;
                if let Some(key) = &request.idempotency_key {
                    self.idempotency.insert(key.clone(), response.clone());
                }
            }
            Err(e) => {
                self.stats.orders_rejected += 1;
                metrics::counter!("dex_orders_rejected_total").increment(1);
                tracing::debug!(pair = %self.pair, code = e.code(), "order rejected: {e}");
            }
        }
        result
    }

    fn place_inner(&mut self, request: &PlaceOrderRequest) -> Result<PlaceOrderResponse, CoreError> {
        validate_request(request, &self.deps.config)?;

        let now = self.next_ts();
        let order = self.build_order(request, now);

        // The band guard applies to any explicitly priced order.
        if let Err(e) = check_price_band(
            order.effective_price(),
            self.book.last_trade_price(),
            self.deps.config.engine.price_band_bps,
        ) {
            return Err(self.persist_rejection(order, e));
        }

        if let Err(e) = self.admit_margin(&order) {
            return Err(self.persist_rejection(order, e));
        }

        match order.order_type {
            t if t.is_conditional() => self.park_conditional(order),
            t if t.is_sliced() => self.start_sliced_parent(order),
            OrderType::Oco => self.place_oco(order, request),
            _ => self.execute_order(order),
        }
    }

    fn build_order(&self, request: &PlaceOrderRequest, now: i64) -> Order {
        let mut order = Order::new(
            &request.user_id,
            &self.pair,
            request.order_type,
            request.side,
            request.quantity,
            now,
        );
        order.price = request.price;
        order.stop_price = request.stop_price;
        order.time_in_force = request.time_in_force;
        order.post_only = request.post_only;
        order.reduce_only = request.reduce_only;
        order.leverage = request.leverage;
        order.trail_distance = request.trail_distance;
        if request.order_type == OrderType::Iceberg {
            order.visible_amount = request.visible_amount;
            order.total_amount = Some(request.quantity);
        }
        if request.order_type.is_sliced() {
            order.slices = request.slices;
            order.duration_ms = request.duration_secs.map(|s| (s * 1000) as i64);
        }
        order
    }

    /// Rejections are persisted with their reason and never mutate the
    /// book.
    fn persist_rejection(&mut self, mut order: Order, error: CoreError) -> CoreError {
        self.release_reservation(&order);
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(format!("{}: {error}", error.code()));
        order.updated_at = order.timestamp;
        self.deps.store.record_order(&order);
        self.deps.bus.publish_order(OrderEvent::from_order(
            OrderEventKind::OrderRejected,
            &order,
            self.book.sequence(),
        ));
        error
    }

    /// Reserve margin for perpetual orders before they can match.
    fn admit_margin(&mut self, order: &Order) -> Result<(), CoreError> {
        if !order.order_type.is_perpetual() {
            return Ok(());
        }
        if order.reduce_only {
            let open = self
                .deps
                .positions
                .get(&order.user_id, &self.pair)
                .map(|p| p.size)
                .unwrap_or(Amount::ZERO);
            if order.quantity > open {
                return Err(CoreError::Risk(
                    "reduce-only size exceeds the open position".into(),
                ));
            }
            return Ok(());
        }
        let reference = order
            .price
            .or_else(|| self.book.last_trade_price())
            .ok_or_else(|| CoreError::Risk("no reference price for margin computation".into()))?;
        let required = margin_required(order.quantity, reference, order.leverage)?;
        self.deps.margin.reserve(&order.user_id, required)?;
        self.reserved.insert(order.id, required);
        Ok(())
    }

    // ==================== Conditional / OCO / sliced entry ====================

    fn park_conditional(&mut self, mut order: Order) -> Result<PlaceOrderResponse, CoreError> {
        order.status = OrderStatus::Pending;
        self.triggers.insert(&order);
        self.index_order(&order);
        self.deps.store.record_order(&order);
        self.deps.bus.publish_order(OrderEvent::from_order(
            OrderEventKind::OrderPlaced,
            &order,
            self.book.sequence(),
        ));
        let response = PlaceOrderResponse::from_order(&order);
        self.orders.insert(order.id, order);
        Ok(response)
    }

    fn start_sliced_parent(&mut self, mut order: Order) -> Result<PlaceOrderResponse, CoreError> {
        let parent = SliceParent::from_order(&order)?;
        order.status = OrderStatus::Open;
        self.slicer.track_parent(parent);
        self.index_order(&order);
        self.deps.store.record_order(&order);
        self.deps.bus.publish_order(OrderEvent::from_order(
            OrderEventKind::OrderPlaced,
            &order,
            self.book.sequence(),
        ));
        let response = PlaceOrderResponse::from_order(&order);
        let parent_id = order.id;
        self.orders.insert(order.id, order);

        // First child goes out immediately; the wheel paces the rest.
        self.handle_release_slice(parent_id);
        Ok(response)
    }

    /// OCO: a limit leg at the target plus a stop-limit leg at the stop,
    /// linked so that a fill or cancel of one atomically cancels the other.
    fn place_oco(
        &mut self,
        limit_leg: Order,
        request: &PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, CoreError> {
        let now = limit_leg.timestamp;
        let mut limit_leg = limit_leg;
        limit_leg.order_type = OrderType::Limit;
        limit_leg.stop_price = None;

        let mut stop_leg = Order::new(
            &request.user_id,
            &self.pair,
            OrderType::StopLimit,
            request.side,
            request.quantity,
            now,
        );
        stop_leg.price = request.stop_limit_price;
        stop_leg.stop_price = request.stop_price;
        stop_leg.time_in_force = request.time_in_force;

        limit_leg.linked_order_id = Some(stop_leg.id);
        stop_leg.linked_order_id = Some(limit_leg.id);
        let stop_id = stop_leg.id;

        self.park_conditional(stop_leg)?;
        match self.execute_order(limit_leg) {
            Ok(response) => Ok(response),
            Err(e) => {
                // A dead limit leg must not leave its sibling armed.
                let _ = self.cancel_internal(&stop_id, None, OrderStatus::Cancelled);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Taker execution and commit
    // ========================================================================

    /// Run the immediate-match pass for `order`, commit the results and
    /// rest the remainder where the type allows.
    ///
    /// The pass repeats while it produces fills: committing a fill can
    /// requeue an iceberg slice that the taker's remainder must consume
    /// before anything rests.
    fn execute_order(&mut self, mut order: Order) -> Result<PlaceOrderResponse, CoreError> {
        let limit = order.effective_price();
        let mut first_pass = true;

        while !order.remaining.is_zero() {
            let fills = match match_incoming(
                &mut self.book,
                order.side,
                order.remaining,
                limit,
                order.time_in_force,
                order.post_only,
            ) {
                Ok(fills) => fills,
                Err(e) if first_pass => return Err(self.persist_rejection(order, e)),
                // Fills from earlier passes stand; the remainder is
                // resolved below.
                Err(_) => break,
            };
            if fills.is_empty() {
                break;
            }
            self.commit_fills(&mut order, &fills)?;
            first_pass = false;
        }

        if !order.remaining.is_zero() {
            let market_style = order.order_type.matches_as_market();
            let ioc = order.time_in_force == TimeInForce::Ioc;
            if market_style || ioc {
                // A market order never rests: the remainder is cancelled.
                order.transition(OrderStatus::Cancelled, self.last_ts);
                self.release_reservation(&order);
                self.deps.store.record_order(&order);
                self.deps.bus.publish_order(OrderEvent::from_order(
                    OrderEventKind::OrderCancelled,
                    &order,
                    self.book.sequence(),
                ));
                self.deps.order_pairs.remove(&order.id);
            } else {
                self.rest_order(&mut order);
            }
        } else {
            // commit_fills already recorded and published the fill; any
            // reservation not consumed at better-than-limit prices goes
            // back to the ledger.
            self.release_reservation(&order);
            self.deps.order_pairs.remove(&order.id);
        }

        let response = PlaceOrderResponse::from_order(&order);
        if !order.is_terminal() {
            self.index_order(&order);
            self.orders.insert(order.id, order);
        }
        Ok(response)
    }

    /// Apply fills to both sides, build trades, and hand everything to
    /// storage and the bus in commit order.
    fn commit_fills(&mut self, taker: &mut Order, fills: &[Fill]) -> Result<(), CoreError> {
        let perpetual = taker.order_type.is_perpetual();
        let taker_bps = self.deps.config.fees.taker_bps(perpetual);
        let maker_bps = self.deps.config.fees.maker_bps(perpetual);

        for fill in fills {
            let quote = precision::quote_quantity(fill.price, fill.quantity)?;
            let taker_fee = precision::fee(quote, taker_bps)?;
            let maker_fee = precision::fee(quote, maker_bps)?;

            taker.apply_fill(fill.quantity, fill.price, taker_fee, self.last_ts)?;

            let (buy_order_id, sell_order_id, buyer_id, seller_id) = match taker.side {
                Side::Buy => (
                    taker.id,
                    fill.maker_order_id,
                    taker.user_id.clone(),
                    fill.maker_user_id.clone(),
                ),
                Side::Sell => (
                    fill.maker_order_id,
                    taker.id,
                    fill.maker_user_id.clone(),
                    taker.user_id.clone(),
                ),
            };

            let trade = Trade::new(
                &self.pair,
                buy_order_id,
                sell_order_id,
                &buyer_id,
                &seller_id,
                fill.price,
                fill.quantity,
                maker_fee.saturating_add(taker_fee),
                taker.side == Side::Sell,
                self.last_ts,
                fill.sequence,
            )?;

            self.stats.trades += 1;
            metrics::counter!("dex_trades_total").increment(1);
            self.deps.store.record_trade(&trade);
            if let Some(planner) = &self.deps.planner {
                planner.add_trade(&trade);
            }
            self.deps.bus.publish_trade(TradeEvent::from(&trade));

            self.slicer.observe_volume(fill.quantity);
            self.settle_maker_fill(fill, maker_fee)?;
            self.apply_perp_fill(taker, fill.quantity, fill.price)?;
        }

        if !fills.is_empty() {
            self.deps.store.record_order(taker);
            self.deps.bus.publish_order(OrderEvent::from_order(
                if taker.remaining.is_zero() {
                    OrderEventKind::OrderFilled
                } else {
                    OrderEventKind::OrderUpdated
                },
                taker,
                self.book.sequence(),
            ));
            self.propagate_to_parent(taker.parent_order_id, fills)?;
            self.cancel_oco_sibling(taker.linked_order_id, taker.id);
        }

        Ok(())
    }

    /// Update the maker side of one fill: order state, iceberg refill, OCO
    /// sibling, perpetual position.
    fn settle_maker_fill(&mut self, fill: &Fill, maker_fee: Amount) -> Result<(), CoreError> {
        let Some(mut maker) = self.orders.remove(&fill.maker_order_id) else {
            // Recovered ladders may reference orders whose full state was
            // evicted; the ladder entry is authoritative for the fill.
            tracing::warn!(order_id = %fill.maker_order_id, "maker order missing from open set");
            return Ok(());
        };

        maker.apply_fill(fill.quantity, fill.price, maker_fee, self.last_ts)?;
        if maker.order_type.is_perpetual() {
            self.apply_perp_fill(&maker, fill.quantity, fill.price)?;
        }

        // Iceberg: when the visible slice is gone but reserve remains,
        // requeue a fresh slice at the back of the level's FIFO.
        if !self.book.contains(&maker.id) && !maker.remaining.is_zero() {
            if let Some(slice) = self.slicer.refill_iceberg(&maker.id) {
                self.book.insert(
                    maker.side,
                    BookEntry {
                        order_id: maker.id,
                        user_id: maker.user_id.clone(),
                        price: fill.price,
                        remaining: slice,
                        timestamp: self.last_ts,
                    },
                );
            }
        }

        self.deps.store.record_order(&maker);
        let kind = if maker.remaining.is_zero() {
            OrderEventKind::OrderFilled
        } else {
            OrderEventKind::OrderUpdated
        };
        self.deps
            .bus
            .publish_order(OrderEvent::from_order(kind, &maker, self.book.sequence()));

        let fill_for_parent = [fill.clone()];
        self.propagate_to_parent(maker.parent_order_id, &fill_for_parent)?;
        self.cancel_oco_sibling(maker.linked_order_id, maker.id);

        if maker.is_terminal() {
            self.release_reservation(&maker);
            self.deps.order_pairs.remove(&maker.id);
            self.slicer.drop_iceberg(&maker.id);
        } else {
            self.orders.insert(maker.id, maker);
        }
        Ok(())
    }

    /// Aggregate child fills onto a TWAP/VWAP parent.
    fn propagate_to_parent(
        &mut self,
        parent_id: Option<Uuid>,
        fills: &[Fill],
    ) -> Result<(), CoreError> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let Some(mut parent) = self.orders.remove(&parent_id) else {
            return Ok(());
        };
        for fill in fills {
            parent.apply_fill(fill.quantity, fill.price, Amount::ZERO, self.last_ts)?;
        }
        self.deps.store.record_order(&parent);
        let kind = if parent.remaining.is_zero() {
            OrderEventKind::OrderFilled
        } else {
            OrderEventKind::OrderUpdated
        };
        self.deps
            .bus
            .publish_order(OrderEvent::from_order(kind, &parent, self.book.sequence()));

        if parent.is_terminal() {
            self.slicer.drop_parent(&parent_id);
            self.deps.order_pairs.remove(&parent_id);
        } else {
            self.orders.insert(parent_id, parent);
        }
        Ok(())
    }

    /// Perpetual bookkeeping for one filled order side.
    fn apply_perp_fill(
        &mut self,
        order: &Order,
        quantity: Amount,
        price: Amount,
    ) -> Result<(), CoreError> {
        if !order.order_type.is_perpetual() {
            return Ok(());
        }
        let side = match order.side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        };
        let margin_in = if order.reduce_only {
            Amount::ZERO
        } else {
            let required = margin_required(quantity, price, order.leverage)?;
            let available = self
                .reserved
                .get(&order.id)
                .copied()
                .unwrap_or(Amount::ZERO);
            let consumed = required.min(available);
            self.deps.margin.consume(&order.user_id, consumed);
            if let Some(r) = self.reserved.get_mut(&order.id) {
                *r = r.saturating_sub(consumed);
            }
            consumed
        };

        let (position, credit) = self.deps.positions.apply_fill(
            &order.user_id,
            &self.pair,
            side,
            quantity,
            price,
            order.leverage,
            margin_in,
            self.last_ts,
        )?;
        if !credit.value.is_zero() {
            self.deps.margin.settle(&order.user_id, credit);
        }

        if position.is_open() {
            self.deps.store.record_position(&position);
        } else {
            self.deps
                .store
                .remove_position(&position.user_id, &position.contract);
        }
        self.deps.bus.publish_position(PositionEvent::from_position(
            PositionEventKind::Position,
            &position,
        ));
        Ok(())
    }

    /// I7: a fill or cancel of one OCO leg atomically cancels the other.
    fn cancel_oco_sibling(&mut self, linked: Option<Uuid>, cause: Uuid) {
        let Some(sibling_id) = linked else {
            return;
        };
        if !self.orders.contains_key(&sibling_id) {
            return;
        }
        tracing::debug!(sibling = %sibling_id, cause = %cause, "cancelling linked oco leg");
        let _ = self.cancel_internal(&sibling_id, None, OrderStatus::Cancelled);
    }

    fn rest_order(&mut self, order: &mut Order) {
        let Some(price) = order.price else {
            // Unpriced remainders never rest.
            order.transition(OrderStatus::Cancelled, self.last_ts);
            self.deps.store.record_order(order);
            self.deps.bus.publish_order(OrderEvent::from_order(
                OrderEventKind::OrderCancelled,
                order,
                self.book.sequence(),
            ));
            self.deps.order_pairs.remove(&order.id);
            return;
        };

        order.status = if order.filled.is_zero() {
            OrderStatus::Open
        } else {
            OrderStatus::PartiallyFilled
        };

        let visible = match order.visible_amount {
            Some(v) if order.order_type == OrderType::Iceberg => {
                self.slicer.track_iceberg(order.id, v, order.remaining);
                v.min(order.remaining)
            }
            _ => order.remaining,
        };

        self.book.insert(
            order.side,
            BookEntry {
                order_id: order.id,
                user_id: order.user_id.clone(),
                price,
                remaining: visible,
                timestamp: order.timestamp,
            },
        );

        if order.time_in_force == TimeInForce::Day {
            self.deps.wheel.schedule_in(
                (self.deps.config.engine.day_session_secs * 1000) as i64,
                WheelEvent::ExpireOrder {
                    pair: self.pair.clone(),
                    order_id: order.id,
                },
            );
        }

        self.deps.store.record_order(order);
        self.deps.bus.publish_order(OrderEvent::from_order(
            if order.filled.is_zero() {
                OrderEventKind::OrderPlaced
            } else {
                OrderEventKind::OrderUpdated
            },
            order,
            self.book.sequence(),
        ));
    }

    fn index_order(&mut self, order: &Order) {
        self.deps.order_pairs.insert(order.id, self.pair.clone());
    }

    fn release_reservation(&mut self, order: &Order) {
        if let Some(reserved) = self.reserved.remove(&order.id) {
            self.deps.margin.release(&order.user_id, reserved);
        }
    }

    /// Post-commit work: trigger cascade, fatal checks, market data,
    /// snapshot publication.
    fn after_commit(&mut self) {
        self.cascade_triggers();

        if !self.book.is_consistent() {
            // A crossed book after commit is an invariant violation; halt
            // the pair and demand operator attention.
            self.halted = true;
            metrics::counter!("dex_pair_halts_total").increment(1);
            tracing::error!(pair = %self.pair, "crossed book detected post-commit, pair halted");
            return;
        }

        let now = self.last_ts;
        let snapshot = self.book.snapshot(SNAPSHOT_DEPTH, now);
        self.deps.store.hot().put_snapshot(snapshot.clone());
        self.deps.store.record_market_data(
            &self.pair,
            self.book.sequence(),
            self.book.best_bid(),
            self.book.best_ask(),
            self.book.last_trade_price(),
            now,
        );
        self.deps.bus.publish_book(snapshot);
    }

    /// Evaluate conditional triggers against the latest last-trade price,
    /// executing fired orders; their trades can fire further triggers, so
    /// loop until quiescent.
    fn cascade_triggers(&mut self) {
        loop {
            let Some(last) = self.book.last_trade_price() else {
                return;
            };
            let fired = self.triggers.on_last_trade(last);
            if fired.is_empty() {
                return;
            }
            for order_id in fired {
                self.fire_trigger(order_id);
            }
        }
    }

    fn fire_trigger(&mut self, order_id: Uuid) {
        let Some(mut order) = self.orders.remove(&order_id) else {
            return;
        };
        let now = self.next_ts();
        order.transition(OrderStatus::Triggered, now);
        self.deps.store.record_order(&order);
        self.deps.bus.publish_order(OrderEvent::from_order(
            OrderEventKind::OrderTriggered,
            &order,
            self.book.sequence(),
        ));

        // Triggering one OCO leg cancels the other.
        self.cancel_oco_sibling(order.linked_order_id, order.id);

        // STOP_LIMIT converts to a limit order; STOP_LOSS and TRAILING_STOP
        // execute market-style.
        match order.order_type {
            OrderType::StopLimit => {
                order.order_type = OrderType::Limit;
            }
            _ => {
                order.order_type = OrderType::Market;
                order.price = None;
            }
        }

        if let Err(e) = self.execute_order(order) {
            tracing::warn!(order_id = %order_id, "triggered order rejected: {e}");
        }
    }

    // ========================================================================
    // Cancel / expiry
    // ========================================================================

    fn handle_cancel(
        &mut self,
        order_id: &Uuid,
        user_id: &str,
    ) -> Result<CancelOrderResponse, CoreError> {
        // A halted pair accepts no mutations until the operator acts.
        if self.halted {
            return Err(CoreError::Fatal(format!("pair {} is halted", self.pair)));
        }
        let before = self.book.sequence();
        let result = self.cancel_internal(order_id, Some(user_id), OrderStatus::Cancelled);
        if self.book.sequence() != before {
            self.after_commit();
        }
        result
    }

    fn cancel_internal(
        &mut self,
        order_id: &Uuid,
        user_id: Option<&str>,
        status: OrderStatus,
    ) -> Result<CancelOrderResponse, CoreError> {
        {
            let Some(order) = self.orders.get(order_id) else {
                // Lost the race against a match, or already terminal.
                return Err(CoreError::Conflict(format!("order {order_id} is not open")));
            };
            if let Some(user) = user_id {
                if order.user_id != user {
                    return Err(CoreError::Unauthorized(
                        "cannot cancel another user's order".into(),
                    ));
                }
            }
        }

        let Some(mut order) = self.orders.remove(order_id) else {
            return Err(CoreError::Conflict(format!("order {order_id} is not open")));
        };
        let now = self.next_ts();

        self.book.remove(order_id);
        self.triggers.remove(order_id);
        self.slicer.drop_iceberg(order_id);
        self.release_reservation(&order);

        // A cancelled parent cancels its live children.
        if order.order_type.is_sliced() {
            self.slicer.drop_parent(order_id);
            let children: Vec<Uuid> = self
                .orders
                .values()
                .filter(|o| o.parent_order_id == Some(*order_id))
                .map(|o| o.id)
                .collect();
            for child in children {
                let _ = self.cancel_internal(&child, None, status);
            }
        }

        // A cancelled OCO leg cancels its sibling.
        self.cancel_oco_sibling(order.linked_order_id, order.id);

        order.transition(status, now);
        let kind = match status {
            OrderStatus::Expired => OrderEventKind::OrderExpired,
            _ => OrderEventKind::OrderCancelled,
        };
        self.deps.store.record_order(&order);
        self.deps
            .bus
            .publish_order(OrderEvent::from_order(kind, &order, self.book.sequence()));
        self.deps.order_pairs.remove(order_id);

        Ok(CancelOrderResponse {
            success: true,
            order_id: *order_id,
            status,
        })
    }

    fn handle_expiry(&mut self, order_id: Uuid) {
        if self.halted {
            tracing::debug!(order_id = %order_id, pair = %self.pair, "expiry skipped, pair halted");
            return;
        }
        if !self.orders.contains_key(&order_id) {
            return;
        }
        match self.cancel_internal(&order_id, None, OrderStatus::Expired) {
            Ok(_) => tracing::debug!(order_id = %order_id, "day order expired"),
            Err(e) => tracing::debug!(order_id = %order_id, "expiry skipped: {e}"),
        }
    }

    // ========================================================================
    // Slices, marks, snapshots, teardown
    // ========================================================================

    fn handle_release_slice(&mut self, parent_id: Uuid) {
        if self.halted {
            return;
        }
        let Some(parent_order) = self.orders.get(&parent_id).cloned() else {
            self.slicer.drop_parent(&parent_id);
            return;
        };

        let Some(parent) = self.slicer.parent_mut(&parent_id) else {
            return;
        };
        let quantity = match parent.next_slice() {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(parent = %parent_id, "slice computation failed: {e}");
                return;
            }
        };
        let interval = parent.interval_ms;
        let done = parent.done_releasing();

        if !quantity.is_zero() {
            let now = self.next_ts();
            let mut child = Order::new(
                &parent_order.user_id,
                &self.pair,
                OrderType::Limit,
                parent_order.side,
                quantity,
                now,
            );
            child.price = parent_order.price;
            child.parent_order_id = Some(parent_id);
            child.leverage = parent_order.leverage;

            if let Err(e) = self.execute_order(child) {
                tracing::warn!(parent = %parent_id, "child slice rejected: {e}");
            }
        }

        if !done {
            self.deps.wheel.schedule_in(
                interval,
                WheelEvent::ReleaseSlice {
                    pair: self.pair.clone(),
                    parent_id,
                },
            );
        }
    }

    /// Perp mark update: refresh positions, then run the liquidation scan
    /// against current book depth.
    fn handle_mark_update(&mut self, mark: Amount) {
        if self.halted {
            return;
        }
        let now = self.next_ts();
        let updated = match self.deps.positions.update_mark(&self.pair, mark, now) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(pair = %self.pair, "mark update failed: {e}");
                return;
            }
        };
        for position in &updated {
            self.deps.store.record_position(position);
            self.deps.bus.publish_position(PositionEvent::from_position(
                PositionEventKind::Position,
                position,
            ));
        }

        let bid_liquidity = self.book.opposing_quantity(Side::Sell, None, Amount::MAX);
        let ask_liquidity = self.book.opposing_quantity(Side::Buy, None, Amount::MAX);
        let outcomes = match self.liquidation.run(
            &self.deps.positions,
            &self.pair,
            mark,
            bid_liquidity,
            ask_liquidity,
            now,
        ) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::error!(pair = %self.pair, "liquidation scan failed: {e}");
                return;
            }
        };

        for outcome in outcomes {
            let (position, margin_returned) = match &outcome {
                LiquidationOutcome::Closed {
                    position,
                    margin_returned,
                    ..
                } => (position, *margin_returned),
                LiquidationOutcome::Deleveraged {
                    position,
                    margin_returned,
                    absorbed_by,
                    ..
                } => {
                    for absorption in absorbed_by {
                        tracing::info!(
                            user = %absorption.user_id,
                            quantity = %absorption.quantity,
                            "adl absorption"
                        );
                        if !absorption.credit.value.is_zero() {
                            self.deps.margin.settle(&absorption.user_id, absorption.credit);
                        }
                        match self.deps.positions.get(&absorption.user_id, &self.pair) {
                            Some(counter) if counter.is_open() => {
                                self.deps.store.record_position(&counter);
                                self.deps.bus.publish_position(PositionEvent::from_position(
                                    PositionEventKind::AutoDeleverage,
                                    &counter,
                                ));
                            }
                            _ => {
                                self.deps
                                    .store
                                    .remove_position(&absorption.user_id, &self.pair);
                            }
                        }
                    }
                    (position, *margin_returned)
                }
            };

            if !margin_returned.is_zero() {
                self.deps
                    .margin
                    .settle(&position.user_id, SignedAmount::positive(margin_returned));
            }
            self.deps
                .store
                .remove_position(&position.user_id, &position.contract);
            self.deps.bus.publish_position(PositionEvent::from_position(
                PositionEventKind::Liquidation,
                position,
            ));
        }
    }

    fn handle_snapshot(&mut self, depth: usize) -> Result<BookSnapshot, CoreError> {
        if self.halted {
            return Err(CoreError::Fatal(format!("pair {} is halted", self.pair)));
        }
        Ok(self.book.snapshot(depth, now_millis()))
    }

    /// Teardown: push every open order and the final watermark to warm
    /// storage before releasing pair ownership.
    fn flush_open_state(&mut self) {
        for order in self.orders.values() {
            self.deps.store.record_order(order);
        }
        self.deps.store.record_market_data(
            &self.pair,
            self.book.sequence(),
            self.book.best_bid(),
            self.book.best_ask(),
            self.book.last_trade_price(),
            now_millis(),
        );
        tracing::info!(pair = %self.pair, open_orders = self.orders.len(), "flushed open state");
    }
}
