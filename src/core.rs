//! The assembled core.
//!
//! [`DexCore`] wires the tiered store, matching engine, perpetual
//! bookkeeping, settlement surface and event bus together, and exposes the
//! typed ingress surface the transport layer calls. Per-pair matching state
//! is process-wide: `start` must complete before ingress opens, and
//! `shutdown` flushes open-order snapshots to warm storage before releasing
//! pair ownership.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::book::BookSnapshot;
use crate::config::AppConfig;
use crate::engine::{MatchingEngine, PairStats};
use crate::error::CoreError;
use crate::events::{EventBus, PositionEvent, PositionEventKind};
use crate::models::order::now_millis;
use crate::models::position::SignedAmount;
use crate::models::{
    CancelOrderResponse, Order, OrderType, PlaceOrderRequest, PlaceOrderResponse, Position, Trade,
    TradeQuery, UserOrdersQuery,
};
use crate::perp::{premium_rate_bps, FundingEngine, MarginLedger, PositionBook};
use crate::precision::Amount;
use crate::privacy::{MpcOracle, PrivacyMatcher, PrivateSwapExecution, PrivateSwapOrder};
use crate::settlement::contract::{encode_deposit, encode_withdraw, parse_address};
use crate::settlement::{
    BatchPlanner, ChainSubmitter, IntentKind, SettlementIntent, SettlementOutbox,
};
use crate::storage::{pubsub, ArchivalPipeline, Reconciler, TieredStore};

pub struct DexCore {
    config: Arc<AppConfig>,
    store: Arc<TieredStore>,
    bus: Arc<EventBus>,
    engine: Arc<MatchingEngine>,
    margin: Arc<MarginLedger>,
    positions: Arc<PositionBook>,
    outbox: Option<Arc<SettlementOutbox>>,
    privacy: Option<Arc<PrivacyMatcher>>,
    /// Latest mark price per perpetual contract.
    marks: DashMap<String, Amount>,
    /// Latest trade price per pair, fed from the bus.
    last_prices: Arc<DashMap<String, Amount>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DexCore {
    /// Bring the whole core up. Must complete before any ingress call.
    pub async fn start(
        config: AppConfig,
        submitter: Option<Arc<dyn ChainSubmitter>>,
        mpc: Option<Arc<dyn MpcOracle>>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        tracing::info!(environment = %config.environment, "starting dex core");

        let store = TieredStore::start(&config).await?;
        let bus = Arc::new(EventBus::new(config.engine.event_buffer));
        let margin = Arc::new(MarginLedger::new());
        let positions = Arc::new(PositionBook::new(config.perp.maintenance_margin_bps));
        let mut background = Vec::new();

        // Settlement: planner + durable outbox, only with a submitter.
        let (planner, outbox) = match submitter {
            Some(submitter) => {
                let planner = Arc::new(BatchPlanner::new(config.settlement.clone())?);
                let outbox = SettlementOutbox::start(
                    config.settlement.clone(),
                    submitter,
                    store.warm().cloned(),
                );
                if let Some(warm) = store.warm() {
                    let replayed = outbox.recover(warm, 1000).await;
                    if replayed > 0 {
                        tracing::info!(replayed, "recovered pending settlement intents");
                    }
                }
                background.push(planner.clone().spawn_window_loop(outbox.clone()));
                (Some(planner), Some(outbox))
            }
            None => {
                tracing::info!("no chain submitter configured, settlement intents disabled");
                (None, None)
            }
        };

        let engine = MatchingEngine::start(
            config.clone(),
            store.clone(),
            bus.clone(),
            margin.clone(),
            positions.clone(),
            planner,
        )
        .await?;

        // Warm-dependent pipelines.
        if let Some(warm) = store.warm() {
            background.push(Reconciler::new(store.hot().clone(), warm.clone()).spawn());
            if let Some(cold) = store.cold() {
                background.push(
                    ArchivalPipeline::new(
                        config.archival.clone(),
                        store.hot().clone(),
                        warm.clone(),
                        cold.clone(),
                    )
                    .spawn(),
                );
            } else {
                tracing::info!("cold tier disabled, archival pipeline not started");
            }
        }

        // Redis pub/sub mirror of committed events.
        if let Some(redis) = store.hot().mirror() {
            background.extend(pubsub::spawn_mirror(&bus, redis));
        }

        // Track last trade prices for the funding loop.
        let last_prices: Arc<DashMap<String, Amount>> = Arc::new(DashMap::new());
        background.push(Self::spawn_last_price_tracker(&bus, last_prices.clone()));

        let privacy = mpc.map(|oracle| Arc::new(PrivacyMatcher::new(oracle)));
        if privacy.is_none() {
            tracing::info!("mpc oracle not configured, privacy orders will be rejected");
        }

        let core = Arc::new(DexCore {
            config: config.clone(),
            store,
            bus,
            engine,
            margin,
            positions,
            outbox,
            privacy,
            marks: DashMap::new(),
            last_prices,
            background: Mutex::new(background),
        });

        core.background
            .lock()
            .push(core.clone().spawn_funding_loop());

        tracing::info!("dex core started");
        Ok(core)
    }

    fn spawn_last_price_tracker(
        bus: &EventBus,
        last_prices: Arc<DashMap<String, Amount>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut trades = bus.subscribe_trades();
        tokio::spawn(async move {
            loop {
                match trades.recv().await {
                    Ok(event) => {
                        last_prices.insert(event.pair, event.price);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("last-price tracker lagged {n} trades");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Funding tick: premium of last trade over mark, clamped, applied to
    /// every open position per contract.
    fn spawn_funding_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.perp.funding_interval_secs);
        tokio::spawn(async move {
            let funding = FundingEngine::new(self.config.perp.funding_clamp_bps);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                for pair in self.engine.pairs() {
                    let Some(mark) = self.marks.get(&pair).map(|m| *m) else {
                        continue;
                    };
                    let last = self
                        .last_prices
                        .get(&pair)
                        .map(|p| *p)
                        .unwrap_or(mark);
                    let rate = match premium_rate_bps(last, mark, self.config.perp.funding_clamp_bps)
                    {
                        Ok(rate) => rate,
                        Err(e) => {
                            tracing::warn!(pair = %pair, "funding rate computation failed: {e}");
                            continue;
                        }
                    };
                    match funding.apply(&self.positions, &pair, rate, mark, now_millis()) {
                        Ok(outcomes) => {
                            for outcome in outcomes {
                                self.store.record_position(&outcome.position);
                                self.bus.publish_position(PositionEvent::from_position(
                                    PositionEventKind::Funding,
                                    &outcome.position,
                                ));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(pair = %pair, "funding application failed: {e}")
                        }
                    }
                }
            }
        })
    }

    // ========================================================================
    // Ingress surface (spot + conditional + sliced)
    // ========================================================================

    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, CoreError> {
        self.engine.place_order(request).await
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<CancelOrderResponse, CoreError> {
        self.engine.cancel_order(order_id, user_id).await
    }

    /// Owner-scoped order lookup; other users see nothing.
    pub async fn get_order(
        &self,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<Option<Order>, CoreError> {
        if let Some(order) = self.engine.open_order(order_id).await? {
            return Ok((order.user_id == user_id).then_some(order));
        }
        match self.store.get_order(&order_id).await? {
            Some(order) if order.user_id == user_id => Ok(Some(order)),
            _ => Ok(None),
        }
    }

    pub async fn get_user_orders(
        &self,
        user_id: &str,
        query: &UserOrdersQuery,
    ) -> Result<Vec<Order>, CoreError> {
        self.store.get_user_orders(user_id, query).await
    }

    pub async fn get_order_book(&self, pair: &str, depth: usize) -> Result<BookSnapshot, CoreError> {
        self.engine.order_book(pair, depth).await
    }

    pub async fn get_trades(&self, pair: &str, limit: usize) -> Result<Vec<Trade>, CoreError> {
        self.store.get_trades(pair, limit).await
    }

    pub async fn get_user_trades(
        &self,
        user_id: &str,
        query: &TradeQuery,
    ) -> Result<Vec<Trade>, CoreError> {
        self.store.get_user_trades(user_id, query).await
    }

    /// Explicit historical lookup through the cold tier.
    pub async fn get_archived_order(
        &self,
        archive_ref: &str,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<Option<Order>, CoreError> {
        match self.store.get_archived_order(archive_ref, &order_id).await? {
            Some(order) if order.user_id == user_id => Ok(Some(order)),
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Perpetuals
    // ========================================================================

    /// Perpetual ingress: the same pipeline, restricted to the perpetual
    /// order types.
    pub async fn place_perpetual_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, CoreError> {
        if !matches!(
            request.order_type,
            OrderType::PerpetualLimit | OrderType::PerpetualMarket
        ) {
            return Err(CoreError::Validation(
                "perpetual ingress accepts only perpetual order types".into(),
            ));
        }
        self.engine.place_order(request).await
    }

    pub async fn get_positions(&self, user_id: &str) -> Result<Vec<Position>, CoreError> {
        let open = self.positions.user_positions(user_id);
        if !open.is_empty() {
            return Ok(open);
        }
        self.store.get_positions(user_id).await
    }

    /// Mark price ingress from the oracle feed: refresh positions and run
    /// the liquidation scan on the owning worker.
    pub async fn update_mark_price(&self, pair: &str, mark: Amount) -> Result<(), CoreError> {
        self.marks.insert(pair.to_string(), mark);
        self.engine.update_mark_price(pair, mark).await
    }

    pub fn free_margin(&self, user_id: &str) -> Amount {
        self.margin.free(user_id)
    }

    // ========================================================================
    // Deposits / withdrawals (settlement surface)
    // ========================================================================

    /// Credit collateral confirmed on-chain by the transport layer and emit
    /// the matching `depositToDEX` shape for bookkeeping.
    pub fn deposit(&self, user_id: &str, token: &str, amount: Amount) -> Result<(), CoreError> {
        self.margin.deposit(user_id, amount);
        self.emit_transfer_intent(IntentKind::Deposit, user_id, token, amount)
    }

    /// Debit free collateral and emit `withdrawFromDEX`. Ownership proof is
    /// the transport layer's concern; balance bounds are enforced here.
    pub fn withdraw(&self, user_id: &str, token: &str, amount: Amount) -> Result<(), CoreError> {
        self.margin.withdraw(user_id, amount)?;
        self.emit_transfer_intent(IntentKind::Withdraw, user_id, token, amount)
    }

    fn emit_transfer_intent(
        &self,
        kind: IntentKind,
        user_id: &str,
        token: &str,
        amount: Amount,
    ) -> Result<(), CoreError> {
        let Some(outbox) = &self.outbox else {
            return Ok(());
        };
        let token_address = self
            .config
            .settlement
            .tokens
            .get(token)
            .ok_or_else(|| CoreError::Validation(format!("unknown settlement token {token}")))?;
        let token_address = parse_address(token_address)?;
        let calldata = match kind {
            IntentKind::Deposit => encode_deposit(token_address, amount),
            _ => encode_withdraw(token_address, amount),
        };
        let now = now_millis();
        outbox.enqueue(SettlementIntent {
            id: format!("{}:{user_id}:{token}:{now}", kind.as_str()),
            kind,
            calldata,
            trade_ids: Vec::new(),
            attempts: 0,
            created_at: now,
        });
        Ok(())
    }

    // ========================================================================
    // Privacy swaps
    // ========================================================================

    /// Submit a privacy-swap order. Without a configured MPC operator set
    /// these are rejected while regular matching continues.
    pub async fn place_private_swap(
        &self,
        order: PrivateSwapOrder,
    ) -> Result<Option<PrivateSwapExecution>, CoreError> {
        let Some(matcher) = &self.privacy else {
            return Err(CoreError::Validation(
                "privacy orders are unavailable: no mpc operator set configured".into(),
            ));
        };
        matcher.submit(order, now_millis()).await
    }

    pub fn cancel_private_swap(&self, order_id: Uuid, user_id: &str) -> Result<(), CoreError> {
        let Some(matcher) = &self.privacy else {
            return Err(CoreError::Validation(
                "privacy orders are unavailable: no mpc operator set configured".into(),
            ));
        };
        matcher.cancel(&order_id, user_id)
    }

    // ========================================================================
    // Introspection / subscriptions / teardown
    // ========================================================================

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub async fn pair_stats(&self, pair: &str) -> Result<PairStats, CoreError> {
        self.engine.pair_stats(pair).await
    }

    /// Flush open-order snapshots to warm storage, stop every background
    /// pipeline, and release per-pair ownership.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down dex core");
        self.engine.shutdown().await;
        let tasks: Vec<_> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            task.abort();
        }
        tracing::info!("dex core stopped");
    }
}

// SignedAmount is re-used by embedders reading ledger deltas.
pub type LedgerDelta = SignedAmount;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn spot_limit(user: &str, side: Side, price: &str, qty: &str) -> PlaceOrderRequest {
        PlaceOrderRequest {
            user_id: user.to_string(),
            pair: "XOM/USDT".to_string(),
            order_type: OrderType::Limit,
            side,
            quantity: Amount::from_decimal_str(qty).unwrap(),
            price: Some(Amount::from_decimal_str(price).unwrap()),
            stop_price: None,
            stop_limit_price: None,
            time_in_force: Default::default(),
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

    async fn core() -> Arc<DexCore> {
        let config = AppConfig::for_tests(vec!["XOM/USDT".into()]);
        DexCore::start(config, None, None).await.unwrap()
    }

    #[tokio::test]
    async fn end_to_end_place_match_query() {
        let core = core().await;
        core.place_order(spot_limit("maker", Side::Sell, "1.26", "100"))
            .await
            .unwrap();
        let response = core
            .place_order(spot_limit("taker", Side::Buy, "1.26", "40"))
            .await
            .unwrap();
        assert_eq!(response.filled, Amount::from_decimal_str("40").unwrap());

        let trades = core.get_trades("XOM/USDT", 10).await.unwrap();
        assert_eq!(trades.len(), 1);

        let orders = core
            .get_user_orders("maker", &UserOrdersQuery::default())
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);

        let book = core.get_order_book("XOM/USDT", 5).await.unwrap();
        assert_eq!(book.asks.len(), 1);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn get_order_is_owner_scoped() {
        let core = core().await;
        let placed = core
            .place_order(spot_limit("alice", Side::Buy, "1.00", "5"))
            .await
            .unwrap();

        assert!(core.get_order(placed.order_id, "alice").await.unwrap().is_some());
        assert!(core.get_order(placed.order_id, "bob").await.unwrap().is_none());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn perpetual_ingress_rejects_spot_types() {
        let core = core().await;
        let err = core
            .place_perpetual_order(spot_limit("alice", Side::Buy, "1.00", "5"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        core.shutdown().await;
    }

    #[tokio::test]
    async fn withdraw_exceeding_balance_is_unauthorized() {
        let core = core().await;
        core.deposit("alice", "USDT", Amount::from_u64(100)).unwrap();
        let err = core
            .withdraw("alice", "USDT", Amount::from_u64(200))
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(core.withdraw("alice", "USDT", Amount::from_u64(50)).is_ok());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn privacy_orders_rejected_without_oracle() {
        let core = core().await;
        let order = PrivateSwapOrder {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            pair: "XOM/USDT".into(),
            side: Side::Buy,
            encrypted_amount: crate::privacy::Ciphertext("ct".into()),
            encrypted_min_output: crate::privacy::Ciphertext("ct".into()),
            timestamp: 1,
        };
        let err = core.place_private_swap(order).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
        core.shutdown().await;
    }
}
