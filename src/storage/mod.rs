//! Tiered storage substrate.
//!
//! Three tiers behind one write-through / read-fallback facade:
//!
//! - **hot**: in-memory maps (optionally mirrored to Redis), authoritative
//!   for matching decisions, TTL-bounded in the mirror;
//! - **warm**: PostgreSQL, `NUMERIC(78,0)` monetary columns, lags hot via
//!   an asynchronous write-back worker with bounded-backoff retries;
//! - **cold**: content-addressed IPFS archive fed by the scheduled
//!   archival pipeline.
//!
//! Degraded modes: hot-only (archival paused), warm-only (hot populated on
//! demand), cold-unavailable (archival stalls; operational reads fine).

pub mod archive;
pub mod cold;
pub mod hot;
pub mod keys;
pub mod pubsub;
pub mod reconcile;
pub mod redis_client;
pub mod warm;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::book::DepthLevel;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::models::{Order, Position, Trade, TradeQuery, UserOrdersQuery};
use crate::precision::Amount;

pub use archive::ArchivalPipeline;
pub use cold::ColdStore;
pub use hot::HotStore;
pub use reconcile::Reconciler;
pub use redis_client::RedisClient;
pub use warm::WarmStore;

const WRITE_QUEUE_DEPTH: usize = 8192;
const WRITE_MAX_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF_BASE_MS: u64 = 100;

/// A warm-tier write handed off from the matching path.
#[derive(Debug)]
pub enum WriteJob {
    Order(Box<Order>),
    Trade(Box<Trade>),
    Position(Box<Position>),
    RemovePosition {
        user_id: String,
        contract: String,
    },
    MarketData {
        pair: String,
        sequence: u64,
        best_bid: Option<Amount>,
        best_ask: Option<Amount>,
        last_price: Option<Amount>,
        now: i64,
    },
}

pub struct TieredStore {
    hot: Arc<HotStore>,
    warm: Option<Arc<WarmStore>>,
    cold: Option<Arc<ColdStore>>,
    writer: mpsc::Sender<WriteJob>,
}

impl TieredStore {
    /// Bring up the configured tiers and start the write-back worker.
    ///
    /// A Redis or PostgreSQL tier that is configured but unreachable
    /// degrades with a warning instead of failing startup.
    pub async fn start(config: &AppConfig) -> Result<Arc<Self>, CoreError> {
        let mirror = if config.redis.enabled() {
            match RedisClient::connect(&config.redis).await {
                Ok(client) => {
                    tracing::info!("hot-tier redis mirror connected");
                    Some(Arc::new(client))
                }
                Err(e) => {
                    tracing::warn!("redis unavailable, hot tier is in-process only: {e}");
                    None
                }
            }
        } else {
            None
        };

        let hot = Arc::new(HotStore::new(config.engine.trade_history, mirror));

        let warm = if config.postgresql.enabled() {
            match WarmStore::connect(&config.postgresql).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!("warm tier unavailable, running hot-only: {e}");
                    None
                }
            }
        } else {
            tracing::info!("warm tier disabled by configuration, running hot-only");
            None
        };

        let cold = if config.ipfs.enabled() {
            Some(Arc::new(ColdStore::new(&config.ipfs)))
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let store = Arc::new(TieredStore {
            hot,
            warm,
            cold,
            writer: tx,
        });
        store.clone().spawn_writer(rx);
        Ok(store)
    }

    pub fn hot(&self) -> &Arc<HotStore> {
        &self.hot
    }

    pub fn warm(&self) -> Option<&Arc<WarmStore>> {
        self.warm.as_ref()
    }

    pub fn cold(&self) -> Option<&Arc<ColdStore>> {
        self.cold.as_ref()
    }

    // ==================== Write path ====================

    /// Upsert into hot synchronously, then enqueue the warm write-back.
    pub fn record_order(&self, order: &Order) {
        self.hot.upsert_order(order);
        self.enqueue(WriteJob::Order(Box::new(order.clone())));
    }

    pub fn record_trade(&self, trade: &Trade) {
        self.hot.push_trade(trade);
        self.enqueue(WriteJob::Trade(Box::new(trade.clone())));
    }

    pub fn record_position(&self, position: &Position) {
        self.hot.upsert_position(position);
        self.enqueue(WriteJob::Position(Box::new(position.clone())));
    }

    pub fn remove_position(&self, user_id: &str, contract: &str) {
        self.hot.remove_position(user_id, contract);
        self.enqueue(WriteJob::RemovePosition {
            user_id: user_id.to_string(),
            contract: contract.to_string(),
        });
    }

    pub fn record_market_data(
        &self,
        pair: &str,
        sequence: u64,
        best_bid: Option<Amount>,
        best_ask: Option<Amount>,
        last_price: Option<Amount>,
        now: i64,
    ) {
        self.enqueue(WriteJob::MarketData {
            pair: pair.to_string(),
            sequence,
            best_bid,
            best_ask,
            last_price,
            now,
        });
    }

    fn enqueue(&self, job: WriteJob) {
        if self.warm.is_none() {
            return;
        }
        if let Err(e) = self.writer.try_send(job) {
            // The matching path must not block; flag and let the
            // reconciler converge.
            metrics::counter!("dex_storage_write_queue_full_total").increment(1);
            match e {
                mpsc::error::TrySendError::Full(WriteJob::Order(order))
                | mpsc::error::TrySendError::Closed(WriteJob::Order(order)) => {
                    self.hot.flag_writeback(order.id);
                }
                _ => tracing::warn!("warm write queue rejected a non-order job"),
            }
        }
    }

    // ==================== Read path ====================

    /// Hot first; on a miss, fall back to warm and repopulate hot.
    pub async fn get_order(&self, id: &Uuid) -> Result<Option<Order>, CoreError> {
        if let Some(order) = self.hot.get_order(id) {
            return Ok(Some(order));
        }
        if let Some(warm) = &self.warm {
            if let Some(order) = warm.fetch_order(id).await? {
                self.hot.upsert_order(&order);
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    pub async fn get_user_orders(
        &self,
        user_id: &str,
        query: &UserOrdersQuery,
    ) -> Result<Vec<Order>, CoreError> {
        let from_hot = self.hot.get_user_orders(user_id, query);
        match &self.warm {
            Some(warm) if from_hot.is_empty() => warm.fetch_user_orders(user_id, query).await,
            _ => Ok(from_hot),
        }
    }

    pub async fn get_trades(&self, pair: &str, limit: usize) -> Result<Vec<Trade>, CoreError> {
        let recent = self.hot.recent_trades(pair, limit);
        match &self.warm {
            Some(warm) if recent.len() < limit => warm.fetch_trades(pair, limit).await,
            _ => Ok(recent),
        }
    }

    pub async fn get_user_trades(
        &self,
        user_id: &str,
        query: &TradeQuery,
    ) -> Result<Vec<Trade>, CoreError> {
        if let Some(warm) = &self.warm {
            return warm.fetch_user_trades(user_id, query).await;
        }
        let mut trades = self.hot.recent_user_trades(user_id, query.limit());
        trades.retain(|t| query.matches(t));
        Ok(trades)
    }

    pub async fn get_positions(&self, user_id: &str) -> Result<Vec<Position>, CoreError> {
        let from_hot = self.hot.get_positions(user_id);
        match &self.warm {
            Some(warm) if from_hot.is_empty() => warm.fetch_positions(user_id).await,
            _ => Ok(from_hot),
        }
    }

    /// Warm-tier depth aggregation, used when no hot ladder exists for a
    /// pair (degraded warm-only reads).
    pub async fn book_fallback(
        &self,
        pair: &str,
        depth: usize,
    ) -> Result<Option<(Vec<DepthLevel>, Vec<DepthLevel>)>, CoreError> {
        match &self.warm {
            Some(warm) => Ok(Some(warm.aggregate_book(pair, depth).await?)),
            None => Ok(None),
        }
    }

    /// Explicit historical lookup by cold-tier reference.
    pub async fn get_archived_order(
        &self,
        archive_ref: &str,
        order_id: &Uuid,
    ) -> Result<Option<Order>, CoreError> {
        match &self.cold {
            Some(cold) => cold.get_order(archive_ref, order_id).await,
            None => Err(CoreError::Transient("cold tier unavailable".into())),
        }
    }

    // ==================== Background workers ====================

    fn spawn_writer(self: Arc<Self>, mut rx: mpsc::Receiver<WriteJob>) {
        tokio::spawn(async move {
            tracing::info!("warm write-back worker started");
            while let Some(job) = rx.recv().await {
                self.write_with_retry(job).await;
            }
            tracing::info!("warm write-back worker stopped");
        });
    }

    async fn write_with_retry(&self, job: WriteJob) {
        let Some(warm) = &self.warm else {
            return;
        };

        for attempt in 0..WRITE_MAX_ATTEMPTS {
            let result = match &job {
                WriteJob::Order(order) => warm.upsert_order(order).await,
                WriteJob::Trade(trade) => warm.insert_trade(trade).await,
                WriteJob::Position(position) => warm.upsert_position(position).await,
                WriteJob::RemovePosition { user_id, contract } => {
                    warm.delete_position(user_id, contract).await
                }
                WriteJob::MarketData {
                    pair,
                    sequence,
                    best_bid,
                    best_ask,
                    last_price,
                    now,
                } => {
                    warm.upsert_market_data(pair, *sequence, *best_bid, *best_ask, *last_price, *now)
                        .await
                }
            };

            match result {
                Ok(()) => return,
                Err(e) if attempt + 1 < WRITE_MAX_ATTEMPTS => {
                    let backoff = WRITE_BACKOFF_BASE_MS << attempt;
                    let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
                    tracing::warn!(
                        attempt = attempt + 1,
                        "warm write failed, retrying in {}ms: {e}",
                        backoff + jitter
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => {
                    metrics::counter!("dex_storage_writeback_exhausted_total").increment(1);
                    tracing::error!("warm write exhausted retries: {e}");
                    // The order stays live in hot; matching is unaffected
                    // and the reconciler re-sends it later.
                    if let WriteJob::Order(order) = &job {
                        self.hot.flag_writeback(order.id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::{OrderType, Side};

    #[tokio::test]
    async fn hot_only_mode_serves_reads() {
        let config = AppConfig::for_tests(vec!["XOM/USDT".into()]);
        let store = TieredStore::start(&config).await.unwrap();
        assert!(store.warm().is_none());
        assert!(store.cold().is_none());

        let order = Order::new(
            "alice",
            "XOM/USDT",
            OrderType::Limit,
            Side::Buy,
            Amount::from_u64(10),
            1,
        );
        store.record_order(&order);

        let got = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(got.id, order.id);

        assert!(store
            .book_fallback("XOM/USDT", 10)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cold_lookup_without_cold_tier_is_transient() {
        let config = AppConfig::for_tests(vec!["XOM/USDT".into()]);
        let store = TieredStore::start(&config).await.unwrap();
        let err = store
            .get_archived_order("bafy...", &Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSIENT");
    }
}
