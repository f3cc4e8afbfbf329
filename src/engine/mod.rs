//! Matching engine.
//!
//! Price-time-priority matching with one single-writer task per trading
//! pair: parallelism across pairs, a strict total order of mutations within
//! each pair. The engine owns the routing layer (pair registry, global
//! order -> pair index, shared timer wheel) and exposes the async ingress
//! surface the core calls into.

pub mod conditional;
pub mod matching;
pub mod slicer;
pub mod validate;
pub mod wheel;
pub mod worker;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::book::BookSnapshot;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::models::order::now_millis;
use crate::models::{
    CancelOrderResponse, Order, PlaceOrderRequest, PlaceOrderResponse,
};
use crate::perp::{MarginLedger, PositionBook};
use crate::precision::Amount;
use crate::settlement::BatchPlanner;
use crate::storage::TieredStore;

pub use worker::{PairCommand, PairStats, PairWorker, WorkerDeps};
pub use wheel::{WheelEvent, WheelHandle};

pub struct MatchingEngine {
    config: Arc<AppConfig>,
    store: Arc<TieredStore>,
    senders: Arc<DashMap<String, mpsc::Sender<PairCommand>>>,
    order_pairs: Arc<DashMap<Uuid, String>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MatchingEngine {
    /// Bring up one worker per configured pair, replaying open orders from
    /// warm storage before ingress opens.
    pub async fn start(
        config: Arc<AppConfig>,
        store: Arc<TieredStore>,
        bus: Arc<EventBus>,
        margin: Arc<MarginLedger>,
        positions: Arc<PositionBook>,
        planner: Option<Arc<BatchPlanner>>,
    ) -> Result<Arc<Self>, CoreError> {
        let (wheel, wheel_rx) = wheel::start();
        let senders: Arc<DashMap<String, mpsc::Sender<PairCommand>>> = Arc::new(DashMap::new());
        let order_pairs: Arc<DashMap<Uuid, String>> = Arc::new(DashMap::new());
        let mut tasks = Vec::new();

        let deps = WorkerDeps {
            config: config.clone(),
            store: store.clone(),
            bus,
            wheel,
            margin,
            positions,
            planner,
            order_pairs: order_pairs.clone(),
        };

        for pair in &config.engine.pairs {
            let (sequence, recovered) = match store.warm() {
                Some(warm) => {
                    let sequence = warm.fetch_sequence(pair).await?;
                    let recovered = warm.fetch_open_orders(pair).await?;
                    (sequence, recovered)
                }
                None => (0, Vec::new()),
            };

            let mut worker = PairWorker::new(pair, sequence, deps.clone());
            if !recovered.is_empty() {
                tracing::info!(pair = %pair, count = recovered.len(), "replaying open orders");
                worker.recover(recovered);
            }

            let (tx, rx) = mpsc::channel(config.engine.command_buffer);
            senders.insert(pair.clone(), tx);
            tasks.push(tokio::spawn(worker.run(rx)));
        }

        // Route fired wheel events to the owning pair.
        tasks.push(Self::spawn_wheel_dispatcher(senders.clone(), wheel_rx));

        tracing::info!(pairs = config.engine.pairs.len(), "matching engine started");
        Ok(Arc::new(MatchingEngine {
            config,
            store,
            senders,
            order_pairs,
            tasks: Mutex::new(tasks),
        }))
    }

    fn spawn_wheel_dispatcher(
        senders: Arc<DashMap<String, mpsc::Sender<PairCommand>>>,
        mut rx: mpsc::UnboundedReceiver<WheelEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(sender) = senders.get(event.pair()).map(|s| s.clone()) else {
                    continue;
                };
                let command = match event {
                    WheelEvent::ReleaseSlice { parent_id, .. } => {
                        PairCommand::ReleaseSlice { parent_id }
                    }
                    WheelEvent::ExpireOrder { order_id, .. } => {
                        PairCommand::ExpireOrder { order_id }
                    }
                };
                if sender.send(command).await.is_err() {
                    tracing::warn!("pair worker gone, dropping wheel event");
                }
            }
        })
    }

    fn sender(&self, pair: &str) -> Result<mpsc::Sender<PairCommand>, CoreError> {
        self.senders
            .get(pair)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::UnknownPair(pair.to_string()))
    }

    async fn request<T>(
        &self,
        pair: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> PairCommand,
    ) -> Result<T, CoreError> {
        let sender = self.sender(pair)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(build(tx))
            .await
            .map_err(|_| CoreError::Transient(format!("pair {pair} worker unavailable")))?;
        rx.await
            .map_err(|_| CoreError::Transient(format!("pair {pair} worker dropped the request")))
    }

    // ==================== Ingress ====================

    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, CoreError> {
        let pair = request.pair.clone();
        self.request(&pair, |resp| PairCommand::Place { request, resp })
            .await?
    }

    /// Cancellation may race a concurrent match; the per-pair single
    /// writer resolves it, answering "not open" when the match won.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<CancelOrderResponse, CoreError> {
        let Some(pair) = self.order_pairs.get(&order_id).map(|p| p.clone()) else {
            return Err(CoreError::Conflict(format!("order {order_id} is not open")));
        };
        let user_id = user_id.to_string();
        self.request(&pair, |resp| PairCommand::Cancel {
            order_id,
            user_id,
            resp,
        })
        .await?
    }

    /// The live (non-terminal) view of an order, straight from its owning
    /// worker.
    pub async fn open_order(&self, order_id: Uuid) -> Result<Option<Order>, CoreError> {
        let Some(pair) = self.order_pairs.get(&order_id).map(|p| p.clone()) else {
            return Ok(None);
        };
        self.request(&pair, |resp| PairCommand::GetOpenOrder { order_id, resp })
            .await
    }

    /// Order book read path: fresh hot snapshot, else the owning worker,
    /// else warm aggregation.
    pub async fn order_book(&self, pair: &str, depth: usize) -> Result<BookSnapshot, CoreError> {
        let now = now_millis();
        if let Some(snapshot) = self.store.hot().fresh_snapshot(pair, now) {
            return Ok(truncate_snapshot(snapshot, depth));
        }

        if self.senders.contains_key(pair) {
            return self
                .request(pair, |resp| PairCommand::Snapshot { depth, resp })
                .await?;
        }

        match self.store.book_fallback(pair, depth).await? {
            Some((bids, asks)) => {
                let sequence = match self.store.warm() {
                    Some(warm) => warm.fetch_sequence(pair).await?,
                    None => 0,
                };
                Ok(BookSnapshot {
                    pair: pair.to_string(),
                    bids,
                    asks,
                    sequence,
                    timestamp: now,
                })
            }
            None => Err(CoreError::UnknownPair(pair.to_string())),
        }
    }

    pub async fn update_mark_price(&self, pair: &str, mark: Amount) -> Result<(), CoreError> {
        let sender = self.sender(pair)?;
        sender
            .send(PairCommand::MarkUpdate { mark })
            .await
            .map_err(|_| CoreError::Transient(format!("pair {pair} worker unavailable")))
    }

    pub async fn pair_stats(&self, pair: &str) -> Result<PairStats, CoreError> {
        self.request(pair, |resp| PairCommand::Stats { resp }).await
    }

    pub fn pairs(&self) -> Vec<String> {
        self.config.engine.pairs.clone()
    }

    /// Teardown: drain every worker (each flushes its open orders and final
    /// watermark to warm storage) and release pair ownership.
    pub async fn shutdown(&self) {
        let workers: Vec<mpsc::Sender<PairCommand>> =
            self.senders.iter().map(|entry| entry.value().clone()).collect();
        for worker in workers {
            let (tx, rx) = oneshot::channel();
            if worker.send(PairCommand::Flush { resp: tx }).await.is_ok() {
                let _ = rx.await;
            }
        }
        self.senders.clear();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        tracing::info!("matching engine stopped");
    }
}

fn truncate_snapshot(mut snapshot: BookSnapshot, depth: usize) -> BookSnapshot {
    snapshot.bids.truncate(depth);
    snapshot.asks.truncate(depth);
    snapshot
}

#[cfg(test)]
mod tests;
