//! Redis pub/sub mirroring of bus events.
//!
//! Forwards committed trade and book events to Redis channels for external
//! consumers. Strictly fire-and-forget: a lagging or absent Redis never
//! feeds back into the matching path.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::events::EventBus;
use crate::storage::keys::CacheKey;
use crate::storage::redis_client::RedisClient;

pub fn spawn_mirror(bus: &EventBus, redis: Arc<RedisClient>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let mut trades = bus.subscribe_trades();
    let trade_redis = redis.clone();
    handles.push(tokio::spawn(async move {
        loop {
            match trades.recv().await {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    let channel = CacheKey::trade_channel(&event.pair);
                    if let Err(e) = trade_redis.publish(&channel, json).await {
                        tracing::warn!("trade pub/sub publish failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("trade pub/sub mirror lagged {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("trade pub/sub mirror stopped");
    }));

    let mut books = bus.subscribe_books();
    handles.push(tokio::spawn(async move {
        loop {
            match books.recv().await {
                Ok(snapshot) => {
                    let Ok(json) = serde_json::to_string(&snapshot) else {
                        continue;
                    };
                    let channel = CacheKey::book_channel(&snapshot.pair);
                    if let Err(e) = redis.publish(&channel, json).await {
                        tracing::warn!("orderbook pub/sub publish failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("orderbook pub/sub mirror lagged {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("orderbook pub/sub mirror stopped");
    }));

    handles
}
