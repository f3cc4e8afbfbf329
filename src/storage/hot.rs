//! Hot storage tier.
//!
//! In-memory maps are the authoritative read path for matching-adjacent
//! state; an optional Redis mirror extends the tier across processes. All
//! mirror writes are fire-and-forget spawns so the matching task never
//! blocks on the network, and mirrored entries carry a 24h TTL.

use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::book::BookSnapshot;
use crate::models::{Order, Position, Trade, UserOrdersQuery};
use crate::storage::keys::CacheKey;
use crate::storage::redis_client::RedisClient;

/// Mirrored entries expire after 24 hours.
const MIRROR_TTL_SECS: u64 = 24 * 60 * 60;

/// A book snapshot older than this is considered stale for the fast read
/// path.
pub const SNAPSHOT_FRESH_MS: i64 = 1_000;

pub struct HotStore {
    orders: DashMap<Uuid, Order>,
    /// Per-user order ids, appended in arrival order.
    user_orders: DashMap<String, Vec<Uuid>>,
    /// Per-pair recent trades, newest at the front.
    trades: DashMap<String, VecDeque<Trade>>,
    snapshots: DashMap<String, BookSnapshot>,
    positions: DashMap<(String, String), Position>,
    /// Keys whose warm write-back exhausted its retries; the reconciler
    /// re-sends these.
    flagged: DashSet<Uuid>,
    trade_history: usize,
    mirror: Option<Arc<RedisClient>>,
}

impl HotStore {
    pub fn new(trade_history: usize, mirror: Option<Arc<RedisClient>>) -> Self {
        HotStore {
            orders: DashMap::new(),
            user_orders: DashMap::new(),
            trades: DashMap::new(),
            snapshots: DashMap::new(),
            positions: DashMap::new(),
            flagged: DashSet::new(),
            trade_history,
            mirror,
        }
    }

    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn mirror(&self) -> Option<Arc<RedisClient>> {
        self.mirror.clone()
    }

    // ==================== Orders ====================

    pub fn upsert_order(&self, order: &Order) {
        let is_new = !self.orders.contains_key(&order.id);
        self.orders.insert(order.id, order.clone());
        if is_new {
            self.user_orders
                .entry(order.user_id.clone())
                .or_default()
                .push(order.id);
        }
        self.mirror_order(order);
    }

    pub fn get_order(&self, id: &Uuid) -> Option<Order> {
        self.orders.get(id).map(|o| o.clone())
    }

    pub fn get_user_orders(&self, user_id: &str, query: &UserOrdersQuery) -> Vec<Order> {
        let ids = match self.user_orders.get(user_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let mut out: Vec<Order> = ids
            .iter()
            .filter_map(|id| self.orders.get(id).map(|o| o.clone()))
            .filter(|o| query.matches(o))
            .collect();
        // Newest first, then page.
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out.into_iter()
            .skip(query.offset())
            .take(query.limit())
            .collect()
    }

    /// Evict a terminal order (post-archival, or TTL sweep in hot-only
    /// mode). Keeps the user index compact.
    pub fn evict_order(&self, id: &Uuid) {
        if let Some((_, order)) = self.orders.remove(id) {
            if let Some(mut ids) = self.user_orders.get_mut(&order.user_id) {
                ids.retain(|x| x != id);
            }
            if let Some(mirror) = &self.mirror {
                let mirror = mirror.clone();
                let key = CacheKey::order(id);
                let ladder_key = CacheKey::pair_side(&order.pair, order.side);
                let member = id.to_string();
                tokio::spawn(async move {
                    let _ = mirror.del(&key).await;
                    let _ = mirror.zrem(&ladder_key, member).await;
                });
            }
        }
        self.flagged.remove(id);
    }

    // ==================== Trades ====================

    pub fn push_trade(&self, trade: &Trade) {
        let mut ring = self.trades.entry(trade.pair.clone()).or_default();
        ring.push_front(trade.clone());
        while ring.len() > self.trade_history {
            ring.pop_back();
        }
    }

    pub fn recent_trades(&self, pair: &str, limit: usize) -> Vec<Trade> {
        self.trades
            .get(pair)
            .map(|ring| ring.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Scan the per-pair rings for a user's trades; warm storage serves the
    /// deep history.
    pub fn recent_user_trades(&self, user_id: &str, limit: usize) -> Vec<Trade> {
        let mut out: Vec<Trade> = self
            .trades
            .iter()
            .flat_map(|ring| {
                ring.value()
                    .iter()
                    .filter(|t| t.buyer_id == user_id || t.seller_id == user_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }

    // ==================== Book snapshots ====================

    pub fn put_snapshot(&self, snapshot: BookSnapshot) {
        if let Some(mirror) = &self.mirror {
            if let Ok(json) = serde_json::to_string(&snapshot) {
                let mirror = mirror.clone();
                let key = CacheKey::book_snapshot(&snapshot.pair);
                tokio::spawn(async move {
                    let _ = mirror.set_ex(&key, json, MIRROR_TTL_SECS).await;
                });
            }
        }
        self.snapshots.insert(snapshot.pair.clone(), snapshot);
    }

    /// A snapshot no older than [`SNAPSHOT_FRESH_MS`].
    pub fn fresh_snapshot(&self, pair: &str, now: i64) -> Option<BookSnapshot> {
        self.snapshots
            .get(pair)
            .filter(|s| now - s.timestamp <= SNAPSHOT_FRESH_MS)
            .map(|s| s.clone())
    }

    // ==================== Positions ====================

    pub fn upsert_position(&self, position: &Position) {
        if let Some(mirror) = &self.mirror {
            if let Ok(json) = serde_json::to_string(position) {
                let mirror = mirror.clone();
                let key = CacheKey::position(&position.user_id, &position.contract);
                tokio::spawn(async move {
                    let _ = mirror.set_ex(&key, json, MIRROR_TTL_SECS).await;
                });
            }
        }
        self.positions.insert(
            (position.user_id.clone(), position.contract.clone()),
            position.clone(),
        );
    }

    pub fn get_positions(&self, user_id: &str) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|kv| kv.key().0 == user_id)
            .map(|kv| kv.value().clone())
            .collect()
    }

    pub fn remove_position(&self, user_id: &str, contract: &str) {
        self.positions
            .remove(&(user_id.to_string(), contract.to_string()));
    }

    // ==================== Write-back flags ====================

    pub fn flag_writeback(&self, id: Uuid) {
        metrics::counter!("dex_storage_writeback_flagged_total").increment(1);
        self.flagged.insert(id);
    }

    pub fn take_flagged(&self) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self.flagged.iter().map(|id| *id).collect();
        for id in &ids {
            self.flagged.remove(id);
        }
        ids
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }

    // ==================== Mirror plumbing ====================

    fn mirror_order(&self, order: &Order) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let Ok(json) = serde_json::to_string(order) else {
            return;
        };
        let mirror = mirror.clone();
        let key = CacheKey::order(&order.id);
        let ladder_key = CacheKey::pair_side(&order.pair, order.side);
        let user_key = CacheKey::user_orders(&order.user_id);
        let member = order.id.to_string();
        let terminal = order.is_terminal();
        // Scores are display-scale floats: ordering inside the mirror is a
        // cache concern, never a matching decision.
        let price_score: f64 = order
            .price
            .map(|p| p.to_decimal_string().parse().unwrap_or(0.0))
            .unwrap_or(0.0);
        let ts_score = order.timestamp as f64;

        tokio::spawn(async move {
            let _ = mirror.set_ex(&key, json, MIRROR_TTL_SECS).await;
            if terminal {
                let _ = mirror.zrem(&ladder_key, member.clone()).await;
            } else {
                let _ = mirror.zadd(&ladder_key, price_score, member.clone()).await;
            }
            let _ = mirror.zadd(&user_key, ts_score, member).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType, Side};
    use crate::precision::Amount;

    fn order(user: &str, ts: i64) -> Order {
        Order::new(user, "XOM/USDT", OrderType::Limit, Side::Buy, Amount::from_u64(10), ts)
    }

    #[test]
    fn upsert_and_get_order() {
        let hot = HotStore::new(10, None);
        let o = order("alice", 1);
        hot.upsert_order(&o);
        assert_eq!(hot.get_order(&o.id).unwrap().id, o.id);
    }

    #[test]
    fn user_orders_filter_and_page() {
        let hot = HotStore::new(10, None);
        for ts in 1..=5 {
            hot.upsert_order(&order("alice", ts));
        }
        hot.upsert_order(&order("bob", 6));

        let q = UserOrdersQuery {
            limit: Some(3),
            ..Default::default()
        };
        let got = hot.get_user_orders("alice", &q);
        assert_eq!(got.len(), 3);
        // Newest first.
        assert_eq!(got[0].timestamp, 5);

        let q = UserOrdersQuery {
            status: Some(OrderStatus::Filled),
            ..Default::default()
        };
        assert!(hot.get_user_orders("alice", &q).is_empty());
    }

    #[test]
    fn trade_ring_is_bounded() {
        let hot = HotStore::new(3, None);
        for i in 0..5i64 {
            let t = Trade::new(
                "XOM/USDT",
                Uuid::new_v4(),
                Uuid::new_v4(),
                "b",
                "s",
                Amount::from_u64(1),
                Amount::from_u64(1),
                Amount::ZERO,
                false,
                i,
                i as u64,
            )
            .unwrap();
            hot.push_trade(&t);
        }
        let recent = hot.recent_trades("XOM/USDT", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, 4);
    }

    #[test]
    fn snapshot_freshness_window() {
        let hot = HotStore::new(10, None);
        let snap = BookSnapshot {
            pair: "XOM/USDT".into(),
            bids: vec![],
            asks: vec![],
            sequence: 1,
            timestamp: 1_000,
        };
        hot.put_snapshot(snap);
        assert!(hot.fresh_snapshot("XOM/USDT", 1_500).is_some());
        assert!(hot.fresh_snapshot("XOM/USDT", 2_500).is_none());
    }

    #[test]
    fn eviction_cleans_user_index() {
        let hot = HotStore::new(10, None);
        let o = order("alice", 1);
        hot.upsert_order(&o);
        hot.evict_order(&o.id);
        assert!(hot.get_order(&o.id).is_none());
        let q = UserOrdersQuery::default();
        assert!(hot.get_user_orders("alice", &q).is_empty());
    }

    #[test]
    fn flagged_keys_drain_once() {
        let hot = HotStore::new(10, None);
        let id = Uuid::new_v4();
        hot.flag_writeback(id);
        assert_eq!(hot.flagged_count(), 1);
        assert_eq!(hot.take_flagged(), vec![id]);
        assert_eq!(hot.flagged_count(), 0);
    }
}
