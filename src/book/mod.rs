//! Per-pair order book state.
//!
//! Two ordered price ladders per pair: bids walked price-descending, asks
//! price-ascending, FIFO within a level. The book is owned exclusively by
//! its pair's matching task (see the engine module), so no interior locking
//! is needed; readers receive point-in-time snapshots.
//!
//! Every committed mutation (add / remove / decrement) advances the pair's
//! sequence by exactly one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::models::Side;
use crate::precision::Amount;

/// A resting order's footprint in the ladder.
///
/// For iceberg orders `remaining` is the visible tranche only; the hidden
/// reserve lives with the slicer state.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: Uuid,
    pub user_id: String,
    pub price: Amount,
    pub remaining: Amount,
    pub timestamp: i64,
}

/// One aggregated ladder level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Amount,
    pub quantity: Amount,
    pub order_count: usize,
}

/// Point-in-time book view: bids price-descending, asks price-ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub sequence: u64,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct OrderBook {
    pair: String,
    bids: BTreeMap<Amount, VecDeque<BookEntry>>,
    asks: BTreeMap<Amount, VecDeque<BookEntry>>,
    /// order id -> (side, price) for O(log n) removal.
    index: HashMap<Uuid, (Side, Amount)>,
    sequence: u64,
    last_trade_price: Option<Amount>,
}

impl OrderBook {
    pub fn new(pair: &str) -> Self {
        OrderBook {
            pair: pair.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            sequence: 0,
            last_trade_price: None,
        }
    }

    /// Restore the sequence watermark when replaying from warm storage.
    pub fn with_sequence(pair: &str, sequence: u64) -> Self {
        let mut book = OrderBook::new(pair);
        book.sequence = sequence;
        book
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_trade_price(&self) -> Option<Amount> {
        self.last_trade_price
    }

    pub fn set_last_trade_price(&mut self, price: Amount) {
        self.last_trade_price = Some(price);
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn best_bid(&self) -> Option<Amount> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Amount> {
        self.asks.keys().next().copied()
    }

    fn ladder(&mut self, side: Side) -> &mut BTreeMap<Amount, VecDeque<BookEntry>> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Insert a resting order at the back of its level's FIFO queue.
    /// Advances the sequence.
    pub fn insert(&mut self, side: Side, entry: BookEntry) -> u64 {
        let price = entry.price;
        self.index.insert(entry.order_id, (side, price));
        self.ladder(side).entry(price).or_default().push_back(entry);
        self.bump()
    }

    /// Remove an order from the ladder. Advances the sequence when the
    /// order was present.
    pub fn remove(&mut self, order_id: &Uuid) -> Option<(BookEntry, u64)> {
        let (side, price) = self.index.remove(order_id)?;
        let ladder = self.ladder(side);
        let queue = ladder.get_mut(&price)?;
        let pos = queue.iter().position(|e| &e.order_id == order_id)?;
        let entry = queue.remove(pos)?;
        if queue.is_empty() {
            ladder.remove(&price);
        }
        let seq = self.bump();
        Some((entry, seq))
    }

    /// Decrement the front order of the best opposing level after a fill.
    ///
    /// The caller has already decided the fill quantity; a fully consumed
    /// entry is popped and its level pruned. Advances the sequence.
    pub fn decrement(&mut self, order_id: &Uuid, qty: Amount) -> Option<u64> {
        let (side, price) = *self.index.get(order_id)?;
        let ladder = self.ladder(side);
        let queue = ladder.get_mut(&price)?;
        let pos = queue.iter().position(|e| &e.order_id == order_id)?;
        let entry = &mut queue[pos];
        entry.remaining = entry.remaining.saturating_sub(qty);
        if entry.remaining.is_zero() {
            queue.remove(pos);
            if queue.is_empty() {
                ladder.remove(&price);
            }
            self.index.remove(order_id);
        }
        Some(self.bump())
    }

    /// The best opposing entry an incoming order on `taker_side` can match,
    /// respecting an optional price cap.
    pub fn best_opposing(&self, taker_side: Side, limit: Option<Amount>) -> Option<&BookEntry> {
        match taker_side {
            Side::Buy => {
                let (price, queue) = self.asks.iter().next()?;
                if let Some(cap) = limit {
                    if *price > cap {
                        return None;
                    }
                }
                queue.front()
            }
            Side::Sell => {
                let (price, queue) = self.bids.iter().next_back()?;
                if let Some(cap) = limit {
                    if *price < cap {
                        return None;
                    }
                }
                queue.front()
            }
        }
    }

    /// Total opposing quantity available at acceptable prices; used by the
    /// FOK pre-scan. Stops summing once `needed` is covered.
    pub fn opposing_quantity(&self, taker_side: Side, limit: Option<Amount>, needed: Amount) -> Amount {
        let mut total = Amount::ZERO;
        match taker_side {
            Side::Buy => {
                for (price, queue) in self.asks.iter() {
                    if let Some(cap) = limit {
                        if *price > cap {
                            break;
                        }
                    }
                    for e in queue {
                        total = total.saturating_add(e.remaining);
                        if total >= needed {
                            return total;
                        }
                    }
                }
            }
            Side::Sell => {
                for (price, queue) in self.bids.iter().rev() {
                    if let Some(cap) = limit {
                        if *price < cap {
                            break;
                        }
                    }
                    for e in queue {
                        total = total.saturating_add(e.remaining);
                        if total >= needed {
                            return total;
                        }
                    }
                }
            }
        }
        total
    }

    /// Whether an order on `side` at `price` would cross the opposite side;
    /// the post-only rejection check.
    pub fn would_cross(&self, side: Side, price: Amount) -> bool {
        match side {
            Side::Buy => self.best_ask().map_or(false, |ask| price >= ask),
            Side::Sell => self.best_bid().map_or(false, |bid| price <= bid),
        }
    }

    /// First N levels per side.
    pub fn snapshot(&self, depth: usize, timestamp: i64) -> BookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(price, queue)| aggregate(*price, queue))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(price, queue)| aggregate(*price, queue))
            .collect();
        BookSnapshot {
            pair: self.pair.clone(),
            bids,
            asks,
            sequence: self.sequence,
            timestamp,
        }
    }

    /// Post-commit invariant: bids strictly decreasing, asks strictly
    /// increasing (BTreeMap keys guarantee this), and no crossed book.
    pub fn is_consistent(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid < ask,
            _ => true,
        }
    }

    fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

fn aggregate(price: Amount, queue: &VecDeque<BookEntry>) -> DepthLevel {
    let mut quantity = Amount::ZERO;
    for e in queue {
        quantity = quantity.saturating_add(e.remaining);
    }
    DepthLevel {
        price,
        quantity,
        order_count: queue.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::from_decimal_str(s).unwrap()
    }

    fn entry(price: &str, qty: &str, ts: i64) -> BookEntry {
        BookEntry {
            order_id: Uuid::new_v4(),
            user_id: "u".into(),
            price: amt(price),
            remaining: amt(qty),
            timestamp: ts,
        }
    }

    #[test]
    fn sequence_advances_by_one_per_mutation() {
        let mut book = OrderBook::new("XOM/USDT");
        let e = entry("1.26", "100", 1);
        let id = e.order_id;
        assert_eq!(book.insert(Side::Buy, e), 1);
        assert_eq!(book.insert(Side::Sell, entry("1.30", "50", 2)), 2);
        let (_, seq) = book.remove(&id).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(book.sequence(), 3);
    }

    #[test]
    fn best_bid_ask_and_cross_detection() {
        let mut book = OrderBook::new("XOM/USDT");
        book.insert(Side::Buy, entry("1.25", "100", 1));
        book.insert(Side::Buy, entry("1.26", "100", 2));
        book.insert(Side::Sell, entry("1.28", "100", 3));

        assert_eq!(book.best_bid(), Some(amt("1.26")));
        assert_eq!(book.best_ask(), Some(amt("1.28")));
        assert!(book.is_consistent());

        // Equal to best opposite counts as crossing (post-only semantics).
        assert!(book.would_cross(Side::Buy, amt("1.28")));
        assert!(!book.would_cross(Side::Buy, amt("1.27")));
        assert!(book.would_cross(Side::Sell, amt("1.26")));
    }

    #[test]
    fn fifo_within_a_level() {
        let mut book = OrderBook::new("XOM/USDT");
        let first = entry("1.26", "100", 1);
        let first_id = first.order_id;
        book.insert(Side::Sell, first);
        book.insert(Side::Sell, entry("1.26", "200", 2));

        let best = book.best_opposing(Side::Buy, None).unwrap();
        assert_eq!(best.order_id, first_id);
    }

    #[test]
    fn decrement_consumes_and_prunes() {
        let mut book = OrderBook::new("XOM/USDT");
        let e = entry("1.26", "100", 1);
        let id = e.order_id;
        book.insert(Side::Sell, e);

        book.decrement(&id, amt("40")).unwrap();
        assert!(book.contains(&id));
        book.decrement(&id, amt("60")).unwrap();
        assert!(!book.contains(&id));
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn opposing_quantity_respects_price_cap() {
        let mut book = OrderBook::new("XOM/USDT");
        book.insert(Side::Sell, entry("1.26", "100", 1));
        book.insert(Side::Sell, entry("1.27", "200", 2));

        let within = book.opposing_quantity(Side::Buy, Some(amt("1.26")), amt("1000"));
        assert_eq!(within, amt("100"));
        let all = book.opposing_quantity(Side::Buy, None, amt("1000"));
        assert_eq!(all, amt("300"));
    }

    #[test]
    fn snapshot_ordering_and_aggregation() {
        let mut book = OrderBook::new("XOM/USDT");
        book.insert(Side::Buy, entry("1.24", "100", 1));
        book.insert(Side::Buy, entry("1.25", "100", 2));
        book.insert(Side::Buy, entry("1.25", "50", 3));
        book.insert(Side::Sell, entry("1.27", "75", 4));

        let snap = book.snapshot(10, 99);
        assert_eq!(snap.bids[0].price, amt("1.25"));
        assert_eq!(snap.bids[0].quantity, amt("150"));
        assert_eq!(snap.bids[0].order_count, 2);
        assert_eq!(snap.bids[1].price, amt("1.24"));
        assert_eq!(snap.asks[0].price, amt("1.27"));
        assert_eq!(snap.sequence, 4);
    }

    #[test]
    fn depth_truncation() {
        let mut book = OrderBook::new("XOM/USDT");
        for (i, p) in ["1.21", "1.22", "1.23", "1.24"].iter().enumerate() {
            book.insert(Side::Buy, entry(p, "10", i as i64));
        }
        let snap = book.snapshot(2, 0);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0].price, amt("1.24"));
    }
}
