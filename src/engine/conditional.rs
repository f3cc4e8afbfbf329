//! Conditional trigger set.
//!
//! Stop, stop-limit and trailing-stop orders wait here, indexed by trigger
//! direction, and are evaluated on every last-trade update:
//!
//! - a sell stop triggers when `last <= stopPrice`, a buy stop when
//!   `last >= stopPrice`;
//! - a trailing stop keeps its `stopPrice` offset by a fixed distance from
//!   the running best adverse price, ratcheted off the last trade.

use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::models::{Order, OrderType, Side};
use crate::precision::Amount;

#[derive(Debug, Clone)]
struct TrailingState {
    side: Side,
    distance: Amount,
    stop: Amount,
}

#[derive(Debug, Default)]
pub struct TriggerSet {
    /// Buy stops: trigger when `last >= key`.
    above: BTreeMap<Amount, Vec<Uuid>>,
    /// Sell stops: trigger when `last <= key`.
    below: BTreeMap<Amount, Vec<Uuid>>,
    trailing: HashMap<Uuid, TrailingState>,
}

impl TriggerSet {
    pub fn new() -> Self {
        TriggerSet::default()
    }

    pub fn len(&self) -> usize {
        self.above.values().map(Vec::len).sum::<usize>()
            + self.below.values().map(Vec::len).sum::<usize>()
            + self.trailing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park a conditional order. The stop price must already be set.
    pub fn insert(&mut self, order: &Order) {
        let Some(stop) = order.stop_price else {
            return;
        };
        if order.order_type == OrderType::TrailingStop {
            let distance = order.trail_distance.unwrap_or(Amount::ZERO);
            self.trailing.insert(
                order.id,
                TrailingState {
                    side: order.side,
                    distance,
                    stop,
                },
            );
            return;
        }
        match order.side {
            Side::Buy => self.above.entry(stop).or_default().push(order.id),
            Side::Sell => self.below.entry(stop).or_default().push(order.id),
        }
    }

    pub fn remove(&mut self, order_id: &Uuid) -> bool {
        if self.trailing.remove(order_id).is_some() {
            return true;
        }
        if Self::remove_from(&mut self.above, order_id) {
            return true;
        }
        Self::remove_from(&mut self.below, order_id)
    }

    fn remove_from(map: &mut BTreeMap<Amount, Vec<Uuid>>, order_id: &Uuid) -> bool {
        let mut hit = None;
        for (price, ids) in map.iter_mut() {
            if let Some(pos) = ids.iter().position(|id| id == order_id) {
                ids.remove(pos);
                hit = Some((*price, ids.is_empty()));
                break;
            }
        }
        match hit {
            Some((price, true)) => {
                map.remove(&price);
                true
            }
            Some((_, false)) => true,
            None => false,
        }
    }

    /// The current stop price of a parked trailing order.
    pub fn trailing_stop(&self, order_id: &Uuid) -> Option<Amount> {
        self.trailing.get(order_id).map(|t| t.stop)
    }

    /// Evaluate all triggers against a new last-trade price. Fired orders
    /// are removed from the set and returned in deterministic order.
    pub fn on_last_trade(&mut self, last: Amount) -> Vec<Uuid> {
        let mut fired = Vec::new();

        // Buy stops with stopPrice <= last.
        let above_hit: Vec<Amount> = self
            .above
            .range(..=last)
            .map(|(price, _)| *price)
            .collect();
        for price in above_hit {
            if let Some(mut ids) = self.above.remove(&price) {
                fired.append(&mut ids);
            }
        }

        // Sell stops with stopPrice >= last.
        let below_hit: Vec<Amount> = self
            .below
            .range(last..)
            .map(|(price, _)| *price)
            .collect();
        for price in below_hit {
            if let Some(mut ids) = self.below.remove(&price) {
                fired.append(&mut ids);
            }
        }

        // Trailing stops: ratchet with the favorable move, fire on the
        // adverse one.
        let mut trailing_fired = Vec::new();
        for (id, state) in self.trailing.iter_mut() {
            match state.side {
                Side::Sell => {
                    // Protects a long: stop trails the price upward.
                    let candidate = last.saturating_sub(state.distance);
                    if candidate > state.stop {
                        state.stop = candidate;
                    }
                    if last <= state.stop {
                        trailing_fired.push(*id);
                    }
                }
                Side::Buy => {
                    // Protects a short: stop trails the price downward.
                    let candidate = last.saturating_add(state.distance);
                    if candidate < state.stop {
                        state.stop = candidate;
                    }
                    if last >= state.stop {
                        trailing_fired.push(*id);
                    }
                }
            }
        }
        for id in &trailing_fired {
            self.trailing.remove(id);
        }
        fired.extend(trailing_fired);

        fired.sort();
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn amt(s: &str) -> Amount {
        Amount::from_decimal_str(s).unwrap()
    }

    fn stop_order(order_type: OrderType, side: Side, stop: &str) -> Order {
        let mut order = Order::new("alice", "XOM/USDT", order_type, side, amt("10"), 1);
        order.stop_price = Some(amt(stop));
        if order_type == OrderType::TrailingStop {
            order.trail_distance = Some(amt("0.05"));
        }
        order
    }

    #[test]
    fn sell_stop_fires_when_price_falls_through() {
        let mut set = TriggerSet::new();
        let order = stop_order(OrderType::StopLoss, Side::Sell, "1.20");
        set.insert(&order);

        assert!(set.on_last_trade(amt("1.25")).is_empty());
        let fired = set.on_last_trade(amt("1.20"));
        assert_eq!(fired, vec![order.id]);
        assert!(set.is_empty());
    }

    #[test]
    fn buy_stop_fires_when_price_rises_through() {
        let mut set = TriggerSet::new();
        let order = stop_order(OrderType::StopLimit, Side::Buy, "1.30");
        set.insert(&order);

        assert!(set.on_last_trade(amt("1.29")).is_empty());
        assert_eq!(set.on_last_trade(amt("1.31")), vec![order.id]);
    }

    #[test]
    fn trailing_sell_ratchets_up_then_fires() {
        let mut set = TriggerSet::new();
        let order = stop_order(OrderType::TrailingStop, Side::Sell, "0.95");
        set.insert(&order);

        // Price climbs: stop follows at distance 0.05.
        assert!(set.on_last_trade(amt("1.10")).is_empty());
        assert_eq!(set.trailing_stop(&order.id), Some(amt("1.05")));
        assert!(set.on_last_trade(amt("1.20")).is_empty());
        assert_eq!(set.trailing_stop(&order.id), Some(amt("1.15")));

        // Pullback below the ratcheted stop fires.
        assert_eq!(set.on_last_trade(amt("1.15")), vec![order.id]);
    }

    #[test]
    fn trailing_buy_ratchets_down() {
        let mut set = TriggerSet::new();
        let order = stop_order(OrderType::TrailingStop, Side::Buy, "1.50");
        set.insert(&order);

        assert!(set.on_last_trade(amt("1.30")).is_empty());
        assert_eq!(set.trailing_stop(&order.id), Some(amt("1.35")));
        assert_eq!(set.on_last_trade(amt("1.35")), vec![order.id]);
    }

    #[test]
    fn remove_cancels_a_parked_trigger() {
        let mut set = TriggerSet::new();
        let order = stop_order(OrderType::StopLoss, Side::Sell, "1.20");
        set.insert(&order);
        assert!(set.remove(&order.id));
        assert!(set.on_last_trade(amt("1.00")).is_empty());
        assert!(!set.remove(&order.id));
    }
}
