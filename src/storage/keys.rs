//! Hot-tier cache key layout.
//!
//! `order:{id}`, `orders:{pair}:{side}` (price-sorted), `orders:user:{userId}`
//! (time-sorted), plus snapshot/trade/position keys and pub/sub channels.

use uuid::Uuid;

use crate::models::Side;

pub struct CacheKey;

impl CacheKey {
    pub fn order(id: &Uuid) -> String {
        format!("order:{id}")
    }

    pub fn pair_side(pair: &str, side: Side) -> String {
        format!("orders:{pair}:{side}")
    }

    pub fn user_orders(user_id: &str) -> String {
        format!("orders:user:{user_id}")
    }

    pub fn book_snapshot(pair: &str) -> String {
        format!("orderbook:{pair}")
    }

    pub fn trades(pair: &str) -> String {
        format!("trades:{pair}")
    }

    pub fn position(user_id: &str, contract: &str) -> String {
        format!("position:{user_id}:{contract}")
    }

    pub fn trade_channel(pair: &str) -> String {
        format!("channel:trades:{pair}")
    }

    pub fn book_channel(pair: &str) -> String {
        format!("channel:orderbook:{pair}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        let id = Uuid::nil();
        assert_eq!(
            CacheKey::order(&id),
            "order:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(CacheKey::pair_side("XOM/USDT", Side::Buy), "orders:XOM/USDT:buy");
        assert_eq!(CacheKey::user_orders("alice"), "orders:user:alice");
        assert_eq!(CacheKey::book_channel("XOM/USDT"), "channel:orderbook:XOM/USDT");
    }
}
