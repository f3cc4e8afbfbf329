use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::precision::{self, Amount};

/// A committed trade between two orders.
///
/// Fees accrue in the quote asset (collateral asset for perpetuals);
/// `fee_asset` records it per trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub pair: String,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buyer_id: String,
    pub seller_id: String,
    pub price: Amount,
    pub quantity: Amount,
    /// `price * quantity / 10^18`.
    pub quote_quantity: Amount,
    /// Maker fee + taker fee for this trade.
    pub fee: Amount,
    pub fee_asset: String,
    pub buyer_is_maker: bool,
    pub timestamp: i64,
    /// Book sequence at which the trade committed.
    pub sequence: u64,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: &str,
        buy_order_id: Uuid,
        sell_order_id: Uuid,
        buyer_id: &str,
        seller_id: &str,
        price: Amount,
        quantity: Amount,
        fee: Amount,
        buyer_is_maker: bool,
        timestamp: i64,
        sequence: u64,
    ) -> Result<Self, CoreError> {
        let quote_quantity = precision::quote_quantity(price, quantity)?;
        let fee_asset = pair.split('/').nth(1).unwrap_or("").to_string();
        Ok(Trade {
            id: Uuid::new_v4(),
            pair: pair.to_string(),
            buy_order_id,
            sell_order_id,
            buyer_id: buyer_id.to_string(),
            seller_id: seller_id.to_string(),
            price,
            quantity,
            quote_quantity,
            fee,
            fee_asset,
            buyer_is_maker,
            timestamp,
            sequence,
        })
    }
}

/// `getTrades` / `getUserTrades` filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeQuery {
    pub pair: Option<String>,
    pub limit: Option<usize>,
    pub before: Option<i64>,
    pub after: Option<i64>,
}

impl TradeQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn matches(&self, trade: &Trade) -> bool {
        if let Some(pair) = &self.pair {
            if &trade.pair != pair {
                return false;
            }
        }
        let before_ok = self.before.map_or(true, |ts| trade.timestamp < ts);
        let after_ok = self.after.map_or(true, |ts| trade.timestamp > ts);
        before_ok && after_ok
    }
}
