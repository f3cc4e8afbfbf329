//! The immediate-match pass.
//!
//! Price-time priority: walk the opposing ladder from the best price while
//! it satisfies the taker's cap, consuming resting orders FIFO within each
//! level. The fill price is always the resting order's price, so price
//! improvement accrues to the taker.

use uuid::Uuid;

use crate::book::OrderBook;
use crate::error::CoreError;
use crate::models::{Side, TimeInForce};
use crate::precision::Amount;

/// One maker consumption produced by a match pass.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub maker_user_id: String,
    pub price: Amount,
    pub quantity: Amount,
    /// Book sequence of the decrement that committed this fill.
    pub sequence: u64,
}

/// Run the immediate-match pass for an incoming order.
///
/// The pass mutates the book (decrements and removals only); resting the
/// taker remainder is the caller's decision. Errors leave the book
/// untouched:
///
/// - post-only that would produce any fill -> validation error;
/// - FOK that cannot fully fill at acceptable prices -> liquidity error;
/// - market order into an empty opposing side -> liquidity error.
pub fn match_incoming(
    book: &mut OrderBook,
    taker_side: Side,
    quantity: Amount,
    limit: Option<Amount>,
    time_in_force: TimeInForce,
    post_only: bool,
) -> Result<Vec<Fill>, CoreError> {
    if post_only {
        // A post-only order must rest; any immediate fill rejects it.
        if let Some(price) = limit {
            if book.would_cross(taker_side, price) {
                return Err(CoreError::Validation("post-only order would cross".into()));
            }
        }
        return Ok(Vec::new());
    }

    if time_in_force == TimeInForce::Fok {
        let available = book.opposing_quantity(taker_side, limit, quantity);
        if available < quantity {
            return Err(CoreError::Liquidity(
                "fill-or-kill cannot be fully filled at acceptable prices".into(),
            ));
        }
    }

    if limit.is_none() && book.best_opposing(taker_side, None).is_none() {
        return Err(CoreError::Liquidity("no opposing liquidity for market order".into()));
    }

    let mut remaining = quantity;
    let mut fills = Vec::new();

    while !remaining.is_zero() {
        let Some(entry) = book.best_opposing(taker_side, limit) else {
            break;
        };
        let maker_order_id = entry.order_id;
        let maker_user_id = entry.user_id.clone();
        let price = entry.price;
        let fill_qty = remaining.min(entry.remaining);

        let sequence = book
            .decrement(&maker_order_id, fill_qty)
            .ok_or_else(|| CoreError::Fatal("book index out of sync with ladder".into()))?;

        book.set_last_trade_price(price);
        fills.push(Fill {
            maker_order_id,
            maker_user_id,
            price,
            quantity: fill_qty,
            sequence,
        });
        remaining -= fill_qty;
    }

    Ok(fills)
}
