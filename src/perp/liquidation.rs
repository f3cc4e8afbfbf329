//! Liquidation engine and auto-deleverage queue.
//!
//! After each mark update, any position whose equity
//! (`margin + unrealized_pnl`) has fallen to its maintenance margin is
//! closed at mark. When the book cannot absorb the close, the remainder is
//! taken from counterparties at the head of the ADL queue, which ranks the
//! opposite side by profit × leverage.

use alloy_primitives::U256;

use crate::error::CoreError;
use crate::models::position::SignedAmount;
use crate::models::{Position, PositionSide};
use crate::precision::{self, Amount, BASE};

use super::position::{breaches_maintenance, maintenance_margin, PositionBook};

/// How a breached position was closed.
#[derive(Debug, Clone)]
pub enum LiquidationOutcome {
    /// Fully closed against the book at mark.
    Closed {
        position: Position,
        /// Loss realized against the position's margin; never exceeds the
        /// deposited margin.
        realized_loss: Amount,
        /// Margin handed back to the owner after the loss.
        margin_returned: Amount,
    },
    /// Book liquidity was insufficient; the remainder was absorbed by ADL
    /// counterparties.
    Deleveraged {
        position: Position,
        realized_loss: Amount,
        margin_returned: Amount,
        absorbed_by: Vec<AdlAbsorption>,
    },
}

/// One counterparty reduction performed by the ADL queue.
#[derive(Debug, Clone)]
pub struct AdlAbsorption {
    pub user_id: String,
    pub quantity: Amount,
    /// Freed margin plus realized profit owed back to the absorber.
    pub credit: SignedAmount,
}

/// ADL ranking entry: higher score = first to absorb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdlRank {
    pub user_id: String,
    pub contract: String,
    /// `pnl * leverage / notional`, scaled by 10^18.
    pub score: Amount,
}

/// Auto-deleverage queue over one contract's profitable counterparties.
pub struct AdlQueue;

impl AdlQueue {
    /// Rank the `side` positions of `contract` by profit × leverage,
    /// descending. Only profitable positions are candidates.
    pub fn rank(
        book: &PositionBook,
        contract: &str,
        side: PositionSide,
    ) -> Result<Vec<AdlRank>, CoreError> {
        let mut ranked = Vec::new();
        for p in book.contract_positions(contract) {
            if p.side != side || !p.is_open() || p.unrealized_pnl.is_negative() {
                continue;
            }
            let notional = precision::quote_quantity(p.mark_price, p.size)?;
            if notional.is_zero() {
                continue;
            }
            // profit fraction * leverage, 10^18-scaled.
            let profit_frac = precision::mul_div(p.unrealized_pnl.value.0, BASE, notional.0)?;
            let score = profit_frac
                .checked_mul(U256::from(p.leverage))
                .ok_or(CoreError::Fatal("adl score overflow".into()))?;
            ranked.push(AdlRank {
                user_id: p.user_id.clone(),
                contract: contract.to_string(),
                score: Amount(score),
            });
        }
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.user_id.cmp(&b.user_id)));
        Ok(ranked)
    }
}

pub struct LiquidationEngine {
    maintenance_bps: u32,
}

impl LiquidationEngine {
    pub fn new(maintenance_bps: u32) -> Self {
        LiquidationEngine { maintenance_bps }
    }

    /// Scan `contract` after a mark update and close every breached
    /// position. `bid_liquidity` / `ask_liquidity` is the book depth
    /// available for a regular close (longs close into bids, shorts into
    /// asks); anything beyond it goes through ADL.
    pub fn run(
        &self,
        positions: &PositionBook,
        contract: &str,
        mark: Amount,
        bid_liquidity: Amount,
        ask_liquidity: Amount,
        now: i64,
    ) -> Result<Vec<LiquidationOutcome>, CoreError> {
        let mut outcomes = Vec::new();
        let mut bids = bid_liquidity;
        let mut asks = ask_liquidity;

        for position in positions.contract_positions(contract) {
            if !position.is_open() {
                continue;
            }
            let maintenance =
                maintenance_margin(position.size, mark, self.maintenance_bps)?;
            if !breaches_maintenance(position.margin, &position.unrealized_pnl, maintenance) {
                continue;
            }

            let liquidity = match position.side {
                PositionSide::Long => &mut bids,
                PositionSide::Short => &mut asks,
            };
            let outcome = self.close(positions, position, mark, liquidity, now)?;
            metrics::counter!("dex_liquidations_total").increment(1);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn close(
        &self,
        positions: &PositionBook,
        position: Position,
        mark: Amount,
        liquidity: &mut Amount,
        now: i64,
    ) -> Result<LiquidationOutcome, CoreError> {
        // Realized loss is capped by the deposited margin.
        let loss = if position.unrealized_pnl.is_negative() {
            position.unrealized_pnl.value.min(position.margin)
        } else {
            Amount::ZERO
        };

        let margin_returned = position.margin.saturating_sub(loss);
        let closable = position.size.min(*liquidity);
        *liquidity = liquidity.saturating_sub(closable);
        let excess = position.size.saturating_sub(closable);

        let mut closed = position.clone();
        closed.size = Amount::ZERO;
        closed.margin = Amount::ZERO;
        closed.mark_price = mark;
        closed.unrealized_pnl = SignedAmount::ZERO;
        closed.updated_at = now;
        positions.remove(&position.user_id, &position.contract);

        if excess.is_zero() {
            return Ok(LiquidationOutcome::Closed {
                position: closed,
                realized_loss: loss,
                margin_returned,
            });
        }

        // Counterparties at the head of the ADL queue absorb the excess by
        // reducing their own exposure at mark.
        let queue = AdlQueue::rank(positions, &position.contract, position.side.opposite())?;
        let mut remaining = excess;
        let mut absorbed_by = Vec::new();
        for rank in queue {
            if remaining.is_zero() {
                break;
            }
            let Some(counter) = positions.get(&rank.user_id, &position.contract) else {
                continue;
            };
            let take = counter.size.min(remaining);
            let (_, credit) = positions.apply_fill(
                &rank.user_id,
                &position.contract,
                counter.side.opposite(),
                take,
                mark,
                counter.leverage,
                Amount::ZERO,
                now,
            )?;
            remaining = remaining.saturating_sub(take);
            absorbed_by.push(AdlAbsorption {
                user_id: rank.user_id,
                quantity: take,
                credit,
            });
        }

        if !remaining.is_zero() {
            tracing::error!(
                contract = %position.contract,
                user = %position.user_id,
                remaining = %remaining,
                "adl queue exhausted before close completed"
            );
            metrics::counter!("dex_adl_shortfall_total").increment(1);
        }

        Ok(LiquidationOutcome::Deleveraged {
            position: closed,
            realized_loss: loss,
            margin_returned,
            absorbed_by,
        })
    }
}
