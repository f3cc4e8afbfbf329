//! Position book and margin math.
//!
//! Margin to open size `s` at leverage `L` and mark `m` is
//! `s * m / (L * 10^18)`. After every mark update the unrealized PnL and
//! liquidation price are recomputed; the invariant
//! `margin * leverage >= size * mark / 10^18` must hold or the position is
//! handed to the liquidation engine.

use alloy_primitives::U256;
use dashmap::DashMap;

use crate::error::CoreError;
use crate::models::position::SignedAmount;
use crate::models::{Position, PositionSide};
use crate::precision::{self, Amount, BASE};

/// `size * mark / (leverage * 10^18)`.
pub fn margin_required(size: Amount, mark: Amount, leverage: u32) -> Result<Amount, CoreError> {
    if leverage == 0 {
        return Err(CoreError::Validation("leverage must be at least 1".into()));
    }
    let divisor = BASE
        .checked_mul(U256::from(leverage))
        .ok_or(CoreError::Fatal("leverage divisor overflow".into()))?;
    Ok(Amount(precision::mul_div(size.0, mark.0, divisor)?))
}

/// Maintenance margin: `maintenance_bps` of current notional.
pub fn maintenance_margin(
    size: Amount,
    mark: Amount,
    maintenance_bps: u32,
) -> Result<Amount, CoreError> {
    let notional = precision::quote_quantity(mark, size)?;
    Ok(precision::fee(notional, maintenance_bps)?)
}

/// Unrealized PnL of a position at `mark`.
pub fn unrealized_pnl(
    side: PositionSide,
    size: Amount,
    entry: Amount,
    mark: Amount,
) -> Result<SignedAmount, CoreError> {
    let (gain, diff) = match side {
        PositionSide::Long => (mark >= entry, if mark >= entry { mark - entry } else { entry - mark }),
        PositionSide::Short => (entry >= mark, if entry >= mark { entry - mark } else { mark - entry }),
    };
    let magnitude = precision::quote_quantity(diff, size)?;
    Ok(if gain {
        SignedAmount::positive(magnitude)
    } else {
        SignedAmount::negative(magnitude)
    })
}

/// Price at which equity falls to the maintenance margin.
///
/// Long: `entry - (margin - maintenance) * 10^18 / size`;
/// short mirrors upward. A position already below maintenance liquidates at
/// the current entry.
pub fn liquidation_price(
    side: PositionSide,
    size: Amount,
    entry: Amount,
    margin: Amount,
    maintenance: Amount,
) -> Result<Amount, CoreError> {
    if size.is_zero() {
        return Ok(Amount::ZERO);
    }
    let buffer = match margin.checked_sub(maintenance) {
        Some(b) => b,
        None => return Ok(entry),
    };
    let offset = Amount(precision::mul_div(buffer.0, BASE, size.0)?);
    Ok(match side {
        PositionSide::Long => entry.saturating_sub(offset),
        PositionSide::Short => entry.saturating_add(offset),
    })
}

/// Whether `margin + unrealized_pnl <= maintenance`.
pub fn breaches_maintenance(
    margin: Amount,
    pnl: &SignedAmount,
    maintenance: Amount,
) -> bool {
    if pnl.is_negative() {
        margin.saturating_sub(pnl.value) <= maintenance
    } else {
        margin.saturating_add(pnl.value) <= maintenance
    }
}

/// In-memory position registry, keyed by `(user, contract)`.
///
/// Updates run in short critical sections behind the map's entry guards;
/// storage write-back happens outside them.
#[derive(Default)]
pub struct PositionBook {
    positions: DashMap<(String, String), Position>,
    maintenance_bps: u32,
}

impl PositionBook {
    pub fn new(maintenance_bps: u32) -> Self {
        PositionBook {
            positions: DashMap::new(),
            maintenance_bps,
        }
    }

    pub fn maintenance_bps(&self) -> u32 {
        self.maintenance_bps
    }

    pub fn get(&self, user_id: &str, contract: &str) -> Option<Position> {
        self.positions
            .get(&(user_id.to_string(), contract.to_string()))
            .map(|p| p.clone())
    }

    pub fn user_positions(&self, user_id: &str) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|kv| kv.key().0 == user_id)
            .map(|kv| kv.value().clone())
            .collect()
    }

    pub fn contract_positions(&self, contract: &str) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|kv| kv.key().1 == contract)
            .map(|kv| kv.value().clone())
            .collect()
    }

    pub fn restore(&self, position: Position) {
        self.positions.insert(
            (position.user_id.clone(), position.contract.clone()),
            position,
        );
    }

    /// Apply a perpetual fill: open, increase, reduce, flip or close the
    /// user's position. Returns the updated position and the margin freed
    /// back to the ledger (for reductions).
    #[allow(clippy::too_many_arguments)]
    pub fn apply_fill(
        &self,
        user_id: &str,
        contract: &str,
        fill_side: PositionSide,
        quantity: Amount,
        price: Amount,
        leverage: u32,
        margin_in: Amount,
        now: i64,
    ) -> Result<(Position, SignedAmount), CoreError> {
        let key = (user_id.to_string(), contract.to_string());
        let mut entry = self.positions.entry(key.clone()).or_insert_with(|| {
            Position::new(user_id, contract, fill_side, Amount::ZERO, price, leverage, Amount::ZERO, now)
        });
        let position = entry.value_mut();
        let mut ledger_delta = SignedAmount::ZERO;

        if position.size.is_zero() || position.side == fill_side {
            // Open or increase: volume-weighted entry, margin accumulates.
            let old_notional = precision::quote_quantity(position.entry_price, position.size)?;
            let add_notional = precision::quote_quantity(price, quantity)?;
            let new_size = position.size.saturating_add(quantity);
            position.side = fill_side;
            position.entry_price = Amount(precision::mul_div(
                old_notional.saturating_add(add_notional).0,
                BASE,
                new_size.0,
            )?);
            position.size = new_size;
            position.margin = position.margin.saturating_add(margin_in);
            position.leverage = leverage;
        } else {
            // Reduce (or close) against the opposite side.
            let reduce = quantity.min(position.size);
            let realized = unrealized_pnl(position.side, reduce, position.entry_price, price)?;
            // Margin backing the reduced size is freed pro-rata.
            let freed = Amount(precision::mul_div(position.margin.0, reduce.0, position.size.0)?);
            position.size -= reduce;
            position.margin = position.margin.saturating_sub(freed);

            let credit = if realized.is_negative() {
                SignedAmount::positive(freed.saturating_sub(realized.value))
            } else {
                SignedAmount::positive(freed.saturating_add(realized.value))
            };
            ledger_delta = credit;

            if position.size.is_zero() {
                position.entry_price = price;
                position.margin = Amount::ZERO;
            }

            // A fill larger than the open size flips the remainder into a
            // fresh position on the other side.
            let flip = quantity.saturating_sub(reduce);
            if !flip.is_zero() {
                position.side = fill_side;
                position.size = flip;
                position.entry_price = price;
                position.margin = margin_in;
                position.leverage = leverage;
            }
        }

        self.refresh_marks(position, price, now)?;
        let snapshot = position.clone();
        drop(entry);

        // Fully closed positions leave the registry.
        if !snapshot.is_open() {
            self.positions.remove(&key);
        }
        Ok((snapshot, ledger_delta))
    }

    /// Recompute mark-dependent fields for every position on `contract`.
    pub fn update_mark(&self, contract: &str, mark: Amount, now: i64) -> Result<Vec<Position>, CoreError> {
        let mut updated = Vec::new();
        for mut kv in self.positions.iter_mut() {
            if kv.key().1 != contract || !kv.value().is_open() {
                continue;
            }
            let position = kv.value_mut();
            self.refresh_marks(position, mark, now)?;
            updated.push(position.clone());
        }
        Ok(updated)
    }

    fn refresh_marks(&self, position: &mut Position, mark: Amount, now: i64) -> Result<(), CoreError> {
        position.mark_price = mark;
        position.unrealized_pnl = unrealized_pnl(
            position.side,
            position.size,
            position.entry_price,
            mark,
        )?;
        let maintenance = maintenance_margin(position.size, mark, self.maintenance_bps)?;
        position.liquidation_price = liquidation_price(
            position.side,
            position.size,
            position.entry_price,
            position.margin,
            maintenance,
        )?;
        position.updated_at = now;
        Ok(())
    }

    pub fn remove(&self, user_id: &str, contract: &str) -> Option<Position> {
        self.positions
            .remove(&(user_id.to_string(), contract.to_string()))
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::from_decimal_str(s).unwrap()
    }

    #[test]
    fn margin_requirement_formula() {
        // size=10, mark=1.50, leverage=10 -> 10 * 1.5 / 10 = 1.5
        let m = margin_required(amt("10"), amt("1.50"), 10).unwrap();
        assert_eq!(m, amt("1.5"));
    }

    #[test]
    fn pnl_signs_per_side() {
        let long_up = unrealized_pnl(PositionSide::Long, amt("10"), amt("1.00"), amt("1.20")).unwrap();
        assert!(!long_up.is_negative());
        assert_eq!(long_up.value, amt("2"));

        let long_down = unrealized_pnl(PositionSide::Long, amt("10"), amt("1.00"), amt("0.90")).unwrap();
        assert!(long_down.is_negative());
        assert_eq!(long_down.value, amt("1"));

        let short_down = unrealized_pnl(PositionSide::Short, amt("10"), amt("1.00"), amt("0.90")).unwrap();
        assert!(!short_down.is_negative());
    }

    #[test]
    fn liquidation_price_brackets_entry() {
        let maintenance = amt("0.1");
        let long = liquidation_price(PositionSide::Long, amt("10"), amt("1.50"), amt("1.5"), maintenance).unwrap();
        assert!(long < amt("1.50"));
        let short = liquidation_price(PositionSide::Short, amt("10"), amt("1.50"), amt("1.5"), maintenance).unwrap();
        assert!(short > amt("1.50"));
    }

    #[test]
    fn maintenance_breach_detection() {
        // margin 1.5, pnl -1.3, maintenance 0.3 -> equity 0.2 <= 0.3
        assert!(breaches_maintenance(
            amt("1.5"),
            &SignedAmount::negative(amt("1.3")),
            amt("0.3")
        ));
        assert!(!breaches_maintenance(
            amt("1.5"),
            &SignedAmount::positive(amt("0.1")),
            amt("0.3")
        ));
    }

    #[test]
    fn increase_volume_weights_entry() {
        let book = PositionBook::new(50);
        book.apply_fill("alice", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        let (p, _) = book
            .apply_fill("alice", "BTC/USDT", PositionSide::Long, amt("10"), amt("2.00"), 10, amt("2"), 2)
            .unwrap();
        assert_eq!(p.size, amt("20"));
        assert_eq!(p.entry_price, amt("1.50"));
        assert_eq!(p.margin, amt("3"));
    }

    #[test]
    fn reduce_frees_margin_and_realizes_pnl() {
        let book = PositionBook::new(50);
        book.apply_fill("alice", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        // Close half at 1.20: realized +1, freed margin 0.5.
        let (p, credit) = book
            .apply_fill("alice", "BTC/USDT", PositionSide::Short, amt("5"), amt("1.20"), 10, Amount::ZERO, 2)
            .unwrap();
        assert_eq!(p.size, amt("5"));
        assert_eq!(p.margin, amt("0.5"));
        assert!(!credit.is_negative());
        assert_eq!(credit.value, amt("1.5"));
    }

    #[test]
    fn oversized_reduce_flips_side() {
        let book = PositionBook::new(50);
        book.apply_fill("alice", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 5, amt("2"), 1)
            .unwrap();
        let (p, _) = book
            .apply_fill("alice", "BTC/USDT", PositionSide::Short, amt("15"), amt("1.00"), 5, amt("1"), 2)
            .unwrap();
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.size, amt("5"));
        assert_eq!(p.margin, amt("1"));
    }

    #[test]
    fn mark_update_refreshes_all_contract_positions() {
        let book = PositionBook::new(50);
        book.apply_fill("alice", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        book.apply_fill("bob", "BTC/USDT", PositionSide::Short, amt("4"), amt("1.00"), 10, amt("0.4"), 1)
            .unwrap();

        let updated = book.update_mark("BTC/USDT", amt("1.10"), 5).unwrap();
        assert_eq!(updated.len(), 2);
        for p in updated {
            assert_eq!(p.mark_price, amt("1.10"));
            assert_eq!(p.updated_at, 5);
        }
    }
}
