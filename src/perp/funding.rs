//! Funding accrual.
//!
//! At each funding interval a signed rate, clamped to ±1%, is applied to
//! every open position on a contract: `size * rate * mark / 10^36` in
//! collateral units. Longs pay positive rates and shorts receive them, and
//! vice versa for negative rates.

use alloy_primitives::U256;

use crate::error::CoreError;
use crate::models::position::SignedAmount;
use crate::models::{Position, PositionSide};
use crate::precision::{self, Amount, BPS_DENOM};

use super::position::PositionBook;

/// Funding rate derived from the premium of the last trade over the mark:
/// `(last - mark) / mark`, in basis points, clamped to ±`clamp_bps`.
pub fn premium_rate_bps(last: Amount, mark: Amount, clamp_bps: u32) -> Result<i32, CoreError> {
    if mark.is_zero() {
        return Ok(0);
    }
    let (positive, diff) = if last >= mark {
        (true, last - mark)
    } else {
        (false, mark - last)
    };
    let bps = precision::mul_div(diff.0, U256::from(BPS_DENOM), mark.0)?;
    let bps: u32 = if bps > U256::from(u32::MAX) {
        u32::MAX
    } else {
        bps.to::<u64>() as u32
    };
    let clamped = bps.min(clamp_bps) as i32;
    Ok(if positive { clamped } else { -clamped })
}

/// What one funding tick did to one position.
#[derive(Debug, Clone)]
pub struct FundingOutcome {
    pub position: Position,
    /// Payment applied to this position (negative = received).
    pub payment: SignedAmount,
    pub rate_bps: i32,
}

pub struct FundingEngine {
    clamp_bps: u32,
}

impl FundingEngine {
    pub fn new(clamp_bps: u32) -> Self {
        FundingEngine { clamp_bps }
    }

    /// Apply one funding tick across all open positions on `contract`.
    pub fn apply(
        &self,
        book: &PositionBook,
        contract: &str,
        rate_bps: i32,
        mark: Amount,
        now: i64,
    ) -> Result<Vec<FundingOutcome>, CoreError> {
        let rate_bps = rate_bps.clamp(-(self.clamp_bps as i32), self.clamp_bps as i32);
        if rate_bps == 0 {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::new();
        for position in book.contract_positions(contract) {
            if !position.is_open() {
                continue;
            }
            let notional = precision::quote_quantity(mark, position.size)?;
            let payment = precision::fee(notional, rate_bps.unsigned_abs())?;

            // Positive rate: longs pay, shorts receive. Negative: reversed.
            let pays = matches!(
                (position.side, rate_bps > 0),
                (PositionSide::Long, true) | (PositionSide::Short, false)
            );

            let updated = self.settle_payment(book, &position, payment, pays, rate_bps, now)?;
            outcomes.push(updated);
        }
        Ok(outcomes)
    }

    fn settle_payment(
        &self,
        book: &PositionBook,
        position: &Position,
        payment: Amount,
        pays: bool,
        rate_bps: i32,
        now: i64,
    ) -> Result<FundingOutcome, CoreError> {
        let mut updated = position.clone();
        if pays {
            updated.margin = updated.margin.saturating_sub(payment);
        } else {
            updated.margin = updated.margin.saturating_add(payment);
        }

        // Accumulate the running net payment with its sign.
        let prior = updated.funding_payment;
        updated.funding_payment = combine(prior, payment, pays);
        updated.last_funding_time = now;
        updated.updated_at = now;
        book.restore(updated.clone());

        Ok(FundingOutcome {
            position: updated,
            payment: if pays {
                SignedAmount::positive(payment)
            } else {
                SignedAmount::negative(payment)
            },
            rate_bps,
        })
    }
}

/// Signed accumulation: paid amounts count positive, received negative.
fn combine(prior: SignedAmount, payment: Amount, pays: bool) -> SignedAmount {
    match (prior.is_negative(), pays) {
        (false, true) => SignedAmount::positive(prior.value.saturating_add(payment)),
        (true, false) => SignedAmount::negative(prior.value.saturating_add(payment)),
        (false, false) => {
            if prior.value >= payment {
                SignedAmount::positive(prior.value - payment)
            } else {
                SignedAmount::negative(payment - prior.value)
            }
        }
        (true, true) => {
            if prior.value >= payment {
                SignedAmount::negative(prior.value - payment)
            } else {
                SignedAmount::positive(payment - prior.value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::from_decimal_str(s).unwrap()
    }

    #[test]
    fn premium_rate_is_clamped() {
        // last 2.0 vs mark 1.0 -> +100% -> clamped to 100 bps.
        assert_eq!(premium_rate_bps(amt("2"), amt("1"), 100).unwrap(), 100);
        assert_eq!(premium_rate_bps(amt("0.5"), amt("1"), 100).unwrap(), -100);
        // last 1.001 vs mark 1.0 -> 10 bps.
        assert_eq!(premium_rate_bps(amt("1.001"), amt("1"), 100).unwrap(), 10);
        assert_eq!(premium_rate_bps(amt("1"), Amount::ZERO, 100).unwrap(), 0);
    }

    #[test]
    fn longs_pay_positive_rates() {
        let book = PositionBook::new(50);
        book.apply_fill("long", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        book.apply_fill("short", "BTC/USDT", PositionSide::Short, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();

        let engine = FundingEngine::new(100);
        // 10 bps on notional 10 = 0.01.
        let outcomes = engine.apply(&book, "BTC/USDT", 10, amt("1.00"), 9).unwrap();
        assert_eq!(outcomes.len(), 2);

        let long = outcomes.iter().find(|o| o.position.user_id == "long").unwrap();
        assert!(!long.payment.is_negative());
        assert_eq!(long.position.margin, amt("0.99"));

        let short = outcomes.iter().find(|o| o.position.user_id == "short").unwrap();
        assert!(short.payment.is_negative());
        assert_eq!(short.position.margin, amt("1.01"));
    }

    #[test]
    fn rate_beyond_clamp_is_bounded() {
        let book = PositionBook::new(50);
        book.apply_fill("long", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        let engine = FundingEngine::new(100);
        let outcomes = engine.apply(&book, "BTC/USDT", 500, amt("1.00"), 9).unwrap();
        assert_eq!(outcomes[0].rate_bps, 100);
    }

    #[test]
    fn zero_rate_is_a_no_op() {
        let book = PositionBook::new(50);
        book.apply_fill("long", "BTC/USDT", PositionSide::Long, amt("10"), amt("1.00"), 10, amt("1"), 1)
            .unwrap();
        let engine = FundingEngine::new(100);
        assert!(engine.apply(&book, "BTC/USDT", 0, amt("1.00"), 9).unwrap().is_empty());
    }

    #[test]
    fn signed_accumulation_crosses_zero() {
        let paid = combine(SignedAmount::ZERO, amt("3"), true);
        assert!(!paid.is_negative());
        let net = combine(paid, amt("5"), false);
        assert!(net.is_negative());
        assert_eq!(net.value, amt("2"));
    }
}
