use serde::{Deserialize, Serialize};
use std::fmt;

use crate::precision::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "position_side", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Signed PnL carried as magnitude + sign; monetary values stay unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAmount {
    pub value: Amount,
    pub negative: bool,
}

impl SignedAmount {
    pub const ZERO: SignedAmount = SignedAmount {
        value: Amount::ZERO,
        negative: false,
    };

    pub fn positive(value: Amount) -> Self {
        SignedAmount {
            value,
            negative: false,
        }
    }

    pub fn negative(value: Amount) -> Self {
        SignedAmount {
            value,
            negative: !value.is_zero(),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.negative && !self.value.is_zero()
    }
}

impl fmt::Display for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            write!(f, "-{}", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// A perpetual position for one user on one contract.
///
/// Invariant: `margin * leverage >= size * mark_price / 10^18` or the
/// position is liquidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    /// Contract symbol (`BASE/QUOTE` of the perpetual pair).
    pub contract: String,
    pub side: PositionSide,
    /// Base-unit contract size.
    pub size: Amount,
    pub entry_price: Amount,
    pub mark_price: Amount,
    pub leverage: u32,
    /// Collateral backing the position.
    pub margin: Amount,
    pub unrealized_pnl: SignedAmount,
    pub liquidation_price: Amount,
    /// Net funding paid (negative = received).
    pub funding_payment: SignedAmount,
    pub last_funding_time: i64,
    pub updated_at: i64,
}

impl Position {
    pub fn new(
        user_id: &str,
        contract: &str,
        side: PositionSide,
        size: Amount,
        entry_price: Amount,
        leverage: u32,
        margin: Amount,
        now: i64,
    ) -> Self {
        Position {
            user_id: user_id.to_string(),
            contract: contract.to_string(),
            side,
            size,
            entry_price,
            mark_price: entry_price,
            leverage,
            margin,
            unrealized_pnl: SignedAmount::ZERO,
            liquidation_price: Amount::ZERO,
            funding_payment: SignedAmount::ZERO,
            last_funding_time: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.size.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_amount_zero_is_not_negative() {
        let z = SignedAmount::negative(Amount::ZERO);
        assert!(!z.is_negative());
        assert_eq!(z.to_string(), "0");
        let n = SignedAmount::negative(Amount::from_u64(5));
        assert!(n.is_negative());
        assert_eq!(n.to_string(), "-5");
    }

    #[test]
    fn position_side_opposite() {
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }
}
