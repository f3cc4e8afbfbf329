//! Fixed-point monetary arithmetic.
//!
//! All monetary values are non-negative integers in the base unit
//! (1 unit = 10^-18 of a token), held as 256-bit unsigned integers and
//! persisted as decimal strings of up to 78 digits. Every matching, fee
//! and margin computation routes through this module; floating point is
//! only ever used for display formatting outside of it.

use alloy_primitives::{U256, U512};
use bigdecimal::BigDecimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// 10^18, the scale factor between base units and whole tokens.
pub const BASE: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Number of decimal places carried by the base unit.
pub const DECIMALS: u32 = 18;

/// Fee denominator: fees are expressed in basis points.
pub const BPS_DENOM: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrecisionError {
    #[error("invalid decimal string: {0}")]
    InvalidDecimal(String),

    #[error("more than {DECIMALS} fractional digits: {0}")]
    TooManyDecimals(String),

    #[error("value does not fit in 256 bits: {0}")]
    OutOfRange(String),

    #[error("arithmetic overflow")]
    Overflow,

    #[error("division by zero")]
    DivideByZero,
}

/// A non-negative monetary value in base units (10^-18 of a token).
///
/// Prices share the same scale as quantities, so a single type covers both.
/// Serialized as a decimal string, never as a float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);
    pub const MAX: Amount = Amount(U256::MAX);

    /// One whole token (10^18 base units).
    pub const ONE: Amount = Amount(BASE);

    pub fn from_u64(v: u64) -> Self {
        Amount(U256::from(v))
    }

    /// Parse a raw base-unit integer string (up to 78 digits).
    pub fn from_raw_str(s: &str) -> Result<Self, PrecisionError> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PrecisionError::InvalidDecimal(s.to_string()));
        }
        U256::from_str_radix(s, 10)
            .map(Amount)
            .map_err(|_| PrecisionError::OutOfRange(s.to_string()))
    }

    /// Parse a human decimal string ("1.26") into base units.
    pub fn from_decimal_str(s: &str) -> Result<Self, PrecisionError> {
        to_base(s).map(Amount)
    }

    /// Render as a human decimal string, trimming trailing fractional zeros.
    pub fn to_decimal_string(&self) -> String {
        from_base(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    pub fn min(self, rhs: Amount) -> Amount {
        if self.0 <= rhs.0 {
            self
        } else {
            rhs
        }
    }

    pub fn max(self, rhs: Amount) -> Amount {
        if self.0 >= rhs.0 {
            self
        } else {
            rhs
        }
    }

    /// Bridge to the warm tier's `NUMERIC(78,0)` columns.
    pub fn to_numeric(&self) -> BigDecimal {
        // U256 decimal rendering always parses as a BigDecimal integer.
        BigDecimal::from_str(&self.0.to_string()).unwrap_or_else(|_| BigDecimal::from(0))
    }

    /// Bridge back from a `NUMERIC(78,0)` column value.
    pub fn from_numeric(v: &BigDecimal) -> Result<Self, PrecisionError> {
        let s = v.with_scale(0).to_string();
        Amount::from_raw_str(&s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = PrecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::from_raw_str(s)
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Amount::from_u64(v)
    }
}

// Plain operators are reserved for arithmetic the invariants already bound
// (fill quantities never exceed remaining); everything else goes through the
// checked helpers above.
impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::from_raw_str(&s).map_err(de::Error::custom)
    }
}

/// Convert a human decimal string into base units.
///
/// Accepts an optional fractional part of up to 18 digits. Anything else
/// (sign, exponent, more precision) is rejected rather than silently
/// rounded.
pub fn to_base(s: &str) -> Result<U256, PrecisionError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PrecisionError::InvalidDecimal(s.to_string()));
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(PrecisionError::InvalidDecimal(s.to_string()));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PrecisionError::InvalidDecimal(s.to_string()));
    }
    if frac_part.len() > DECIMALS as usize {
        return Err(PrecisionError::TooManyDecimals(s.to_string()));
    }

    let int_units = if int_part.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(int_part, 10).map_err(|_| PrecisionError::OutOfRange(s.to_string()))?
    };

    let mut frac_units = U256::ZERO;
    if !frac_part.is_empty() {
        // Right-pad the fraction to 18 digits before parsing.
        let mut padded = frac_part.to_string();
        padded.push_str(&"0".repeat(DECIMALS as usize - frac_part.len()));
        frac_units =
            U256::from_str_radix(&padded, 10).map_err(|_| PrecisionError::OutOfRange(s.to_string()))?;
    }

    int_units
        .checked_mul(BASE)
        .and_then(|scaled| scaled.checked_add(frac_units))
        .ok_or_else(|| PrecisionError::OutOfRange(s.to_string()))
}

/// Render a base-unit value as a human decimal string.
///
/// Trailing zeros beyond the significant fractional digits are truncated;
/// whole values render without a fractional part.
pub fn from_base(v: U256) -> String {
    let int_part = v / BASE;
    let frac_part = v % BASE;

    if frac_part.is_zero() {
        return int_part.to_string();
    }

    let mut frac = format!("{:0>18}", frac_part.to_string());
    while frac.ends_with('0') {
        frac.pop();
    }
    format!("{int_part}.{frac}")
}

/// `a * b / divisor` with a full 512-bit intermediate product.
///
/// Errors on a zero divisor or if the quotient does not fit in 256 bits.
pub fn mul_div(a: U256, b: U256, divisor: U256) -> Result<U256, PrecisionError> {
    if divisor.is_zero() {
        return Err(PrecisionError::DivideByZero);
    }
    let wide: U512 = U512::from(a) * U512::from(b);
    let quotient = wide / U512::from(divisor);
    if quotient > U512::from(U256::MAX) {
        return Err(PrecisionError::Overflow);
    }
    Ok(quotient.to::<U256>())
}

/// Amount-typed convenience wrapper around [`mul_div`].
pub fn mul_div_amount(a: Amount, b: Amount, divisor: Amount) -> Result<Amount, PrecisionError> {
    mul_div(a.0, b.0, divisor.0).map(Amount)
}

/// Fee on `amount` at `basis_points` (1 bp = 0.01%).
pub fn fee(amount: Amount, basis_points: u32) -> Result<Amount, PrecisionError> {
    mul_div(
        amount.0,
        U256::from(basis_points),
        U256::from(BPS_DENOM),
    )
    .map(Amount)
}

/// Quote-asset value of `quantity` base units at `price`:
/// `price * quantity / 10^18`.
pub fn quote_quantity(price: Amount, quantity: Amount) -> Result<Amount, PrecisionError> {
    mul_div(price.0, quantity.0, BASE).map(Amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount(to_base(s).unwrap())
    }

    #[test]
    fn base_constant_is_ten_pow_eighteen() {
        assert_eq!(BASE, U256::from(10u64).pow(U256::from(18u64)));
    }

    #[test]
    fn to_base_whole_and_fractional() {
        assert_eq!(to_base("0").unwrap(), U256::ZERO);
        assert_eq!(to_base("1").unwrap(), BASE);
        assert_eq!(
            to_base("1.26").unwrap(),
            U256::from(1_260_000_000_000_000_000u64)
        );
        assert_eq!(to_base("0.000000000000000001").unwrap(), U256::from(1u64));
    }

    #[test]
    fn to_base_rejects_garbage() {
        assert!(to_base("").is_err());
        assert!(to_base(".").is_err());
        assert!(to_base("-1").is_err());
        assert!(to_base("1e18").is_err());
        assert!(to_base("1.0000000000000000001").is_err());
    }

    #[test]
    fn from_base_truncates_trailing_zeros() {
        assert_eq!(from_base(to_base("1.26").unwrap()), "1.26");
        assert_eq!(from_base(to_base("100").unwrap()), "100");
        assert_eq!(from_base(to_base("0.5").unwrap()), "0.5");
        assert_eq!(from_base(U256::from(1u64)), "0.000000000000000001");
    }

    #[test]
    fn round_trip_identity_on_18_decimal_values() {
        for s in ["0", "1", "1.26", "97500.12345678", "0.000000000000000042"] {
            assert_eq!(from_base(to_base(s).unwrap()), s);
        }
    }

    #[test]
    fn mul_div_uses_wide_intermediate() {
        // (MAX / 2) * 2 / 2 overflows a 256-bit product but not the quotient.
        let half = U256::MAX / U256::from(2u64);
        let out = mul_div(half, U256::from(2u64), U256::from(2u64)).unwrap();
        assert_eq!(out, half);
    }

    #[test]
    fn mul_div_overflow_and_zero_divisor() {
        assert_eq!(
            mul_div(U256::MAX, U256::from(2u64), U256::from(1u64)),
            Err(PrecisionError::Overflow)
        );
        assert_eq!(
            mul_div(U256::from(1u64), U256::from(1u64), U256::ZERO),
            Err(PrecisionError::DivideByZero)
        );
    }

    #[test]
    fn fee_in_basis_points() {
        // 5 bps on 10_000 tokens = 5 tokens.
        let amount = amt("10000");
        assert_eq!(fee(amount, 5).unwrap(), amt("5"));
        assert_eq!(fee(amount, 0).unwrap(), Amount::ZERO);
    }

    #[test]
    fn quote_quantity_at_price() {
        // 150 @ 1.26 = 189 quote units.
        assert_eq!(quote_quantity(amt("1.26"), amt("150")).unwrap(), amt("189"));
    }

    #[test]
    fn numeric_bridge_round_trips() {
        let v = amt("123456789.000000000000000001");
        let n = v.to_numeric();
        assert_eq!(Amount::from_numeric(&n).unwrap(), v);
    }

    #[test]
    fn amount_serde_is_decimal_string() {
        let v = Amount::from_u64(42);
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"42\"");
        let back: Amount = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(back, v);
    }
}
