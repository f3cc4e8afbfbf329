//! Perpetual & margin bookkeeping.
//!
//! Positions, leverage and margin requirements, funding accrual, and the
//! liquidation path with its auto-deleverage queue. All monetary math is
//! integer fixed-point through the precision module.

pub mod funding;
pub mod liquidation;
pub mod position;

pub use funding::{premium_rate_bps, FundingEngine, FundingOutcome};
pub use liquidation::{AdlAbsorption, AdlQueue, LiquidationEngine, LiquidationOutcome};
pub use position::{margin_required, PositionBook};

use dashmap::DashMap;

use crate::error::CoreError;
use crate::models::position::SignedAmount;
use crate::precision::Amount;

/// Per-user collateral ledger: free balance plus margin reserved against
/// open perpetual orders and positions.
#[derive(Debug, Default, Clone)]
pub struct MarginAccount {
    pub balance: Amount,
    pub reserved: Amount,
}

impl MarginAccount {
    pub fn free(&self) -> Amount {
        self.balance.saturating_sub(self.reserved)
    }
}

#[derive(Default)]
pub struct MarginLedger {
    accounts: DashMap<String, MarginAccount>,
}

impl MarginLedger {
    pub fn new() -> Self {
        MarginLedger {
            accounts: DashMap::new(),
        }
    }

    pub fn deposit(&self, user_id: &str, amount: Amount) {
        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        account.balance = account.balance.saturating_add(amount);
    }

    /// Withdrawals are bounded by the free balance.
    pub fn withdraw(&self, user_id: &str, amount: Amount) -> Result<(), CoreError> {
        let mut account = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| CoreError::Unauthorized(format!("no margin account for {user_id}")))?;
        if account.free() < amount {
            return Err(CoreError::Unauthorized(format!(
                "withdraw {amount} exceeds free margin {}",
                account.free()
            )));
        }
        account.balance -= amount;
        Ok(())
    }

    /// Reserve margin for a new perpetual order; admission fails when free
    /// margin does not cover the requirement.
    pub fn reserve(&self, user_id: &str, amount: Amount) -> Result<(), CoreError> {
        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        if account.free() < amount {
            return Err(CoreError::Risk(format!(
                "insufficient margin: need {amount}, free {}",
                account.free()
            )));
        }
        account.reserved = account.reserved.saturating_add(amount);
        Ok(())
    }

    pub fn release(&self, user_id: &str, amount: Amount) {
        if let Some(mut account) = self.accounts.get_mut(user_id) {
            account.reserved = account.reserved.saturating_sub(amount);
        }
    }

    /// Margin reserved for an order becomes margin consumed by a position:
    /// it leaves both the reservation and the balance.
    pub fn consume(&self, user_id: &str, amount: Amount) {
        if let Some(mut account) = self.accounts.get_mut(user_id) {
            account.reserved = account.reserved.saturating_sub(amount);
            account.balance = account.balance.saturating_sub(amount);
        }
    }

    /// Credit realized PnL (or margin returned on close).
    pub fn settle(&self, user_id: &str, delta: SignedAmount) {
        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        if delta.is_negative() {
            account.balance = account.balance.saturating_sub(delta.value);
        } else {
            account.balance = account.balance.saturating_add(delta.value);
        }
    }

    pub fn free(&self, user_id: &str) -> Amount {
        self.accounts
            .get(user_id)
            .map(|a| a.free())
            .unwrap_or(Amount::ZERO)
    }

    pub fn balance(&self, user_id: &str) -> Amount {
        self.accounts
            .get(user_id)
            .map(|a| a.balance)
            .unwrap_or(Amount::ZERO)
    }
}
