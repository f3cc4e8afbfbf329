//! Privacy-swap matching variant.
//!
//! Amounts are opaque ciphertexts; comparisons and swap-output computation
//! are delegated to an external MPC operator set. The engine treats those
//! operations as oracle primitives and never reads a plaintext it did not
//! itself encrypt. When no oracle is configured, privacy orders are
//! rejected and regular matching continues untouched.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::Side;
use crate::precision::Amount;

/// An opaque ciphertext handle produced by the MPC operator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

#[derive(Debug, thiserror::Error)]
pub enum MpcError {
    #[error("mpc operator set unavailable")]
    Unavailable,
    #[error("mpc operation failed: {0}")]
    Failed(String),
}

/// Operation set required from the MPC operator nodes.
pub trait MpcOracle: Send + Sync {
    fn encrypt(&self, plaintext: Amount) -> BoxFuture<'_, Result<Ciphertext, MpcError>>;

    /// Only the owner may learn a plaintext.
    fn decrypt_for_owner<'a>(
        &'a self,
        ciphertext: &'a Ciphertext,
        owner_id: &'a str,
    ) -> BoxFuture<'a, Result<Amount, MpcError>>;

    fn add_encrypted<'a>(
        &'a self,
        a: &'a Ciphertext,
        b: &'a Ciphertext,
    ) -> BoxFuture<'a, Result<Ciphertext, MpcError>>;

    fn subtract_encrypted<'a>(
        &'a self,
        a: &'a Ciphertext,
        b: &'a Ciphertext,
    ) -> BoxFuture<'a, Result<Ciphertext, MpcError>>;

    fn compare_encrypted<'a>(
        &'a self,
        a: &'a Ciphertext,
        b: &'a Ciphertext,
        op: CompareOp,
    ) -> BoxFuture<'a, Result<bool, MpcError>>;

    /// Output amount of a swap of `amount_in`, as a fresh ciphertext.
    fn compute_swap_output<'a>(
        &'a self,
        amount_in: &'a Ciphertext,
        pair: &'a str,
        side: Side,
    ) -> BoxFuture<'a, Result<Ciphertext, MpcError>>;
}

/// A resting privacy-swap order: all amounts opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateSwapOrder {
    pub id: Uuid,
    pub user_id: String,
    pub pair: String,
    pub side: Side,
    pub encrypted_amount: Ciphertext,
    /// Minimum acceptable output, encrypted by the owner.
    pub encrypted_min_output: Ciphertext,
    pub timestamp: i64,
}

/// A matched privacy swap: both legs keep their amounts opaque.
#[derive(Debug, Clone, Serialize)]
pub struct PrivateSwapExecution {
    pub id: Uuid,
    pub pair: String,
    pub taker_order_id: Uuid,
    pub maker_order_id: Uuid,
    pub taker_output: Ciphertext,
    pub maker_output: Ciphertext,
    pub timestamp: i64,
}

/// FIFO matcher over resting privacy orders for one pair set.
///
/// Arrival order stands in for price-time priority: prices are opaque, so
/// acceptability is decided by the oracle against each order's encrypted
/// minimum output.
pub struct PrivacyMatcher {
    oracle: Arc<dyn MpcOracle>,
    resting: Mutex<VecDeque<PrivateSwapOrder>>,
}

impl PrivacyMatcher {
    pub fn new(oracle: Arc<dyn MpcOracle>) -> Self {
        PrivacyMatcher {
            oracle,
            resting: Mutex::new(VecDeque::new()),
        }
    }

    pub fn resting_count(&self) -> usize {
        self.resting.lock().len()
    }

    /// Submit a privacy order: walk resting counter-orders in arrival
    /// order, asking the oracle whether the computed swap outputs satisfy
    /// both encrypted minimums. The first acceptable counter-order matches;
    /// otherwise the order rests.
    pub async fn submit(
        &self,
        order: PrivateSwapOrder,
        now: i64,
    ) -> Result<Option<PrivateSwapExecution>, CoreError> {
        let candidates: Vec<PrivateSwapOrder> = {
            let resting = self.resting.lock();
            resting
                .iter()
                .filter(|r| r.pair == order.pair && r.side == order.side.opposite())
                .cloned()
                .collect()
        };

        for candidate in candidates {
            let taker_output = self
                .oracle
                .compute_swap_output(&order.encrypted_amount, &order.pair, order.side)
                .await
                .map_err(map_mpc)?;
            let maker_output = self
                .oracle
                .compute_swap_output(&candidate.encrypted_amount, &candidate.pair, candidate.side)
                .await
                .map_err(map_mpc)?;

            let taker_ok = self
                .oracle
                .compare_encrypted(&taker_output, &order.encrypted_min_output, CompareOp::Ge)
                .await
                .map_err(map_mpc)?;
            let maker_ok = self
                .oracle
                .compare_encrypted(&maker_output, &candidate.encrypted_min_output, CompareOp::Ge)
                .await
                .map_err(map_mpc)?;

            if taker_ok && maker_ok {
                self.resting.lock().retain(|r| r.id != candidate.id);
                metrics::counter!("dex_private_swaps_total").increment(1);
                return Ok(Some(PrivateSwapExecution {
                    id: Uuid::new_v4(),
                    pair: order.pair.clone(),
                    taker_order_id: order.id,
                    maker_order_id: candidate.id,
                    taker_output,
                    maker_output,
                    timestamp: now,
                }));
            }
        }

        self.resting.lock().push_back(order);
        Ok(None)
    }

    pub fn cancel(&self, order_id: &Uuid, user_id: &str) -> Result<(), CoreError> {
        let mut resting = self.resting.lock();
        let Some(pos) = resting.iter().position(|r| &r.id == order_id) else {
            return Err(CoreError::Conflict(format!("order {order_id} is not open")));
        };
        if resting[pos].user_id != user_id {
            return Err(CoreError::Unauthorized(
                "cannot cancel another user's order".into(),
            ));
        }
        resting.remove(pos);
        Ok(())
    }
}

fn map_mpc(e: MpcError) -> CoreError {
    match e {
        MpcError::Unavailable => CoreError::Transient("mpc operator set unavailable".into()),
        MpcError::Failed(m) => CoreError::Transient(format!("mpc operation failed: {m}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::Amount;
    use std::collections::HashMap;

    /// Transparent test oracle: "ciphertexts" are tagged plaintext handles
    /// held in a table only the oracle can read.
    struct TableOracle {
        table: Mutex<HashMap<String, Amount>>,
        counter: Mutex<u64>,
    }

    impl TableOracle {
        fn new() -> Self {
            TableOracle {
                table: Mutex::new(HashMap::new()),
                counter: Mutex::new(0),
            }
        }

        fn store(&self, v: Amount) -> Ciphertext {
            let mut n = self.counter.lock();
            *n += 1;
            let handle = format!("ct-{}", *n);
            self.table.lock().insert(handle.clone(), v);
            Ciphertext(handle)
        }

        fn load(&self, ct: &Ciphertext) -> Amount {
            self.table.lock().get(&ct.0).copied().unwrap_or(Amount::ZERO)
        }
    }

    impl MpcOracle for TableOracle {
        fn encrypt(&self, plaintext: Amount) -> BoxFuture<'_, Result<Ciphertext, MpcError>> {
            Box::pin(async move { Ok(self.store(plaintext)) })
        }

        fn decrypt_for_owner<'a>(
            &'a self,
            ciphertext: &'a Ciphertext,
            _owner_id: &'a str,
        ) -> BoxFuture<'a, Result<Amount, MpcError>> {
            Box::pin(async move { Ok(self.load(ciphertext)) })
        }

        fn add_encrypted<'a>(
            &'a self,
            a: &'a Ciphertext,
            b: &'a Ciphertext,
        ) -> BoxFuture<'a, Result<Ciphertext, MpcError>> {
            Box::pin(async move { Ok(self.store(self.load(a).saturating_add(self.load(b)))) })
        }

        fn subtract_encrypted<'a>(
            &'a self,
            a: &'a Ciphertext,
            b: &'a Ciphertext,
        ) -> BoxFuture<'a, Result<Ciphertext, MpcError>> {
            Box::pin(async move { Ok(self.store(self.load(a).saturating_sub(self.load(b)))) })
        }

        fn compare_encrypted<'a>(
            &'a self,
            a: &'a Ciphertext,
            b: &'a Ciphertext,
            op: CompareOp,
        ) -> BoxFuture<'a, Result<bool, MpcError>> {
            Box::pin(async move {
                let (a, b) = (self.load(a), self.load(b));
                Ok(match op {
                    CompareOp::Lt => a < b,
                    CompareOp::Le => a <= b,
                    CompareOp::Eq => a == b,
                    CompareOp::Ge => a >= b,
                    CompareOp::Gt => a > b,
                })
            })
        }

        fn compute_swap_output<'a>(
            &'a self,
            amount_in: &'a Ciphertext,
            _pair: &'a str,
            _side: Side,
        ) -> BoxFuture<'a, Result<Ciphertext, MpcError>> {
            // 1:1 swap for the test table.
            Box::pin(async move { Ok(self.store(self.load(amount_in))) })
        }
    }

    fn order(oracle: &TableOracle, user: &str, side: Side, amount: u64, min_out: u64) -> PrivateSwapOrder {
        PrivateSwapOrder {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            pair: "XOM/USDT".into(),
            side,
            encrypted_amount: oracle.store(Amount::from_u64(amount)),
            encrypted_min_output: oracle.store(Amount::from_u64(min_out)),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn acceptable_counter_order_matches() {
        let oracle = Arc::new(TableOracle::new());
        let matcher = PrivacyMatcher::new(oracle.clone());

        let resting = order(&oracle, "alice", Side::Sell, 100, 90);
        assert!(matcher.submit(resting.clone(), 1).await.unwrap().is_none());

        let taker = order(&oracle, "bob", Side::Buy, 100, 95);
        let execution = matcher.submit(taker, 2).await.unwrap().expect("match");
        assert_eq!(execution.maker_order_id, resting.id);
        assert_eq!(matcher.resting_count(), 0);

        // Outputs stay opaque; only the oracle can resolve them.
        assert_eq!(oracle.load(&execution.taker_output), Amount::from_u64(100));
    }

    #[tokio::test]
    async fn unacceptable_minimum_rests_instead() {
        let oracle = Arc::new(TableOracle::new());
        let matcher = PrivacyMatcher::new(oracle.clone());

        matcher
            .submit(order(&oracle, "alice", Side::Sell, 100, 150), 1)
            .await
            .unwrap();
        // Maker demands 150 out but the swap yields 100: no match.
        let outcome = matcher
            .submit(order(&oracle, "bob", Side::Buy, 100, 90), 2)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(matcher.resting_count(), 2);
    }

    #[tokio::test]
    async fn cancel_enforces_ownership() {
        let oracle = Arc::new(TableOracle::new());
        let matcher = PrivacyMatcher::new(oracle.clone());
        let o = order(&oracle, "alice", Side::Sell, 100, 90);
        matcher.submit(o.clone(), 1).await.unwrap();

        assert_eq!(
            matcher.cancel(&o.id, "mallory").unwrap_err().code(),
            "UNAUTHORIZED"
        );
        assert!(matcher.cancel(&o.id, "alice").is_ok());
        assert_eq!(matcher.resting_count(), 0);
    }
}
