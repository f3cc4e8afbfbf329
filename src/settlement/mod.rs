//! Settlement surface.
//!
//! The core emits settlement intents (ABI-encoded calls plus idempotency
//! keys) into a durable outbox; a [`ChainSubmitter`] supplied by the
//! embedder carries them on-chain. Failure never rolls back in-core fills:
//! the trade stays flagged `on_chain: pending` and an operator alert is
//! raised after retries are exhausted.

pub mod contract;
pub mod planner;

pub use planner::BatchPlanner;

use futures::future::BoxFuture;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::models::order::now_millis;
use crate::storage::warm::WarmStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Deposit,
    Withdraw,
    SettleTrade,
    BatchSettle,
    FeeDistribution,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Deposit => "deposit",
            IntentKind::Withdraw => "withdraw",
            IntentKind::SettleTrade => "settle_trade",
            IntentKind::BatchSettle => "batch_settle",
            IntentKind::FeeDistribution => "fee_distribution",
        }
    }
}

/// One call to the counterparty contract, keyed for idempotent replay.
#[derive(Debug, Clone)]
pub struct SettlementIntent {
    /// Idempotency key: trade id, batch id, or transfer id.
    pub id: String,
    pub kind: IntentKind,
    pub calldata: Vec<u8>,
    /// Trade ids covered by this intent, for on-chain status flips.
    pub trade_ids: Vec<Uuid>,
    pub attempts: u32,
    pub created_at: i64,
}

/// A genuine chain reference returned by the embedder's submitter.
pub type TxRef = String;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submission timed out")]
    Timeout,
    #[error("contract rejected the call: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Implemented by the chain-side layer (signer + RPC). The core never
/// fabricates transaction hashes; only a submitter returns one.
pub trait ChainSubmitter: Send + Sync {
    fn submit<'a>(
        &'a self,
        intent: &'a SettlementIntent,
    ) -> BoxFuture<'a, Result<TxRef, SubmitError>>;
}

/// Durable intent queue with bounded-backoff retries and a per-attempt
/// wall-clock deadline.
pub struct SettlementOutbox {
    tx: mpsc::Sender<SettlementIntent>,
}

const OUTBOX_DEPTH: usize = 4096;
const RETRY_BASE_MS: u64 = 500;

impl SettlementOutbox {
    pub fn start(
        config: SettlementConfig,
        submitter: Arc<dyn ChainSubmitter>,
        warm: Option<Arc<WarmStore>>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        let outbox = Arc::new(SettlementOutbox { tx });
        tokio::spawn(run_outbox(config, submitter, warm, rx));
        outbox
    }

    /// Enqueue an intent. Persisting to the warm outbox table happens in
    /// the worker so the matching path never waits on storage.
    pub fn enqueue(&self, intent: SettlementIntent) {
        if self.tx.try_send(intent).is_err() {
            metrics::counter!("dex_settlement_outbox_full_total").increment(1);
            tracing::error!("settlement outbox is full; intent dropped, operator attention required");
        }
    }

    /// Re-enqueue pending intents from the warm outbox after a restart.
    pub async fn recover(&self, warm: &WarmStore, limit: usize) -> usize {
        let pending = match warm.fetch_pending_intents(limit).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("settlement recovery failed: {e}");
                return 0;
            }
        };
        let count = pending.len();
        for (id, kind, calldata, attempts) in pending {
            let kind = match kind.as_str() {
                "deposit" => IntentKind::Deposit,
                "withdraw" => IntentKind::Withdraw,
                "settle_trade" => IntentKind::SettleTrade,
                "batch_settle" => IntentKind::BatchSettle,
                _ => IntentKind::FeeDistribution,
            };
            self.enqueue(SettlementIntent {
                id,
                kind,
                calldata,
                trade_ids: Vec::new(),
                attempts: attempts.max(0) as u32,
                created_at: now_millis(),
            });
        }
        count
    }
}

async fn run_outbox(
    config: SettlementConfig,
    submitter: Arc<dyn ChainSubmitter>,
    warm: Option<Arc<WarmStore>>,
    mut rx: mpsc::Receiver<SettlementIntent>,
) {
    tracing::info!("settlement outbox worker started");
    while let Some(mut intent) = rx.recv().await {
        if let Some(warm) = &warm {
            // Duplicate idempotency keys are conflicts: the first insert
            // wins and replays are skipped.
            match warm
                .insert_settlement_intent(&intent.id, intent.kind.as_str(), &intent.calldata, now_millis())
                .await
            {
                Ok(true) => {}
                Ok(false) if intent.attempts == 0 => {
                    tracing::warn!(intent = %intent.id, "duplicate settlement intent skipped");
                    continue;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("settlement intent persist failed: {e}"),
            }
        }

        submit_with_retry(&config, submitter.as_ref(), warm.as_deref(), &mut intent).await;
    }
    tracing::info!("settlement outbox worker stopped");
}

async fn submit_with_retry(
    config: &SettlementConfig,
    submitter: &dyn ChainSubmitter,
    warm: Option<&WarmStore>,
    intent: &mut SettlementIntent,
) {
    let deadline = Duration::from_secs(config.submit_deadline_secs);

    while intent.attempts < config.max_attempts {
        intent.attempts += 1;
        let attempt = intent.attempts;

        let result = match tokio::time::timeout(deadline, submitter.submit(intent)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout),
        };

        match result {
            Ok(tx_ref) => {
                metrics::counter!("dex_settlements_confirmed_total").increment(1);
                tracing::info!(intent = %intent.id, tx = %tx_ref, "settlement confirmed");
                if let Some(warm) = warm {
                    let _ = warm
                        .update_settlement_intent(&intent.id, "confirmed", attempt, Some(&tx_ref), now_millis())
                        .await;
                    for trade_id in &intent.trade_ids {
                        let _ = warm.mark_trade_on_chain(trade_id, "confirmed", Some(&tx_ref)).await;
                    }
                }
                return;
            }
            Err(e) if attempt < config.max_attempts => {
                let backoff = RETRY_BASE_MS << (attempt - 1).min(6);
                let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
                tracing::warn!(
                    intent = %intent.id,
                    attempt,
                    "settlement attempt failed, retrying in {}ms: {e}",
                    backoff + jitter
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(e) => {
                // In-core fills stand; the trade stays pending on-chain and
                // the operator is alerted.
                metrics::counter!("dex_settlements_failed_total").increment(1);
                tracing::error!(
                    intent = %intent.id,
                    kind = intent.kind.as_str(),
                    "settlement exhausted {} attempts, operator attention required: {e}",
                    config.max_attempts
                );
                if let Some(warm) = warm {
                    let _ = warm
                        .update_settlement_intent(&intent.id, "failed", attempt, None, now_millis())
                        .await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySubmitter {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl ChainSubmitter for FlakySubmitter {
        fn submit<'a>(
            &'a self,
            intent: &'a SettlementIntent,
        ) -> BoxFuture<'a, Result<TxRef, SubmitError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.fail_first;
            let id = intent.id.clone();
            Box::pin(async move {
                if fail {
                    Err(SubmitError::Transport("rpc down".into()))
                } else {
                    Ok(format!("0xtx-{id}"))
                }
            })
        }
    }

    fn intent(id: &str) -> SettlementIntent {
        SettlementIntent {
            id: id.into(),
            kind: IntentKind::SettleTrade,
            calldata: vec![1, 2, 3],
            trade_ids: vec![],
            attempts: 0,
            created_at: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let config = crate::config::AppConfig::for_tests(vec!["BTC/USDT".into()]).settlement;
        let submitter = FlakySubmitter {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let mut i = intent("t1");
        submit_with_retry(&config, &submitter, None, &mut i).await;
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(i.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let config = crate::config::AppConfig::for_tests(vec!["BTC/USDT".into()]).settlement;
        let submitter = FlakySubmitter {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let mut i = intent("t2");
        submit_with_retry(&config, &submitter, None, &mut i).await;
        assert_eq!(i.attempts, config.max_attempts);
    }
}
