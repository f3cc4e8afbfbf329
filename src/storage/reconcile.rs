//! Hot/warm reconciler.
//!
//! Hot is authoritative for matching decisions; warm lags behind the
//! asynchronous write-back. This task periodically re-sends the latest hot
//! state for any key whose write-back was flagged as exhausted, and for any
//! sampled key whose warm fill-state disagrees with hot.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CoreError;
use crate::storage::hot::HotStore;
use crate::storage::warm::WarmStore;

const RECONCILE_INTERVAL_SECS: u64 = 30;

pub struct Reconciler {
    hot: Arc<HotStore>,
    warm: Arc<WarmStore>,
}

impl Reconciler {
    pub fn new(hot: Arc<HotStore>, warm: Arc<WarmStore>) -> Self {
        Reconciler { hot, warm }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(resent) => tracing::info!(resent, "reconciler re-sent hot state"),
                    Err(e) => tracing::warn!("reconcile pass failed: {e}"),
                }
            }
        })
    }

    /// One pass: flagged keys first, then a divergence check over them.
    /// Returns how many orders were re-sent to warm.
    pub async fn run_once(&self) -> Result<usize, CoreError> {
        let flagged = self.hot.take_flagged();
        if flagged.is_empty() {
            return Ok(0);
        }

        let mut resent = 0usize;
        let stale = self.divergent_keys(&flagged).await?;
        for id in stale {
            if let Some(order) = self.hot.get_order(&id) {
                match self.warm.upsert_order(&order).await {
                    Ok(()) => resent += 1,
                    Err(e) => {
                        tracing::warn!(order_id = %id, "reconcile re-send failed: {e}");
                        self.hot.flag_writeback(id);
                    }
                }
            }
        }
        metrics::counter!("dex_reconciled_orders_total").increment(resent as u64);
        Ok(resent)
    }

    /// Keys whose warm row is missing or disagrees with hot on
    /// (status, remaining). Warm must never look fresher than hot, so any
    /// mismatch resolves in hot's favor.
    async fn divergent_keys(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, CoreError> {
        let warm_states = self.warm.fetch_order_states(ids).await?;
        let mut out = Vec::new();
        for id in ids {
            let Some(hot_order) = self.hot.get_order(id) else {
                continue;
            };
            let in_sync = warm_states.iter().any(|(wid, status, remaining)| {
                wid == id && *status == hot_order.status && *remaining == hot_order.remaining
            });
            if !in_sync {
                out.push(*id);
            }
        }
        Ok(out)
    }
}
