//! Archival pipeline: warm → cold.
//!
//! On a fixed interval, terminal orders older than the configured threshold
//! are batched, written to the cold tier, annotated with their
//! `archive_ref` in warm storage, and evicted from the hot tier. With the
//! cold tier disabled the pipeline stalls and operational reads are
//! unaffected.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ArchivalConfig;
use crate::error::CoreError;
use crate::models::order::now_millis;
use crate::storage::cold::{ArchiveBatch, ColdStore};
use crate::storage::hot::HotStore;
use crate::storage::warm::WarmStore;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

pub struct ArchivalPipeline {
    config: ArchivalConfig,
    hot: Arc<HotStore>,
    warm: Arc<WarmStore>,
    cold: Arc<ColdStore>,
}

impl ArchivalPipeline {
    pub fn new(
        config: ArchivalConfig,
        hot: Arc<HotStore>,
        warm: Arc<WarmStore>,
        cold: Arc<ColdStore>,
    ) -> Self {
        ArchivalPipeline {
            config,
            hot,
            warm,
            cold,
        }
    }

    /// Spawn the interval loop. Returns the task handle for teardown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once(now_millis()).await {
                    Ok(0) => {}
                    Ok(archived) => {
                        tracing::info!(archived, "archival pass complete");
                    }
                    Err(e) => {
                        tracing::warn!("archival pass failed: {e}");
                        metrics::counter!("dex_archival_failures_total").increment(1);
                    }
                }
            }
        })
    }

    /// A single archival pass; returns the number of orders archived.
    pub async fn run_once(&self, now: i64) -> Result<usize, CoreError> {
        let cutoff = now - self.config.threshold_days as i64 * MILLIS_PER_DAY;
        let eligible = self
            .warm
            .fetch_archivable(cutoff, self.config.batch_size as usize)
            .await?;
        if eligible.is_empty() {
            return Ok(0);
        }

        let ids: Vec<uuid::Uuid> = eligible.iter().map(|o| o.id).collect();
        let batch = ArchiveBatch::new(eligible, now)?;
        let archive_ref = self.cold.put_batch(&batch).await?;

        self.warm.mark_archived(&ids, &archive_ref).await?;
        for id in &ids {
            self.hot.evict_order(id);
        }

        metrics::counter!("dex_orders_archived_total").increment(ids.len() as u64);
        Ok(ids.len())
    }
}
