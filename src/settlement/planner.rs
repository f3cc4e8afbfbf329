//! Batch settlement planner.
//!
//! Collects committed trades over a settlement window, then plans
//! `settleDEXTrade` / `batchSettleDEX` intents bounded by both the
//! configured trades-per-batch cap and the gas budget. Accrued fees are
//! routed through `distributeDEXFees` once per window and token.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use alloy_primitives::Address;

use crate::config::SettlementConfig;
use crate::error::CoreError;
use crate::models::order::now_millis;
use crate::models::Trade;
use crate::precision::Amount;

use super::contract::{
    encode_batch_settle, encode_fee_distribution, encode_settle_trade, parse_address, reference,
};
use super::{IntentKind, SettlementIntent, SettlementOutbox};

/// A trade pending settlement, resolved to chain addresses.
#[derive(Debug, Clone)]
struct PendingSettlement {
    trade_id: Uuid,
    buyer: Address,
    seller: Address,
    token: Address,
    amount: Amount,
}

pub struct BatchPlanner {
    config: SettlementConfig,
    validator: Option<Address>,
    tokens: BTreeMap<String, Address>,
    pending: Mutex<Vec<PendingSettlement>>,
    /// Fees accrued this window, per token symbol.
    fees: Mutex<BTreeMap<String, (Address, Amount)>>,
}

impl BatchPlanner {
    pub fn new(config: SettlementConfig) -> Result<Self, CoreError> {
        let validator = if config.validator_address.is_empty() {
            None
        } else {
            Some(parse_address(&config.validator_address)?)
        };
        let mut tokens = BTreeMap::new();
        for (symbol, address) in &config.tokens {
            tokens.insert(symbol.clone(), parse_address(address)?);
        }
        Ok(BatchPlanner {
            config,
            validator,
            tokens,
            pending: Mutex::new(Vec::new()),
            fees: Mutex::new(BTreeMap::new()),
        })
    }

    /// Number of trades one batch call may carry under the gas budget.
    pub fn batch_capacity(&self) -> usize {
        let by_gas = (self.config.gas_budget / self.config.gas_per_trade.max(1)) as usize;
        self.config.max_trades_per_batch.min(by_gas).max(1)
    }

    /// Register a committed trade for the current window.
    ///
    /// Trades on tokens without a registry entry are skipped with a
    /// warning; user ids double as settlement addresses.
    pub fn add_trade(&self, trade: &Trade) {
        let Some(token) = self.tokens.get(&trade.fee_asset).copied() else {
            tracing::warn!(pair = %trade.pair, token = %trade.fee_asset, "no settlement token registered, trade left pending");
            return;
        };
        let (Ok(buyer), Ok(seller)) = (
            parse_address(&trade.buyer_id),
            parse_address(&trade.seller_id),
        ) else {
            tracing::warn!(trade = %trade.id, "non-address participant, trade left pending");
            return;
        };

        self.pending.lock().push(PendingSettlement {
            trade_id: trade.id,
            buyer,
            seller,
            token,
            amount: trade.quote_quantity,
        });

        let mut fees = self.fees.lock();
        let slot = fees
            .entry(trade.fee_asset.clone())
            .or_insert((token, Amount::ZERO));
        slot.1 = slot.1.saturating_add(trade.fee);
    }

    /// Close the window: plan settle intents and one fee distribution per
    /// token with accrued fees.
    pub fn flush(&self) -> Vec<SettlementIntent> {
        let pending: Vec<PendingSettlement> = std::mem::take(&mut *self.pending.lock());
        let fees: BTreeMap<String, (Address, Amount)> = std::mem::take(&mut *self.fees.lock());
        let now = now_millis();
        let mut intents = Vec::new();

        let capacity = self.batch_capacity();
        for chunk in pending.chunks(capacity) {
            intents.push(self.plan_chunk(chunk, now));
        }

        if let Some(validator) = self.validator {
            for (symbol, (token, total_fee)) in fees {
                if total_fee.is_zero() {
                    continue;
                }
                let id = format!("fees:{symbol}:{now}");
                intents.push(SettlementIntent {
                    calldata: encode_fee_distribution(token, total_fee, validator),
                    id,
                    kind: IntentKind::FeeDistribution,
                    trade_ids: Vec::new(),
                    attempts: 0,
                    created_at: now,
                });
            }
        }

        intents
    }

    fn plan_chunk(&self, chunk: &[PendingSettlement], now: i64) -> SettlementIntent {
        if let [single] = chunk {
            let id = single.trade_id.to_string();
            return SettlementIntent {
                calldata: encode_settle_trade(
                    single.buyer,
                    single.seller,
                    single.token,
                    single.amount,
                    reference(&id),
                ),
                id,
                kind: IntentKind::SettleTrade,
                trade_ids: vec![single.trade_id],
                attempts: 0,
                created_at: now,
            };
        }

        let trade_ids: Vec<Uuid> = chunk.iter().map(|p| p.trade_id).collect();
        let batch_id = batch_id(&trade_ids);
        SettlementIntent {
            calldata: encode_batch_settle(
                chunk.iter().map(|p| p.buyer).collect(),
                chunk.iter().map(|p| p.seller).collect(),
                chunk.iter().map(|p| p.token).collect(),
                chunk.iter().map(|p| p.amount).collect(),
                reference(&batch_id),
            ),
            id: batch_id,
            kind: IntentKind::BatchSettle,
            trade_ids,
            attempts: 0,
            created_at: now,
        }
    }

    /// Spawn the window timer that flushes into the outbox.
    pub fn spawn_window_loop(self: Arc<Self>, outbox: Arc<SettlementOutbox>) -> tokio::task::JoinHandle<()> {
        let window = Duration::from_secs(self.config.window_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let intents = self.flush();
                if intents.is_empty() {
                    continue;
                }
                tracing::debug!(count = intents.len(), "settlement window closed");
                for intent in intents {
                    outbox.enqueue(intent);
                }
            }
        })
    }

    /// Fee-token symbols currently registered.
    pub fn token_symbols(&self) -> Vec<String> {
        self.tokens.keys().cloned().collect()
    }
}

/// Deterministic batch id from the covered trade ids.
fn batch_id(trade_ids: &[Uuid]) -> String {
    let joined: String = trade_ids.iter().map(|id| id.to_string()).collect();
    format!("batch:{}", &crate::storage::cold::keccak_hex(joined.as_bytes())[..32])
}
