//! Decentralized exchange backend core.
//!
//! Order management and price-time-priority matching over a tiered storage
//! substrate, with perpetual bookkeeping and a settlement-intent surface
//! against an on-chain counterparty contract.
//!
//! # Architecture
//!
//! ```text
//! Transport layer (external)
//!   ↓ typed requests
//! DexCore
//!   ├→ MatchingEngine ── one single-writer task per pair
//!   │    ├→ OrderBook (price ladders + sequence)
//!   │    ├→ TriggerSet (stop / trailing), SlicerState (iceberg / TWAP / VWAP)
//!   │    └→ PositionBook + MarginLedger (perpetuals)
//!   ├→ TieredStore ── hot (in-memory + redis) / warm (postgres) / cold (ipfs)
//!   ├→ BatchPlanner + SettlementOutbox ── call shapes for the chain contract
//!   └→ EventBus ── order / trade / orderbook / position subscriptions
//! ```
//!
//! Monetary values are 256-bit integers in 10^-18 base units throughout;
//! see the [`precision`] module. The transport layer, wallet signing, the
//! contract itself and the MPC operator nodes are external collaborators
//! behind the [`settlement::ChainSubmitter`] and [`privacy::MpcOracle`]
//! seams.

pub mod book;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod perp;
pub mod precision;
pub mod privacy;
pub mod settlement;
pub mod storage;

pub use crate::core::DexCore;
pub use config::AppConfig;
pub use error::CoreError;
pub use precision::Amount;
