//! Layered application configuration.
//!
//! Sources, in override order: `config/default.toml` (optional), a file named
//! by `DEX_CONFIG` (optional), then environment variables with the `DEX_`
//! prefix (`DEX_POSTGRESQL__HOST`, `DEX_REDIS__PORT`, ...). `.env` files are
//! honored through `dotenvy` before loading.
//!
//! Storage tiers are individually disabled by an empty `host`.

use serde::Deserialize;

/// Hot distributed cache (Redis). `host == ""` disables the mirror; the
/// in-process hot tier keeps working regardless.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "defaults::redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

impl RedisConfig {
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn url(&self) -> String {
        match &self.password {
            Some(p) if !p.is_empty() => {
                format!("redis://:{}@{}:{}/{}", p, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Warm relational store (PostgreSQL). `host == ""` runs the core hot-only.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "defaults::pg_port")]
    pub port: u16,
    #[serde(default = "defaults::pg_database")]
    pub database: String,
    #[serde(default = "defaults::pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Maximum pool connections.
    #[serde(default = "defaults::pg_max")]
    pub max: u32,
}

impl PostgresConfig {
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Cold content-addressed archive (IPFS HTTP API). `host == ""` disables
/// archival.
#[derive(Debug, Clone, Deserialize)]
pub struct IpfsConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "defaults::ipfs_port")]
    pub port: u16,
    #[serde(default = "defaults::ipfs_protocol")]
    pub protocol: String,
}

impl IpfsConfig {
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn api_url(&self) -> String {
        format!("{}://{}:{}/api/v0", self.protocol, self.host, self.port)
    }
}

/// Archival schedule for terminal orders.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchivalConfig {
    #[serde(default = "defaults::archival_threshold_days")]
    pub threshold_days: u32,
    #[serde(default = "defaults::archival_batch_size")]
    pub batch_size: u32,
    /// How often the pipeline scans for eligible orders, in seconds.
    #[serde(default = "defaults::archival_interval_secs")]
    pub interval_secs: u64,
}

/// Fee rates (basis points) and the distribution split.
///
/// The three shares must sum to 1.0 within 1e-3.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "defaults::spot_maker_bps")]
    pub spot_maker_bps: u32,
    #[serde(default = "defaults::spot_taker_bps")]
    pub spot_taker_bps: u32,
    #[serde(default = "defaults::perp_maker_bps")]
    pub perp_maker_bps: u32,
    #[serde(default = "defaults::perp_taker_bps")]
    pub perp_taker_bps: u32,
    #[serde(default = "defaults::validator_share")]
    pub validator_share: f64,
    #[serde(default = "defaults::company_share")]
    pub company_share: f64,
    #[serde(default = "defaults::development_share")]
    pub development_share: f64,
}

impl FeeConfig {
    pub fn maker_bps(&self, perpetual: bool) -> u32 {
        if perpetual {
            self.perp_maker_bps
        } else {
            self.spot_maker_bps
        }
    }

    pub fn taker_bps(&self, perpetual: bool) -> u32 {
        if perpetual {
            self.perp_taker_bps
        } else {
            self.spot_taker_bps
        }
    }

    /// Validator share expressed in basis points, for integer fee math.
    pub fn validator_share_bps(&self) -> u32 {
        (self.validator_share * 10_000.0).round() as u32
    }
}

/// Matching-engine knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Trading pairs served at startup (`BASE/QUOTE` symbols).
    #[serde(default = "defaults::pairs")]
    pub pairs: Vec<String>,
    /// Reject orders whose effective price deviates from the last trade by
    /// more than this fraction, in basis points (5000 = 50%).
    #[serde(default = "defaults::price_band_bps")]
    pub price_band_bps: u32,
    /// DAY time-in-force session length.
    #[serde(default = "defaults::day_session_secs")]
    pub day_session_secs: u64,
    /// Per-pair command channel depth.
    #[serde(default = "defaults::command_buffer")]
    pub command_buffer: usize,
    /// Event bus channel capacity.
    #[serde(default = "defaults::event_buffer")]
    pub event_buffer: usize,
    /// Recent trades retained per pair in the hot tier.
    #[serde(default = "defaults::trade_history")]
    pub trade_history: usize,
}

/// Perpetual risk parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PerpConfig {
    #[serde(default = "defaults::max_leverage")]
    pub max_leverage: u32,
    /// Maintenance margin requirement in basis points of notional.
    #[serde(default = "defaults::maintenance_margin_bps")]
    pub maintenance_margin_bps: u32,
    /// Funding interval in seconds (default 8h).
    #[serde(default = "defaults::funding_interval_secs")]
    pub funding_interval_secs: u64,
    /// Funding rate clamp in basis points (100 = ±1%).
    #[serde(default = "defaults::funding_clamp_bps")]
    pub funding_clamp_bps: u32,
}

/// Settlement batching bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Settlement window length in seconds.
    #[serde(default = "defaults::settle_window_secs")]
    pub window_secs: u64,
    #[serde(default = "defaults::max_trades_per_batch")]
    pub max_trades_per_batch: usize,
    /// Gas budget per batch call.
    #[serde(default = "defaults::gas_budget")]
    pub gas_budget: u64,
    /// Estimated gas per settled trade within a batch.
    #[serde(default = "defaults::gas_per_trade")]
    pub gas_per_trade: u64,
    /// Wall-clock deadline for a single submission attempt, in seconds.
    #[serde(default = "defaults::submit_deadline_secs")]
    pub submit_deadline_secs: u64,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    /// Address that receives the validator fee share.
    #[serde(default)]
    pub validator_address: String,
    /// Token symbol -> on-chain address, for settlement calls.
    #[serde(default)]
    pub tokens: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "defaults::environment")]
    pub environment: String,
    pub redis: RedisConfig,
    pub postgresql: PostgresConfig,
    pub ipfs: IpfsConfig,
    #[serde(default = "defaults::archival")]
    pub archival: ArchivalConfig,
    #[serde(default = "defaults::fees")]
    pub fees: FeeConfig,
    #[serde(default = "defaults::engine")]
    pub engine: EngineConfig,
    #[serde(default = "defaults::perp")]
    pub perp: PerpConfig,
    #[serde(default = "defaults::settlement")]
    pub settlement: SettlementConfig,
}

impl AppConfig {
    /// Load layered configuration and validate cross-field constraints.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        if let Ok(path) = std::env::var("DEX_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let cfg: AppConfig = builder
            .add_source(config::Environment::with_prefix("DEX").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let split =
            self.fees.validator_share + self.fees.company_share + self.fees.development_share;
        if (split - 1.0).abs() > 1e-3 {
            anyhow::bail!("fee distribution shares sum to {split}, expected 1.0 (±1e-3)");
        }
        if self.engine.pairs.is_empty() {
            anyhow::bail!("at least one trading pair must be configured");
        }
        for pair in &self.engine.pairs {
            if pair.split('/').count() != 2 {
                anyhow::bail!("pair {pair:?} is not a BASE/QUOTE symbol");
            }
        }
        if self.engine.price_band_bps == 0 {
            anyhow::bail!("price band must be positive");
        }
        if self.perp.max_leverage == 0 {
            anyhow::bail!("max leverage must be at least 1");
        }
        if self.perp.funding_clamp_bps > 100 {
            anyhow::bail!("funding clamp exceeds the ±1% bound");
        }
        if self.settlement.gas_per_trade > self.settlement.gas_budget {
            anyhow::bail!("gas budget does not cover a single trade");
        }
        Ok(())
    }

    /// Configuration suitable for in-process tests: all external tiers off.
    pub fn for_tests(pairs: Vec<String>) -> Self {
        AppConfig {
            environment: "test".into(),
            redis: RedisConfig {
                host: String::new(),
                port: defaults::redis_port(),
                password: None,
                db: 0,
            },
            postgresql: PostgresConfig {
                host: String::new(),
                port: defaults::pg_port(),
                database: defaults::pg_database(),
                user: defaults::pg_user(),
                password: String::new(),
                max: defaults::pg_max(),
            },
            ipfs: IpfsConfig {
                host: String::new(),
                port: defaults::ipfs_port(),
                protocol: defaults::ipfs_protocol(),
            },
            archival: defaults::archival(),
            fees: defaults::fees(),
            engine: EngineConfig {
                pairs,
                ..defaults::engine()
            },
            perp: defaults::perp(),
            settlement: defaults::settlement(),
        }
    }
}

mod defaults {
    use super::*;

    pub fn environment() -> String {
        "development".into()
    }
    pub fn redis_port() -> u16 {
        6379
    }
    pub fn pg_port() -> u16 {
        5432
    }
    pub fn pg_database() -> String {
        "dex".into()
    }
    pub fn pg_user() -> String {
        "dex".into()
    }
    pub fn pg_max() -> u32 {
        10
    }
    pub fn ipfs_port() -> u16 {
        5001
    }
    pub fn ipfs_protocol() -> String {
        "http".into()
    }
    pub fn archival_threshold_days() -> u32 {
        30
    }
    pub fn archival_batch_size() -> u32 {
        500
    }
    pub fn archival_interval_secs() -> u64 {
        3600
    }
    pub fn spot_maker_bps() -> u32 {
        2
    }
    pub fn spot_taker_bps() -> u32 {
        5
    }
    pub fn perp_maker_bps() -> u32 {
        2
    }
    pub fn perp_taker_bps() -> u32 {
        6
    }
    pub fn validator_share() -> f64 {
        0.70
    }
    pub fn company_share() -> f64 {
        0.20
    }
    pub fn development_share() -> f64 {
        0.10
    }
    pub fn pairs() -> Vec<String> {
        vec!["BTC/USDT".into(), "ETH/USDT".into()]
    }
    pub fn price_band_bps() -> u32 {
        5000
    }
    pub fn day_session_secs() -> u64 {
        86_400
    }
    pub fn command_buffer() -> usize {
        1024
    }
    pub fn event_buffer() -> usize {
        4096
    }
    pub fn trade_history() -> usize {
        1000
    }
    pub fn max_leverage() -> u32 {
        100
    }
    pub fn maintenance_margin_bps() -> u32 {
        50
    }
    pub fn funding_interval_secs() -> u64 {
        28_800
    }
    pub fn funding_clamp_bps() -> u32 {
        100
    }
    pub fn settle_window_secs() -> u64 {
        60
    }
    pub fn max_trades_per_batch() -> usize {
        50
    }
    pub fn gas_budget() -> u64 {
        8_000_000
    }
    pub fn gas_per_trade() -> u64 {
        120_000
    }
    pub fn submit_deadline_secs() -> u64 {
        30
    }
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn archival() -> ArchivalConfig {
        ArchivalConfig {
            threshold_days: archival_threshold_days(),
            batch_size: archival_batch_size(),
            interval_secs: archival_interval_secs(),
        }
    }
    pub fn fees() -> FeeConfig {
        FeeConfig {
            spot_maker_bps: spot_maker_bps(),
            spot_taker_bps: spot_taker_bps(),
            perp_maker_bps: perp_maker_bps(),
            perp_taker_bps: perp_taker_bps(),
            validator_share: validator_share(),
            company_share: company_share(),
            development_share: development_share(),
        }
    }
    pub fn engine() -> EngineConfig {
        EngineConfig {
            pairs: pairs(),
            price_band_bps: price_band_bps(),
            day_session_secs: day_session_secs(),
            command_buffer: command_buffer(),
            event_buffer: event_buffer(),
            trade_history: trade_history(),
        }
    }
    pub fn perp() -> PerpConfig {
        PerpConfig {
            max_leverage: max_leverage(),
            maintenance_margin_bps: maintenance_margin_bps(),
            funding_interval_secs: funding_interval_secs(),
            funding_clamp_bps: funding_clamp_bps(),
        }
    }
    pub fn settlement() -> SettlementConfig {
        SettlementConfig {
            window_secs: settle_window_secs(),
            max_trades_per_batch: max_trades_per_batch(),
            gas_budget: gas_budget(),
            gas_per_trade: gas_per_trade(),
            submit_deadline_secs: submit_deadline_secs(),
            max_attempts: max_attempts(),
            validator_address: String::new(),
            tokens: std::collections::BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_with_and_without_password() {
        let mut cfg = RedisConfig {
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 2,
        };
        assert_eq!(cfg.url(), "redis://localhost:6379/2");
        cfg.password = Some("s3cret".into());
        assert_eq!(cfg.url(), "redis://:s3cret@localhost:6379/2");
    }

    #[test]
    fn empty_host_disables_tier() {
        let cfg = AppConfig::for_tests(vec!["BTC/USDT".into()]);
        assert!(!cfg.redis.enabled());
        assert!(!cfg.postgresql.enabled());
        assert!(!cfg.ipfs.enabled());
    }

    #[test]
    fn fee_split_must_sum_to_one() {
        let mut cfg = AppConfig::for_tests(vec!["BTC/USDT".into()]);
        assert!(cfg.validate().is_ok());
        cfg.fees.validator_share = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pair_symbols_are_checked() {
        let cfg = AppConfig::for_tests(vec!["BTCUSDT".into()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn funding_clamp_bound() {
        let mut cfg = AppConfig::for_tests(vec!["BTC/USDT".into()]);
        cfg.perp.funding_clamp_bps = 101;
        assert!(cfg.validate().is_err());
    }
}
