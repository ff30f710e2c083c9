// 7.0 config.rs: all settings in one place. ledger accounts, risk defaults, position
// rules, liquidation, funding, routing fees, oracle staleness, intents, scheduling, logging.
// 7.1 every section has serde defaults so a partial TOML file is enough.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::funding::FundingParams;
use crate::liquidation::LiquidationParams;
use crate::logging::LoggingConfig;
use crate::risk::RiskLimits;
use crate::scheduler::SchedulerConfig;
use crate::types::{AgentId, Asset, Bps};

/** 7.2: balance ledger and custody settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    // Account collecting trading and liquidation fees
    pub fee_account: String,
    // Intermediate account funding payments flow through
    pub funding_pool_account: String,
    // Largest on-chain withdrawal accepted in one request
    pub max_single_withdrawal: Decimal,
    // Minimum gap between two on-chain withdrawals of one agent
    pub withdrawal_cooldown_secs: u64,
    // Withdrawals at or above this are recorded as multisig settlements
    pub multisig_threshold: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fee_account: "protocol-fees".to_string(),
            funding_pool_account: "funding-pool".to_string(),
            max_single_withdrawal: dec!(100_000),
            withdrawal_cooldown_secs: 60,
            multisig_threshold: dec!(10_000),
        }
    }
}

impl LedgerConfig {
    pub fn fee_agent(&self) -> AgentId {
        AgentId::new(self.fee_account.clone())
    }

    pub fn funding_pool_agent(&self) -> AgentId {
        AgentId::new(self.funding_pool_account.clone())
    }

    pub fn withdrawal_cooldown_ms(&self) -> i64 {
        (self.withdrawal_cooldown_secs as i64) * 1000
    }
}

/** 7.3: position rules shared by every agent */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub supported_assets: Vec<String>,
    // Hard cap regardless of per-agent risk limits
    pub max_leverage: Decimal,
    // Fraction of margin lost at the liquidation price (0.8 = 80%)
    pub liquidation_loss_threshold: Decimal,
    // Adverse price move for the default stop loss (0.05 = 5%)
    pub default_stop_loss_pct: Option<Decimal>,
    // Favorable price move for the default take profit
    pub default_take_profit_pct: Option<Decimal>,
    // equity / margin under this raises a margin warning
    pub warning_health: Decimal,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            supported_assets: vec![
                "BTC-PERP".to_string(),
                "ETH-PERP".to_string(),
                "SOL-PERP".to_string(),
            ],
            max_leverage: dec!(100),
            liquidation_loss_threshold: dec!(0.8),
            default_stop_loss_pct: Some(dec!(0.05)),
            default_take_profit_pct: Some(dec!(0.10)),
            warning_health: dec!(0.5),
        }
    }
}

impl PositionConfig {
    pub fn is_supported(&self, asset: &Asset) -> bool {
        self.supported_assets.iter().any(|a| a == asset.as_str())
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.supported_assets.iter().map(Asset::new).collect()
    }
}

/** 7.4: fees in bps. 100 bps = 1% */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    // Charged on internally matched notional, both sides
    pub maker_fee_bps: i32,
    // Charged on externally routed notional when the venue reports no fee
    pub taker_fee_bps: i32,
    // Venue calls slower than this fail the external leg
    pub venue_timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            maker_fee_bps: 2,  // 0.02%
            taker_fee_bps: 5,  // 0.05%
            venue_timeout_ms: 5_000,
        }
    }
}

impl RoutingConfig {
    pub fn maker_fee(&self) -> Bps {
        Bps::new(self.maker_fee_bps)
    }

    pub fn taker_fee(&self) -> Bps {
        Bps::new(self.taker_fee_bps)
    }

    pub fn venue_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.venue_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    // Cached prices older than this are refused
    pub max_staleness_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            max_staleness_secs: 60,
        }
    }
}

impl OracleConfig {
    pub fn max_staleness_ms(&self) -> i64 {
        (self.max_staleness_secs as i64) * 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub default_ttl_secs: u64,
    pub max_open_per_agent: usize,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_open_per_agent: 50,
        }
    }
}

// The complete core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub ledger: LedgerConfig,
    // Limits applied to agents that have not set their own
    pub risk: RiskLimits,
    pub positions: PositionConfig,
    pub liquidation: LiquidationParams,
    pub funding: FundingParams,
    pub routing: RoutingConfig,
    pub oracle: OracleConfig,
    pub intents: IntentConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    // Create a configuration preset for testnet
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.routing.maker_fee_bps = 0; // free makers on testnet
        config.routing.taker_fee_bps = 1;
        config.ledger.withdrawal_cooldown_secs = 5;
        config.risk.max_leverage = dec!(50);
        config
    }

    // Create a configuration preset for mainnet with conservative settings
    pub fn mainnet_conservative() -> Self {
        let mut config = Self::default();
        config.positions.max_leverage = dec!(20);
        config.risk.max_leverage = dec!(10);
        config.oracle.max_staleness_secs = 15;
        config.ledger.withdrawal_cooldown_secs = 300;
        config.ledger.max_single_withdrawal = dec!(50_000);
        config
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.positions.liquidation_loss_threshold;
        if threshold <= Decimal::ZERO || threshold >= Decimal::ONE {
            return Err(ConfigError::InvalidPositions {
                reason: "liquidation loss threshold must be between 0 and 1".to_string(),
            });
        }

        if self.positions.max_leverage < Decimal::ONE {
            return Err(ConfigError::InvalidPositions {
                reason: "max leverage must be at least 1x".to_string(),
            });
        }

        if self.positions.supported_assets.is_empty() {
            return Err(ConfigError::InvalidPositions {
                reason: "at least one supported asset is required".to_string(),
            });
        }

        for pct in [
            self.positions.default_stop_loss_pct,
            self.positions.default_take_profit_pct,
        ]
        .into_iter()
        .flatten()
        {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                return Err(ConfigError::InvalidPositions {
                    reason: "default stop loss / take profit must be between 0 and 1".to_string(),
                });
            }
        }

        let mmr = self.liquidation.maintenance_margin_rate;
        if mmr <= Decimal::ZERO || mmr >= Decimal::ONE {
            return Err(ConfigError::InvalidLiquidation {
                reason: "maintenance margin rate must be between 0 and 1".to_string(),
            });
        }

        if self.liquidation.fee_rate < Decimal::ZERO || self.liquidation.fee_rate >= Decimal::ONE {
            return Err(ConfigError::InvalidLiquidation {
                reason: "liquidation fee rate must be in [0, 1)".to_string(),
            });
        }

        if self.funding.min_rate > self.funding.max_rate {
            return Err(ConfigError::InvalidFunding {
                reason: "min rate above max rate".to_string(),
            });
        }

        if self.funding.interval_hours <= 0 || self.funding.history_len == 0 {
            return Err(ConfigError::InvalidFunding {
                reason: "interval and history length must be positive".to_string(),
            });
        }

        if self.routing.taker_fee_bps > 100 || self.routing.maker_fee_bps > 100 {
            return Err(ConfigError::InvalidFees {
                reason: "fee too high (>1%)".to_string(),
            });
        }

        if self.ledger.fee_account == self.ledger.funding_pool_account {
            return Err(ConfigError::InvalidLedger {
                reason: "fee account and funding pool must differ".to_string(),
            });
        }

        if self.ledger.max_single_withdrawal <= Decimal::ZERO {
            return Err(ConfigError::InvalidLedger {
                reason: "max single withdrawal must be positive".to_string(),
            });
        }

        if self.oracle.max_staleness_secs == 0 {
            return Err(ConfigError::InvalidOracle {
                reason: "max staleness must be positive".to_string(),
            });
        }

        self.risk
            .validate()
            .map_err(|reason| ConfigError::InvalidRisk { reason })?;

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid ledger config: {reason}")]
    InvalidLedger { reason: String },
    #[error("invalid position config: {reason}")]
    InvalidPositions { reason: String },
    #[error("invalid liquidation config: {reason}")]
    InvalidLiquidation { reason: String },
    #[error("invalid funding config: {reason}")]
    InvalidFunding { reason: String },
    #[error("invalid fee config: {reason}")]
    InvalidFees { reason: String },
    #[error("invalid oracle config: {reason}")]
    InvalidOracle { reason: String },
    #[error("invalid risk limits: {reason}")]
    InvalidRisk { reason: String },
    #[error("cannot parse config: {reason}")]
    Parse { reason: String },
    #[error("cannot read config: {reason}")]
    Io { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> CoreConfig {
        match self {
            Environment::Development => CoreConfig::default(),
            Environment::Testnet => CoreConfig::testnet(),
            Environment::Mainnet => CoreConfig::mainnet_conservative(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.positions.liquidation_loss_threshold, dec!(0.8));
    }

    #[test]
    fn test_environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
        assert_eq!(Environment::Testnet.config().routing.maker_fee_bps, 0);
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = CoreConfig::default();
        config.positions.liquidation_loss_threshold = dec!(1.2);

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::InvalidPositions { .. })));
    }

    #[test]
    fn test_invalid_funding_bounds() {
        let mut config = CoreConfig::default();
        config.funding.min_rate = dec!(0.02);
        config.funding.max_rate = dec!(0.01);

        assert!(matches!(config.validate(), Err(ConfigError::InvalidFunding { .. })));
    }

    #[test]
    fn test_same_fee_and_pool_account_rejected() {
        let mut config = CoreConfig::default();
        config.ledger.funding_pool_account = config.ledger.fee_account.clone();

        assert!(matches!(config.validate(), Err(ConfigError::InvalidLedger { .. })));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [positions]
            supported_assets = ["BTC-PERP"]
            liquidation_loss_threshold = "0.75"

            [routing]
            taker_fee_bps = 7
        "#;

        let config = CoreConfig::from_toml(raw).unwrap();
        assert_eq!(config.positions.supported_assets, vec!["BTC-PERP".to_string()]);
        assert_eq!(config.positions.liquidation_loss_threshold, dec!(0.75));
        assert_eq!(config.routing.taker_fee_bps, 7);
        assert_eq!(config.routing.maker_fee_bps, 2);
        assert_eq!(config.ledger.fee_account, "protocol-fees");
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = CoreConfig::from_toml("[positions\nbroken");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.toml");
        std::fs::write(&path, "[oracle]\nmax_staleness_secs = 5\n").unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.oracle.max_staleness_ms(), 5_000);
    }

    #[test]
    fn test_supported_assets() {
        let config = PositionConfig::default();
        assert!(config.is_supported(&Asset::new("BTC-PERP")));
        assert!(!config.is_supported(&Asset::new("DOGE-PERP")));
    }
}
