// 2.0 error.rs: one error type for every fallible operation on the core.
// sub-errors from config, store, oracle, venue and on-chain clients fold in via From.

use crate::config::ConfigError;
use crate::custody::OnchainError;
use crate::oracle::OracleError;
use crate::risk::RiskViolation;
use crate::router::VenueError;
use crate::store::StoreError;
use crate::types::{AgentId, IntentId, PositionId, Quote};
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("risk limits violated: {}", format_violations(.0))]
    RiskLimitViolation(Vec<RiskViolation>),

    #[error("insufficient balance for {agent}: required {required}, available {available}")]
    InsufficientBalance {
        agent: AgentId,
        required: Quote,
        available: Quote,
    },

    #[error("settlement already processed for signature {signature}")]
    DuplicateSettlement { signature: String },

    #[error("settlement failed: {0}")]
    SettlementFailure(String),

    #[error("liquidation failed for {position}: {reason}")]
    LiquidationFailure { position: PositionId, reason: String },

    #[error("agent {0} cannot transfer to itself")]
    SelfTransfer(AgentId),

    #[error("agent {0} cannot trade against itself")]
    SelfTrade(AgentId),

    #[error("position {0} not found")]
    PositionNotFound(PositionId),

    #[error("position {0} is already closed")]
    PositionClosed(PositionId),

    #[error("intent {0} not found")]
    IntentNotFound(IntentId),

    #[error("intent {0} is no longer open")]
    IntentNotOpen(IntentId),

    #[error("price unavailable: {0}")]
    PriceUnavailable(#[from] OracleError),

    #[error("withdrawal cooldown active for {agent}, retry in {remaining_ms}ms")]
    WithdrawalCooldown { agent: AgentId, remaining_ms: i64 },

    #[error("external routing failed: {0}")]
    Routing(#[from] VenueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

fn format_violations(violations: &[RiskViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<OnchainError> for CoreError {
    fn from(err: OnchainError) -> Self {
        CoreError::SettlementFailure(err.to_string())
    }
}

/// Stable, machine-checkable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Validation,
    RiskLimitViolation,
    InsufficientBalance,
    DuplicateSettlement,
    SettlementFailure,
    LiquidationFailure,
    SelfTransfer,
    SelfTrade,
    PositionNotFound,
    PositionClosed,
    IntentNotFound,
    IntentNotOpen,
    PriceUnavailable,
    WithdrawalCooldown,
    RoutingFailure,
    StoreFailure,
    ConfigInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::RiskLimitViolation => "risk_limit_violation",
            ErrorCode::InsufficientBalance => "insufficient_balance",
            ErrorCode::DuplicateSettlement => "duplicate_settlement",
            ErrorCode::SettlementFailure => "settlement_failure",
            ErrorCode::LiquidationFailure => "liquidation_failure",
            ErrorCode::SelfTransfer => "self_transfer",
            ErrorCode::SelfTrade => "self_trade",
            ErrorCode::PositionNotFound => "position_not_found",
            ErrorCode::PositionClosed => "position_closed",
            ErrorCode::IntentNotFound => "intent_not_found",
            ErrorCode::IntentNotOpen => "intent_not_open",
            ErrorCode::PriceUnavailable => "price_unavailable",
            ErrorCode::WithdrawalCooldown => "withdrawal_cooldown",
            ErrorCode::RoutingFailure => "routing_failure",
            ErrorCode::StoreFailure => "store_failure",
            ErrorCode::ConfigInvalid => "config_invalid",
        }
    }

    // transient failures a caller may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SettlementFailure
                | ErrorCode::LiquidationFailure
                | ErrorCode::PriceUnavailable
                | ErrorCode::WithdrawalCooldown
                | ErrorCode::RoutingFailure
                | ErrorCode::StoreFailure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::RiskLimitViolation(_) => ErrorCode::RiskLimitViolation,
            CoreError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            CoreError::DuplicateSettlement { .. } => ErrorCode::DuplicateSettlement,
            CoreError::SettlementFailure(_) => ErrorCode::SettlementFailure,
            CoreError::LiquidationFailure { .. } => ErrorCode::LiquidationFailure,
            CoreError::SelfTransfer(_) => ErrorCode::SelfTransfer,
            CoreError::SelfTrade(_) => ErrorCode::SelfTrade,
            CoreError::PositionNotFound(_) => ErrorCode::PositionNotFound,
            CoreError::PositionClosed(_) => ErrorCode::PositionClosed,
            CoreError::IntentNotFound(_) => ErrorCode::IntentNotFound,
            CoreError::IntentNotOpen(_) => ErrorCode::IntentNotOpen,
            CoreError::PriceUnavailable(_) => ErrorCode::PriceUnavailable,
            CoreError::WithdrawalCooldown { .. } => ErrorCode::WithdrawalCooldown,
            CoreError::Routing(_) => ErrorCode::RoutingFailure,
            CoreError::Store(_) => ErrorCode::StoreFailure,
            CoreError::Config(_) => ErrorCode::ConfigInvalid,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
