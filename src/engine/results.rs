// 8.0.2: what the engine operations and sweeps hand back.

use super::positions::CloseOutcome;
use crate::error::CoreError;
use crate::funding::FundingRate;
use crate::liquidation::LiquidationRecord;
use crate::position::Position;
use crate::router::VenueFill;
use crate::types::{MatchId, PositionId, Quote};

/// Fees the taker paid for one trade.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeFees {
    // maker-rate fee on the internally matched leg
    pub internal: Quote,
    // venue fee on the routed leg
    pub external: Quote,
}

impl TradeFees {
    pub fn total(&self) -> Quote {
        self.internal.add(self.external)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingSummary {
    pub internal_filled: Quote,
    pub external_filled: Quote,
    // set when at least one resting intent was matched
    pub match_id: Option<MatchId>,
    pub external_fills: Vec<VenueFill>,
}

impl RoutingSummary {
    pub fn total_filled(&self) -> Quote {
        self.internal_filled.add(self.external_filled)
    }
}

#[derive(Debug, Clone)]
pub struct TradeResult {
    pub success: bool,
    pub position: Option<Position>,
    pub fees: TradeFees,
    pub routing: RoutingSummary,
    // positions opened for the makers this trade matched against
    pub counterparty_positions: Vec<Position>,
}

#[derive(Debug, Clone)]
pub struct FundingResult {
    pub rate: FundingRate,
    pub total_paid: Quote,
    pub total_received: Quote,
    pub payers: usize,
    pub receivers: usize,
    pub failures: usize,
}

impl FundingResult {
    pub fn new(rate: FundingRate) -> Self {
        Self {
            rate,
            total_paid: Quote::zero(),
            total_received: Quote::zero(),
            payers: 0,
            receivers: 0,
            failures: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiquidationSweepResult {
    pub checked: usize,
    pub executed: Vec<LiquidationRecord>,
    pub failed: Vec<LiquidationRecord>,
}

#[derive(Debug, Default)]
pub struct PositionSweepResult {
    pub stop_losses: Vec<CloseOutcome>,
    pub take_profits: Vec<CloseOutcome>,
    pub warnings: Vec<PositionId>,
    pub failures: Vec<(PositionId, CoreError)>,
}

impl PositionSweepResult {
    pub fn is_empty(&self) -> bool {
        self.stop_losses.is_empty()
            && self.take_profits.is_empty()
            && self.warnings.is_empty()
            && self.failures.is_empty()
    }
}
