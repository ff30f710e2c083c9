// 8.0: the exchange core. coordinates balances, custody, intent matching and routing,
// position management, price updates, funding settlement and liquidation sweeps.
// every operation takes &self; components synchronize internally.

mod core;
mod funding;
mod liquidations;
mod matching;
mod positions;
mod pricing;
mod results;

pub use core::{Collaborators, Exchange};
pub use positions::{CloseOutcome, MarginSource, OpenRequest, PositionManager};
pub use results::{
    FundingResult, LiquidationSweepResult, PositionSweepResult, RoutingSummary, TradeFees, TradeResult,
};
