// agent-perps-core: position, risk, settlement and liquidation core for
// agent-to-agent perpetuals. agents trade against each other through intents;
// what cannot be matched internally is routed to an external venue.
// risk-first: every trade passes the risk gate, every balance move goes through the ledger.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: AgentId, Asset, Side, Price, Quote, Leverage, Bps
//   2.x  error.rs: CoreError and stable error codes
//   3.x  ledger.rs: agent balances, settlements, position close settlement
//   3.2  custody.rs: on-chain deposits and withdrawals
//   4.x  position.rs: position model, pnl, health, liquidation price
//   5.x  funding.rs: funding rate, payments, pro-rata split
//   6.x  liquidation.rs: liquidation params, state machine, records
//   6.3  risk.rs: per-agent limits, rate limits, drawdown, risk score
//   7.x  config.rs: every setting, TOML loading, env presets
//   8.x  engine/: the Exchange: balances, matching, positions, funding, liquidations
//   9.x  oracle.rs: price sources and the staleness-checked cache
//   9.1  store.rs: persistence (memory, JSON file)
//   10.x router.rs: external venue routing and fee statistics
//   11.x events.rs: state transition events for audit
//   12.x scheduler.rs: background sweeps
//   13.x intent.rs: resting trade intents
//   14.x locks.rs: per-key mutexes for balance and position sections

// core modules
pub mod engine;
pub mod events;
pub mod funding;
pub mod intent;
pub mod ledger;
pub mod liquidation;
pub mod position;
pub mod types;

// risk and safety modules
pub mod locks;
pub mod risk;

// integration modules
pub mod clock;
pub mod config;
pub mod custody;
pub mod error;
pub mod logging;
pub mod oracle;
pub mod router;
pub mod scheduler;
pub mod store;

// re exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, Environment};
pub use custody::{DepositVerification, MockOnchainClient, OnchainClient, OnchainError};
pub use engine::*;
pub use error::{CoreError, CoreResult, ErrorCode};
pub use events::{BroadcastSink, CloseReason, Event, EventLog, EventPayload, EventSink, FanoutSink};
pub use funding::{FundingParams, FundingRate};
pub use intent::{IntentStatus, TradeIntent};
pub use ledger::{AgentBalance, Settlement, SettlementKind, SettlementStatus};
pub use liquidation::{LiquidationOutcome, LiquidationParams, LiquidationRecord, LiquidationState};
pub use logging::{LogFormat, LoggingConfig};
pub use oracle::{MockPriceSource, PriceCache, PriceSnapshot, PriceSource};
pub use position::Position;
pub use risk::{RiskLimits, RiskManager, RiskViolation, TradeReservation};
pub use router::{ExternalVenue, MockVenue, RoutingStats, VenueError, VenueFill};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{FileStore, MemoryStore, Store, StoreError};
pub use types::*;
