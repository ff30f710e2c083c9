// 8.0 engine/core.rs: the exchange. owns the ledger, custody, risk, positions,
// liquidations, funding, prices, routing and the intent book, and wires them together.

use super::positions::PositionManager;
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::custody::{Custody, OnchainClient};
use crate::error::{CoreError, CoreResult};
use crate::events::EventSink;
use crate::funding::FundingBook;
use crate::intent::IntentBook;
use crate::ledger::{AgentBalance, Ledger, Settlement};
use crate::liquidation::LiquidationBook;
use crate::oracle::PriceCache;
use crate::risk::{RiskLimits, RiskManager};
use crate::router::{ExternalRouter, ExternalVenue, RoutingStats};
use crate::store::Store;
use crate::types::{AgentId, Quote};
use std::sync::Arc;
use tracing::info;

/// External collaborators the exchange runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub venue: Arc<dyn ExternalVenue>,
    pub onchain: Arc<dyn OnchainClient>,
}

/** 8.1: main exchange struct. every component is internally synchronized, so
the exchange is shared as Arc<Exchange> and all methods take &self */
pub struct Exchange {
    pub(super) config: CoreConfig,
    pub(super) store: Arc<dyn Store>,
    pub(super) events: Arc<dyn EventSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ledger: Arc<Ledger>,
    pub(super) custody: Custody,
    pub(super) risk: RiskManager,
    pub(super) positions: PositionManager,
    pub(super) liquidations: LiquidationBook,
    pub(super) funding: FundingBook,
    pub(super) prices: PriceCache,
    pub(super) router: ExternalRouter,
    pub(super) intents: IntentBook,
}

impl Exchange {
    /// Validate `config`, reload persisted state from the store and start the
    /// funding schedule of every supported asset one interval from now.
    pub fn new(config: CoreConfig, deps: Collaborators) -> CoreResult<Self> {
        config.validate()?;
        let Collaborators {
            store,
            events,
            clock,
            venue,
            onchain,
        } = deps;

        let ledger = Arc::new(Ledger::new(store.clone(), events.clone(), clock.clone())?);
        let custody = Custody::new(
            config.ledger.clone(),
            ledger.clone(),
            store.clone(),
            onchain,
            events.clone(),
            clock.clone(),
        );
        let positions = PositionManager::new(
            config.positions.clone(),
            config.ledger.fee_agent(),
            ledger.clone(),
            store.clone(),
            events.clone(),
            clock.clone(),
        )?;
        let liquidations =
            LiquidationBook::new(config.liquidation.max_records, store.load_liquidations()?);

        let funding = FundingBook::new(config.funding.clone());
        let first_settlement = clock.now().plus_millis(config.funding.interval_ms());
        for asset in config.positions.assets() {
            funding.schedule(&asset, first_settlement);
        }

        let exchange = Self {
            risk: RiskManager::new(config.risk.clone(), clock.clone()),
            prices: PriceCache::new(config.oracle.max_staleness_ms(), clock.clone()),
            router: ExternalRouter::new(venue, &config.routing),
            intents: IntentBook::new(config.intents.max_open_per_agent),
            liquidations,
            funding,
            positions,
            custody,
            ledger,
            config,
            store,
            events,
            clock,
        };

        info!(
            assets = exchange.config.positions.supported_assets.len(),
            venue = %exchange.router.venue_name(),
            open_positions = exchange.positions.open_positions().len(),
            "exchange ready"
        );
        Ok(exchange)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // Balance operations

    pub fn deposit(&self, agent: &AgentId, amount: Quote) -> CoreResult<Settlement> {
        self.require_trading_account(agent)?;
        let settlement = self.ledger.deposit(agent, amount)?;
        self.risk.record_capital_flow(agent, amount);
        Ok(settlement)
    }

    /// `Ok(false)` when available funds are short; nothing changes then.
    pub fn withdraw(&self, agent: &AgentId, amount: Quote) -> CoreResult<bool> {
        let withdrawn = self.ledger.withdraw(agent, amount)?;
        if withdrawn {
            self.risk.record_capital_flow(agent, amount.negate());
        }
        Ok(withdrawn)
    }

    pub fn transfer(&self, from: &AgentId, to: &AgentId, amount: Quote) -> CoreResult<Settlement> {
        self.require_trading_account(from)?;
        self.require_trading_account(to)?;
        let settlement = self.ledger.transfer_internal(from, to, amount, "agent transfer")?;
        self.risk.record_capital_flow(from, amount.negate());
        self.risk.record_capital_flow(to, amount);
        Ok(settlement)
    }

    pub async fn deposit_onchain(
        &self,
        agent: &AgentId,
        tx_signature: &str,
        expected_amount: Option<Quote>,
        from_wallet: Option<&str>,
    ) -> CoreResult<Settlement> {
        self.require_trading_account(agent)?;
        let settlement = self
            .custody
            .credit_onchain_deposit(agent, tx_signature, expected_amount, from_wallet)
            .await?;
        self.risk.record_capital_flow(agent, settlement.amount);
        Ok(settlement)
    }

    pub async fn withdraw_onchain(&self, agent: &AgentId, amount: Quote, to_wallet: &str) -> CoreResult<Settlement> {
        let settlement = self.custody.withdraw_onchain(agent, amount, to_wallet).await?;
        self.risk.record_capital_flow(agent, amount.negate());
        Ok(settlement)
    }

    pub fn is_deposit_processed(&self, tx_signature: &str) -> CoreResult<bool> {
        self.custody.is_processed(tx_signature)
    }

    pub fn withdrawal_cooldown_remaining(&self, agent: &AgentId) -> i64 {
        self.custody.cooldown_remaining(agent)
    }

    pub fn get_balance(&self, agent: &AgentId) -> AgentBalance {
        self.ledger.balance(agent)
    }

    pub fn settlement_history(&self, agent: &AgentId) -> CoreResult<Vec<Settlement>> {
        self.ledger.settlements(agent)
    }

    /// Sum of every balance, protocol accounts included.
    pub fn total_supply(&self) -> Quote {
        self.ledger.total_supply()
    }

    /// Balances that break their invariants. Empty in a healthy system.
    pub fn audit(&self) -> Vec<AgentBalance> {
        self.ledger.audit()
    }

    // Risk

    pub fn get_risk_limits(&self, agent: &AgentId) -> RiskLimits {
        self.risk.limits(agent)
    }

    pub fn set_risk_limits(&self, agent: &AgentId, limits: RiskLimits) -> CoreResult<()> {
        self.risk.set_limits(agent, limits)
    }

    /// 0 (no risk) to 100.
    pub fn get_risk_score(&self, agent: &AgentId) -> u8 {
        self.risk.risk_score(
            agent,
            self.positions.exposure(agent),
            self.positions.max_open_leverage(agent),
        )
    }

    /// Balance plus unrealized pnl of open positions.
    pub fn agent_equity(&self, agent: &AgentId) -> Quote {
        self.ledger
            .balance(agent)
            .total
            .add(self.positions.unrealized_pnl(agent))
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.router.stats()
    }

    // fees and funding flow through these accounts; agents cannot fund or trade them
    pub(super) fn require_trading_account(&self, agent: &AgentId) -> CoreResult<()> {
        if *agent == self.config.ledger.fee_agent() || *agent == self.config.ledger.funding_pool_agent() {
            return Err(CoreError::Validation(format!("{} is a protocol account", agent)));
        }
        Ok(())
    }
}
