// 3.0 ledger.rs: agent balances and the settlement records that move them.
// total = everything the agent owns, locked = margin reserved for positions and resting intents.
// available = total - locked. no operation ever leaves available or locked below zero.
// 3.1 every mutation runs inside the agent's keyed lock: check, mutate, persist, publish.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::{DepositEvent, EventPayload, EventSink, TransferEvent, WithdrawalEvent};
use crate::locks::KeyedLocks;
use crate::store::Store;
use crate::types::{AgentId, Quote, SettlementId, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBalance {
    pub agent: AgentId,
    pub total: Quote,
    pub locked: Quote,
    pub updated_at: Timestamp,
}

impl AgentBalance {
    pub fn new(agent: AgentId, timestamp: Timestamp) -> Self {
        Self {
            agent,
            total: Quote::zero(),
            locked: Quote::zero(),
            updated_at: timestamp,
        }
    }

    pub fn available(&self) -> Quote {
        self.total.sub(self.locked)
    }

    pub fn is_valid(&self) -> bool {
        !self.available().is_negative() && !self.locked.is_negative()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Internal,
    OnchainDeposit,
    OnchainWithdraw,
    Multisig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Confirming,
    Settled,
    Failed,
}

impl SettlementStatus {
    // pending -> confirming -> settled | failed. internal moves skip confirming.
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Confirming) | (Pending, Settled) | (Pending, Failed)
                | (Confirming, Settled) | (Confirming, Failed)
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SettlementStatus::Settled | SettlementStatus::Failed)
    }
}

/// Immutable value-transfer record once it reaches a final status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub kind: SettlementKind,
    pub from: Option<AgentId>,
    pub to: Option<AgentId>,
    pub amount: Quote,
    pub fee: Option<Quote>,
    pub tx_hash: Option<String>,
    pub reason: String,
    pub status: SettlementStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Settlement {
    pub fn new(
        kind: SettlementKind,
        from: Option<AgentId>,
        to: Option<AgentId>,
        amount: Quote,
        reason: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: SettlementId::new(),
            kind,
            from,
            to,
            amount,
            fee: None,
            tx_hash: None,
            reason: reason.into(),
            status: SettlementStatus::Pending,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn with_fee(mut self, fee: Quote) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn advance(&mut self, next: SettlementStatus, timestamp: Timestamp) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::SettlementFailure(format!(
                "settlement {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = timestamp;
        Ok(())
    }

    pub fn involves(&self, agent: &AgentId) -> bool {
        self.from.as_ref() == Some(agent) || self.to.as_ref() == Some(agent)
    }
}

/// What a position close did to the owner's balance.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSettlement {
    // pnl actually applied, losses capped at the margin
    pub realized_pnl: Quote,
    // margin left after losses, before the fee
    pub remaining_margin: Quote,
    pub fee_charged: Quote,
    // margin + profit that went back to available
    pub returned_to_agent: Quote,
    // loss beyond the margin that could not be collected
    pub bad_debt: Quote,
}

pub struct Ledger {
    balances: DashMap<AgentId, AgentBalance>,
    locks: KeyedLocks<AgentId>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    /// Build a ledger over `store`, reloading every persisted balance.
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let balances = DashMap::new();
        for balance in store.load_balances()? {
            balances.insert(balance.agent.clone(), balance);
        }
        debug!(agents = balances.len(), "ledger loaded");
        Ok(Self {
            balances,
            locks: KeyedLocks::new(),
            store,
            events,
            clock,
        })
    }

    pub fn balance(&self, agent: &AgentId) -> AgentBalance {
        self.balances
            .get(agent)
            .map(|b| b.value().clone())
            .unwrap_or_else(|| AgentBalance::new(agent.clone(), self.clock.now()))
    }

    pub fn available(&self, agent: &AgentId) -> Quote {
        self.balance(agent).available()
    }

    pub fn balances(&self) -> Vec<AgentBalance> {
        self.balances.iter().map(|b| b.value().clone()).collect()
    }

    pub fn total_supply(&self) -> Quote {
        self.balances.iter().map(|b| b.value().total).sum()
    }

    /// Balances breaking `available >= 0 && locked >= 0`. Always empty unless something is badly wrong.
    pub fn audit(&self) -> Vec<AgentBalance> {
        self.balances
            .iter()
            .filter(|b| !b.value().is_valid())
            .map(|b| b.value().clone())
            .collect()
    }

    pub fn settlements(&self, agent: &AgentId) -> CoreResult<Vec<Settlement>> {
        Ok(self
            .store
            .load_settlements()?
            .into_iter()
            .filter(|s| s.involves(agent))
            .collect())
    }

    pub fn deposit(&self, agent: &AgentId, amount: Quote) -> CoreResult<Settlement> {
        self.credit(agent, amount, SettlementKind::Internal, None, "deposit")
    }

    /// Credit `amount` to `agent` and record a settled record of `kind`.
    pub(crate) fn credit(
        &self,
        agent: &AgentId,
        amount: Quote,
        kind: SettlementKind,
        tx_hash: Option<String>,
        reason: &str,
    ) -> CoreResult<Settlement> {
        require_positive(amount, "deposit amount")?;
        let now = self.clock.now();
        let mut settlement = Settlement::new(kind, None, Some(agent.clone()), amount, reason, now);
        if let Some(hash) = tx_hash.clone() {
            settlement = settlement.with_tx_hash(hash);
        }
        settlement.advance(SettlementStatus::Settled, now)?;

        let balance = self.mutate(agent, Some(&settlement), |bal| {
            bal.total = bal.total.add(amount);
            Ok(())
        })?;

        info!(agent = %agent, amount = %amount, total = %balance.total, "deposit credited");
        self.events.publish(
            now,
            EventPayload::Deposit(DepositEvent {
                agent: agent.clone(),
                amount,
                new_total: balance.total,
                settlement_id: settlement.id,
                tx_signature: tx_hash,
            }),
        );
        Ok(settlement)
    }

    /// Withdraw from available funds. `Ok(false)` when available is short; nothing changes then.
    pub fn withdraw(&self, agent: &AgentId, amount: Quote) -> CoreResult<bool> {
        require_positive(amount, "withdrawal amount")?;
        let now = self.clock.now();
        let mut settlement =
            Settlement::new(SettlementKind::Internal, Some(agent.clone()), None, amount, "withdraw", now);
        settlement.advance(SettlementStatus::Settled, now)?;

        let result = self.mutate(agent, Some(&settlement), |bal| {
            if bal.available() < amount {
                return Err(insufficient(agent, amount, bal));
            }
            bal.total = bal.total.sub(amount);
            Ok(())
        });

        match result {
            Ok(balance) => {
                info!(agent = %agent, amount = %amount, total = %balance.total, "withdrawal debited");
                self.events.publish(
                    now,
                    EventPayload::Withdrawal(WithdrawalEvent {
                        agent: agent.clone(),
                        amount,
                        new_total: balance.total,
                        settlement_id: settlement.id,
                        tx_hash: None,
                    }),
                );
                Ok(true)
            }
            Err(CoreError::InsufficientBalance { available, .. }) => {
                warn!(agent = %agent, amount = %amount, available = %available, "withdrawal refused");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve available funds as margin.
    pub fn lock(&self, agent: &AgentId, amount: Quote) -> CoreResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        require_positive(amount, "lock amount")?;
        self.mutate(agent, None, |bal| {
            if bal.available() < amount {
                return Err(insufficient(agent, amount, bal));
            }
            bal.locked = bal.locked.add(amount);
            Ok(())
        })?;
        debug!(agent = %agent, amount = %amount, "funds locked");
        Ok(())
    }

    /// Release reserved funds back to available.
    pub fn unlock(&self, agent: &AgentId, amount: Quote) -> CoreResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        require_positive(amount, "unlock amount")?;
        self.mutate(agent, None, |bal| {
            if bal.locked < amount {
                return Err(CoreError::SettlementFailure(format!(
                    "cannot unlock {} for {}: only {} locked",
                    amount, agent, bal.locked
                )));
            }
            bal.locked = bal.locked.sub(amount);
            Ok(())
        })?;
        debug!(agent = %agent, amount = %amount, "funds unlocked");
        Ok(())
    }

    /// Move available funds between two agents.
    pub fn transfer_internal(
        &self,
        from: &AgentId,
        to: &AgentId,
        amount: Quote,
        reason: &str,
    ) -> CoreResult<Settlement> {
        self.transfer(from, to, amount, reason, FundsSource::Available)
    }

    /// Move funds the sender already has locked (a resting intent's fee, for instance).
    pub fn transfer_locked(
        &self,
        from: &AgentId,
        to: &AgentId,
        amount: Quote,
        reason: &str,
    ) -> CoreResult<Settlement> {
        self.transfer(from, to, amount, reason, FundsSource::Locked)
    }

    fn transfer(
        &self,
        from: &AgentId,
        to: &AgentId,
        amount: Quote,
        reason: &str,
        source: FundsSource,
    ) -> CoreResult<Settlement> {
        if from == to {
            return Err(CoreError::SelfTransfer(from.clone()));
        }
        require_positive(amount, "transfer amount")?;
        let now = self.clock.now();
        let mut settlement = Settlement::new(
            SettlementKind::Internal,
            Some(from.clone()),
            Some(to.clone()),
            amount,
            reason,
            now,
        );
        settlement.advance(SettlementStatus::Settled, now)?;

        self.mutate_pair(from, to, Some(&settlement), |payer, payee| {
            match source {
                FundsSource::Available => {
                    if payer.available() < amount {
                        return Err(insufficient(from, amount, payer));
                    }
                }
                FundsSource::Locked => {
                    if payer.locked < amount {
                        return Err(CoreError::SettlementFailure(format!(
                            "{} has only {} locked, cannot move {}",
                            from, payer.locked, amount
                        )));
                    }
                    payer.locked = payer.locked.sub(amount);
                }
            }
            payer.total = payer.total.sub(amount);
            payee.total = payee.total.add(amount);
            Ok(())
        })?;

        debug!(from = %from, to = %to, amount = %amount, reason, "internal transfer settled");
        self.events.publish(
            now,
            EventPayload::Transfer(TransferEvent {
                settlement_id: settlement.id,
                from: from.clone(),
                to: to.clone(),
                amount,
                reason: reason.to_string(),
            }),
        );
        Ok(settlement)
    }

    /// Remove funds that were locked for an outbound transfer which has now completed.
    pub(crate) fn debit_locked(&self, agent: &AgentId, amount: Quote, settlement: &Settlement) -> CoreResult<AgentBalance> {
        require_positive(amount, "debit amount")?;
        let balance = self.mutate(agent, Some(settlement), |bal| {
            if bal.locked < amount {
                return Err(CoreError::SettlementFailure(format!(
                    "{} has only {} locked, cannot debit {}",
                    agent, bal.locked, amount
                )));
            }
            bal.locked = bal.locked.sub(amount);
            bal.total = bal.total.sub(amount);
            Ok(())
        })?;
        info!(agent = %agent, amount = %amount, total = %balance.total, "locked funds debited");
        Ok(balance)
    }

    /// Persist a settlement that moved no balance (a failed on-chain withdrawal, for instance).
    pub(crate) fn record(&self, settlement: &Settlement) -> CoreResult<()> {
        self.store.commit(&[], Some(settlement))?;
        Ok(())
    }

    /// Release a position's margin and apply its pnl and fee in one critical section.
    /// Isolated margin: the agent never loses more than `margin`. The fee comes out of
    /// whatever margin is left after the loss and goes to `fee_to`.
    pub fn settle_position_close(
        &self,
        agent: &AgentId,
        margin: Quote,
        pnl: Quote,
        fee: Quote,
        fee_to: &AgentId,
    ) -> CoreResult<CloseSettlement> {
        if agent == fee_to {
            return Err(CoreError::SelfTransfer(agent.clone()));
        }
        if margin.is_negative() || fee.is_negative() {
            return Err(CoreError::Validation("margin and fee must not be negative".to_string()));
        }

        let loss = pnl.negate().max(Quote::zero());
        let profit = pnl.max(Quote::zero());
        let covered_loss = loss.min(margin);
        let bad_debt = loss.sub(covered_loss);
        let remaining_margin = margin.sub(covered_loss);
        let fee_charged = fee.min(remaining_margin);
        let returned = remaining_margin.sub(fee_charged).add(profit);
        let realized = profit.sub(covered_loss);

        let now = self.clock.now();
        let mut settlement = Settlement::new(
            SettlementKind::Internal,
            Some(agent.clone()),
            Some(fee_to.clone()),
            fee_charged,
            format!("position close: pnl {}, returned {}", realized, returned),
            now,
        )
        .with_fee(fee_charged);
        settlement.advance(SettlementStatus::Settled, now)?;

        self.mutate_pair(agent, fee_to, Some(&settlement), |owner, fees| {
            if owner.locked < margin {
                return Err(CoreError::SettlementFailure(format!(
                    "{} has only {} locked, position margin is {}",
                    agent, owner.locked, margin
                )));
            }
            owner.locked = owner.locked.sub(margin);
            owner.total = owner.total.sub(covered_loss).sub(fee_charged).add(profit);
            fees.total = fees.total.add(fee_charged);
            Ok(())
        })?;

        if bad_debt.is_positive() {
            warn!(agent = %agent, bad_debt = %bad_debt, "loss exceeded position margin");
        }
        debug!(agent = %agent, pnl = %realized, fee = %fee_charged, returned = %returned, "position settled");

        Ok(CloseSettlement {
            realized_pnl: realized,
            remaining_margin,
            fee_charged,
            returned_to_agent: returned,
            bad_debt,
        })
    }

    fn current(&self, agent: &AgentId) -> AgentBalance {
        self.balance(agent)
    }

    // caller-visible state only changes if both the closure and the store commit succeed
    fn mutate(
        &self,
        agent: &AgentId,
        settlement: Option<&Settlement>,
        f: impl FnOnce(&mut AgentBalance) -> CoreResult<()>,
    ) -> CoreResult<AgentBalance> {
        self.locks.with_lock(agent, || {
            let mut balance = self.current(agent);
            f(&mut balance)?;
            debug_assert!(balance.is_valid(), "balance invariant broken for {}", agent);
            balance.updated_at = self.clock.now();
            self.store.commit(std::slice::from_ref(&balance), settlement)?;
            self.balances.insert(agent.clone(), balance.clone());
            Ok(balance)
        })
    }

    fn mutate_pair(
        &self,
        a: &AgentId,
        b: &AgentId,
        settlement: Option<&Settlement>,
        f: impl FnOnce(&mut AgentBalance, &mut AgentBalance) -> CoreResult<()>,
    ) -> CoreResult<()> {
        self.locks.with_pair(a, b, || {
            let mut first = self.current(a);
            let mut second = self.current(b);
            f(&mut first, &mut second)?;
            debug_assert!(first.is_valid() && second.is_valid());
            let now = self.clock.now();
            first.updated_at = now;
            second.updated_at = now;
            self.store.commit(&[first.clone(), second.clone()], settlement)?;
            self.balances.insert(a.clone(), first);
            self.balances.insert(b.clone(), second);
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum FundsSource {
    Available,
    Locked,
}

fn require_positive(amount: Quote, what: &str) -> CoreResult<()> {
    if !amount.is_positive() {
        return Err(CoreError::Validation(format!("{} must be positive, got {}", what, amount)));
    }
    Ok(())
}

fn insufficient(agent: &AgentId, required: Quote, balance: &AgentBalance) -> CoreError {
    CoreError::InsufficientBalance {
        agent: agent.clone(),
        required,
        available: balance.available(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventLog;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn test_ledger() -> Ledger {
        Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventLog::default()),
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    fn q(v: rust_decimal::Decimal) -> Quote {
        Quote::new(v)
    }

    #[test]
    fn deposit_then_withdraw_restores_balance() {
        let ledger = test_ledger();
        let agent = AgentId::new("a1");

        ledger.deposit(&agent, q(dec!(100))).unwrap();
        assert!(ledger.withdraw(&agent, q(dec!(100))).unwrap());

        let bal = ledger.balance(&agent);
        assert_eq!(bal.total, Quote::zero());
        assert_eq!(bal.locked, Quote::zero());
    }

    #[test]
    fn failed_withdraw_changes_nothing() {
        let ledger = test_ledger();
        let agent = AgentId::new("a1");
        ledger.deposit(&agent, q(dec!(50))).unwrap();
        ledger.lock(&agent, q(dec!(30))).unwrap();

        let before = ledger.balance(&agent);
        assert!(!ledger.withdraw(&agent, q(dec!(21))).unwrap());
        assert_eq!(ledger.balance(&agent), before);
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let ledger = test_ledger();
        let agent = AgentId::new("a1");
        assert!(matches!(ledger.deposit(&agent, q(dec!(0))), Err(CoreError::Validation(_))));
        assert!(matches!(ledger.deposit(&agent, q(dec!(-5))), Err(CoreError::Validation(_))));
        assert!(matches!(ledger.withdraw(&agent, q(dec!(-5))), Err(CoreError::Validation(_))));
    }

    #[test]
    fn lock_cannot_exceed_available() {
        let ledger = test_ledger();
        let agent = AgentId::new("a1");
        ledger.deposit(&agent, q(dec!(10))).unwrap();

        let result = ledger.lock(&agent, q(dec!(11)));
        assert!(matches!(result, Err(CoreError::InsufficientBalance { .. })));

        ledger.lock(&agent, q(dec!(10))).unwrap();
        assert_eq!(ledger.available(&agent), Quote::zero());
        assert!(ledger.unlock(&agent, q(dec!(11))).is_err());
        ledger.unlock(&agent, q(dec!(10))).unwrap();
        assert_eq!(ledger.available(&agent), q(dec!(10)));
    }

    #[test]
    fn self_transfer_rejected() {
        let ledger = test_ledger();
        let agent = AgentId::new("a1");
        ledger.deposit(&agent, q(dec!(10))).unwrap();

        let result = ledger.transfer_internal(&agent, &agent, q(dec!(1)), "test");
        assert!(matches!(result, Err(CoreError::SelfTransfer(_))));
    }

    #[test]
    fn transfer_moves_funds_and_records_settlement() {
        let ledger = test_ledger();
        let a = AgentId::new("a");
        let b = AgentId::new("b");
        ledger.deposit(&a, q(dec!(100))).unwrap();

        let settlement = ledger.transfer_internal(&a, &b, q(dec!(40)), "test").unwrap();
        assert_eq!(settlement.status, SettlementStatus::Settled);
        assert_eq!(ledger.balance(&a).total, q(dec!(60)));
        assert_eq!(ledger.balance(&b).total, q(dec!(40)));

        let history = ledger.settlements(&b).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, settlement.id);
    }

    #[test]
    fn transfer_never_goes_negative() {
        let ledger = test_ledger();
        let a = AgentId::new("a");
        let b = AgentId::new("b");
        ledger.deposit(&a, q(dec!(10))).unwrap();
        ledger.lock(&a, q(dec!(5))).unwrap();

        let result = ledger.transfer_internal(&a, &b, q(dec!(6)), "test");
        assert!(matches!(result, Err(CoreError::InsufficientBalance { .. })));
        assert_eq!(ledger.balance(&a).total, q(dec!(10)));
        assert_eq!(ledger.balance(&b).total, Quote::zero());
    }

    #[test]
    fn transfer_locked_spends_reserved_funds() {
        let ledger = test_ledger();
        let a = AgentId::new("a");
        let fees = AgentId::new("fees");
        ledger.deposit(&a, q(dec!(10))).unwrap();
        ledger.lock(&a, q(dec!(4))).unwrap();

        ledger.transfer_locked(&a, &fees, q(dec!(1)), "fee").unwrap();
        let bal = ledger.balance(&a);
        assert_eq!(bal.total, q(dec!(9)));
        assert_eq!(bal.locked, q(dec!(3)));
        assert_eq!(ledger.balance(&fees).total, q(dec!(1)));
    }

    #[test]
    fn close_with_profit_returns_margin_and_pnl() {
        let ledger = test_ledger();
        let agent = AgentId::new("a");
        let fees = AgentId::new("fees");
        ledger.deposit(&agent, q(dec!(100))).unwrap();
        ledger.lock(&agent, q(dec!(40))).unwrap();

        let out = ledger
            .settle_position_close(&agent, q(dec!(40)), q(dec!(10)), Quote::zero(), &fees)
            .unwrap();
        assert_eq!(out.returned_to_agent, q(dec!(50)));
        assert_eq!(out.bad_debt, Quote::zero());

        let bal = ledger.balance(&agent);
        assert_eq!(bal.total, q(dec!(110)));
        assert_eq!(bal.locked, Quote::zero());
    }

    #[test]
    fn close_loss_capped_at_margin() {
        let ledger = test_ledger();
        let agent = AgentId::new("a");
        let fees = AgentId::new("fees");
        ledger.deposit(&agent, q(dec!(100))).unwrap();
        ledger.lock(&agent, q(dec!(40))).unwrap();

        let out = ledger
            .settle_position_close(&agent, q(dec!(40)), q(dec!(-55)), q(dec!(2)), &fees)
            .unwrap();
        assert_eq!(out.realized_pnl, q(dec!(-40)));
        assert_eq!(out.bad_debt, q(dec!(15)));
        assert_eq!(out.fee_charged, Quote::zero());
        assert_eq!(ledger.balance(&agent).total, q(dec!(60)));
        assert!(ledger.audit().is_empty());
    }

    #[test]
    fn close_fee_taken_from_remaining_margin() {
        let ledger = test_ledger();
        let agent = AgentId::new("a");
        let fees = AgentId::new("fees");
        ledger.deposit(&agent, q(dec!(100))).unwrap();
        ledger.lock(&agent, q(dec!(40))).unwrap();

        let out = ledger
            .settle_position_close(&agent, q(dec!(40)), q(dec!(-35)), q(dec!(8)), &fees)
            .unwrap();
        assert_eq!(out.remaining_margin, q(dec!(5)));
        assert_eq!(out.fee_charged, q(dec!(5)));
        assert_eq!(out.returned_to_agent, Quote::zero());
        assert_eq!(ledger.balance(&fees).total, q(dec!(5)));
        assert_eq!(ledger.balance(&agent).total, q(dec!(60)));
    }

    #[test]
    fn settlement_status_transitions() {
        use SettlementStatus::*;
        assert!(Pending.can_transition_to(Confirming));
        assert!(Confirming.can_transition_to(Settled));
        assert!(!Settled.can_transition_to(Settled));
        assert!(!Failed.can_transition_to(Settled));
        assert!(!Settled.can_transition_to(Pending));
    }

    #[test]
    fn balances_reload_from_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let agent = AgentId::new("a");
        {
            let ledger = Ledger::new(store.clone(), Arc::new(EventLog::default()), clock.clone()).unwrap();
            ledger.deposit(&agent, q(dec!(75))).unwrap();
            ledger.lock(&agent, q(dec!(25))).unwrap();
        }
        let ledger = Ledger::new(store, Arc::new(EventLog::default()), clock).unwrap();
        let bal = ledger.balance(&agent);
        assert_eq!(bal.total, q(dec!(75)));
        assert_eq!(bal.locked, q(dec!(25)));
    }
}
