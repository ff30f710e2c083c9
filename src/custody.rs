// 3.2 custody.rs: money crossing the chain boundary.
// deposits are keyed by transaction signature and credited exactly once: the signature
// is claimed in the store before the network is asked, so a replay or a concurrent
// duplicate never reaches the ledger. withdrawals lock the funds, wait for the chain
// outside any balance lock, then debit or release.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{
    DuplicateSettlementEvent, EventPayload, EventSink, WithdrawalEvent, WithdrawalRejectedEvent,
};
use crate::ledger::{Ledger, Settlement, SettlementKind, SettlementStatus};
use crate::store::Store;
use crate::types::{AgentId, Quote, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OnchainError {
    #[error("rpc failure: {0}")]
    Rpc(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
}

/// What the chain says about a deposit transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositVerification {
    pub valid: bool,
    pub amount: Quote,
    pub from_wallet: Option<String>,
    pub reason: Option<String>,
}

impl DepositVerification {
    pub fn valid(amount: Quote, from_wallet: Option<String>) -> Self {
        Self {
            valid: true,
            amount,
            from_wallet,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            amount: Quote::zero(),
            from_wallet: None,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait OnchainClient: Send + Sync {
    async fn verify_deposit(
        &self,
        tx_signature: &str,
        expected_amount: Option<Quote>,
        from_wallet: Option<&str>,
    ) -> Result<DepositVerification, OnchainError>;

    /// Returns the transaction hash.
    async fn send_funds(&self, to_wallet: &str, amount: Quote) -> Result<String, OnchainError>;
}

pub struct Custody {
    ledger: Arc<Ledger>,
    store: Arc<dyn Store>,
    client: Arc<dyn OnchainClient>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    last_withdrawal: DashMap<AgentId, Timestamp>,
}

impl Custody {
    pub fn new(
        config: LedgerConfig,
        ledger: Arc<Ledger>,
        store: Arc<dyn Store>,
        client: Arc<dyn OnchainClient>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            store,
            client,
            events,
            clock,
            config,
            last_withdrawal: DashMap::new(),
        }
    }

    /// Credit a verified on-chain deposit. A signature already seen is rejected with
    /// `DuplicateSettlement` and changes nothing.
    pub async fn credit_onchain_deposit(
        &self,
        agent: &AgentId,
        tx_signature: &str,
        expected_amount: Option<Quote>,
        from_wallet: Option<&str>,
    ) -> CoreResult<Settlement> {
        if tx_signature.trim().is_empty() {
            return Err(CoreError::Validation("transaction signature is empty".to_string()));
        }

        if !self.store.claim_signature(tx_signature)? {
            warn!(agent = %agent, signature = tx_signature, "duplicate deposit signature");
            self.events.publish(
                self.clock.now(),
                EventPayload::DuplicateSettlement(DuplicateSettlementEvent {
                    agent: agent.clone(),
                    tx_signature: tx_signature.to_string(),
                }),
            );
            return Err(CoreError::DuplicateSettlement {
                signature: tx_signature.to_string(),
            });
        }

        let verified = match self
            .client
            .verify_deposit(tx_signature, expected_amount, from_wallet)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.release_claim(tx_signature);
                return Err(e.into());
            }
        };

        if let Err(reason) = check_verification(&verified, expected_amount) {
            warn!(agent = %agent, signature = tx_signature, reason = %reason, "deposit not credited");
            self.release_claim(tx_signature);
            return Err(CoreError::SettlementFailure(reason));
        }

        match self.ledger.credit(
            agent,
            verified.amount,
            SettlementKind::OnchainDeposit,
            Some(tx_signature.to_string()),
            "onchain deposit",
        ) {
            Ok(settlement) => {
                info!(agent = %agent, signature = tx_signature, amount = %verified.amount, "onchain deposit credited");
                Ok(settlement)
            }
            Err(e) => {
                self.release_claim(tx_signature);
                Err(e)
            }
        }
    }

    /// Send `amount` to `to_wallet`. Funds stay locked while the chain call is in
    /// flight; they are debited when it lands and released when it fails.
    pub async fn withdraw_onchain(&self, agent: &AgentId, amount: Quote, to_wallet: &str) -> CoreResult<Settlement> {
        if !amount.is_positive() {
            return Err(CoreError::Validation(format!("withdrawal amount must be positive, got {}", amount)));
        }
        if amount.value() > self.config.max_single_withdrawal {
            return Err(self.reject(
                agent,
                amount,
                CoreError::Validation(format!(
                    "withdrawal {} above the single withdrawal cap {}",
                    amount, self.config.max_single_withdrawal
                )),
            ));
        }
        if to_wallet.trim().is_empty() {
            return Err(CoreError::Validation("destination wallet is empty".to_string()));
        }

        let now = self.clock.now();
        let previous = self.start_cooldown(agent, now).map_err(|e| self.reject(agent, amount, e))?;

        if let Err(e) = self.ledger.lock(agent, amount) {
            self.restore_cooldown(agent, previous);
            return Err(self.reject(agent, amount, e));
        }

        let kind = if amount.value() >= self.config.multisig_threshold {
            SettlementKind::Multisig
        } else {
            SettlementKind::OnchainWithdraw
        };
        let mut settlement = Settlement::new(
            kind,
            Some(agent.clone()),
            None,
            amount,
            format!("onchain withdrawal to {}", to_wallet),
            now,
        );
        settlement.advance(SettlementStatus::Confirming, now)?;

        match self.client.send_funds(to_wallet, amount).await {
            Ok(tx_hash) => {
                let done = self.clock.now();
                settlement.tx_hash = Some(tx_hash.clone());
                settlement.advance(SettlementStatus::Settled, done)?;
                let balance = self.ledger.debit_locked(agent, amount, &settlement).map_err(|e| {
                    error!(agent = %agent, tx = %tx_hash, error = %e, "funds sent but not debited");
                    e
                })?;

                info!(agent = %agent, amount = %amount, tx = %tx_hash, kind = ?kind, "onchain withdrawal settled");
                self.events.publish(
                    done,
                    EventPayload::Withdrawal(WithdrawalEvent {
                        agent: agent.clone(),
                        amount,
                        new_total: balance.total,
                        settlement_id: settlement.id,
                        tx_hash: Some(tx_hash),
                    }),
                );
                Ok(settlement)
            }
            Err(e) => {
                let done = self.clock.now();
                self.ledger.unlock(agent, amount)?;
                settlement.advance(SettlementStatus::Failed, done)?;
                self.ledger.record(&settlement)?;
                self.restore_cooldown(agent, previous);
                Err(self.reject(agent, amount, CoreError::SettlementFailure(e.to_string())))
            }
        }
    }

    /// Milliseconds until `agent` may withdraw again. 0 when allowed now.
    pub fn cooldown_remaining(&self, agent: &AgentId) -> i64 {
        let cooldown = self.config.withdrawal_cooldown_ms();
        self.last_withdrawal
            .get(agent)
            .map(|last| (cooldown - self.clock.now().millis_since(*last.value())).max(0))
            .unwrap_or(0)
    }

    pub fn is_processed(&self, tx_signature: &str) -> CoreResult<bool> {
        Ok(self.store.is_claimed(tx_signature)?)
    }

    // check and stamp in one step so two concurrent requests cannot both pass
    fn start_cooldown(&self, agent: &AgentId, now: Timestamp) -> CoreResult<Option<Timestamp>> {
        let cooldown = self.config.withdrawal_cooldown_ms();
        match self.last_withdrawal.entry(agent.clone()) {
            Entry::Occupied(mut entry) => {
                let elapsed = now.millis_since(*entry.get());
                if elapsed < cooldown {
                    return Err(CoreError::WithdrawalCooldown {
                        agent: agent.clone(),
                        remaining_ms: cooldown - elapsed,
                    });
                }
                Ok(Some(entry.insert(now)))
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(None)
            }
        }
    }

    // a withdrawal that never left does not count against the cooldown
    fn restore_cooldown(&self, agent: &AgentId, previous: Option<Timestamp>) {
        match previous {
            Some(ts) => {
                self.last_withdrawal.insert(agent.clone(), ts);
            }
            None => {
                self.last_withdrawal.remove(agent);
            }
        }
    }

    fn release_claim(&self, tx_signature: &str) {
        if let Err(e) = self.store.release_signature(tx_signature) {
            error!(signature = tx_signature, error = %e, "could not release deposit claim");
        }
    }

    fn reject(&self, agent: &AgentId, amount: Quote, err: CoreError) -> CoreError {
        warn!(agent = %agent, amount = %amount, error = %err, "withdrawal rejected");
        self.events.publish(
            self.clock.now(),
            EventPayload::WithdrawalRejected(WithdrawalRejectedEvent {
                agent: agent.clone(),
                amount,
                reason: err.to_string(),
            }),
        );
        err
    }
}

fn check_verification(verified: &DepositVerification, expected: Option<Quote>) -> Result<(), String> {
    if !verified.valid {
        return Err(format!(
            "deposit invalid: {}",
            verified.reason.as_deref().unwrap_or("rejected by verifier")
        ));
    }
    if !verified.amount.is_positive() {
        return Err(format!("verified amount {} is not positive", verified.amount));
    }
    if let Some(expected) = expected {
        if expected != verified.amount {
            return Err(format!("expected {}, chain shows {}", expected, verified.amount));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct MockDeposit {
    amount: Quote,
    from_wallet: Option<String>,
}

/// In-process chain for tests and the simulator.
#[derive(Default)]
pub struct MockOnchainClient {
    deposits: RwLock<HashMap<String, MockDeposit>>,
    sent: RwLock<Vec<(String, Quote, String)>>,
    failing_sends: AtomicBool,
    verify_delay_ms: AtomicU64,
    verify_calls: AtomicU64,
    tx_counter: AtomicU64,
}

impl MockOnchainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deposit(&self, tx_signature: &str, amount: Quote, from_wallet: Option<&str>) {
        self.deposits.write().insert(
            tx_signature.to_string(),
            MockDeposit {
                amount,
                from_wallet: from_wallet.map(str::to_string),
            },
        );
    }

    pub fn set_failing_sends(&self, failing: bool) {
        self.failing_sends.store(failing, Ordering::SeqCst);
    }

    pub fn set_verify_delay(&self, delay: Duration) {
        self.verify_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> u64 {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// (wallet, amount, tx hash) for every successful send.
    pub fn sent(&self) -> Vec<(String, Quote, String)> {
        self.sent.read().clone()
    }
}

#[async_trait]
impl OnchainClient for MockOnchainClient {
    async fn verify_deposit(
        &self,
        tx_signature: &str,
        _expected_amount: Option<Quote>,
        from_wallet: Option<&str>,
    ) -> Result<DepositVerification, OnchainError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.verify_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let deposit = self.deposits.read().get(tx_signature).cloned();
        let Some(deposit) = deposit else {
            return Ok(DepositVerification::invalid("transaction not found"));
        };
        if let (Some(claimed), Some(actual)) = (from_wallet, deposit.from_wallet.as_deref()) {
            if claimed != actual {
                return Ok(DepositVerification::invalid("sender does not match"));
            }
        }
        Ok(DepositVerification::valid(deposit.amount, deposit.from_wallet))
    }

    async fn send_funds(&self, to_wallet: &str, amount: Quote) -> Result<String, OnchainError> {
        if self.failing_sends.load(Ordering::SeqCst) {
            return Err(OnchainError::Rpc("mock chain unavailable".to_string()));
        }
        if !to_wallet.starts_with("0x") {
            return Err(OnchainError::InvalidAddress(to_wallet.to_string()));
        }
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let tx_hash = format!("0xmock{:08x}", n);
        self.sent
            .write()
            .push((to_wallet.to_string(), amount, tx_hash.clone()));
        Ok(tx_hash)
    }
}
