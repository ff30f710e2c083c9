// 11.0: every state change produces an event. used for audit trails, alerts to agents,
// and notifying external systems. the EventPayload enum lists all event types.
// 11.1 sinks: EventLog keeps a bounded in-memory tail, BroadcastSink fans out to subscribers.

use crate::types::{
    AgentId, Asset, IntentId, Leverage, LiquidationId, MatchId, PositionId, Price, Quote,
    SettlementId, Side, Timestamp,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Balance events
    Deposit(DepositEvent),
    Withdrawal(WithdrawalEvent),
    WithdrawalRejected(WithdrawalRejectedEvent),
    Transfer(TransferEvent),
    DuplicateSettlement(DuplicateSettlementEvent),

    // Position events
    PositionOpened(PositionOpenedEvent),
    PositionClosed(PositionClosedEvent),
    PositionUpdated(PositionUpdatedEvent),
    StopLossTriggered(TriggerEvent),
    TakeProfitTriggered(TriggerEvent),

    // Risk events
    MarginWarning(MarginWarningEvent),
    Liquidation(LiquidationEvent),
    LiquidationFailed(LiquidationFailedEvent),
    BadDebt(BadDebtEvent),

    // Funding events
    FundingRateUpdated(FundingRateEvent),
    FundingPayment(FundingPaymentEvent),

    // Matching events
    IntentPosted(IntentPostedEvent),
    IntentClosed(IntentClosedEvent),
    InternalMatch(InternalMatchEvent),
    ExternalFill(ExternalFillEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositEvent {
    pub agent: AgentId,
    pub amount: Quote,
    pub new_total: Quote,
    pub settlement_id: SettlementId,
    pub tx_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalEvent {
    pub agent: AgentId,
    pub amount: Quote,
    pub new_total: Quote,
    pub settlement_id: SettlementId,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRejectedEvent {
    pub agent: AgentId,
    pub amount: Quote,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub settlement_id: SettlementId,
    pub from: AgentId,
    pub to: AgentId,
    pub amount: Quote,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateSettlementEvent {
    pub agent: AgentId,
    pub tx_signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Manual => "manual",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Liquidation => "liquidation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub size: Quote,
    pub entry_price: Price,
    pub leverage: Leverage,
    pub margin: Quote,
    pub liquidation_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub exit_price: Price,
    pub closed_size: Quote,
    pub realized_pnl: Quote,
    pub returned_to_agent: Quote,
    pub reason: CloseReason,
    // false when only part of the position was closed
    pub fully_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdatedEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub trigger_price: Price,
    pub mark_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginWarningEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub health: Decimal,
    pub equity: Quote,
    pub margin: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub liquidation_id: LiquidationId,
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub mark_price: Price,
    pub fee_charged: Quote,
    pub returned_to_agent: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationFailedEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub reason: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadDebtEvent {
    pub position_id: PositionId,
    pub agent: AgentId,
    pub amount: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateEvent {
    pub asset: Asset,
    pub rate: Decimal,
    pub premium: Decimal,
    pub mark_price: Price,
    pub index_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPaymentEvent {
    pub asset: Asset,
    pub agent: AgentId,
    pub position_id: PositionId,
    // positive = paid, negative = received
    pub amount: Quote,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPostedEvent {
    pub intent_id: IntentId,
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub size: Quote,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCloseReason {
    Filled,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClosedEvent {
    pub intent_id: IntentId,
    pub agent: AgentId,
    pub reason: IntentCloseReason,
    pub refunded: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalMatchEvent {
    pub match_id: MatchId,
    pub asset: Asset,
    pub taker: AgentId,
    pub maker: AgentId,
    pub maker_intent: IntentId,
    pub notional: Quote,
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFillEvent {
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub venue: String,
    pub notional: Quote,
    pub fill_price: Price,
    pub fee: Quote,
}

/// Anything that wants to observe core state changes.
pub trait EventSink: Send + Sync {
    fn publish(&self, timestamp: Timestamp, payload: EventPayload);
}

struct EventLogInner {
    events: VecDeque<Event>,
    next_id: u64,
}

/// Bounded in-memory event tail. Oldest events are dropped past `max_events`.
pub struct EventLog {
    inner: Mutex<EventLogInner>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                events: VecDeque::new(),
                next_id: 1,
            }),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        let start = inner.events.len().saturating_sub(count);
        inner.events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().events.clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl EventSink for EventLog {
    fn publish(&self, timestamp: Timestamp, payload: EventPayload) {
        let mut inner = self.inner.lock();
        let id = EventId(inner.next_id);
        inner.next_id += 1;
        inner.events.push_back(Event::new(id, timestamp, payload));
        while inner.events.len() > self.max_events {
            inner.events.pop_front();
        }
    }
}

/// Fans events out over a tokio broadcast channel. Slow subscribers lag and lose events;
/// publishing never blocks.
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
    next_id: AtomicU64,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, timestamp: Timestamp, payload: EventPayload) {
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // no subscribers is fine
        let _ = self.tx.send(Event::new(id, timestamp, payload));
    }
}

/// Publishes to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, timestamp: Timestamp, payload: EventPayload) {
        for sink in &self.sinks {
            sink.publish(timestamp, payload.clone());
        }
    }
}
