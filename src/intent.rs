//! Resting trade intents and peer-to-peer matching.
//!
//! An intent is a want ("long 500 USD of BTC-PERP at 5x") with its margin and maker
//! fee already locked in the ledger. Takers consume opposite intents of the same
//! asset oldest first, at the oracle mark: there is no price to cross, so time is the
//! only priority. The book does no ledger work itself; it hands back what each fill
//! consumed so the caller can move the money, and takes it back if that fails.

use crate::types::{AgentId, Asset, IntentId, Leverage, Quote, Side, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

// closed intents kept for lookups
const MAX_CLOSED_HISTORY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Open,
    Matched,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: IntentId,
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub size: Quote,
    pub remaining: Quote,
    pub leverage: Leverage,
    // margin still reserved for the unfilled remainder
    pub locked_margin: Quote,
    // maker fee still reserved for the unfilled remainder
    pub locked_fee: Quote,
    pub status: IntentStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    seq: u64,
}

impl TradeIntent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: AgentId,
        asset: Asset,
        side: Side,
        size: Quote,
        leverage: Leverage,
        locked_margin: Quote,
        locked_fee: Quote,
        created_at: Timestamp,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            id: IntentId::new(),
            agent,
            asset,
            side,
            size,
            remaining: size,
            leverage,
            locked_margin,
            locked_fee,
            status: IntentStatus::Open,
            created_at,
            expires_at,
            seq: 0,
        }
    }

    pub fn filled(&self) -> Quote {
        self.size.sub(self.remaining)
    }

    pub fn is_open(&self) -> bool {
        self.status == IntentStatus::Open
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn reserved(&self) -> Quote {
        self.locked_margin.add(self.locked_fee)
    }

    fn can_fill(&self, taker: &AgentId, asset: &Asset, taker_side: Side, now: Timestamp) -> bool {
        self.is_open()
            && &self.agent != taker
            && &self.asset == asset
            && self.side == taker_side.opposite()
            && !self.is_expired(now)
            && self.remaining.is_positive()
    }
}

/// One maker's share of a taker's trade.
#[derive(Debug, Clone)]
pub struct MakerFill {
    pub intent_id: IntentId,
    pub maker: AgentId,
    pub side: Side,
    pub notional: Quote,
    pub leverage: Leverage,
    // reserved funds this fill consumes
    pub margin: Quote,
    pub fee: Quote,
    pub completed: bool,
}

/// An intent taken off the book with whatever it still had reserved.
#[derive(Debug, Clone)]
pub struct ClosedIntent {
    pub intent: TradeIntent,
    pub refund: Quote,
}

#[derive(Default)]
struct BookInner {
    open: HashMap<IntentId, TradeIntent>,
    // matched, cancelled and expired intents, oldest first
    closed: VecDeque<TradeIntent>,
    open_count: HashMap<AgentId, usize>,
    next_seq: u64,
}

impl BookInner {
    fn retire(&mut self, intent: TradeIntent) {
        if let Some(count) = self.open_count.get_mut(&intent.agent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open_count.remove(&intent.agent);
            }
        }
        self.closed.push_back(intent);
        while self.closed.len() > MAX_CLOSED_HISTORY {
            self.closed.pop_front();
        }
    }

    fn reopen(&mut self, intent: TradeIntent) {
        *self.open_count.entry(intent.agent.clone()).or_default() += 1;
        self.open.insert(intent.id, intent);
    }
}

pub struct IntentBook {
    inner: Mutex<BookInner>,
    max_open_per_agent: usize,
}

impl IntentBook {
    pub fn new(max_open_per_agent: usize) -> Self {
        Self {
            inner: Mutex::new(BookInner::default()),
            max_open_per_agent,
        }
    }

    pub fn post(&self, mut intent: TradeIntent) -> Result<TradeIntent, String> {
        let mut inner = self.inner.lock();
        let open = inner.open_count.get(&intent.agent).copied().unwrap_or(0);
        if open >= self.max_open_per_agent {
            return Err(format!(
                "{} already has {} open intents (max {})",
                intent.agent, open, self.max_open_per_agent
            ));
        }
        intent.seq = inner.next_seq;
        inner.next_seq += 1;
        inner.reopen(intent.clone());
        Ok(intent)
    }

    /// Open intents and the most recent closed ones.
    pub fn get(&self, id: &IntentId) -> Option<TradeIntent> {
        let inner = self.inner.lock();
        inner
            .open
            .get(id)
            .or_else(|| inner.closed.iter().rev().find(|i| &i.id == id))
            .cloned()
    }

    pub fn open_for(&self, agent: &AgentId) -> Vec<TradeIntent> {
        let inner = self.inner.lock();
        let mut out: Vec<TradeIntent> = inner
            .open
            .values()
            .filter(|i| &i.agent == agent)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.seq);
        out
    }

    /// Unfilled notional `agent` has resting on the book.
    pub fn open_notional(&self, agent: &AgentId) -> Quote {
        self.inner
            .lock()
            .open
            .values()
            .filter(|i| &i.agent == agent)
            .map(|i| i.remaining)
            .sum()
    }

    /// Notional resting on the book that `taker` could fill right now.
    pub fn matchable(&self, taker: &AgentId, asset: &Asset, side: Side, now: Timestamp) -> Quote {
        self.inner
            .lock()
            .open
            .values()
            .filter(|i| i.can_fill(taker, asset, side, now))
            .map(|i| i.remaining)
            .sum()
    }

    /// Consume up to `notional` of opposite intents, oldest first. Reserved margin and
    /// fee are consumed pro rata; the last fill of an intent takes whatever is left.
    pub fn take(
        &self,
        taker: &AgentId,
        asset: &Asset,
        side: Side,
        notional: Quote,
        now: Timestamp,
    ) -> Vec<MakerFill> {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<(u64, IntentId)> = inner
            .open
            .values()
            .filter(|i| i.can_fill(taker, asset, side, now))
            .map(|i| (i.seq, i.id))
            .collect();
        candidates.sort();

        let mut fills = Vec::new();
        let mut remaining = notional;
        for (_, id) in candidates {
            if !remaining.is_positive() {
                break;
            }
            let Some(intent) = inner.open.get_mut(&id) else {
                continue;
            };

            let fill = remaining.min(intent.remaining);
            let completed = fill == intent.remaining;
            let (margin, fee) = if completed {
                (intent.locked_margin, intent.locked_fee)
            } else {
                let share = fill.value() / intent.remaining.value();
                (intent.locked_margin.mul(share), intent.locked_fee.mul(share))
            };

            intent.remaining = intent.remaining.sub(fill);
            intent.locked_margin = intent.locked_margin.sub(margin);
            intent.locked_fee = intent.locked_fee.sub(fee);
            remaining = remaining.sub(fill);

            fills.push(MakerFill {
                intent_id: id,
                maker: intent.agent.clone(),
                side: intent.side,
                notional: fill,
                leverage: intent.leverage,
                margin,
                fee,
                completed,
            });

            if completed {
                if let Some(mut done) = inner.open.remove(&id) {
                    done.status = IntentStatus::Matched;
                    inner.retire(done);
                }
            }
        }
        fills
    }

    /// Put a fill back after the ledger refused it. If the intent was cancelled or
    /// expired in the meantime the fill's reservation is returned instead; the caller
    /// must release it.
    pub fn restore(&self, fill: &MakerFill) -> Option<Quote> {
        let mut inner = self.inner.lock();
        if let Some(intent) = inner.open.get_mut(&fill.intent_id) {
            give_back(intent, fill);
            return None;
        }

        // only this fill can have closed a matched intent, so it reopens
        let matched = inner
            .closed
            .iter()
            .rposition(|i| i.id == fill.intent_id && i.status == IntentStatus::Matched);
        let matched = matched.and_then(|pos| inner.closed.remove(pos));
        if let Some(mut intent) = matched {
            give_back(&mut intent, fill);
            intent.status = IntentStatus::Open;
            inner.reopen(intent);
            return None;
        }
        Some(fill.margin.add(fill.fee))
    }

    /// Cancel an open intent of `agent`. Returns what must be released.
    pub fn cancel(&self, agent: &AgentId, id: &IntentId) -> Result<ClosedIntent, CancelError> {
        let mut inner = self.inner.lock();
        if !inner.open.get(id).is_some_and(|i| &i.agent == agent) {
            let closed_own = inner.closed.iter().any(|i| &i.id == id && &i.agent == agent);
            return Err(if closed_own { CancelError::NotOpen } else { CancelError::NotFound });
        }
        let mut intent = inner.open.remove(id).ok_or(CancelError::NotFound)?;
        let closed = close(&mut intent, IntentStatus::Cancelled);
        inner.retire(intent);
        Ok(closed)
    }

    /// Expire every open intent whose deadline passed.
    pub fn expire(&self, now: Timestamp) -> Vec<ClosedIntent> {
        let mut inner = self.inner.lock();
        let mut due: Vec<(u64, IntentId)> = inner
            .open
            .values()
            .filter(|i| i.is_expired(now))
            .map(|i| (i.seq, i.id))
            .collect();
        due.sort();

        let mut expired = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(mut intent) = inner.open.remove(&id) {
                expired.push(close(&mut intent, IntentStatus::Expired));
                inner.retire(intent);
            }
        }
        expired
    }

    /// Open intents on the book.
    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn closed_len(&self) -> usize {
        self.inner.lock().closed.len()
    }
}

fn give_back(intent: &mut TradeIntent, fill: &MakerFill) {
    intent.remaining = intent.remaining.add(fill.notional);
    intent.locked_margin = intent.locked_margin.add(fill.margin);
    intent.locked_fee = intent.locked_fee.add(fill.fee);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    NotFound,
    NotOpen,
}

fn close(intent: &mut TradeIntent, status: IntentStatus) -> ClosedIntent {
    let refund = intent.reserved();
    intent.locked_margin = Quote::zero();
    intent.locked_fee = Quote::zero();
    intent.status = status;
    ClosedIntent {
        intent: intent.clone(),
        refund,
    }
}
