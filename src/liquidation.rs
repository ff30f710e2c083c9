//! Liquidation conditions and the audit trail of forced closes.
//!
//! A position is liquidated when its health (equity / initial margin) falls under
//! `maintenance_margin_rate`. With the default 0.2 that is exactly the point where
//! 80% of the margin is gone, the same loss the liquidation price is computed from.
//! Every attempt, successful or not, leaves one immutable [`LiquidationRecord`].

use crate::ledger::CloseSettlement;
use crate::position::Position;
use crate::types::{AgentId, Asset, LiquidationId, PositionId, Price, Quote, Side, Timestamp};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidationParams {
    pub maintenance_margin_rate: Decimal,
    // charged on notional, out of whatever margin is left
    pub fee_rate: Decimal,
    // records kept in memory; the store keeps all of them
    pub max_records: usize,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self {
            maintenance_margin_rate: dec!(0.2),
            fee_rate: dec!(0.005),
            max_records: 10_000,
        }
    }
}

impl LiquidationParams {
    pub fn fee_for(&self, notional: Quote) -> Quote {
        notional.mul(self.fee_rate)
    }

    pub fn is_liquidatable(&self, health: Decimal) -> bool {
        health < self.maintenance_margin_rate
    }
}

/// Per-position liquidation state. Healthy positions have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationState {
    Healthy,
    Liquidating,
    Executed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LiquidationOutcome {
    Executed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub id: LiquidationId,
    pub position_id: PositionId,
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub size: Quote,
    pub entry_price: Price,
    // None when no usable price could be read
    pub mark_price: Option<Price>,
    pub liquidation_price: Price,
    pub realized_pnl: Quote,
    pub remaining_margin: Quote,
    pub fee_charged: Quote,
    pub returned_to_agent: Quote,
    pub bad_debt: Quote,
    pub outcome: LiquidationOutcome,
    pub attempt: u32,
    pub timestamp: Timestamp,
}

impl LiquidationRecord {
    pub fn executed(
        position: &Position,
        mark_price: Price,
        settlement: &CloseSettlement,
        attempt: u32,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: LiquidationId::new(),
            position_id: position.id,
            agent: position.owner.clone(),
            asset: position.asset.clone(),
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            mark_price: Some(mark_price),
            liquidation_price: position.liquidation_price,
            realized_pnl: settlement.realized_pnl,
            remaining_margin: settlement.remaining_margin,
            fee_charged: settlement.fee_charged,
            returned_to_agent: settlement.returned_to_agent,
            bad_debt: settlement.bad_debt,
            outcome: LiquidationOutcome::Executed,
            attempt,
            timestamp,
        }
    }

    pub fn failed(
        position: &Position,
        mark_price: Option<Price>,
        reason: impl Into<String>,
        attempt: u32,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: LiquidationId::new(),
            position_id: position.id,
            agent: position.owner.clone(),
            asset: position.asset.clone(),
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            mark_price,
            liquidation_price: position.liquidation_price,
            realized_pnl: Quote::zero(),
            remaining_margin: position.margin,
            fee_charged: Quote::zero(),
            returned_to_agent: Quote::zero(),
            bad_debt: Quote::zero(),
            outcome: LiquidationOutcome::Failed { reason: reason.into() },
            attempt,
            timestamp,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.outcome == LiquidationOutcome::Executed
    }
}

/// Liquidation state per position plus a bounded, newest-last tail of records.
pub struct LiquidationBook {
    states: DashMap<PositionId, (LiquidationState, u32)>,
    records: RwLock<VecDeque<LiquidationRecord>>,
    max_records: usize,
}

impl LiquidationBook {
    pub fn new(max_records: usize, history: Vec<LiquidationRecord>) -> Self {
        let mut records: VecDeque<LiquidationRecord> = history.into();
        while records.len() > max_records {
            records.pop_front();
        }
        Self {
            states: DashMap::new(),
            records: RwLock::new(records),
            max_records,
        }
    }

    pub fn state(&self, id: &PositionId) -> LiquidationState {
        self.states
            .get(id)
            .map(|s| s.value().0)
            .unwrap_or(LiquidationState::Healthy)
    }

    pub fn attempts(&self, id: &PositionId) -> u32 {
        self.states.get(id).map(|s| s.value().1).unwrap_or(0)
    }

    /// Healthy/Failed -> Liquidating. Returns the attempt number, or None if already
    /// in flight or done.
    pub fn begin(&self, id: &PositionId) -> Option<u32> {
        let mut entry = self.states.entry(*id).or_insert((LiquidationState::Healthy, 0));
        match entry.0 {
            LiquidationState::Healthy | LiquidationState::Failed => {
                entry.0 = LiquidationState::Liquidating;
                entry.1 += 1;
                Some(entry.1)
            }
            LiquidationState::Liquidating | LiquidationState::Executed => None,
        }
    }

    /// Executed drops the entry: the position is closed and can never begin again.
    pub fn finish(&self, id: &PositionId, state: LiquidationState) {
        if state == LiquidationState::Executed {
            self.states.remove(id);
            return;
        }
        if let Some(mut entry) = self.states.get_mut(id) {
            entry.0 = state;
        }
    }

    // recovered, or closed some other way
    pub fn reset(&self, id: &PositionId) {
        self.states.remove(id);
    }

    /// Positions with a tracked liquidation state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    pub fn push(&self, record: LiquidationRecord) {
        let mut records = self.records.write();
        records.push_back(record);
        while records.len() > self.max_records {
            records.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<LiquidationRecord> {
        self.records.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn for_position(&self, id: &PositionId) -> Vec<LiquidationRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| &r.position_id == id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::calculate_liquidation_price;
    use crate::types::Leverage;

    fn position() -> Position {
        let lev = Leverage::new(dec!(10)).unwrap();
        let entry = Price::new_unchecked(dec!(100));
        Position::new(
            AgentId::new("a1"),
            Asset::new("ETH-PERP"),
            Side::Long,
            Quote::new(dec!(1000)),
            entry,
            lev,
            Quote::new(dec!(100)),
            calculate_liquidation_price(entry, lev, Side::Long, dec!(0.8)),
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn health_threshold() {
        let params = LiquidationParams::default();
        assert!(params.is_liquidatable(dec!(0.19)));
        assert!(!params.is_liquidatable(dec!(0.2)));
        assert_eq!(params.fee_for(Quote::new(dec!(1000))), Quote::new(dec!(5)));
    }

    #[test]
    fn liquidation_price_matches_maintenance_rate() {
        // just past the liquidation price a position is liquidatable, at it it is not yet
        let pos = position();
        let params = LiquidationParams::default();
        assert!(!params.is_liquidatable(pos.health_at(pos.liquidation_price)));
        let below = Price::new_unchecked(pos.liquidation_price.value() - dec!(0.01));
        assert!(params.is_liquidatable(pos.health_at(below)));
    }

    #[test]
    fn state_machine_allows_one_attempt_in_flight() {
        let book = LiquidationBook::new(10, Vec::new());
        let pos = position();

        assert_eq!(book.state(&pos.id), LiquidationState::Healthy);
        assert_eq!(book.begin(&pos.id), Some(1));
        assert_eq!(book.begin(&pos.id), None);

        book.finish(&pos.id, LiquidationState::Failed);
        assert_eq!(book.begin(&pos.id), Some(2));

        assert_eq!(book.attempts(&pos.id), 2);
        assert_eq!(book.begin(&pos.id), None);
        book.finish(&pos.id, LiquidationState::Executed);
        assert_eq!(book.tracked(), 0);
    }

    #[test]
    fn closed_positions_are_forgotten() {
        let book = LiquidationBook::new(10, Vec::new());
        let pos = position();
        book.begin(&pos.id);
        book.finish(&pos.id, LiquidationState::Failed);
        assert_eq!(book.tracked(), 1);

        book.reset(&pos.id);
        assert_eq!(book.tracked(), 0);
        assert_eq!(book.state(&pos.id), LiquidationState::Healthy);
    }

    #[test]
    fn records_bounded_and_newest_first() {
        let book = LiquidationBook::new(2, Vec::new());
        let pos = position();
        for attempt in 1..=3 {
            book.push(LiquidationRecord::failed(
                &pos,
                None,
                "stale price",
                attempt,
                Timestamp::from_millis(attempt as i64),
            ));
        }

        let recent = book.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].attempt, 3);
        assert_eq!(recent[1].attempt, 2);
        assert!(!recent[0].is_executed());
    }
}
