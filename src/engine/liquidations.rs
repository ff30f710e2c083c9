//! Liquidation sweep.

use super::core::Exchange;
use super::results::LiquidationSweepResult;
use crate::error::CoreError;
use crate::events::{BadDebtEvent, CloseReason, EventPayload, LiquidationEvent, LiquidationFailedEvent};
use crate::liquidation::{LiquidationRecord, LiquidationState};
use crate::position::Position;
use crate::types::Price;
use tracing::{debug, error, info, warn};

impl Exchange {
    /// Force-close every open position whose health at the cached mark is under the
    /// maintenance rate. A position that cannot be closed (no fresh price, settlement
    /// error) gets a Failed record and is picked up again next sweep.
    pub fn run_liquidation_sweep(&self) -> LiquidationSweepResult {
        let mut result = LiquidationSweepResult::default();

        for position in self.positions.open_positions() {
            result.checked += 1;
            let params = &self.config.liquidation;

            let mark = match self.prices.mark(&position.asset) {
                Ok(mark) => mark,
                Err(e) => {
                    // without a usable price only flag what already looked underwater
                    if params.is_liquidatable(position.health()) {
                        if let Some(attempt) = self.liquidations.begin(&position.id) {
                            let record = self.fail_liquidation(&position, None, e.to_string(), attempt);
                            result.failed.push(record);
                        }
                    }
                    continue;
                }
            };

            let health = position.health_at(mark);
            if !params.is_liquidatable(health) {
                if self.liquidations.state(&position.id) == LiquidationState::Failed {
                    debug!(position = %position.id, health = %health, "recovered before liquidation");
                    self.liquidations.reset(&position.id);
                }
                continue;
            }

            let Some(attempt) = self.liquidations.begin(&position.id) else {
                continue;
            };
            let fee = params.fee_for(position.size);

            match self
                .positions
                .close_with_fee(&position.id, mark, CloseReason::Liquidation, fee)
            {
                Ok(outcome) => {
                    let now = self.clock.now();
                    let record =
                        LiquidationRecord::executed(&position, mark, &outcome.settlement, attempt, now);
                    self.persist_liquidation(&record);
                    self.liquidations.finish(&position.id, LiquidationState::Executed);
                    self.after_close(&outcome);

                    info!(
                        position = %position.id,
                        agent = %position.owner,
                        mark = %mark,
                        health = %health,
                        fee = %outcome.settlement.fee_charged,
                        "position liquidated"
                    );
                    self.events.publish(
                        now,
                        EventPayload::Liquidation(LiquidationEvent {
                            liquidation_id: record.id,
                            position_id: position.id,
                            agent: position.owner.clone(),
                            asset: position.asset.clone(),
                            mark_price: mark,
                            fee_charged: outcome.settlement.fee_charged,
                            returned_to_agent: outcome.settlement.returned_to_agent,
                        }),
                    );
                    if outcome.settlement.bad_debt.is_positive() {
                        self.events.publish(
                            now,
                            EventPayload::BadDebt(BadDebtEvent {
                                position_id: position.id,
                                agent: position.owner.clone(),
                                amount: outcome.settlement.bad_debt,
                            }),
                        );
                    }
                    result.executed.push(record);
                }
                // closed by its owner or a trigger between the scan and now
                Err(CoreError::PositionClosed(_)) => {
                    self.liquidations.reset(&position.id);
                }
                Err(e) => {
                    let record = self.fail_liquidation(&position, Some(mark), e.to_string(), attempt);
                    result.failed.push(record);
                }
            }
        }

        if !result.executed.is_empty() || !result.failed.is_empty() {
            debug!(
                checked = result.checked,
                executed = result.executed.len(),
                failed = result.failed.len(),
                "liquidation sweep"
            );
        }
        result
    }

    fn fail_liquidation(
        &self,
        position: &Position,
        mark: Option<Price>,
        reason: String,
        attempt: u32,
    ) -> LiquidationRecord {
        let now = self.clock.now();
        warn!(position = %position.id, attempt, reason = %reason, "liquidation failed");
        let record = LiquidationRecord::failed(position, mark, reason.clone(), attempt, now);
        self.persist_liquidation(&record);
        self.liquidations.finish(&position.id, LiquidationState::Failed);
        self.events.publish(
            now,
            EventPayload::LiquidationFailed(LiquidationFailedEvent {
                position_id: position.id,
                agent: position.owner.clone(),
                reason,
                attempt,
            }),
        );
        record
    }

    fn persist_liquidation(&self, record: &LiquidationRecord) {
        if let Err(e) = self.store.append_liquidation(record) {
            error!(position = %record.position_id, error = %e, "liquidation record not persisted");
        }
        self.liquidations.push(record.clone());
    }

    /// Most recent liquidation records, newest first.
    pub fn get_liquidations(&self, limit: usize) -> Vec<LiquidationRecord> {
        self.liquidations.recent(limit)
    }

    pub fn liquidation_state(&self, position: &crate::types::PositionId) -> LiquidationState {
        match self.positions.get(position) {
            Some(p) if !p.is_open && p.close_reason == Some(CloseReason::Liquidation) => LiquidationState::Executed,
            _ => self.liquidations.state(position),
        }
    }

    pub fn tracked_liquidations(&self) -> usize {
        self.liquidations.tracked()
    }
}
