//! Position lifecycle: open, mark, close, protective triggers.

use super::core::Exchange;
use super::results::PositionSweepResult;
use crate::clock::Clock;
use crate::config::PositionConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{
    CloseReason, EventPayload, EventSink, MarginWarningEvent, PositionClosedEvent, PositionOpenedEvent,
    PositionUpdatedEvent, TriggerEvent,
};
use crate::ledger::{CloseSettlement, Ledger};
use crate::locks::KeyedLocks;
use crate::position::{
    calculate_liquidation_price, default_stop_loss, default_take_profit, validate_stop_loss,
    validate_take_profit, Position,
};
use crate::store::Store;
use crate::types::{AgentId, Asset, Leverage, PositionId, Price, Quote, Side};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where an opening position's margin comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarginSource {
    // lock size / leverage from the owner's available balance
    Lock,
    // margin was reserved earlier (a resting intent); take over exactly this amount
    AlreadyLocked(Quote),
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub agent: AgentId,
    pub asset: Asset,
    pub side: Side,
    pub size: Quote,
    pub entry_price: Price,
    pub leverage: Decimal,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub margin_source: MarginSource,
}

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub position: Position,
    pub closed_size: Quote,
    pub exit_price: Price,
    pub reason: CloseReason,
    pub settlement: CloseSettlement,
    pub fully_closed: bool,
}

impl CloseOutcome {
    pub fn realized_pnl(&self) -> Quote {
        self.settlement.realized_pnl
    }
}

pub struct PositionManager {
    positions: DashMap<PositionId, Position>,
    locks: KeyedLocks<PositionId>,
    ledger: Arc<Ledger>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: PositionConfig,
    fee_account: AgentId,
}

impl PositionManager {
    /// Reloads every persisted position, open or closed.
    pub fn new(
        config: PositionConfig,
        fee_account: AgentId,
        ledger: Arc<Ledger>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let positions = DashMap::new();
        for position in store.load_positions()? {
            positions.insert(position.id, position);
        }
        debug!(positions = positions.len(), "positions loaded");
        Ok(Self {
            positions,
            locks: KeyedLocks::new(),
            ledger,
            store,
            events,
            clock,
            config,
            fee_account,
        })
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    pub fn open(&self, req: OpenRequest) -> CoreResult<Position> {
        if !self.config.is_supported(&req.asset) {
            return Err(CoreError::Validation(format!("asset {} is not supported", req.asset)));
        }
        if !req.size.is_positive() {
            return Err(CoreError::Validation(format!("size must be positive, got {}", req.size)));
        }
        let leverage = Leverage::new(req.leverage)
            .filter(|l| l.value() <= self.config.max_leverage)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "leverage {} outside 1..={}",
                    req.leverage, self.config.max_leverage
                ))
            })?;

        // explicit levels are checked, defaults are derived from entry
        if let Some(sl) = req.stop_loss {
            validate_stop_loss(req.side, req.entry_price, sl).map_err(CoreError::Validation)?;
        }
        if let Some(tp) = req.take_profit {
            validate_take_profit(req.side, req.entry_price, tp).map_err(CoreError::Validation)?;
        }
        let stop_loss = req.stop_loss.or_else(|| {
            self.config
                .default_stop_loss_pct
                .and_then(|pct| default_stop_loss(req.entry_price, req.side, pct))
        });
        let take_profit = req.take_profit.or_else(|| {
            self.config
                .default_take_profit_pct
                .and_then(|pct| default_take_profit(req.entry_price, req.side, pct))
        });

        let (margin, locked_here) = match req.margin_source {
            MarginSource::Lock => {
                let margin = leverage.margin_for(req.size);
                self.ledger.lock(&req.agent, margin)?;
                (margin, true)
            }
            MarginSource::AlreadyLocked(margin) => (margin, false),
        };

        let liquidation_price = calculate_liquidation_price(
            req.entry_price,
            leverage,
            req.side,
            self.config.liquidation_loss_threshold,
        );
        let now = self.clock.now();
        let mut position = Position::new(
            req.agent.clone(),
            req.asset.clone(),
            req.side,
            req.size,
            req.entry_price,
            leverage,
            margin,
            liquidation_price,
            now,
        );
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;

        if let Err(e) = self.store.save_position(&position) {
            if locked_here {
                if let Err(unlock_err) = self.ledger.unlock(&req.agent, margin) {
                    error!(agent = %req.agent, error = %unlock_err, "margin release after failed open");
                }
            }
            return Err(e.into());
        }
        self.positions.insert(position.id, position.clone());

        info!(
            position = %position.id,
            agent = %position.owner,
            asset = %position.asset,
            side = %position.side,
            size = %position.size,
            entry = %position.entry_price,
            leverage = %position.leverage,
            "position opened"
        );
        self.events.publish(
            now,
            EventPayload::PositionOpened(PositionOpenedEvent {
                position_id: position.id,
                agent: position.owner.clone(),
                asset: position.asset.clone(),
                side: position.side,
                size: position.size,
                entry_price: position.entry_price,
                leverage: position.leverage,
                margin,
                liquidation_price,
            }),
        );
        Ok(position)
    }

    pub fn get(&self, id: &PositionId) -> Option<Position> {
        self.positions.get(id).map(|p| p.value().clone())
    }

    /// Positions owned by `agent`, oldest first.
    pub fn positions_for(&self, agent: &AgentId, include_closed: bool) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| &p.owner == agent && (include_closed || p.is_open))
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.opened_at);
        out
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.is_open)
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.opened_at);
        out
    }

    pub fn open_positions_in(&self, asset: &Asset) -> Vec<Position> {
        self.open_positions()
            .into_iter()
            .filter(|p| &p.asset == asset)
            .collect()
    }

    // summed open notional
    pub fn exposure(&self, agent: &AgentId) -> Quote {
        self.positions
            .iter()
            .filter(|p| p.is_open && &p.owner == agent)
            .map(|p| p.size)
            .sum()
    }

    pub fn max_open_leverage(&self, agent: &AgentId) -> Decimal {
        self.positions
            .iter()
            .filter(|p| p.is_open && &p.owner == agent)
            .map(|p| p.leverage.value())
            .max()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn unrealized_pnl(&self, agent: &AgentId) -> Quote {
        self.positions
            .iter()
            .filter(|p| p.is_open && &p.owner == agent)
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    /// Re-mark every open position in `asset`. Returns the updated positions.
    pub fn update_price(&self, asset: &Asset, price: Price) -> Vec<Position> {
        let now = self.clock.now();
        // collect ids first: get_mut while iterating the same map can deadlock a shard
        let ids: Vec<PositionId> = self
            .positions
            .iter()
            .filter(|p| p.is_open && &p.asset == asset)
            .map(|p| p.id)
            .collect();

        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let marked = self.locks.with_lock(&id, || {
                let mut entry = self.positions.get_mut(&id)?;
                if !entry.is_open {
                    return None;
                }
                entry.mark_to(price, now);
                Some(entry.value().clone())
            });
            updated.extend(marked);
        }
        updated
    }

    pub fn close(&self, id: &PositionId, exit_price: Price, reason: CloseReason) -> CoreResult<CloseOutcome> {
        self.close_fraction(id, Decimal::ONE, exit_price, reason, Quote::zero())
    }

    /// Close `pct` (0, 1] of the position. 1 closes it fully.
    pub fn close_partial(
        &self,
        id: &PositionId,
        pct: Decimal,
        exit_price: Price,
        reason: CloseReason,
    ) -> CoreResult<CloseOutcome> {
        if pct <= Decimal::ZERO || pct > Decimal::ONE {
            return Err(CoreError::Validation(format!("close fraction must be in (0, 1], got {}", pct)));
        }
        self.close_fraction(id, pct, exit_price, reason, Quote::zero())
    }

    /// Full close with a fee charged to the owner (liquidations).
    pub fn close_with_fee(
        &self,
        id: &PositionId,
        exit_price: Price,
        reason: CloseReason,
        fee: Quote,
    ) -> CoreResult<CloseOutcome> {
        self.close_fraction(id, Decimal::ONE, exit_price, reason, fee)
    }

    fn close_fraction(
        &self,
        id: &PositionId,
        fraction: Decimal,
        exit_price: Price,
        reason: CloseReason,
        fee: Quote,
    ) -> CoreResult<CloseOutcome> {
        self.locks.with_lock(id, || {
            let mut position = self.get(id).ok_or(CoreError::PositionNotFound(*id))?;
            if !position.is_open {
                return Err(CoreError::PositionClosed(*id));
            }

            let fully_closed = fraction >= Decimal::ONE;
            let (closed_size, closed_margin) = if fully_closed {
                (position.size, position.margin)
            } else {
                (position.size.mul(fraction), position.margin.mul(fraction))
            };
            let pnl = crate::position::calculate_unrealized_pnl(
                position.side,
                closed_size,
                position.entry_price,
                exit_price,
            );

            let settlement = self.ledger.settle_position_close(
                &position.owner,
                closed_margin,
                pnl,
                fee,
                &self.fee_account,
            )?;

            let now = self.clock.now();
            position.realized_pnl = position.realized_pnl.add(settlement.realized_pnl);
            if fully_closed {
                position.is_open = false;
                position.close_price = Some(exit_price);
                position.close_reason = Some(reason);
                position.closed_at = Some(now);
                position.current_price = exit_price;
                position.unrealized_pnl = Quote::zero();
                position.updated_at = now;
            } else {
                position.size = position.size.sub(closed_size);
                position.margin = position.margin.sub(closed_margin);
                position.mark_to(exit_price, now);
            }

            // the ledger has already moved the money; a persistence failure here must not hide that
            if let Err(e) = self.store.save_position(&position) {
                error!(position = %id, error = %e, "closed position not persisted");
            }
            self.positions.insert(*id, position.clone());

            info!(
                position = %id,
                agent = %position.owner,
                reason = %reason,
                exit = %exit_price,
                closed_size = %closed_size,
                pnl = %settlement.realized_pnl,
                "position closed"
            );
            self.events.publish(
                now,
                EventPayload::PositionClosed(PositionClosedEvent {
                    position_id: *id,
                    agent: position.owner.clone(),
                    asset: position.asset.clone(),
                    exit_price,
                    closed_size,
                    realized_pnl: settlement.realized_pnl,
                    returned_to_agent: settlement.returned_to_agent,
                    reason,
                    fully_closed,
                }),
            );

            Ok(CloseOutcome {
                position,
                closed_size,
                exit_price,
                reason,
                settlement,
                fully_closed,
            })
        })
    }

    pub fn set_stop_loss(&self, id: &PositionId, price: Option<Price>) -> CoreResult<Position> {
        self.update_levels(id, |position| {
            if let Some(p) = price {
                validate_stop_loss(position.side, position.entry_price, p).map_err(CoreError::Validation)?;
            }
            position.stop_loss = price;
            Ok(())
        })
    }

    pub fn set_take_profit(&self, id: &PositionId, price: Option<Price>) -> CoreResult<Position> {
        self.update_levels(id, |position| {
            if let Some(p) = price {
                validate_take_profit(position.side, position.entry_price, p).map_err(CoreError::Validation)?;
            }
            position.take_profit = price;
            Ok(())
        })
    }

    fn update_levels(
        &self,
        id: &PositionId,
        f: impl FnOnce(&mut Position) -> CoreResult<()>,
    ) -> CoreResult<Position> {
        self.locks.with_lock(id, || {
            let mut position = self.get(id).ok_or(CoreError::PositionNotFound(*id))?;
            if !position.is_open {
                return Err(CoreError::PositionClosed(*id));
            }
            f(&mut position)?;
            let now = self.clock.now();
            position.updated_at = now;
            self.store.save_position(&position)?;
            self.positions.insert(*id, position.clone());

            self.events.publish(
                now,
                EventPayload::PositionUpdated(PositionUpdatedEvent {
                    position_id: *id,
                    agent: position.owner.clone(),
                    stop_loss: position.stop_loss,
                    take_profit: position.take_profit,
                }),
            );
            Ok(position)
        })
    }

    /// Track funding against a position. Informational, balances move through the ledger.
    /// Same lock as closes, which rewrite the whole position.
    pub(crate) fn record_funding(&self, id: &PositionId, paid: Quote) {
        self.locks.with_lock(id, || {
            if let Some(mut entry) = self.positions.get_mut(id) {
                entry.funding_paid = entry.funding_paid.add(paid);
            }
        });
    }

    // 4.6: stop loss / take profit at the last mark, then margin warnings for what is left
    pub fn sweep(&self) -> PositionSweepResult {
        let mut result = PositionSweepResult::default();
        let now = self.clock.now();

        for position in self.open_positions() {
            let mark = position.current_price;
            let trigger = if let Some(level) = position.stop_loss_hit(mark) {
                Some((CloseReason::StopLoss, level))
            } else {
                position
                    .take_profit_hit(mark)
                    .map(|level| (CloseReason::TakeProfit, level))
            };

            if let Some((reason, level)) = trigger {
                let alert = TriggerEvent {
                    position_id: position.id,
                    agent: position.owner.clone(),
                    asset: position.asset.clone(),
                    trigger_price: level,
                    mark_price: mark,
                };
                match self.close(&position.id, mark, reason) {
                    Ok(outcome) => {
                        let payload = match reason {
                            CloseReason::StopLoss => EventPayload::StopLossTriggered(alert),
                            _ => EventPayload::TakeProfitTriggered(alert),
                        };
                        self.events.publish(now, payload);
                        match reason {
                            CloseReason::StopLoss => result.stop_losses.push(outcome),
                            _ => result.take_profits.push(outcome),
                        }
                    }
                    // closed concurrently (user close or liquidation)
                    Err(CoreError::PositionClosed(_)) => {}
                    Err(e) => {
                        warn!(position = %position.id, reason = %reason, error = %e, "trigger close failed");
                        result.failures.push((position.id, e));
                    }
                }
                continue;
            }

            let health = position.health();
            if health < self.config.warning_health {
                self.events.publish(
                    now,
                    EventPayload::MarginWarning(MarginWarningEvent {
                        position_id: position.id,
                        agent: position.owner.clone(),
                        asset: position.asset.clone(),
                        health,
                        equity: position.equity(),
                        margin: position.margin,
                    }),
                );
                result.warnings.push(position.id);
            }
        }

        if !result.is_empty() {
            debug!(
                stop_losses = result.stop_losses.len(),
                take_profits = result.take_profits.len(),
                warnings = result.warnings.len(),
                "position sweep"
            );
        }
        result
    }
}

impl Exchange {
    /// Close `pct` of a position at the current mark. 1 closes it entirely.
    pub fn close_position(&self, id: &PositionId, pct: Decimal) -> CoreResult<CloseOutcome> {
        let position = self.positions.get(id).ok_or(CoreError::PositionNotFound(*id))?;
        if !position.is_open {
            return Err(CoreError::PositionClosed(*id));
        }
        let mark = self.prices.mark(&position.asset)?;
        let outcome = self.positions.close_partial(id, pct, mark, CloseReason::Manual)?;
        self.after_close(&outcome);
        Ok(outcome)
    }

    pub fn set_stop_loss(&self, id: &PositionId, price: Option<Price>) -> CoreResult<Position> {
        self.positions.set_stop_loss(id, price)
    }

    pub fn set_take_profit(&self, id: &PositionId, price: Option<Price>) -> CoreResult<Position> {
        self.positions.set_take_profit(id, price)
    }

    pub fn get_position(&self, id: &PositionId) -> Option<Position> {
        self.positions.get(id)
    }

    /// Open positions of `agent`.
    pub fn get_positions(&self, agent: &AgentId) -> Vec<Position> {
        self.positions.positions_for(agent, false)
    }

    pub fn position_history(&self, agent: &AgentId) -> Vec<Position> {
        self.positions.positions_for(agent, true)
    }

    pub fn run_position_sweep(&self) -> PositionSweepResult {
        let result = self.positions.sweep();
        for outcome in result.stop_losses.iter().chain(result.take_profits.iter()) {
            self.after_close(outcome);
        }
        result
    }

    // realized pnl and the new equity feed the owner's daily loss and drawdown limits
    pub(super) fn after_close(&self, outcome: &CloseOutcome) {
        let owner = &outcome.position.owner;
        if !outcome.position.is_open {
            self.liquidations.reset(&outcome.position.id);
        }
        self.risk.record_realized_pnl(owner, outcome.realized_pnl());
        self.risk.record_equity(owner, self.agent_equity(owner));
    }
}
