//! Per-agent risk limits.
//!
//! Every trade passes through [`RiskManager::reserve_trade`] before any money moves.
//! Limits cover single-position size, aggregate exposure, leverage, daily loss
//! (absolute and relative to start-of-day equity), drawdown from peak equity and
//! trade frequency. All violations are reported together so an agent can fix its
//! request in one round trip.

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::types::{AgentId, Quote, Side, Timestamp};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

/// Limits applied to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Largest notional for a single trade.
    pub max_position_size: Quote,
    /// Largest sum of open notional across all positions.
    pub max_total_exposure: Quote,
    pub max_leverage: Decimal,
    /// Realized loss since UTC midnight that blocks new trades.
    pub max_daily_loss: Quote,
    /// Same, as a fraction of start-of-day equity (0.1 = 10%).
    pub max_daily_loss_pct: Decimal,
    /// Drop from peak equity that blocks new trades (0.25 = 25%).
    pub max_drawdown_pct: Decimal,
    pub max_trades_per_minute: u32,
    pub max_trades_per_hour: u32,
    pub max_trades_per_day: u32,
    /// Minimum gap between two trades in milliseconds.
    pub min_trade_interval_ms: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: Quote::new(dec!(10_000)),
            max_total_exposure: Quote::new(dec!(50_000)),
            max_leverage: dec!(20),
            max_daily_loss: Quote::new(dec!(1_000)),
            max_daily_loss_pct: dec!(0.10),
            max_drawdown_pct: dec!(0.25),
            max_trades_per_minute: 10,
            max_trades_per_hour: 100,
            max_trades_per_day: 500,
            min_trade_interval_ms: 1_000,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), String> {
        if !self.max_position_size.is_positive() || !self.max_total_exposure.is_positive() {
            return Err("size and exposure limits must be positive".to_string());
        }
        if self.max_position_size > self.max_total_exposure {
            return Err("max position size exceeds max total exposure".to_string());
        }
        if self.max_leverage < Decimal::ONE {
            return Err("max leverage must be at least 1x".to_string());
        }
        if !self.max_daily_loss.is_positive() {
            return Err("max daily loss must be positive".to_string());
        }
        for pct in [self.max_daily_loss_pct, self.max_drawdown_pct] {
            if pct <= Decimal::ZERO || pct > Decimal::ONE {
                return Err("percentage limits must be in (0, 1]".to_string());
            }
        }
        if self.max_trades_per_minute > self.max_trades_per_hour
            || self.max_trades_per_hour > self.max_trades_per_day
        {
            return Err("trade frequency caps must widen with the window".to_string());
        }
        if self.min_trade_interval_ms < 0 {
            return Err("min trade interval must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

/// One reason a trade was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RiskViolation {
    #[error("size must be positive")]
    NonPositiveSize,
    #[error("size {size} above max position size {max}")]
    PositionTooLarge { size: Quote, max: Quote },
    #[error("leverage must be at least 1x")]
    LeverageTooLow,
    #[error("leverage {leverage}x above max {max}x")]
    LeverageTooHigh { leverage: Decimal, max: Decimal },
    #[error("exposure would reach {exposure_after}, max {max}")]
    ExposureExceeded { exposure_after: Quote, max: Quote },
    #[error("daily pnl {daily_pnl} beyond max daily loss {max}")]
    DailyLossExceeded { daily_pnl: Quote, max: Quote },
    #[error("daily loss {loss_pct} of start-of-day equity beyond {max}")]
    DailyLossPctExceeded { loss_pct: Decimal, max: Decimal },
    #[error("drawdown {drawdown} from peak beyond {max}")]
    DrawdownExceeded { drawdown: Decimal, max: Decimal },
    #[error("{count} trades in the last {window}, max {max}")]
    TradeRateExceeded { window: RateWindow, count: u32, max: u32 },
    #[error("last trade {elapsed_ms}ms ago, min interval {min_ms}ms")]
    TradeTooSoon { elapsed_ms: i64, min_ms: i64 },
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateWindow::Minute => f.write_str("minute"),
            RateWindow::Hour => f.write_str("hour"),
            RateWindow::Day => f.write_str("day"),
        }
    }
}

/// Result of a risk check.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskCheck {
    pub allowed: bool,
    pub violations: Vec<RiskViolation>,
}

impl RiskCheck {
    pub fn into_result(self) -> CoreResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(CoreError::RiskLimitViolation(self.violations))
        }
    }
}

/// Rolling per-agent state the limits are checked against.
#[derive(Debug, Clone)]
pub struct AgentRiskState {
    /// Custom limits; `None` means the manager defaults apply.
    pub limits: Option<RiskLimits>,
    /// Trade timestamps inside the last 24h, oldest first.
    pub trades: VecDeque<Timestamp>,
    pub last_trade: Option<Timestamp>,
    pub day: i64,
    pub daily_pnl: Quote,
    pub day_start_equity: Quote,
    pub current_equity: Quote,
    pub peak_equity: Quote,
    /// Notional of reserved trades whose positions are not open yet.
    pub pending_exposure: Quote,
}

/// A trade slot and exposure held by [`RiskManager::reserve_trade`]. Dropping it
/// without [`commit`](TradeReservation::commit) gives both back.
#[must_use = "dropping a reservation cancels it"]
pub struct TradeReservation<'a> {
    manager: &'a RiskManager,
    agent: AgentId,
    size: Quote,
    at: Timestamp,
    previous_last_trade: Option<Timestamp>,
    committed: bool,
}

impl TradeReservation<'_> {
    /// The trade happened; its exposure now lives in a position or a resting intent.
    pub fn commit(mut self) {
        self.committed = true;
        self.manager.release_pending(&self.agent, self.size);
    }
}

impl fmt::Debug for TradeReservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeReservation")
            .field("agent", &self.agent)
            .field("size", &self.size)
            .field("at", &self.at)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for TradeReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.rollback(self);
        }
    }
}

impl AgentRiskState {
    fn new(now: Timestamp) -> Self {
        Self {
            limits: None,
            trades: VecDeque::new(),
            last_trade: None,
            day: now.day_index(),
            daily_pnl: Quote::zero(),
            day_start_equity: Quote::zero(),
            current_equity: Quote::zero(),
            peak_equity: Quote::zero(),
            pending_exposure: Quote::zero(),
        }
    }

    /// Reset the daily counters when UTC midnight has passed.
    fn roll(&mut self, now: Timestamp) {
        let today = now.day_index();
        if today != self.day {
            self.day = today;
            self.daily_pnl = Quote::zero();
            self.day_start_equity = self.current_equity;
        }
        let cutoff = now.as_millis() - DAY_MS;
        while self.trades.front().is_some_and(|t| t.as_millis() <= cutoff) {
            self.trades.pop_front();
        }
    }

    fn trades_within(&self, now: Timestamp, window_ms: i64) -> u32 {
        let cutoff = now.as_millis() - window_ms;
        self.trades.iter().filter(|t| t.as_millis() > cutoff).count() as u32
    }

    pub fn drawdown(&self) -> Decimal {
        if !self.peak_equity.is_positive() {
            return Decimal::ZERO;
        }
        let dd = (self.peak_equity.value() - self.current_equity.value()) / self.peak_equity.value();
        dd.max(Decimal::ZERO)
    }
}

/// Risk gate shared by every request path.
pub struct RiskManager {
    default_limits: RiskLimits,
    agents: DashMap<AgentId, AgentRiskState>,
    clock: Arc<dyn Clock>,
}

impl RiskManager {
    pub fn new(default_limits: RiskLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_limits,
            agents: DashMap::new(),
            clock,
        }
    }

    pub fn limits(&self, agent: &AgentId) -> RiskLimits {
        self.agents
            .get(agent)
            .and_then(|s| s.limits.clone())
            .unwrap_or_else(|| self.default_limits.clone())
    }

    pub fn set_limits(&self, agent: &AgentId, limits: RiskLimits) -> CoreResult<()> {
        limits.validate().map_err(CoreError::Validation)?;
        let now = self.clock.now();
        self.agents
            .entry(agent.clone())
            .or_insert_with(|| AgentRiskState::new(now))
            .limits = Some(limits);
        debug!(agent = %agent, "risk limits updated");
        Ok(())
    }

    pub fn state(&self, agent: &AgentId) -> Option<AgentRiskState> {
        self.agents.get(agent).map(|s| s.value().clone())
    }

    /// Check a prospective trade of `size` notional at `leverage`.
    /// `current_exposure` is the agent's open notional before this trade.
    /// Nothing is recorded; see [`RiskManager::reserve_trade`].
    pub fn check_trade(
        &self,
        agent: &AgentId,
        size: Quote,
        leverage: Decimal,
        side: Side,
        current_exposure: Quote,
    ) -> RiskCheck {
        let now = self.clock.now();
        let limits = self.limits(agent);
        let violations = match self.agents.get_mut(agent) {
            Some(mut state) => {
                let exposure = current_exposure.add(state.pending_exposure);
                evaluate(&limits, &mut state, now, size, leverage, exposure)
            }
            None => evaluate(&limits, &mut AgentRiskState::new(now), now, size, leverage, current_exposure),
        };
        self.log_rejection(agent, side, size, leverage, &violations);
        RiskCheck {
            allowed: violations.is_empty(),
            violations,
        }
    }

    /// Check a trade and, if allowed, take its trade slot and exposure in the same
    /// step. Concurrent reservations for one agent see each other.
    pub fn reserve_trade(
        &self,
        agent: &AgentId,
        size: Quote,
        leverage: Decimal,
        side: Side,
        current_exposure: Quote,
    ) -> CoreResult<TradeReservation<'_>> {
        let now = self.clock.now();
        let violations = {
            let mut state = self
                .agents
                .entry(agent.clone())
                .or_insert_with(|| AgentRiskState::new(now));
            let limits = state.limits.clone().unwrap_or_else(|| self.default_limits.clone());
            let exposure = current_exposure.add(state.pending_exposure);
            let violations = evaluate(&limits, &mut state, now, size, leverage, exposure);
            if violations.is_empty() {
                let previous_last_trade = state.last_trade;
                state.trades.push_back(now);
                state.last_trade = Some(now);
                state.pending_exposure = state.pending_exposure.add(size);
                return Ok(TradeReservation {
                    manager: self,
                    agent: agent.clone(),
                    size,
                    at: now,
                    previous_last_trade,
                    committed: false,
                });
            }
            violations
        };
        self.log_rejection(agent, side, size, leverage, &violations);
        Err(CoreError::RiskLimitViolation(violations))
    }

    fn release_pending(&self, agent: &AgentId, size: Quote) {
        if let Some(mut state) = self.agents.get_mut(agent) {
            state.pending_exposure = state.pending_exposure.sub(size).max(Quote::zero());
        }
    }

    fn rollback(&self, reservation: &TradeReservation<'_>) {
        let Some(mut state) = self.agents.get_mut(&reservation.agent) else {
            return;
        };
        state.pending_exposure = state.pending_exposure.sub(reservation.size).max(Quote::zero());
        if let Some(pos) = state.trades.iter().rposition(|t| *t == reservation.at) {
            state.trades.remove(pos);
        }
        if state.last_trade == Some(reservation.at) {
            state.last_trade = reservation.previous_last_trade;
        }
        debug!(agent = %reservation.agent, size = %reservation.size, "risk reservation released");
    }

    fn log_rejection(
        &self,
        agent: &AgentId,
        side: Side,
        size: Quote,
        leverage: Decimal,
        violations: &[RiskViolation],
    ) {
        if !violations.is_empty() {
            warn!(
                agent = %agent,
                side = %side,
                size = %size,
                leverage = %leverage,
                violations = violations.len(),
                "trade rejected by risk limits"
            );
        }
    }

    pub fn record_realized_pnl(&self, agent: &AgentId, pnl: Quote) {
        let now = self.clock.now();
        let mut state = self
            .agents
            .entry(agent.clone())
            .or_insert_with(|| AgentRiskState::new(now));
        state.roll(now);
        state.daily_pnl = state.daily_pnl.add(pnl);
    }

    /// Record the agent's current equity; tracks the peak for drawdown.
    pub fn record_equity(&self, agent: &AgentId, equity: Quote) {
        let now = self.clock.now();
        let mut state = self
            .agents
            .entry(agent.clone())
            .or_insert_with(|| {
                let mut s = AgentRiskState::new(now);
                s.day_start_equity = equity;
                s
            });
        state.roll(now);
        state.current_equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        if state.day_start_equity.is_zero() {
            state.day_start_equity = equity;
        }
    }

    /// Deposits and withdrawals move equity without being pnl. The reference points
    /// move with them so drawdown and daily loss only see trading results.
    pub fn record_capital_flow(&self, agent: &AgentId, delta: Quote) {
        let now = self.clock.now();
        let mut state = self
            .agents
            .entry(agent.clone())
            .or_insert_with(|| AgentRiskState::new(now));
        state.roll(now);
        state.current_equity = state.current_equity.add(delta);
        state.peak_equity = state.peak_equity.add(delta).max(Quote::zero());
        state.day_start_equity = state.day_start_equity.add(delta).max(Quote::zero());
    }

    pub fn daily_pnl(&self, agent: &AgentId) -> Quote {
        self.agents
            .get(agent)
            .map(|s| s.daily_pnl)
            .unwrap_or_default()
    }

    /// 0..=100. Weighted utilization of the agent's limits: leverage 40%, exposure 25%,
    /// daily loss 20%, drawdown 15%.
    pub fn risk_score(&self, agent: &AgentId, exposure: Quote, max_open_leverage: Decimal) -> u8 {
        let limits = self.limits(agent);
        let (daily_pnl, drawdown) = self
            .agents
            .get(agent)
            .map(|s| (s.daily_pnl, s.drawdown()))
            .unwrap_or((Quote::zero(), Decimal::ZERO));

        let leverage_util = utilization(max_open_leverage, limits.max_leverage);
        let exposure_util = utilization(exposure.value(), limits.max_total_exposure.value());
        let loss_util = utilization(
            daily_pnl.negate().value().max(Decimal::ZERO),
            limits.max_daily_loss.value(),
        );
        let drawdown_util = utilization(drawdown, limits.max_drawdown_pct);

        let score = (leverage_util * dec!(0.40)
            + exposure_util * dec!(0.25)
            + loss_util * dec!(0.20)
            + drawdown_util * dec!(0.15))
            * dec!(100);

        score
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_u8()
            .unwrap_or(100)
            .min(100)
    }
}

fn evaluate(
    limits: &RiskLimits,
    state: &mut AgentRiskState,
    now: Timestamp,
    size: Quote,
    leverage: Decimal,
    current_exposure: Quote,
) -> Vec<RiskViolation> {
    let mut violations = Vec::new();
    state.roll(now);

    if !size.is_positive() {
        violations.push(RiskViolation::NonPositiveSize);
    } else if size > limits.max_position_size {
        violations.push(RiskViolation::PositionTooLarge {
            size,
            max: limits.max_position_size,
        });
    }

    if leverage < Decimal::ONE {
        violations.push(RiskViolation::LeverageTooLow);
    } else if leverage > limits.max_leverage {
        violations.push(RiskViolation::LeverageTooHigh {
            leverage,
            max: limits.max_leverage,
        });
    }

    let exposure_after = current_exposure.add(size.max(Quote::zero()));
    if exposure_after > limits.max_total_exposure {
        violations.push(RiskViolation::ExposureExceeded {
            exposure_after,
            max: limits.max_total_exposure,
        });
    }

    if state.daily_pnl.negate() > limits.max_daily_loss {
        violations.push(RiskViolation::DailyLossExceeded {
            daily_pnl: state.daily_pnl,
            max: limits.max_daily_loss,
        });
    }

    if state.day_start_equity.is_positive() && state.daily_pnl.is_negative() {
        let loss_pct = state.daily_pnl.negate().value() / state.day_start_equity.value();
        if loss_pct > limits.max_daily_loss_pct {
            violations.push(RiskViolation::DailyLossPctExceeded {
                loss_pct,
                max: limits.max_daily_loss_pct,
            });
        }
    }

    let drawdown = state.drawdown();
    if drawdown > limits.max_drawdown_pct {
        violations.push(RiskViolation::DrawdownExceeded {
            drawdown,
            max: limits.max_drawdown_pct,
        });
    }

    let windows = [
        (RateWindow::Minute, MINUTE_MS, limits.max_trades_per_minute),
        (RateWindow::Hour, HOUR_MS, limits.max_trades_per_hour),
        (RateWindow::Day, DAY_MS, limits.max_trades_per_day),
    ];
    for (window, window_ms, max) in windows {
        let count = state.trades_within(now, window_ms);
        if count >= max {
            violations.push(RiskViolation::TradeRateExceeded { window, count, max });
        }
    }

    if let Some(last) = state.last_trade {
        let elapsed_ms = now.millis_since(last);
        if elapsed_ms < limits.min_trade_interval_ms {
            violations.push(RiskViolation::TradeTooSoon {
                elapsed_ms,
                min_ms: limits.min_trade_interval_ms,
            });
        }
    }
    violations
}

fn utilization(value: Decimal, limit: Decimal) -> Decimal {
    if limit <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (value / limit).max(Decimal::ZERO).min(Decimal::ONE)
}
