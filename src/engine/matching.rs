//! Trade intents: posting, matching and routing.
//!
//! A taker's trade fills against resting opposite intents first, at the oracle mark
//! and the maker fee. Whatever the book cannot fill goes to the external venue at
//! its price and fee. The taker ends up with one position at the size-weighted entry
//! of both legs; every maker gets its own position at the mark.

use super::core::Exchange;
use super::positions::{MarginSource, OpenRequest};
use super::results::{RoutingSummary, TradeFees, TradeResult};
use crate::error::{CoreError, CoreResult};
use crate::events::{
    EventPayload, ExternalFillEvent, IntentCloseReason, IntentClosedEvent, IntentPostedEvent,
    InternalMatchEvent,
};
use crate::intent::{CancelError, ClosedIntent, MakerFill, TradeIntent};
use crate::position::{weighted_entry_price, Position};
use crate::types::{AgentId, Asset, IntentId, Leverage, MatchId, Price, Quote, Side};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info, warn};

impl Exchange {
    /// Rest an intent on the book. Margin for the full size plus the maker fee are
    /// locked now and released again on cancel or expiry. Posting takes a trade slot
    /// and the intent's notional counts as exposure while it rests.
    pub fn post_intent(
        &self,
        agent: &AgentId,
        asset: &Asset,
        side: Side,
        size: Quote,
        leverage: Decimal,
        ttl: Option<Duration>,
    ) -> CoreResult<TradeIntent> {
        self.require_trading_account(agent)?;
        self.require_supported(asset)?;
        let reservation = self
            .risk
            .reserve_trade(agent, size, leverage, side, self.committed_exposure(agent))?;
        let leverage = self.checked_leverage(leverage)?;

        let margin = leverage.margin_for(size);
        let fee = self.router.maker_fee().of(size);
        self.ledger.lock(agent, margin.add(fee))?;

        let now = self.clock.now();
        let ttl_ms = ttl
            .map(|d| d.as_millis() as i64)
            .unwrap_or((self.config.intents.default_ttl_secs as i64) * 1000);
        let intent = TradeIntent::new(
            agent.clone(),
            asset.clone(),
            side,
            size,
            leverage,
            margin,
            fee,
            now,
            now.plus_millis(ttl_ms),
        );
        let intent = match self.intents.post(intent) {
            Ok(intent) => intent,
            Err(reason) => {
                self.release(agent, margin.add(fee));
                return Err(CoreError::Validation(reason));
            }
        };
        reservation.commit();

        info!(intent = %intent.id, agent = %agent, asset = %asset, side = %side, size = %size, "intent posted");
        self.events.publish(
            now,
            EventPayload::IntentPosted(IntentPostedEvent {
                intent_id: intent.id,
                agent: agent.clone(),
                asset: asset.clone(),
                side,
                size,
                expires_at: intent.expires_at,
            }),
        );
        Ok(intent)
    }

    /// Open a position of `size` notional. Matches resting intents first, routes the
    /// rest externally. Fails without side effects when nothing could be filled.
    pub async fn open_intent(
        &self,
        agent: &AgentId,
        asset: &Asset,
        side: Side,
        size: Quote,
        leverage: Decimal,
    ) -> CoreResult<TradeResult> {
        self.require_trading_account(agent)?;
        self.require_supported(asset)?;
        // held across the external leg; every early return below gives it back
        let reservation = self
            .risk
            .reserve_trade(agent, size, leverage, side, self.committed_exposure(agent))?;
        let leverage = self.checked_leverage(leverage)?;
        let mark = self.prices.mark(asset)?;

        // margin for the whole size plus the worst-case taker fee; fees are paid from it
        let margin = leverage.margin_for(size);
        let mut fee_reserve = self.router.taker_fee().of(size);
        self.ledger.lock(agent, margin.add(fee_reserve))?;

        // 1: internal leg
        let now = self.clock.now();
        let fills = self.intents.take(agent, asset, side, size, now);
        let match_id = MatchId::new();
        let mut fees = TradeFees::default();
        let mut internal_filled = Quote::zero();
        let mut counterparty_positions = Vec::new();
        for fill in fills {
            match self.settle_maker_fill(agent, asset, mark, &fill, match_id) {
                Ok(position) => {
                    let fee = self.router.maker_fee().of(fill.notional);
                    let collected = self.collect_taker_fee(agent, fee, &mut fee_reserve, "internal match fee");
                    self.router.record_internal(fill.notional, collected);
                    internal_filled = internal_filled.add(fill.notional);
                    fees.internal = fees.internal.add(collected);
                    counterparty_positions.push(position);
                }
                Err(e) => {
                    warn!(intent = %fill.intent_id, maker = %fill.maker, error = %e, "maker fill refused");
                    if let Some(refund) = self.intents.restore(&fill) {
                        warn!(intent = %fill.intent_id, maker = %fill.maker, refund = %refund, "intent closed during fill, reservation released");
                        self.release(&fill.maker, refund);
                    }
                }
            }
        }
        let mut legs: Vec<(Quote, Price)> = Vec::new();
        if internal_filled.is_positive() {
            legs.push((internal_filled, mark));
        }

        // 2: external leg for whatever the book could not fill
        let mut routing = RoutingSummary {
            internal_filled,
            match_id: internal_filled.is_positive().then_some(match_id),
            ..RoutingSummary::default()
        };
        let remainder = size.sub(internal_filled);
        if remainder.is_positive() {
            match self.router.route(asset, side, remainder).await {
                Ok(fill) => {
                    let fee = fill.fee.unwrap_or_default();
                    fees.external = self.collect_taker_fee(agent, fee, &mut fee_reserve, "external taker fee");
                    self.events.publish(
                        self.clock.now(),
                        EventPayload::ExternalFill(ExternalFillEvent {
                            agent: agent.clone(),
                            asset: asset.clone(),
                            side,
                            venue: fill.venue.clone(),
                            notional: fill.notional,
                            fill_price: fill.fill_price,
                            fee: fees.external,
                        }),
                    );
                    legs.push((fill.notional, fill.fill_price));
                    routing.external_filled = fill.notional;
                    routing.external_fills.push(fill);
                }
                Err(e) if internal_filled.is_zero() => {
                    self.release(agent, margin.add(fee_reserve));
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(agent = %agent, asset = %asset, remainder = %remainder, error = %e, "external leg failed, keeping internal fill");
                }
            }
        }

        // 3: one taker position over both legs; margin for any unfilled part and the
        // unspent fee reserve are released
        let filled = routing.total_filled();
        let taker_margin = if filled == size { margin } else { leverage.margin_for(filled).min(margin) };
        self.release(agent, margin.sub(taker_margin).add(fee_reserve));
        let Some(entry_price) = weighted_entry_price(&legs) else {
            self.release(agent, taker_margin);
            return Err(CoreError::Validation(format!("nothing filled for {} {}", side, asset)));
        };
        let position = match self.positions.open(OpenRequest {
            agent: agent.clone(),
            asset: asset.clone(),
            side,
            size: filled,
            entry_price,
            leverage: leverage.value(),
            stop_loss: None,
            take_profit: None,
            margin_source: MarginSource::AlreadyLocked(taker_margin),
        }) {
            Ok(position) => position,
            Err(e) => {
                error!(agent = %agent, asset = %asset, filled = %filled, error = %e, "taker position not opened after fill");
                self.release(agent, taker_margin);
                return Err(e);
            }
        };

        reservation.commit();
        self.risk.record_equity(agent, self.agent_equity(agent));
        info!(
            position = %position.id,
            agent = %agent,
            asset = %asset,
            side = %side,
            internal = %routing.internal_filled,
            external = %routing.external_filled,
            entry = %entry_price,
            fees = %fees.total(),
            "trade executed"
        );

        Ok(TradeResult {
            success: true,
            position: Some(position),
            fees,
            routing,
            counterparty_positions,
        })
    }

    // open the maker's side of a fill and collect the maker's fee
    fn settle_maker_fill(
        &self,
        taker: &AgentId,
        asset: &Asset,
        mark: Price,
        fill: &MakerFill,
        match_id: MatchId,
    ) -> CoreResult<Position> {
        if &fill.maker == taker {
            return Err(CoreError::SelfTrade(taker.clone()));
        }
        let position = self.positions.open(OpenRequest {
            agent: fill.maker.clone(),
            asset: asset.clone(),
            side: fill.side,
            size: fill.notional,
            entry_price: mark,
            leverage: fill.leverage.value(),
            stop_loss: None,
            take_profit: None,
            margin_source: MarginSource::AlreadyLocked(fill.margin),
        })?;

        // from here on the fill stands; fee problems are logged, never unwound
        if fill.fee.is_positive() {
            let fee_account = self.config.ledger.fee_agent();
            if let Err(e) = self
                .ledger
                .transfer_locked(&fill.maker, &fee_account, fill.fee, "maker fee")
            {
                error!(maker = %fill.maker, fee = %fill.fee, error = %e, "maker fee not collected");
                self.release(&fill.maker, fill.fee);
            }
        }

        let now = self.clock.now();
        self.events.publish(
            now,
            EventPayload::InternalMatch(InternalMatchEvent {
                match_id,
                asset: asset.clone(),
                taker: taker.clone(),
                maker: fill.maker.clone(),
                maker_intent: fill.intent_id,
                notional: fill.notional,
                price: mark,
            }),
        );
        if fill.completed {
            self.events.publish(
                now,
                EventPayload::IntentClosed(IntentClosedEvent {
                    intent_id: fill.intent_id,
                    agent: fill.maker.clone(),
                    reason: IntentCloseReason::Filled,
                    refunded: Quote::zero(),
                }),
            );
        }
        Ok(position)
    }

    // Pay a taker fee out of the locked reserve; anything above it comes from
    // available funds. Returns what was collected.
    fn collect_taker_fee(&self, agent: &AgentId, fee: Quote, reserve: &mut Quote, memo: &str) -> Quote {
        if !fee.is_positive() {
            return Quote::zero();
        }
        let fee_account = self.config.ledger.fee_agent();
        let from_reserve = fee.min(*reserve);
        if from_reserve.is_positive() {
            if let Err(e) = self.ledger.transfer_locked(agent, &fee_account, from_reserve, memo) {
                error!(agent = %agent, fee = %from_reserve, error = %e, "taker fee not collected");
                return Quote::zero();
            }
            *reserve = reserve.sub(from_reserve);
        }
        let beyond = fee.sub(from_reserve);
        if beyond.is_positive() {
            if let Err(e) = self.ledger.transfer_internal(agent, &fee_account, beyond, memo) {
                error!(agent = %agent, fee = %beyond, error = %e, "taker fee above reserve not collected");
                return from_reserve;
            }
        }
        fee
    }

    // open notional plus what is still resting on the book
    fn committed_exposure(&self, agent: &AgentId) -> Quote {
        self.positions.exposure(agent).add(self.intents.open_notional(agent))
    }

    /// Cancel an open intent of `agent` and release what it still had reserved.
    pub fn cancel_intent(&self, agent: &AgentId, id: &IntentId) -> CoreResult<ClosedIntent> {
        let closed = self.intents.cancel(agent, id).map_err(|e| match e {
            CancelError::NotFound => CoreError::IntentNotFound(*id),
            CancelError::NotOpen => CoreError::IntentNotOpen(*id),
        })?;
        self.close_intent(&closed, IntentCloseReason::Cancelled);
        Ok(closed)
    }

    /// Take every expired intent off the book and refund its reservation.
    pub fn expire_intents(&self) -> Vec<ClosedIntent> {
        let expired = self.intents.expire(self.clock.now());
        for closed in &expired {
            self.close_intent(closed, IntentCloseReason::Expired);
        }
        if !expired.is_empty() {
            info!(expired = expired.len(), "intents expired");
        }
        expired
    }

    pub fn get_intent(&self, id: &IntentId) -> Option<TradeIntent> {
        self.intents.get(id)
    }

    /// Open intents of `agent`, oldest first.
    pub fn open_intents(&self, agent: &AgentId) -> Vec<TradeIntent> {
        self.intents.open_for(agent)
    }

    /// Notional `agent` could fill internally right now.
    pub fn matchable_liquidity(&self, agent: &AgentId, asset: &Asset, side: Side) -> Quote {
        self.intents.matchable(agent, asset, side, self.clock.now())
    }

    fn close_intent(&self, closed: &ClosedIntent, reason: IntentCloseReason) {
        let intent = &closed.intent;
        self.release(&intent.agent, closed.refund);
        self.events.publish(
            self.clock.now(),
            EventPayload::IntentClosed(IntentClosedEvent {
                intent_id: intent.id,
                agent: intent.agent.clone(),
                reason,
                refunded: closed.refund,
            }),
        );
    }

    fn require_supported(&self, asset: &Asset) -> CoreResult<()> {
        if !self.config.positions.is_supported(asset) {
            return Err(CoreError::Validation(format!("asset {} is not supported", asset)));
        }
        Ok(())
    }

    fn checked_leverage(&self, leverage: Decimal) -> CoreResult<Leverage> {
        let max = self.config.positions.max_leverage;
        Leverage::new(leverage)
            .filter(|l| l.value() <= max)
            .ok_or_else(|| CoreError::Validation(format!("leverage {} outside 1..={}", leverage, max)))
    }

    fn release(&self, agent: &AgentId, amount: Quote) {
        if !amount.is_positive() {
            return;
        }
        if let Err(e) = self.ledger.unlock(agent, amount) {
            error!(agent = %agent, amount = %amount, error = %e, "reserved funds not released");
        }
    }
}
