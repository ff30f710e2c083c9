//! Funding rate settlement.

use super::core::Exchange;
use super::results::FundingResult;
use crate::error::CoreResult;
use crate::events::{EventPayload, FundingPaymentEvent, FundingRateEvent};
use crate::funding::{
    calculate_funding_payment, calculate_funding_rate, calculate_premium_index, distribute_pro_rata,
    payer_side, FundingRate,
};
use crate::position::Position;
use crate::types::{AgentId, Asset, PositionId, Quote};
use tracing::{debug, info, warn};

impl Exchange {
    /// Compute this interval's rate for `asset` and move the payments.
    /// Payers transfer into the funding pool one by one; whatever was collected is then
    /// split across the receiving side by notional. A payer that cannot pay is counted
    /// and skipped, it never blocks the others.
    pub fn settle_funding(&self, asset: &Asset) -> CoreResult<FundingResult> {
        let snapshot = self.prices.snapshot(asset)?;
        let params = self.funding.params();
        let now = self.clock.now();

        let premium = calculate_premium_index(snapshot.mark, snapshot.index);
        let rate = calculate_funding_rate(premium, params);
        let funding_rate = FundingRate {
            asset: asset.clone(),
            rate,
            premium,
            mark_price: snapshot.mark,
            index_price: snapshot.index,
            computed_at: now,
            next_settlement_at: now.plus_millis(params.interval_ms()),
        };
        self.funding.record(funding_rate.clone());
        self.events.publish(
            now,
            EventPayload::FundingRateUpdated(FundingRateEvent {
                asset: asset.clone(),
                rate,
                premium,
                mark_price: snapshot.mark,
                index_price: snapshot.index,
            }),
        );

        let mut result = FundingResult::new(funding_rate);
        let Some(paying) = payer_side(rate) else {
            debug!(asset = %asset, "zero funding rate, nothing to settle");
            return Ok(result);
        };

        let (payers, receivers): (Vec<Position>, Vec<Position>) = self
            .positions
            .open_positions_in(asset)
            .into_iter()
            .partition(|p| p.side == paying);
        if payers.is_empty() || receivers.is_empty() {
            debug!(asset = %asset, payers = payers.len(), receivers = receivers.len(), "one-sided market, no funding");
            return Ok(result);
        }

        let pool = self.config.ledger.funding_pool_agent();
        let mut collected = Quote::zero();
        for position in &payers {
            let amount = calculate_funding_payment(position.size, rate);
            if !amount.is_positive() {
                continue;
            }
            match self
                .ledger
                .transfer_internal(&position.owner, &pool, amount, "funding payment")
            {
                Ok(_) => {
                    collected = collected.add(amount);
                    self.positions.record_funding(&position.id, amount);
                    self.publish_payment(asset, &position.owner, position.id, amount, rate);
                    result.payers += 1;
                }
                Err(e) => {
                    warn!(agent = %position.owner, position = %position.id, amount = %amount, error = %e, "funding payment failed");
                    result.failures += 1;
                }
            }
        }
        result.total_paid = collected;

        let weights: Vec<((AgentId, PositionId), Quote)> = receivers
            .iter()
            .map(|p| ((p.owner.clone(), p.id), p.size))
            .collect();
        for ((agent, position_id), share) in distribute_pro_rata(collected, &weights) {
            if !share.is_positive() {
                continue;
            }
            match self
                .ledger
                .transfer_internal(&pool, &agent, share, "funding receipt")
            {
                Ok(_) => {
                    result.total_received = result.total_received.add(share);
                    self.positions.record_funding(&position_id, share.negate());
                    self.publish_payment(asset, &agent, position_id, share.negate(), rate);
                    result.receivers += 1;
                }
                Err(e) => {
                    warn!(agent = %agent, position = %position_id, amount = %share, error = %e, "funding receipt failed");
                    result.failures += 1;
                }
            }
        }

        info!(
            asset = %asset,
            rate = %rate,
            paid = %result.total_paid,
            received = %result.total_received,
            failures = result.failures,
            "funding settled"
        );
        Ok(result)
    }

    fn publish_payment(&self, asset: &Asset, agent: &AgentId, position_id: PositionId, amount: Quote, rate: rust_decimal::Decimal) {
        self.events.publish(
            self.clock.now(),
            EventPayload::FundingPayment(FundingPaymentEvent {
                asset: asset.clone(),
                agent: agent.clone(),
                position_id,
                amount,
                rate,
            }),
        );
    }

    /// Settle every supported asset whose interval has elapsed. An asset without a
    /// fresh price keeps its schedule and is retried next run.
    pub fn run_funding_sweep(&self) -> Vec<FundingResult> {
        let now = self.clock.now();
        let mut results = Vec::new();
        for asset in self.config.positions.assets() {
            if !self.funding.is_due(&asset, now) {
                continue;
            }
            match self.settle_funding(&asset) {
                Ok(result) => results.push(result),
                Err(e) => warn!(asset = %asset, error = %e, "funding skipped"),
            }
        }
        results
    }

    pub fn get_funding_rate(&self, asset: &Asset) -> Option<FundingRate> {
        self.funding.current(asset)
    }

    pub fn funding_history(&self, asset: &Asset, limit: usize) -> Vec<FundingRate> {
        self.funding.history(asset, limit)
    }

    /// What `agent` would pay at the next settlement if the current rate held.
    /// Positive = pays, negative = receives.
    pub fn predicted_payment(&self, agent: &AgentId) -> Quote {
        let mut total = Quote::zero();
        for position in self.positions.positions_for(agent, false) {
            let Some(current) = self.funding.current(&position.asset) else {
                continue;
            };
            let Some(paying) = payer_side(current.rate) else {
                continue;
            };

            if position.side == paying {
                total = total.add(calculate_funding_payment(position.size, current.rate));
                continue;
            }

            let (paying_notional, receiving_notional) = self
                .positions
                .open_positions_in(&position.asset)
                .iter()
                .fold((Quote::zero(), Quote::zero()), |(pay, recv), p| {
                    if p.side == paying {
                        (pay.add(p.size), recv)
                    } else {
                        (pay, recv.add(p.size))
                    }
                });
            if !receiving_notional.is_positive() {
                continue;
            }
            let pot = calculate_funding_payment(paying_notional, current.rate);
            let share = pot.value() * position.size.value() / receiving_notional.value();
            total = total.sub(Quote::new(share));
        }
        total
    }
}
