// 5.0: funding rates. every interval one side pays the other to keep the perp near spot.
// rate > 0 means mark above index: longs pay, shorts receive. rate < 0 the reverse.
// 5.1 rate calculation, 5.2 payment and pro-rata split, 5.3 FundingBook keeps rate history.

use crate::types::{Asset, Price, Quote, Side, Timestamp};
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// amounts moved by funding are truncated to this many decimals
pub const FUNDING_DP: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingParams {
    pub interval_hours: i64,
    pub interest_rate: Decimal,
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    // rates kept per asset
    pub history_len: usize,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            interval_hours: 8,
            interest_rate: dec!(0.0001),
            min_rate: dec!(-0.01),
            max_rate: dec!(0.01),
            history_len: 100,
        }
    }
}

impl FundingParams {
    pub fn interval_ms(&self) -> i64 {
        self.interval_hours * 3_600_000
    }

    pub fn periods_per_year(&self) -> Decimal {
        Decimal::from(24 * 365) / Decimal::from(self.interval_hours.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub asset: Asset,
    pub rate: Decimal,
    pub premium: Decimal,
    pub mark_price: Price,
    pub index_price: Price,
    pub computed_at: Timestamp,
    pub next_settlement_at: Timestamp,
}

impl FundingRate {
    pub fn payer_side(&self) -> Option<Side> {
        payer_side(self.rate)
    }
}

// 5.1: how far perp is from spot. positive = perp above spot
pub fn calculate_premium_index(mark_price: Price, index_price: Price) -> Decimal {
    (mark_price.value() - index_price.value()) / index_price.value()
}

pub fn calculate_funding_rate(premium_index: Decimal, params: &FundingParams) -> Decimal {
    let rate = premium_index + params.interest_rate;
    rate.max(params.min_rate).min(params.max_rate)
}

pub fn payer_side(rate: Decimal) -> Option<Side> {
    if rate > Decimal::ZERO {
        Some(Side::Long)
    } else if rate < Decimal::ZERO {
        Some(Side::Short)
    } else {
        None
    }
}

// 5.2: what one position pays (or is owed before the split) for one interval
pub fn calculate_funding_payment(notional: Quote, rate: Decimal) -> Quote {
    truncate(notional.mul(rate.abs()))
}

pub fn truncate(amount: Quote) -> Quote {
    Quote::new(
        amount
            .value()
            .round_dp_with_strategy(FUNDING_DP, RoundingStrategy::ToZero),
    )
}

/// Split `total` across `weights` in proportion. Each share is truncated and the
/// leftover dust goes to the heaviest weight, so the shares always sum to `total`.
pub fn distribute_pro_rata<K: Clone>(total: Quote, weights: &[(K, Quote)]) -> Vec<(K, Quote)> {
    let weight_sum: Quote = weights.iter().map(|(_, w)| *w).sum();
    if weights.is_empty() || !weight_sum.is_positive() || !total.is_positive() {
        return Vec::new();
    }

    let mut shares: Vec<(K, Quote)> = weights
        .iter()
        .map(|(k, w)| {
            let share = truncate(Quote::new(total.value() * w.value() / weight_sum.value()));
            (k.clone(), share)
        })
        .collect();

    let distributed: Quote = shares.iter().map(|(_, s)| *s).sum();
    let dust = total.sub(distributed);
    if !dust.is_zero() {
        let heaviest = weights
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, w))| *w)
            .map(|(i, _)| i)
            .unwrap_or(0);
        shares[heaviest].1 = shares[heaviest].1.add(dust);
    }
    shares
}

pub fn annualized_funding_rate(period_rate: Decimal, params: &FundingParams) -> Decimal {
    period_rate * params.periods_per_year()
}

// 5.3: current rate, bounded history and the settlement schedule per asset
pub struct FundingBook {
    params: FundingParams,
    history: DashMap<Asset, VecDeque<FundingRate>>,
    next_settlement: DashMap<Asset, Timestamp>,
}

impl FundingBook {
    pub fn new(params: FundingParams) -> Self {
        Self {
            params,
            history: DashMap::new(),
            next_settlement: DashMap::new(),
        }
    }

    pub fn params(&self) -> &FundingParams {
        &self.params
    }

    pub fn schedule(&self, asset: &Asset, at: Timestamp) {
        self.next_settlement.insert(asset.clone(), at);
    }

    pub fn next_settlement(&self, asset: &Asset) -> Option<Timestamp> {
        self.next_settlement.get(asset).map(|t| *t.value())
    }

    // unscheduled assets are due
    pub fn is_due(&self, asset: &Asset, now: Timestamp) -> bool {
        self.next_settlement(asset).map_or(true, |at| now >= at)
    }

    pub fn record(&self, rate: FundingRate) {
        self.next_settlement
            .insert(rate.asset.clone(), rate.next_settlement_at);
        let mut history = self.history.entry(rate.asset.clone()).or_default();
        history.push_back(rate);
        while history.len() > self.params.history_len {
            history.pop_front();
        }
    }

    pub fn current(&self, asset: &Asset) -> Option<FundingRate> {
        self.history.get(asset).and_then(|h| h.back().cloned())
    }

    /// Newest first.
    pub fn history(&self, asset: &Asset, limit: usize) -> Vec<FundingRate> {
        self.history
            .get(asset)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn rate_at(asset: &str, rate: Decimal, at: i64) -> FundingRate {
        FundingRate {
            asset: Asset::new(asset),
            rate,
            premium: rate,
            mark_price: price(dec!(100)),
            index_price: price(dec!(100)),
            computed_at: Timestamp::from_millis(at),
            next_settlement_at: Timestamp::from_millis(at + 1_000),
        }
    }

    #[test]
    fn premium_index_positive() {
        let premium = calculate_premium_index(price(dec!(50100)), price(dec!(50000)));
        assert_eq!(premium, dec!(0.002));
    }

    #[test]
    fn rate_is_clamped() {
        let params = FundingParams::default();
        assert_eq!(calculate_funding_rate(dec!(0.5), &params), dec!(0.01));
        assert_eq!(calculate_funding_rate(dec!(-0.5), &params), dec!(-0.01));
        assert_eq!(calculate_funding_rate(dec!(0.001), &params), dec!(0.0011));
    }

    #[test]
    fn payer_follows_sign() {
        assert_eq!(payer_side(dec!(0.001)), Some(Side::Long));
        assert_eq!(payer_side(dec!(-0.001)), Some(Side::Short));
        assert_eq!(payer_side(Decimal::ZERO), None);
    }

    #[test]
    fn payment_uses_absolute_rate() {
        let paid = calculate_funding_payment(Quote::new(dec!(10000)), dec!(-0.0005));
        assert_eq!(paid, Quote::new(dec!(5)));
    }

    #[test]
    fn pro_rata_split_conserves_total() {
        let total = Quote::new(dec!(10));
        let shares = distribute_pro_rata(
            total,
            &[
                ("a", Quote::new(dec!(100))),
                ("b", Quote::new(dec!(100))),
                ("c", Quote::new(dec!(100))),
            ],
        );
        let sum: Quote = shares.iter().map(|(_, s)| *s).sum();
        assert_eq!(sum, total);
        // dust lands on one share only
        assert_eq!(shares[1].1, Quote::new(dec!(3.33333333)));
    }

    #[test]
    fn pro_rata_split_follows_weights() {
        let shares = distribute_pro_rata(
            Quote::new(dec!(9)),
            &[("small", Quote::new(dec!(100))), ("big", Quote::new(dec!(200)))],
        );
        assert_eq!(shares[0].1, Quote::new(dec!(3)));
        assert_eq!(shares[1].1, Quote::new(dec!(6)));
        assert!(distribute_pro_rata::<&str>(Quote::new(dec!(1)), &[]).is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let params = FundingParams {
            history_len: 2,
            ..FundingParams::default()
        };
        let book = FundingBook::new(params);
        let asset = Asset::new("BTC-PERP");
        for i in 0..5 {
            book.record(rate_at("BTC-PERP", Decimal::from(i), i * 10));
        }

        let history = book.history(&asset, 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].rate, dec!(4));
        assert_eq!(book.current(&asset).map(|r| r.rate), Some(dec!(4)));
        assert_eq!(book.next_settlement(&asset), Some(Timestamp::from_millis(1_040)));
    }

    #[test]
    fn schedule_decides_due() {
        let book = FundingBook::new(FundingParams::default());
        let asset = Asset::new("ETH-PERP");
        assert!(book.is_due(&asset, Timestamp::from_millis(0)));

        book.schedule(&asset, Timestamp::from_millis(5_000));
        assert!(!book.is_due(&asset, Timestamp::from_millis(4_999)));
        assert!(book.is_due(&asset, Timestamp::from_millis(5_000)));
    }

    #[test]
    fn annualized_rate() {
        let params = FundingParams::default();
        // 3 periods a day
        assert_eq!(annualized_funding_rate(dec!(0.0001), &params), dec!(0.1095));
    }
}
