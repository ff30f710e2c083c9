// 4.0: open position tracking. size is USD notional, pnl = side * (mark - entry) / entry * size.
// 4.1 liquidation price is fixed at open: the price where the position has lost
// `threshold` of its margin. only equity and health move with the mark.
// 4.2 stop loss / take profit defaults and validation at the bottom.

use crate::events::CloseReason;
use crate::types::{AgentId, Asset, Leverage, PositionId, Price, Quote, Side, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub owner: AgentId,
    pub asset: Asset,
    pub side: Side,
    // USD notional at entry
    pub size: Quote,
    pub entry_price: Price,
    pub leverage: Leverage,
    pub margin: Quote,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub current_price: Price,
    pub unrealized_pnl: Quote,
    pub liquidation_price: Price,
    pub is_open: bool,
    pub close_price: Option<Price>,
    pub close_reason: Option<CloseReason>,
    // summed over partial closes
    pub realized_pnl: Quote,
    // net funding paid (negative = received)
    pub funding_paid: Quote,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: AgentId,
        asset: Asset,
        side: Side,
        size: Quote,
        entry_price: Price,
        leverage: Leverage,
        margin: Quote,
        liquidation_price: Price,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: PositionId::new(),
            owner,
            asset,
            side,
            size,
            entry_price,
            leverage,
            margin,
            stop_loss: None,
            take_profit: None,
            current_price: entry_price,
            unrealized_pnl: Quote::zero(),
            liquidation_price,
            is_open: true,
            close_price: None,
            close_reason: None,
            realized_pnl: Quote::zero(),
            funding_paid: Quote::zero(),
            opened_at: timestamp,
            updated_at: timestamp,
            closed_at: None,
        }
    }

    // 4.1: paper gains/losses at a given price
    pub fn pnl_at(&self, mark_price: Price) -> Quote {
        calculate_unrealized_pnl(self.side, self.size, self.entry_price, mark_price)
    }

    pub fn mark_to(&mut self, mark_price: Price, timestamp: Timestamp) {
        self.current_price = mark_price;
        self.unrealized_pnl = self.pnl_at(mark_price);
        self.updated_at = timestamp;
    }

    // margin + unrealized pnl
    pub fn equity(&self) -> Quote {
        self.margin.add(self.unrealized_pnl)
    }

    pub fn equity_at(&self, mark_price: Price) -> Quote {
        self.margin.add(self.pnl_at(mark_price))
    }

    pub fn health(&self) -> Decimal {
        calculate_health(self.equity(), self.margin)
    }

    pub fn health_at(&self, mark_price: Price) -> Decimal {
        calculate_health(self.equity_at(mark_price), self.margin)
    }

    pub fn stop_loss_hit(&self, mark_price: Price) -> Option<Price> {
        let sl = self.stop_loss?;
        let hit = match self.side {
            Side::Long => mark_price <= sl,
            Side::Short => mark_price >= sl,
        };
        hit.then_some(sl)
    }

    pub fn take_profit_hit(&self, mark_price: Price) -> Option<Price> {
        let tp = self.take_profit?;
        let hit = match self.side {
            Side::Long => mark_price >= tp,
            Side::Short => mark_price <= tp,
        };
        hit.then_some(tp)
    }
}

// 4.3: pnl for a USD-notional position. the position holds size / entry units.
pub fn calculate_unrealized_pnl(side: Side, size: Quote, entry_price: Price, mark_price: Price) -> Quote {
    let move_pct = (mark_price.value() - entry_price.value()) / entry_price.value();
    Quote::new(side.sign() * move_pct * size.value())
}

// equity / margin. 1.0 at entry, 0 when the margin is gone.
pub fn calculate_health(equity: Quote, margin: Quote) -> Decimal {
    if !margin.is_positive() {
        return Decimal::ZERO;
    }
    equity.value() / margin.value()
}

/// Price at which `threshold` of the margin is lost.
/// long: entry * (1 - threshold / leverage), short: entry * (1 + threshold / leverage).
pub fn calculate_liquidation_price(
    entry_price: Price,
    leverage: Leverage,
    side: Side,
    threshold: Decimal,
) -> Price {
    let move_pct = threshold / leverage.value();
    let liq_price = match side {
        Side::Long => entry_price.value() * (Decimal::ONE - move_pct),
        Side::Short => entry_price.value() * (Decimal::ONE + move_pct),
    };

    Price::new_unchecked(liq_price.max(dec!(0.0001)))
}

/// Notional-weighted entry across fills: total notional / total units.
pub fn weighted_entry_price(fills: &[(Quote, Price)]) -> Option<Price> {
    let total_notional: Decimal = fills.iter().map(|(n, _)| n.value()).sum();
    let total_units: Decimal = fills.iter().map(|(n, p)| n.value() / p.value()).sum();
    if total_units.is_zero() {
        return None;
    }
    Price::new(total_notional / total_units)
}

// 4.4: default protective levels. pct is a price move, not a margin fraction.
pub fn default_stop_loss(entry_price: Price, side: Side, pct: Decimal) -> Option<Price> {
    let value = match side {
        Side::Long => entry_price.value() * (Decimal::ONE - pct),
        Side::Short => entry_price.value() * (Decimal::ONE + pct),
    };
    Price::new(value)
}

pub fn default_take_profit(entry_price: Price, side: Side, pct: Decimal) -> Option<Price> {
    let value = match side {
        Side::Long => entry_price.value() * (Decimal::ONE + pct),
        Side::Short => entry_price.value() * (Decimal::ONE - pct),
    };
    Price::new(value)
}

// stop loss sits on the losing side of entry, take profit on the winning side
pub fn validate_stop_loss(side: Side, entry_price: Price, stop_loss: Price) -> Result<(), String> {
    let ok = match side {
        Side::Long => stop_loss < entry_price,
        Side::Short => stop_loss > entry_price,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "stop loss {} on wrong side of entry {} for {}",
            stop_loss, entry_price, side
        ))
    }
}

pub fn validate_take_profit(side: Side, entry_price: Price, take_profit: Price) -> Result<(), String> {
    let ok = match side {
        Side::Long => take_profit > entry_price,
        Side::Short => take_profit < entry_price,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "take profit {} on wrong side of entry {} for {}",
            take_profit, entry_price, side
        ))
    }
}
