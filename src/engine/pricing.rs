//! Price updates.

use super::core::Exchange;
use crate::oracle::{PriceSnapshot, PriceSource};
use crate::position::Position;
use crate::types::{AgentId, Asset, Price};
use tracing::debug;

impl Exchange {
    /// New price for an asset: caches it and re-marks every open position in it.
    /// Without an index the previous one is kept.
    pub fn on_price_update(&self, asset: &Asset, mark: Price, index: Option<Price>) -> Vec<Position> {
        match index {
            Some(index) => self.prices.update(asset, mark, index),
            None => self.prices.update_mark(asset, mark),
        };
        self.remark(asset, mark)
    }

    /// Pull every supported asset from `source`. Assets the source cannot price keep
    /// their old cache entry and go stale.
    pub async fn refresh_prices(&self, source: &dyn PriceSource) -> Vec<PriceSnapshot> {
        let assets = self.config.positions.assets();
        let snapshots = self.prices.refresh(source, &assets).await;
        for snapshot in &snapshots {
            self.remark(&snapshot.asset, snapshot.mark);
        }
        debug!(requested = assets.len(), updated = snapshots.len(), "prices refreshed");
        snapshots
    }

    /// Latest fresh snapshot for `asset`, if any.
    pub fn get_price(&self, asset: &Asset) -> Option<PriceSnapshot> {
        self.prices.snapshot(asset).ok()
    }

    fn remark(&self, asset: &Asset, mark: Price) -> Vec<Position> {
        let updated = self.positions.update_price(asset, mark);

        let mut owners: Vec<&AgentId> = updated.iter().map(|p| &p.owner).collect();
        owners.sort();
        owners.dedup();
        for owner in owners {
            self.risk.record_equity(owner, self.agent_equity(owner));
        }
        updated
    }
}
