// Price Oracle
//
// The core never discovers prices. An external feed (Pyth, a CEX aggregator, a venue's
// mark) implements PriceSource; a background task pulls from it into PriceCache and
// request handling only ever reads the cache. Reads older than max_staleness are refused
// so nothing settles against a frozen price.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::types::{Asset, Price, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("no price for {0}")]
    Missing(Asset),
    #[error("price for {asset} is {age_ms}ms old (max {max_ms}ms)")]
    Stale { asset: Asset, age_ms: i64, max_ms: i64 },
    #[error("price source failed: {0}")]
    Source(String),
}

/// A mark/index pair for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset: Asset,
    pub mark: Price,
    pub index: Price,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_price(&self, asset: &Asset) -> Result<Price, OracleError>;
    async fn get_index_price(&self, asset: &Asset) -> Result<Price, OracleError>;
    async fn get_all_prices(&self) -> Result<Vec<PriceQuote>, OracleError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub asset: Asset,
    pub mark: Price,
    pub index: Price,
    pub updated_at: Timestamp,
}

pub struct PriceCache {
    prices: DashMap<Asset, PriceSnapshot>,
    max_staleness_ms: i64,
    clock: Arc<dyn Clock>,
}

impl PriceCache {
    pub fn new(max_staleness_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            prices: DashMap::new(),
            max_staleness_ms,
            clock,
        }
    }

    pub fn update(&self, asset: &Asset, mark: Price, index: Price) -> PriceSnapshot {
        let snapshot = PriceSnapshot {
            asset: asset.clone(),
            mark,
            index,
            updated_at: self.clock.now(),
        };
        self.prices.insert(asset.clone(), snapshot.clone());
        snapshot
    }

    // index falls back to the previous index, or to mark when there was none
    pub fn update_mark(&self, asset: &Asset, mark: Price) -> PriceSnapshot {
        let index = self
            .prices
            .get(asset)
            .map(|s| s.value().index)
            .unwrap_or(mark);
        self.update(asset, mark, index)
    }

    /// Latest fresh snapshot.
    pub fn snapshot(&self, asset: &Asset) -> Result<PriceSnapshot, OracleError> {
        let snapshot = self
            .last_known(asset)
            .ok_or_else(|| OracleError::Missing(asset.clone()))?;
        let age_ms = self.clock.now().millis_since(snapshot.updated_at);
        if age_ms > self.max_staleness_ms {
            return Err(OracleError::Stale {
                asset: asset.clone(),
                age_ms,
                max_ms: self.max_staleness_ms,
            });
        }
        Ok(snapshot)
    }

    pub fn mark(&self, asset: &Asset) -> Result<Price, OracleError> {
        self.snapshot(asset).map(|s| s.mark)
    }

    pub fn index(&self, asset: &Asset) -> Result<Price, OracleError> {
        self.snapshot(asset).map(|s| s.index)
    }

    /// Whatever was cached last, however old.
    pub fn last_known(&self, asset: &Asset) -> Option<PriceSnapshot> {
        self.prices.get(asset).map(|s| s.value().clone())
    }

    /// Pull mark and index for each asset from `source`. An asset that fails keeps its
    /// previous entry (which will go stale) and is left out of the result.
    pub async fn refresh(&self, source: &dyn PriceSource, assets: &[Asset]) -> Vec<PriceSnapshot> {
        let mut updated = Vec::with_capacity(assets.len());
        for asset in assets {
            let mark = match source.get_price(asset).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(asset = %asset, error = %e, "mark price fetch failed");
                    continue;
                }
            };
            let index = match source.get_index_price(asset).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(asset = %asset, error = %e, "index fetch failed, using mark");
                    mark
                }
            };
            updated.push(self.update(asset, mark, index));
        }
        updated
    }
}

/// In-process price source for tests and the simulator.
#[derive(Default)]
pub struct MockPriceSource {
    prices: RwLock<HashMap<Asset, (Price, Price)>>,
    failing: AtomicBool,
}

impl MockPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, asset: &Asset, mark: Price) {
        self.prices.write().insert(asset.clone(), (mark, mark));
    }

    pub fn set_prices(&self, asset: &Asset, mark: Price, index: Price) {
        self.prices.write().insert(asset.clone(), (mark, index));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lookup(&self, asset: &Asset) -> Result<(Price, Price), OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Source("mock source offline".to_string()));
        }
        self.prices
            .read()
            .get(asset)
            .copied()
            .ok_or_else(|| OracleError::Missing(asset.clone()))
    }
}

#[async_trait]
impl PriceSource for MockPriceSource {
    async fn get_price(&self, asset: &Asset) -> Result<Price, OracleError> {
        self.lookup(asset).map(|(mark, _)| mark)
    }

    async fn get_index_price(&self, asset: &Asset) -> Result<Price, OracleError> {
        self.lookup(asset).map(|(_, index)| index)
    }

    async fn get_all_prices(&self) -> Result<Vec<PriceQuote>, OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Source("mock source offline".to_string()));
        }
        Ok(self
            .prices
            .read()
            .iter()
            .map(|(asset, (mark, index))| PriceQuote {
                asset: asset.clone(),
                mark: *mark,
                index: *index,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;

    fn btc() -> Asset {
        Asset::new("BTC-PERP")
    }

    #[test]
    fn fresh_price_is_served() {
        let clock = Arc::new(ManualClock::default());
        let cache = PriceCache::new(1_000, clock.clone());
        cache.update_mark(&btc(), Price::new_unchecked(dec!(50000)));

        clock.advance_time(1_000);
        assert_eq!(cache.mark(&btc()).unwrap().value(), dec!(50000));
    }

    #[test]
    fn stale_price_is_refused() {
        let clock = Arc::new(ManualClock::default());
        let cache = PriceCache::new(1_000, clock.clone());
        cache.update_mark(&btc(), Price::new_unchecked(dec!(50000)));

        clock.advance_time(1_001);
        assert!(matches!(cache.mark(&btc()), Err(OracleError::Stale { .. })));
        // still visible for display purposes
        assert!(cache.last_known(&btc()).is_some());
    }

    #[test]
    fn missing_price_is_refused() {
        let cache = PriceCache::new(1_000, Arc::new(ManualClock::default()));
        assert!(matches!(cache.mark(&btc()), Err(OracleError::Missing(_))));
    }

    #[tokio::test]
    async fn refresh_pulls_mark_and_index() {
        let clock = Arc::new(ManualClock::default());
        let cache = PriceCache::new(1_000, clock);
        let source = MockPriceSource::new();
        source.set_prices(
            &btc(),
            Price::new_unchecked(dec!(50100)),
            Price::new_unchecked(dec!(50000)),
        );

        let updated = cache.refresh(&source, &[btc(), Asset::new("ETH-PERP")]).await;
        assert_eq!(updated.len(), 1);
        assert_eq!(cache.index(&btc()).unwrap().value(), dec!(50000));
        assert_eq!(cache.mark(&btc()).unwrap().value(), dec!(50100));
    }

    #[tokio::test]
    async fn failing_source_keeps_old_entry() {
        let clock = Arc::new(ManualClock::default());
        let cache = PriceCache::new(1_000, clock);
        let source = MockPriceSource::new();
        source.set_price(&btc(), Price::new_unchecked(dec!(100)));
        cache.refresh(&source, &[btc()]).await;

        source.set_failing(true);
        let updated = cache.refresh(&source, &[btc()]).await;
        assert!(updated.is_empty());
        assert_eq!(cache.mark(&btc()).unwrap().value(), dec!(100));
    }
}
