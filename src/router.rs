// 10.0 router.rs: the leg of a trade nobody inside could take goes to an external venue.
// the venue is a trait so the core never knows which exchange sits behind it.
// 10.1 ExternalRouter adds the fallback taker fee, a timeout and cost statistics.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RoutingConfig;
use crate::types::{Asset, Bps, Price, Quote, Side};

const MAX_FILL_HISTORY: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VenueError {
    #[error("venue {venue} rejected the order: {reason}")]
    Rejected { venue: String, reason: String },
    #[error("venue {0} unavailable")]
    Unavailable(String),
    #[error("venue did not answer within {0}ms")]
    Timeout(u64),
    #[error("venue {venue} reported {filled} filled for an order of {requested}")]
    Overfill {
        venue: String,
        requested: Quote,
        filled: Quote,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueFill {
    pub venue: String,
    pub asset: Asset,
    pub side: Side,
    pub notional: Quote,
    pub fill_price: Price,
    // None when the venue did not report one
    pub fee: Option<Quote>,
}

#[async_trait]
pub trait ExternalVenue: Send + Sync {
    fn name(&self) -> &str;

    async fn route(&self, asset: &Asset, side: Side, notional: Quote) -> Result<VenueFill, VenueError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingStats {
    pub internal_volume: Quote,
    pub external_volume: Quote,
    pub internal_fills: u64,
    pub external_fills: u64,
    pub external_failures: u64,
    pub maker_fees: Quote,
    pub external_fees: Quote,
    // taker fees internal matches did not have to pay, net of maker fees
    pub fee_saved: Quote,
}

impl RoutingStats {
    /// Share of volume matched internally, 0..=1.
    pub fn internal_fill_rate(&self) -> Decimal {
        let total = self.internal_volume.add(self.external_volume);
        if !total.is_positive() {
            return Decimal::ZERO;
        }
        self.internal_volume.value() / total.value()
    }
}

pub struct ExternalRouter {
    venue: Arc<dyn ExternalVenue>,
    maker_fee: Bps,
    taker_fee: Bps,
    timeout: Duration,
    stats: Mutex<RoutingStats>,
    fills: Mutex<VecDeque<VenueFill>>,
}

impl ExternalRouter {
    pub fn new(venue: Arc<dyn ExternalVenue>, config: &RoutingConfig) -> Self {
        Self {
            venue,
            maker_fee: config.maker_fee(),
            taker_fee: config.taker_fee(),
            timeout: config.venue_timeout(),
            stats: Mutex::new(RoutingStats::default()),
            fills: Mutex::new(VecDeque::new()),
        }
    }

    pub fn maker_fee(&self) -> Bps {
        self.maker_fee
    }

    pub fn taker_fee(&self) -> Bps {
        self.taker_fee
    }

    pub fn venue_name(&self) -> &str {
        self.venue.name()
    }

    /// Send `notional` to the venue. The returned fill always carries a fee.
    pub async fn route(&self, asset: &Asset, side: Side, notional: Quote) -> Result<VenueFill, VenueError> {
        let routed = tokio::time::timeout(self.timeout, self.venue.route(asset, side, notional)).await;
        let mut fill = match routed {
            Ok(Ok(fill)) => fill,
            Ok(Err(e)) => {
                warn!(venue = %self.venue.name(), asset = %asset, notional = %notional, error = %e, "external route failed");
                self.stats.lock().external_failures += 1;
                return Err(e);
            }
            Err(_) => {
                let err = VenueError::Timeout(self.timeout.as_millis() as u64);
                warn!(venue = %self.venue.name(), asset = %asset, error = %err, "external route timed out");
                self.stats.lock().external_failures += 1;
                return Err(err);
            }
        };

        // the caller sized margin for `notional`; a fill beyond it has no backing
        if fill.notional > notional || !fill.notional.is_positive() {
            let err = VenueError::Overfill {
                venue: self.venue.name().to_string(),
                requested: notional,
                filled: fill.notional,
            };
            warn!(asset = %asset, error = %err, "external fill refused");
            self.stats.lock().external_failures += 1;
            return Err(err);
        }

        let fee = fill.fee.unwrap_or_else(|| self.taker_fee.of(fill.notional));
        fill.fee = Some(fee);

        {
            let mut stats = self.stats.lock();
            stats.external_volume = stats.external_volume.add(fill.notional);
            stats.external_fills += 1;
            stats.external_fees = stats.external_fees.add(fee);
        }
        {
            let mut fills = self.fills.lock();
            fills.push_back(fill.clone());
            while fills.len() > MAX_FILL_HISTORY {
                fills.pop_front();
            }
        }
        debug!(venue = %fill.venue, asset = %asset, notional = %fill.notional, price = %fill.fill_price, fee = %fee, "external fill");
        Ok(fill)
    }

    // internal match of `notional`; the maker fee was charged instead of the taker fee
    pub fn record_internal(&self, notional: Quote, maker_fee_charged: Quote) {
        let mut stats = self.stats.lock();
        stats.internal_volume = stats.internal_volume.add(notional);
        stats.internal_fills += 1;
        stats.maker_fees = stats.maker_fees.add(maker_fee_charged);
        let saved = self.taker_fee.of(notional).sub(maker_fee_charged);
        stats.fee_saved = stats.fee_saved.add(saved);
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats.lock().clone()
    }

    /// Newest first.
    pub fn recent_fills(&self, limit: usize) -> Vec<VenueFill> {
        self.fills.lock().iter().rev().take(limit).cloned().collect()
    }
}

/// Venue that fills everything at a configured price. For tests and the simulator.
pub struct MockVenue {
    name: String,
    prices: RwLock<HashMap<Asset, Price>>,
    fee: Option<Bps>,
    // reported notional per requested notional
    fill_ratio: RwLock<Decimal>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    routed: AtomicU64,
}

impl MockVenue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prices: RwLock::new(HashMap::new()),
            fee: None,
            fill_ratio: RwLock::new(Decimal::ONE),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            routed: AtomicU64::new(0),
        }
    }

    // venue-reported fee; without one the router applies the configured taker fee
    pub fn with_fee(mut self, fee: Bps) -> Self {
        self.fee = Some(fee);
        self
    }

    pub fn set_price(&self, asset: &Asset, price: Price) {
        self.prices.write().insert(asset.clone(), price);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_fill_ratio(&self, ratio: Decimal) {
        *self.fill_ratio.write() = ratio;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalVenue for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn route(&self, asset: &Asset, side: Side, notional: Quote) -> Result<VenueFill, VenueError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(VenueError::Unavailable(self.name.clone()));
        }
        let fill_price = self
            .prices
            .read()
            .get(asset)
            .copied()
            .ok_or_else(|| VenueError::Rejected {
                venue: self.name.clone(),
                reason: format!("no market for {}", asset),
            })?;

        self.routed.fetch_add(1, Ordering::SeqCst);
        let notional = notional.mul(*self.fill_ratio.read());
        Ok(VenueFill {
            venue: self.name.clone(),
            asset: asset.clone(),
            side,
            notional,
            fill_price,
            fee: self.fee.map(|bps| bps.of(notional)),
        })
    }
}
