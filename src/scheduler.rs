// 12.0 scheduler.rs: the periodic jobs that keep the core moving without callers.
// price refresh, stop loss / take profit sweep, liquidation sweep, funding settlement
// and intent expiry each run on their own interval until shutdown is signalled.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Exchange;
use crate::oracle::PriceSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub price_refresh_ms: u64,
    pub position_sweep_ms: u64,
    pub liquidation_sweep_ms: u64,
    // how often to check whether a funding interval has elapsed
    pub funding_check_ms: u64,
    pub intent_expiry_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            price_refresh_ms: 1_000,
            position_sweep_ms: 1_000,
            liquidation_sweep_ms: 5_000,
            funding_check_ms: 60_000,
            intent_expiry_ms: 60_000,
        }
    }
}

/// Handle on the running jobs. Dropping it without `shutdown` leaves them running.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every job onto the current tokio runtime. Without a price source the
    /// cache is left to whoever calls `on_price_update`.
    pub fn start(
        exchange: Arc<Exchange>,
        prices: Option<Arc<dyn PriceSource>>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Some(source) = prices {
            let ex = exchange.clone();
            tasks.push(spawn_job("price_refresh", config.price_refresh_ms, shutdown_rx.clone(), move || {
                let ex = ex.clone();
                let source = source.clone();
                async move {
                    ex.refresh_prices(source.as_ref()).await;
                }
            }));
        }

        let ex = exchange.clone();
        tasks.push(spawn_job("position_sweep", config.position_sweep_ms, shutdown_rx.clone(), move || {
            let ex = ex.clone();
            async move {
                ex.run_position_sweep();
            }
        }));

        let ex = exchange.clone();
        tasks.push(spawn_job("liquidation_sweep", config.liquidation_sweep_ms, shutdown_rx.clone(), move || {
            let ex = ex.clone();
            async move {
                let result = ex.run_liquidation_sweep();
                if !result.failed.is_empty() {
                    warn!(failed = result.failed.len(), "liquidations pending retry");
                }
            }
        }));

        let ex = exchange.clone();
        tasks.push(spawn_job("funding", config.funding_check_ms, shutdown_rx.clone(), move || {
            let ex = ex.clone();
            async move {
                ex.run_funding_sweep();
            }
        }));

        let ex = exchange;
        tasks.push(spawn_job("intent_expiry", config.intent_expiry_ms, shutdown_rx, move || {
            let ex = ex.clone();
            async move {
                ex.expire_intents();
            }
        }));

        info!(jobs = tasks.len(), "scheduler started");
        Self { shutdown, tasks }
    }

    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every job and wait for them to finish their current run.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler job ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

fn spawn_job<F, Fut>(name: &'static str, period_ms: u64, mut shutdown: watch::Receiver<bool>, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!(job = name, "job stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    job().await;
                }
            }
        }
    })
}
