//! Agent perps core simulation.
//!
//! Walks the core through its lifecycle against in-process mocks: deposits,
//! risk rejection, internal matching with external fallback, funding, a
//! liquidation, on-chain flows, and finally the background scheduler.
//! Pass a TOML config path as the first argument to override the defaults.

use agent_perps_core::*;
use anyhow::Context;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

const BTC: &str = "BTC-PERP";

struct Sim {
    exchange: Arc<Exchange>,
    clock: Arc<ManualClock>,
    venue: Arc<MockVenue>,
    chain: Arc<MockOnchainClient>,
    events: Arc<EventLog>,
}

impl Sim {
    fn new(config: &CoreConfig) -> anyhow::Result<Self> {
        let clock = Arc::new(ManualClock::new(Timestamp::now()));
        let venue = Arc::new(MockVenue::new("sim-venue"));
        let chain = Arc::new(MockOnchainClient::new());
        let events = Arc::new(EventLog::new(10_000));
        let exchange = Exchange::new(
            config.clone(),
            Collaborators {
                store: Arc::new(MemoryStore::new()),
                events: events.clone(),
                clock: clock.clone(),
                venue: venue.clone(),
                onchain: chain.clone(),
            },
        )?;
        Ok(Self {
            exchange: Arc::new(exchange),
            clock,
            venue,
            chain,
            events,
        })
    }

    fn set_price(&self, price: rust_decimal::Decimal) {
        let asset = Asset::new(BTC);
        let price = Price::new_unchecked(price);
        self.venue.set_price(&asset, price);
        self.exchange.on_price_update(&asset, price, Some(price));
    }

    fn fund(&self, name: &str, amount: rust_decimal::Decimal) -> anyhow::Result<AgentId> {
        let agent = AgentId::new(name);
        self.exchange.deposit(&agent, Quote::new(amount))?;
        Ok(agent)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => CoreConfig::default(),
    };
    config.logging.init();

    println!("Agent Perps Core Simulation");
    println!("Intents, Isolated Margin, Full Lifecycle\n");

    scenario_1_open_and_close(&config).await?;
    scenario_2_risk_rejection(&config).await?;
    scenario_3_internal_match(&config).await?;
    scenario_4_funding(&config).await?;
    scenario_5_liquidation(&config).await?;
    scenario_6_onchain(&config).await?;
    scenario_7_background(&config).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

/// Routed trade, then a manual close after the price moves.
async fn scenario_1_open_and_close(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 1: Open and Close\n");
    let sim = Sim::new(config)?;
    sim.set_price(dec!(50000));
    let alice = sim.fund("alice", dec!(1000))?;

    let trade = sim
        .exchange
        .open_intent(&alice, &Asset::new(BTC), Side::Long, Quote::new(dec!(200)), dec!(5))
        .await?;
    let position = trade.position.context("trade opened no position")?;
    let balance = sim.exchange.get_balance(&alice);
    println!("  Alice longs $200 at 5x, entry ${}", position.entry_price);
    println!("  Locked ${}, available ${}", balance.locked, balance.available());

    sim.set_price(dec!(52000));
    let outcome = sim.exchange.close_position(&position.id, dec!(1))?;
    let balance = sim.exchange.get_balance(&alice);
    println!("  BTC to $52,000, closed for pnl ${}", outcome.realized_pnl());
    println!("  Balance ${}, locked ${}\n", balance.total, balance.locked);
    Ok(())
}

/// Leverage beyond the limits is refused before any money moves.
async fn scenario_2_risk_rejection(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 2: Risk Rejection\n");
    let sim = Sim::new(config)?;
    sim.set_price(dec!(50000));
    let bob = sim.fund("bob", dec!(1000))?;

    match sim
        .exchange
        .open_intent(&bob, &Asset::new(BTC), Side::Long, Quote::new(dec!(100)), dec!(200))
        .await
    {
        Ok(_) => println!("  unexpected: 200x accepted"),
        Err(e) => println!("  200x rejected [{}]: {}", e.code(), e),
    }
    println!("  Bob's balance still ${}\n", sim.exchange.get_balance(&bob).total);
    Ok(())
}

/// Two agents with opposite intents match without touching the venue.
async fn scenario_3_internal_match(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 3: Internal Matching\n");
    let sim = Sim::new(config)?;
    sim.set_price(dec!(50000));
    let maker = sim.fund("maker", dec!(5000))?;
    let taker = sim.fund("taker", dec!(5000))?;
    let asset = Asset::new(BTC);

    let intent = sim
        .exchange
        .post_intent(&maker, &asset, Side::Short, Quote::new(dec!(1000)), dec!(10), None)?;
    println!("  Maker rests SHORT $1,000 at 10x (intent {})", intent.id);

    let trade = sim
        .exchange
        .open_intent(&taker, &asset, Side::Long, Quote::new(dec!(1500)), dec!(10))
        .await?;
    println!(
        "  Taker LONG $1,500: ${} internal, ${} external",
        trade.routing.internal_filled, trade.routing.external_filled
    );
    println!("  Fees: internal ${}, external ${}", trade.fees.internal, trade.fees.external);

    let stats = sim.exchange.routing_stats();
    println!(
        "  Internal fill rate {}, fee saved ${}\n",
        stats.internal_fill_rate().round_dp(4),
        stats.fee_saved
    );
    Ok(())
}

/// Mark above index: longs pay shorts through the funding pool.
async fn scenario_4_funding(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 4: Funding Settlement\n");
    let sim = Sim::new(config)?;
    sim.set_price(dec!(50000));
    let long = sim.fund("long", dec!(5000))?;
    let short = sim.fund("short", dec!(5000))?;
    let asset = Asset::new(BTC);

    sim.exchange
        .post_intent(&short, &asset, Side::Short, Quote::new(dec!(2000)), dec!(5), None)?;
    sim.exchange
        .open_intent(&long, &asset, Side::Long, Quote::new(dec!(2000)), dec!(5))
        .await?;

    sim.exchange.on_price_update(
        &asset,
        Price::new_unchecked(dec!(50100)),
        Some(Price::new_unchecked(dec!(50000))),
    );
    let result = sim.exchange.settle_funding(&asset)?;
    println!("  Rate {} ({} pays)", result.rate.rate, if result.rate.rate.is_sign_positive() { "long" } else { "short" });
    println!("  Paid ${}, received ${}", result.total_paid, result.total_received);
    println!("  Predicted next payment for long: ${}\n", sim.exchange.predicted_payment(&long));
    Ok(())
}

/// A 10x long is force-closed once the mark falls through maintenance.
async fn scenario_5_liquidation(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 5: Liquidation\n");
    let sim = Sim::new(config)?;
    sim.set_price(dec!(50000));
    let trader = sim.fund("trader", dec!(1000))?;

    let trade = sim
        .exchange
        .open_intent(&trader, &Asset::new(BTC), Side::Long, Quote::new(dec!(1000)), dec!(10))
        .await?;
    let position = trade.position.context("trade opened no position")?;
    println!("  Long $1,000 at 10x, liquidation price ${}", position.liquidation_price);

    sim.clock.advance_time(1_000);
    sim.set_price(dec!(45500));
    let sweep = sim.exchange.run_liquidation_sweep();
    for record in &sweep.executed {
        println!(
            "  Liquidated at ${}: fee ${}, returned ${}, bad debt ${}",
            record.mark_price.map(|p| p.value()).unwrap_or_default(),
            record.fee_charged,
            record.returned_to_agent,
            record.bad_debt
        );
    }
    println!("  Trader balance ${}\n", sim.exchange.get_balance(&trader).total);
    Ok(())
}

/// Deposit by signature (twice), then withdraw to a wallet.
async fn scenario_6_onchain(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 6: On-chain Settlement\n");
    let sim = Sim::new(config)?;
    let agent = AgentId::new("onchain");
    sim.chain.add_deposit("sig-1", Quote::new(dec!(2500)), Some("0xabc"));

    let settlement = sim
        .exchange
        .deposit_onchain(&agent, "sig-1", None, Some("0xabc"))
        .await?;
    println!("  Deposit sig-1 credited ${} ({:?})", settlement.amount, settlement.status);
    if let Err(e) = sim.exchange.deposit_onchain(&agent, "sig-1", None, Some("0xabc")).await {
        println!("  Replay of sig-1 refused: {}", e);
    }

    let withdrawal = sim
        .exchange
        .withdraw_onchain(&agent, Quote::new(dec!(1000)), "0xdef")
        .await?;
    println!(
        "  Withdrew ${} in tx {}",
        withdrawal.amount,
        withdrawal.tx_hash.as_deref().unwrap_or("-")
    );
    println!("  Balance ${}\n", sim.exchange.get_balance(&agent).total);
    Ok(())
}

/// The scheduler runs the sweeps on its own until shutdown.
async fn scenario_7_background(config: &CoreConfig) -> anyhow::Result<()> {
    println!("Scenario 7: Background Scheduler\n");
    let sim = Sim::new(config)?;
    let source = Arc::new(MockPriceSource::new());
    source.set_price(&Asset::new(BTC), Price::new_unchecked(dec!(50000)));
    let maker = sim.fund("maker", dec!(1000))?;
    sim.exchange.post_intent(
        &maker,
        &Asset::new(BTC),
        Side::Long,
        Quote::new(dec!(500)),
        dec!(5),
        Some(Duration::from_secs(1)),
    )?;

    let jobs = SchedulerConfig {
        price_refresh_ms: 50,
        position_sweep_ms: 50,
        liquidation_sweep_ms: 50,
        funding_check_ms: 100,
        intent_expiry_ms: 50,
    };
    let scheduler = Scheduler::start(sim.exchange.clone(), Some(source as Arc<dyn PriceSource>), &jobs);
    sim.clock.advance_time(2_000);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        _ = tokio::signal::ctrl_c() => println!("  interrupted"),
    }
    scheduler.shutdown().await;

    let price = sim.exchange.get_price(&Asset::new(BTC)).map(|s| s.mark.value());
    println!("  Cached BTC mark: {:?}", price);
    println!("  Maker locked after expiry: ${}", sim.exchange.get_balance(&maker).locked);
    println!("  Events recorded: {}", sim.events.len());
    Ok(())
}
