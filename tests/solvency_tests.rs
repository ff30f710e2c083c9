//! Solvency invariant tests.
//!
//! These tests verify the money invariants that must hold for the core to stay
//! solvent: balances never go negative, margin is never silently lost, funding
//! conserves value and every deposit signature is credited exactly once.

use agent_perps_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const BTC: &str = "BTC-PERP";

struct Harness {
    exchange: Exchange,
    clock: Arc<ManualClock>,
    venue: Arc<MockVenue>,
    chain: Arc<MockOnchainClient>,
    events: Arc<EventLog>,
}

fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.risk.min_trade_interval_ms = 0;
    config.risk.max_trades_per_minute = 1_000;
    config.risk.max_trades_per_hour = 10_000;
    config.risk.max_trades_per_day = 100_000;
    config
}

fn harness_with(config: CoreConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let venue = Arc::new(MockVenue::new("venue"));
    let chain = Arc::new(MockOnchainClient::new());
    let events = Arc::new(EventLog::default());
    let exchange = Exchange::new(
        config,
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            events: events.clone(),
            clock: clock.clone(),
            venue: venue.clone(),
            onchain: chain.clone(),
        },
    )
    .unwrap();
    Harness {
        exchange,
        clock,
        venue,
        chain,
        events,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

impl Harness {
    fn price(&self, mark: Decimal) {
        let asset = Asset::new(BTC);
        let mark = Price::new_unchecked(mark);
        self.venue.set_price(&asset, mark);
        self.exchange.on_price_update(&asset, mark, Some(mark));
    }

    fn fund(&self, name: &str, amount: Decimal) -> AgentId {
        let agent = AgentId::new(name);
        self.exchange.deposit(&agent, Quote::new(amount)).unwrap();
        agent
    }

    fn assert_solvent(&self) {
        assert!(self.exchange.audit().is_empty(), "invalid balances: {:?}", self.exchange.audit());
        for balance in self.exchange.ledger().balances() {
            assert!(!balance.available().is_negative(), "{} available negative", balance.agent);
            assert!(!balance.locked.is_negative(), "{} locked negative", balance.agent);
        }
    }

    fn count_events(&self, pred: impl Fn(&EventPayload) -> bool) -> usize {
        self.events.events().iter().filter(|e| pred(&e.payload)).count()
    }
}

fn q(v: Decimal) -> Quote {
    Quote::new(v)
}

fn btc() -> Asset {
    Asset::new(BTC)
}

/// Open long 200 at 5x: at least 40 locked. Closing re-credits margin plus pnl.
#[tokio::test]
async fn open_long_locks_margin_and_close_recredits() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("alice", dec!(1000));

    let trade = h
        .exchange
        .open_intent(&agent, &btc(), Side::Long, q(dec!(200)), dec!(5))
        .await
        .unwrap();
    let position = trade.position.unwrap();
    let balance = h.exchange.get_balance(&agent);
    assert!(balance.locked >= q(dec!(40)));
    assert_eq!(position.margin, q(dec!(40)));
    // 5 bps taker fee on the routed 200
    assert_eq!(trade.fees.external, q(dec!(0.1)));
    assert_eq!(balance.total, q(dec!(999.9)));

    h.price(dec!(55000));
    let outcome = h.exchange.close_position(&position.id, dec!(1)).unwrap();
    assert_eq!(outcome.realized_pnl(), q(dec!(20)));

    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.locked, Quote::zero());
    assert_eq!(balance.total, q(dec!(1019.9)));
    assert!(!h.exchange.get_position(&position.id).unwrap().is_open);
    h.assert_solvent();
}

/// Leverage 200 is refused by the risk gate and nothing moves.
#[tokio::test]
async fn leverage_200_rejected_without_side_effects() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("bob", dec!(1000));
    let before = h.exchange.get_balance(&agent);

    let err = h
        .exchange
        .open_intent(&agent, &btc(), Side::Long, q(dec!(100)), dec!(200))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RiskLimitViolation);

    let after = h.exchange.get_balance(&agent);
    assert_eq!(after.total, before.total);
    assert_eq!(after.locked, before.locked);
    assert!(h.exchange.get_positions(&agent).is_empty());
    assert_eq!(h.venue.routed_count(), 0);
}

/// The taker fee is locked with the margin, so draining available funds while the
/// external leg is in flight cannot dodge it.
#[tokio::test(start_paused = true)]
async fn taker_fee_collected_after_available_is_drained() {
    let h = harness();
    h.price(dec!(50000));
    h.venue.set_delay(std::time::Duration::from_millis(200));
    let agent = h.fund("drained", dec!(1000));
    let fee_account = h.exchange.config().ledger.fee_agent();

    let asset = btc();
    let (trade, withdrawn) = tokio::join!(
        h.exchange.open_intent(&agent, &asset, Side::Long, q(dec!(1000)), dec!(10)),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let available = h.exchange.get_balance(&agent).available();
            h.exchange.withdraw(&agent, available).unwrap()
        }
    );
    let trade = trade.unwrap();
    assert!(withdrawn);

    // 5 bps of 1000
    assert_eq!(trade.fees.external, q(dec!(0.5)));
    assert_eq!(h.exchange.get_balance(&fee_account).total, q(dec!(0.5)));
    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.locked, q(dec!(100)));
    assert_eq!(balance.total, q(dec!(100)));
    h.assert_solvent();
}

/// An external fill larger than the order is refused; the internal leg stands and
/// only its margin stays locked.
#[tokio::test]
async fn overfilled_external_leg_keeps_only_internal_fill() {
    let h = harness();
    h.price(dec!(50000));
    h.venue.set_fill_ratio(dec!(2));
    let maker = h.fund("maker", dec!(1000));
    let taker = h.fund("taker", dec!(1000));
    h.exchange
        .post_intent(&maker, &btc(), Side::Short, q(dec!(200)), dec!(5), None)
        .unwrap();

    let trade = h
        .exchange
        .open_intent(&taker, &btc(), Side::Long, q(dec!(500)), dec!(5))
        .await
        .unwrap();
    let position = trade.position.unwrap();
    assert_eq!(trade.routing.internal_filled, q(dec!(200)));
    assert_eq!(trade.routing.external_filled, Quote::zero());
    assert_eq!(position.size, q(dec!(200)));
    assert_eq!(position.margin, q(dec!(40)));

    let balance = h.exchange.get_balance(&taker);
    assert_eq!(balance.locked, q(dec!(40)));
    // 2 bps on the internal 200
    assert_eq!(balance.total, q(dec!(999.96)));
    h.assert_solvent();
}

/// Equal opposite intents fill each other with no external fee.
#[tokio::test]
async fn equal_opposite_intents_fill_internally() {
    let h = harness();
    h.price(dec!(50000));
    let maker = h.fund("maker", dec!(5000));
    let taker = h.fund("taker", dec!(5000));

    let intent = h
        .exchange
        .post_intent(&maker, &btc(), Side::Short, q(dec!(1000)), dec!(10), None)
        .unwrap();
    let trade = h
        .exchange
        .open_intent(&taker, &btc(), Side::Long, q(dec!(1000)), dec!(10))
        .await
        .unwrap();

    assert!(trade.success);
    assert_eq!(trade.routing.internal_filled, q(dec!(1000)));
    assert_eq!(trade.routing.external_filled, Quote::zero());
    assert!(trade.routing.match_id.is_some());
    assert_eq!(trade.fees.external, Quote::zero());
    assert_eq!(h.venue.routed_count(), 0);
    assert_eq!(trade.counterparty_positions.len(), 1);
    assert_eq!(trade.counterparty_positions[0].side, Side::Short);
    assert_eq!(h.exchange.get_intent(&intent.id).unwrap().status, IntentStatus::Matched);

    // both sides: 100 margin locked, 2 bps maker fee paid
    for agent in [&maker, &taker] {
        let balance = h.exchange.get_balance(agent);
        assert_eq!(balance.locked, q(dec!(100)));
        assert_eq!(balance.total, q(dec!(4999.8)));
    }
    assert_eq!(h.exchange.total_supply(), q(dec!(10000)));
    h.assert_solvent();
}

/// A taker larger than the book fills internally first and routes the rest.
#[tokio::test]
async fn remainder_routes_externally_at_weighted_entry() {
    let h = harness();
    h.price(dec!(50000));
    let maker = h.fund("maker", dec!(5000));
    let taker = h.fund("taker", dec!(5000));
    h.venue.set_price(&btc(), Price::new_unchecked(dec!(50100)));

    h.exchange
        .post_intent(&maker, &btc(), Side::Short, q(dec!(1000)), dec!(10), None)
        .unwrap();
    let trade = h
        .exchange
        .open_intent(&taker, &btc(), Side::Long, q(dec!(2000)), dec!(10))
        .await
        .unwrap();

    assert_eq!(trade.routing.internal_filled, q(dec!(1000)));
    assert_eq!(trade.routing.external_filled, q(dec!(1000)));
    let position = trade.position.unwrap();
    assert_eq!(position.size, q(dec!(2000)));
    // weighted by units, so just under the notional midpoint
    assert!(position.entry_price > Price::new_unchecked(dec!(50049)));
    assert!(position.entry_price < Price::new_unchecked(dec!(50050)));
    assert_eq!(position.margin, q(dec!(200)));
    // 0.2 maker rate internally, 0.5 taker rate externally
    assert_eq!(trade.fees.internal, q(dec!(0.2)));
    assert_eq!(trade.fees.external, q(dec!(0.5)));
    assert_eq!(h.exchange.routing_stats().internal_fill_rate(), dec!(0.5));
    h.assert_solvent();
}

/// Venue down and nothing matched: the trade fails and the margin comes back.
#[tokio::test]
async fn failed_routing_releases_margin() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("carol", dec!(1000));
    h.venue.set_failing(true);

    let err = h
        .exchange
        .open_intent(&agent, &btc(), Side::Short, q(dec!(500)), dec!(5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RoutingFailure);
    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.locked, Quote::zero());
    assert_eq!(balance.total, q(dec!(1000)));
}

#[tokio::test]
async fn deposit_withdraw_round_trip() {
    let h = harness();
    let agent = h.fund("dave", dec!(750));

    assert!(h.exchange.withdraw(&agent, q(dec!(750))).unwrap());
    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.total, Quote::zero());
    assert_eq!(balance.locked, Quote::zero());
    assert_eq!(h.exchange.total_supply(), Quote::zero());
}

#[tokio::test]
async fn failed_withdraw_is_side_effect_free() {
    let h = harness();
    let agent = h.fund("erin", dec!(100));
    let before = h.exchange.get_balance(&agent);

    assert!(!h.exchange.withdraw(&agent, q(dec!(150))).unwrap());
    assert_eq!(h.exchange.get_balance(&agent), before);
    assert_eq!(h.count_events(|p| matches!(p, EventPayload::Withdrawal(_))), 0);

    // locked funds are not withdrawable either
    h.exchange.ledger().lock(&agent, q(dec!(80))).unwrap();
    assert!(!h.exchange.withdraw(&agent, q(dec!(50))).unwrap());
    assert_eq!(h.exchange.get_balance(&agent).total, q(dec!(100)));
}

#[tokio::test]
async fn signature_replay_credits_once() {
    let h = harness();
    let agent = AgentId::new("frank");
    h.chain.add_deposit("sig-a", q(dec!(300)), Some("0xaaa"));

    h.exchange
        .deposit_onchain(&agent, "sig-a", Some(q(dec!(300))), Some("0xaaa"))
        .await
        .unwrap();
    let err = h
        .exchange
        .deposit_onchain(&agent, "sig-a", Some(q(dec!(300))), Some("0xaaa"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::DuplicateSettlement);
    assert_eq!(h.exchange.get_balance(&agent).total, q(dec!(300)));
    assert!(h.exchange.is_deposit_processed("sig-a").unwrap());
    assert_eq!(h.count_events(|p| matches!(p, EventPayload::DuplicateSettlement(_))), 1);
}

/// An unverifiable deposit gives its signature back so a later valid one can land.
#[tokio::test]
async fn invalid_deposit_releases_signature() {
    let h = harness();
    let agent = AgentId::new("gina");

    let err = h
        .exchange
        .deposit_onchain(&agent, "sig-late", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SettlementFailure);
    assert!(!h.exchange.is_deposit_processed("sig-late").unwrap());

    h.chain.add_deposit("sig-late", q(dec!(40)), None);
    h.exchange
        .deposit_onchain(&agent, "sig-late", None, None)
        .await
        .unwrap();
    assert_eq!(h.exchange.get_balance(&agent).total, q(dec!(40)));
}

#[tokio::test]
async fn failed_onchain_withdrawal_unlocks_funds() {
    let h = harness();
    let agent = h.fund("hank", dec!(500));
    h.chain.set_failing_sends(true);

    let err = h
        .exchange
        .withdraw_onchain(&agent, q(dec!(200)), "0x123")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SettlementFailure);
    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.total, q(dec!(500)));
    assert_eq!(balance.locked, Quote::zero());
    assert_eq!(h.exchange.withdrawal_cooldown_remaining(&agent), 0);

    h.chain.set_failing_sends(false);
    let settlement = h
        .exchange
        .withdraw_onchain(&agent, q(dec!(200)), "0x123")
        .await
        .unwrap();
    assert_eq!(settlement.status, SettlementStatus::Settled);
    assert_eq!(h.exchange.get_balance(&agent).total, q(dec!(300)));
    assert_eq!(h.chain.sent().len(), 1);
}

/// Mark equal to index with no interest component: nothing moves.
#[tokio::test]
async fn zero_funding_rate_moves_nothing() {
    let mut config = test_config();
    config.funding.interest_rate = Decimal::ZERO;
    let h = harness_with(config);
    h.price(dec!(50000));
    let maker = h.fund("maker", dec!(5000));
    let taker = h.fund("taker", dec!(5000));
    h.exchange
        .post_intent(&maker, &btc(), Side::Short, q(dec!(2000)), dec!(5), None)
        .unwrap();
    h.exchange
        .open_intent(&taker, &btc(), Side::Long, q(dec!(2000)), dec!(5))
        .await
        .unwrap();
    let before: Vec<AgentBalance> = [&maker, &taker].iter().map(|a| h.exchange.get_balance(a)).collect();

    let result = h.exchange.settle_funding(&btc()).unwrap();
    assert_eq!(result.rate.rate, Decimal::ZERO);
    assert_eq!(result.total_paid, Quote::zero());
    assert_eq!(result.payers + result.receivers, 0);
    let after: Vec<AgentBalance> = [&maker, &taker].iter().map(|a| h.exchange.get_balance(a)).collect();
    assert_eq!(before, after);
    assert_eq!(h.count_events(|p| matches!(p, EventPayload::FundingPayment(_))), 0);
}

/// Mark above index: the long pays, the shorts split it by notional, nothing is lost.
#[tokio::test]
async fn positive_funding_rate_conserves_value() {
    let h = harness();
    h.price(dec!(50000));
    let small = h.fund("short-small", dec!(5000));
    let big = h.fund("short-big", dec!(5000));
    let long = h.fund("long", dec!(5000));
    h.exchange
        .post_intent(&small, &btc(), Side::Short, q(dec!(1000)), dec!(5), None)
        .unwrap();
    h.exchange
        .post_intent(&big, &btc(), Side::Short, q(dec!(2000)), dec!(5), None)
        .unwrap();
    h.exchange
        .open_intent(&long, &btc(), Side::Long, q(dec!(3000)), dec!(5))
        .await
        .unwrap();

    let supply = h.exchange.total_supply();
    let long_before = h.exchange.get_balance(&long).total;
    let small_before = h.exchange.get_balance(&small).total;
    let big_before = h.exchange.get_balance(&big).total;

    h.exchange.on_price_update(
        &btc(),
        Price::new_unchecked(dec!(50100)),
        Some(Price::new_unchecked(dec!(50000))),
    );
    let result = h.exchange.settle_funding(&btc()).unwrap();

    // premium 0.002 + interest 0.0001
    assert_eq!(result.rate.rate, dec!(0.0021));
    assert_eq!(result.total_paid, q(dec!(6.3)));
    assert_eq!(result.total_paid, result.total_received);
    assert_eq!(result.failures, 0);
    assert_eq!(h.exchange.get_balance(&long).total, long_before.sub(q(dec!(6.3))));
    assert_eq!(h.exchange.get_balance(&small).total, small_before.add(q(dec!(2.1))));
    assert_eq!(h.exchange.get_balance(&big).total, big_before.add(q(dec!(4.2))));
    assert_eq!(
        h.exchange.get_balance(&h.exchange.config().ledger.funding_pool_agent()).total,
        Quote::zero()
    );
    assert_eq!(h.exchange.total_supply(), supply);
    assert_eq!(h.exchange.funding_history(&btc(), 10).len(), 1);
}

/// Funding runs on its schedule only.
#[tokio::test]
async fn funding_sweep_waits_for_interval() {
    let h = harness();
    h.price(dec!(50000));
    assert!(h.exchange.run_funding_sweep().is_empty());

    h.clock.advance_time(8 * 3_600_000);
    h.price(dec!(50000));
    let results = h.exchange.run_funding_sweep();
    assert_eq!(results.len(), 1);
    assert!(h.exchange.run_funding_sweep().is_empty());
}

/// Under-margined position is liquidated by the next sweep with exactly one record.
#[tokio::test]
async fn underwater_position_liquidated_once() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("ivan", dec!(1000));
    let trade = h
        .exchange
        .open_intent(&agent, &btc(), Side::Long, q(dec!(1000)), dec!(10))
        .await
        .unwrap();
    let position = trade.position.unwrap();
    assert_eq!(position.liquidation_price, Price::new_unchecked(dec!(46000)));

    // -90 on 100 margin: health 0.1
    h.price(dec!(45500));
    let sweep = h.exchange.run_liquidation_sweep();
    assert_eq!(sweep.executed.len(), 1);
    assert!(sweep.failed.is_empty());

    let record = &sweep.executed[0];
    assert!(record.is_executed());
    assert_eq!(record.position_id, position.id);
    assert_eq!(record.fee_charged, q(dec!(5)));
    assert_eq!(record.returned_to_agent, q(dec!(5)));
    assert_eq!(record.bad_debt, Quote::zero());

    let closed = h.exchange.get_position(&position.id).unwrap();
    assert!(!closed.is_open);
    assert_eq!(closed.close_reason, Some(CloseReason::Liquidation));
    assert_eq!(h.exchange.liquidation_state(&position.id), LiquidationState::Executed);
    assert_eq!(h.exchange.tracked_liquidations(), 0);

    // 1000 - 0.5 taker fee - 90 loss - 5 liquidation fee
    let balance = h.exchange.get_balance(&agent);
    assert_eq!(balance.total, q(dec!(904.5)));
    assert_eq!(balance.locked, Quote::zero());

    let again = h.exchange.run_liquidation_sweep();
    assert!(again.executed.is_empty());
    assert_eq!(h.exchange.get_liquidations(10).len(), 1);
    h.assert_solvent();
}

/// Loss beyond the margin never drives the balance negative; the excess is bad debt.
#[tokio::test]
async fn gap_through_margin_reports_bad_debt() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("judy", dec!(200));
    let trade = h
        .exchange
        .open_intent(&agent, &btc(), Side::Long, q(dec!(1000)), dec!(10))
        .await
        .unwrap();
    let position = trade.position.unwrap();

    // -200 on 100 margin
    h.price(dec!(40000));
    let sweep = h.exchange.run_liquidation_sweep();
    let record = &sweep.executed[0];
    assert_eq!(record.position_id, position.id);
    assert_eq!(record.bad_debt, q(dec!(100)));
    assert_eq!(record.fee_charged, Quote::zero());
    assert_eq!(h.count_events(|p| matches!(p, EventPayload::BadDebt(_))), 1);

    // 200 - 0.5 fee - 100 margin lost
    assert_eq!(h.exchange.get_balance(&agent).total, q(dec!(99.5)));
    h.assert_solvent();
}

/// No fresh price: the liquidation is recorded as failed and retried next sweep.
#[tokio::test]
async fn stale_price_fails_then_retries_liquidation() {
    let h = harness();
    h.price(dec!(50000));
    let agent = h.fund("kim", dec!(1000));
    let position = h
        .exchange
        .open_intent(&agent, &btc(), Side::Long, q(dec!(1000)), dec!(10))
        .await
        .unwrap()
        .position
        .unwrap();

    // underwater at the last mark, then the feed goes quiet
    h.price(dec!(45500));
    h.clock.advance_time(120_000);
    let sweep = h.exchange.run_liquidation_sweep();
    assert!(sweep.executed.is_empty());
    assert_eq!(sweep.failed.len(), 1);
    assert_eq!(h.exchange.liquidation_state(&position.id), LiquidationState::Failed);
    assert!(h.exchange.get_position(&position.id).unwrap().is_open);

    h.price(dec!(45500));
    let retry = h.exchange.run_liquidation_sweep();
    assert_eq!(retry.executed.len(), 1);
    assert_eq!(retry.executed[0].attempt, 2);
    assert_eq!(h.exchange.get_liquidations(10).len(), 2);
}

/// Cancelling refunds the reservation; a second cancel is refused.
#[tokio::test]
async fn cancel_refunds_and_is_not_repeatable() {
    let h = harness();
    let agent = h.fund("leo", dec!(1000));
    let intent = h
        .exchange
        .post_intent(&agent, &btc(), Side::Long, q(dec!(500)), dec!(5), None)
        .unwrap();
    // 100 margin + 0.1 maker fee
    assert_eq!(h.exchange.get_balance(&agent).locked, q(dec!(100.1)));

    let closed = h.exchange.cancel_intent(&agent, &intent.id).unwrap();
    assert_eq!(closed.refund, q(dec!(100.1)));
    assert_eq!(h.exchange.get_balance(&agent).locked, Quote::zero());

    let err = h.exchange.cancel_intent(&agent, &intent.id).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IntentNotOpen);
    let other = h.exchange.cancel_intent(&AgentId::new("mallory"), &intent.id).unwrap_err();
    assert_eq!(other.code(), ErrorCode::IntentNotFound);
}

/// A partly filled intent refunds only what it still had reserved when it expires.
#[tokio::test]
async fn expiry_refunds_remaining_reservation() {
    let h = harness();
    h.price(dec!(50000));
    let maker = h.fund("maker", dec!(1000));
    let taker = h.fund("taker", dec!(1000));
    h.exchange
        .post_intent(
            &maker,
            &btc(),
            Side::Short,
            q(dec!(1000)),
            dec!(10),
            Some(std::time::Duration::from_secs(30)),
        )
        .unwrap();
    h.exchange
        .open_intent(&taker, &btc(), Side::Long, q(dec!(400)), dec!(10))
        .await
        .unwrap();

    h.clock.advance_time(31_000);
    let expired = h.exchange.expire_intents();
    assert_eq!(expired.len(), 1);
    // 60 margin + 0.12 fee left of the 600 unfilled
    assert_eq!(expired[0].refund, q(dec!(60.12)));

    // only the open position's margin stays locked
    assert_eq!(h.exchange.get_balance(&maker).locked, q(dec!(40)));
    h.assert_solvent();
}

/// Mixed sequence of every balance-moving operation keeps the invariant.
#[tokio::test]
async fn balance_invariant_after_mixed_sequence() {
    let h = harness();
    h.price(dec!(50000));
    let a = h.fund("a", dec!(3000));
    let b = h.fund("b", dec!(3000));
    let c = h.fund("c", dec!(3000));

    let resting = h
        .exchange
        .post_intent(&a, &btc(), Side::Short, q(dec!(1500)), dec!(5), None)
        .unwrap();
    let t1 = h
        .exchange
        .open_intent(&b, &btc(), Side::Long, q(dec!(1000)), dec!(5))
        .await
        .unwrap();
    h.exchange.transfer(&c, &a, q(dec!(250))).unwrap();
    let t2 = h
        .exchange
        .open_intent(&c, &btc(), Side::Short, q(dec!(800)), dec!(4))
        .await
        .unwrap();
    h.exchange.cancel_intent(&a, &resting.id).unwrap();

    h.price(dec!(51000));
    h.exchange
        .close_position(&t1.position.unwrap().id, dec!(0.5))
        .unwrap();
    h.exchange.close_position(&t2.position.unwrap().id, dec!(1)).unwrap();
    assert!(!h.exchange.withdraw(&b, q(dec!(1_000_000))).unwrap());
    assert!(h.exchange.withdraw(&c, q(dec!(100))).unwrap());

    h.assert_solvent();
    assert!(h.exchange.get_positions(&c).is_empty());
}
