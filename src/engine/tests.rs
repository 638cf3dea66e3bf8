//! Engine scenario suite: lifecycle, fills, stray handling, slippage,
//! diverge/converge, maintenance, and snapshots against a recording mock
//! adapter with a manual clock.

use std::collections::HashMap;

use super::dc::DcGroup;
use super::test_util::*;
use super::Engine;
use crate::amount::Amount;
use crate::config::MarketSettings;
use crate::errors::EngineError;
use crate::exchange::ExchangeKind;
use crate::types::{CancelReason, FillSource, OrderInfo, OrderStatus, Side, TickerQuote};

/// Registry invariants that must hold between operations: every position is
/// exactly one of queued/active, the order-id map points at active
/// positions, the open-price multiset mirrors the positions, and no rung
/// index is owned twice outside a DC transit.
fn assert_registry_invariants(engine: &Engine<MockAdapter>) {
    for (id, _) in engine.arena.iter() {
        let queued = engine.queued.contains(&id);
        let active = engine.active.contains(&id);
        assert!(
            queued ^ active,
            "position must be in exactly one of queued/active"
        );
    }

    for (order_id, id) in &engine.by_order_id {
        assert!(engine.active.contains(id), "order ids map to active positions");
        let pos = engine.position(*id).expect("mapped position exists");
        assert_eq!(pos.order_id.as_deref(), Some(order_id.as_str()));
    }

    for (market, info) in &engine.markets {
        let positions: Vec<_> = engine
            .arena
            .iter()
            .filter(|(_, p)| p.market == *market)
            .collect();
        assert_eq!(
            info.order_prices.len(),
            positions.len(),
            "open-price multiset matches positions for {market}"
        );
        for (_, pos) in &positions {
            assert!(info.has_order_price(pos.price));
        }
    }

    // unique index ownership per market, DC transits excepted
    let mut owned: HashMap<(String, u32), usize> = HashMap::new();
    for (_, pos) in engine.arena.iter() {
        for idx in &pos.market_indices {
            *owned.entry((pos.market.clone(), *idx)).or_insert(0) += 1;
        }
    }
    for ((market, idx), count) in owned {
        if count > 1 {
            assert!(
                engine.is_index_diverging_converging(&market, idx),
                "index {idx} of {market} owned {count} times outside DC"
            );
        }
    }
}

// === S1: place, activate, detect fill from open-orders scan, flip ===

#[test]
fn s1_fill_from_order_scan_flips_to_sell() {
    let (mut engine, clock) = test_engine(ExchangeKind::Binance);

    let id = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();

    // rung 0 allocated, position queued, one submit out
    assert_eq!(engine.market(MARKET).unwrap().index.len(), 1);
    assert!(engine.is_queued(id));
    assert_eq!(engine.adapter.submits.len(), 1);
    assert_registry_invariants(&engine);

    engine.activate(id, "id1");
    assert!(engine.is_active(id));
    // binance ids are market-prefixed in the registry
    assert_eq!(engine.position_for_order_id("BTC-TESTid1"), Some(id));
    assert_registry_invariants(&engine);

    // a snapshot sent after placement, past the safety delay, without our
    // id: that is a fill
    clock.advance_ms(3_000);
    engine.on_open_orders(&[], &[], START_MS + 2_500);

    assert!(engine.position(id).is_none(), "filled position released");
    assert_eq!(engine.queued.len(), 1, "flip queued a new position");

    let flipped = engine.position(engine.queued[0]).unwrap();
    assert_eq!(flipped.side, Side::Sell);
    assert_eq!(flipped.market_indices.as_slice(), &[0]);
    assert_eq!(flipped.buy_price, amt("1.00"));
    assert_eq!(flipped.sell_price, amt("2.00"));

    let rung = engine.market(MARKET).unwrap().index.get(0).unwrap();
    assert_eq!(rung.fill_count, 1);
    assert_registry_invariants(&engine);
}

// === S2: post-only sell improvement at placement ===

#[test]
fn s2_sell_lifts_to_one_tick_under_ask() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Binance);
    set_ticker(&mut engine, "2.00", "2.10");

    let id = engine
        .add_position(MARKET, Side::Sell, "1.00", "2.05", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();

    let pos = engine.position(id).unwrap();
    assert_eq!(pos.sell_price, amt("2.09999999"));
    assert_eq!(pos.price, amt("2.09999999"));
    assert_eq!(pos.sell_price_original, amt("2.05"));
    assert!(pos.is_slippage);
    assert!(pos.sell_price >= pos.sell_price_original, "never below original");
}

// === S3: taker spread guard ===

#[test]
fn s3_taker_rejected_off_spread_unless_overridden() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Binance);
    set_ticker(&mut engine, "1.95", "2.00");

    let rejected = engine.add_position(
        MARKET, Side::Buy, "2.50", "2.50", "10", "onetime-taker", "", &[], false, true,
    );
    assert!(matches!(rejected, Err(EngineError::SpreadViolation { .. })));
    assert!(!engine.has_queued_positions());

    let accepted = engine.add_position(
        MARKET, Side::Buy, "2.50", "2.50", "10", "onetime-taker-override", "", &[], false, true,
    );
    assert!(accepted.unwrap().is_some());
}

#[test]
fn taker_rejected_when_no_ticker_is_known() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Binance);
    let rejected = engine.add_position(
        MARKET, Side::Buy, "2.50", "2.50", "10", "onetime-taker", "", &[], false, true,
    );
    assert!(matches!(rejected, Err(EngineError::SpreadViolation { .. })));
}

// === S4: convergence boundary and landmark handoff ===

#[test]
fn s4_converge_handoff_spans_landmark() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let a = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "a");
    let b = add_active(&mut engine, Side::Buy, "1.10", "2.10", "10", "b");
    let c = add_active(&mut engine, Side::Buy, "1.20", "2.20", "10", "c");

    // H_buy = 2, boundary = 2: only rungs 0 and 1 are past it, which is
    // short of order_dc = 3 - nothing converges
    engine.on_check_diverge_converge();
    assert!(engine.dc_groups.is_empty());
    assert!(engine.adapter.cancels.is_empty());

    // force the three rungs through a landmark handoff
    engine.dc_groups.push(DcGroup {
        market: MARKET.to_string(),
        positions: vec![a, b, c],
        landmark: true,
        indices: vec![0, 1, 2],
        side: Side::Buy,
    });
    for idx in 0..3 {
        engine
            .diverging_converging
            .entry(MARKET.to_string())
            .or_default()
            .push(idx);
    }
    for id in [a, b, c] {
        engine.cancel_order(id, true, CancelReason::ForDC);
    }
    for id in [a, b, c] {
        engine.process_cancelled_order(id);
    }

    assert_eq!(engine.queued.len(), 1);
    let landmark = engine.position(engine.queued[0]).unwrap();
    assert!(landmark.is_landmark);
    assert_eq!(landmark.side, Side::Buy);
    assert_eq!(landmark.market_indices.as_slice(), &[0, 1, 2]);
    assert_eq!(landmark.btc_amount, amt("30"));
    assert_eq!(landmark.buy_price, amt("1.10"));

    assert!(engine
        .diverging_converging
        .get(MARKET)
        .map(|v| v.is_empty())
        .unwrap_or(true));
    assert_registry_invariants(&engine);
}

#[test]
fn converge_sells_forms_group_from_scan() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    // one buy anchors H_buy = 0; sells on rungs 1..=4
    add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "b0");
    add_active(&mut engine, Side::Sell, "1.10", "2.10", "10", "s1");
    add_active(&mut engine, Side::Sell, "1.20", "2.20", "10", "s2");
    add_active(&mut engine, Side::Sell, "1.30", "2.30", "10", "s3");
    add_active(&mut engine, Side::Sell, "1.40", "2.40", "10", "s4");

    engine.adapter.cancels.clear();
    engine.on_check_diverge_converge();

    // sell boundary = H_buy + 1 = 1; candidates are rungs with lo_idx > 1:
    // {2,3,4}, a contiguous run of order_dc = 3
    assert_eq!(engine.dc_groups.len(), 1);
    let group = &engine.dc_groups[0];
    assert!(group.landmark);
    assert_eq!(group.side, Side::Sell);
    assert_eq!(group.indices, vec![4, 3, 2]);
    assert_eq!(engine.adapter.cancels.len(), 3);
    for idx in [2, 3, 4] {
        assert!(engine.is_index_diverging_converging(MARKET, idx));
    }
    assert_registry_invariants(&engine);
}

#[test]
fn diverge_unwinds_landmark_to_single_rungs() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    settings.landmark_start = 1;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    // three real rungs, reserved as ghosts
    for (buy, sell) in [("1.00", "2.00"), ("1.10", "2.10"), ("1.20", "2.20")] {
        engine
            .add_position(MARKET, Side::Buy, buy, sell, "10", "ghost", "", &[], false, true)
            .unwrap();
    }

    let id = engine
        .add_position(
            MARKET,
            Side::Buy,
            "0.00000001",
            "0.00000002",
            "0.00000000",
            "active",
            "",
            &[0, 1, 2],
            true,
            true,
        )
        .unwrap()
        .unwrap();
    engine.activate(id, "L1");
    assert!(engine.position(id).unwrap().is_landmark);

    // boundary = H_buy - landmark_start = 1; the landmark's high index 2
    // is above it, so it diverges
    engine.on_check_diverge_converge();
    assert_eq!(engine.dc_groups.len(), 1);
    assert!(!engine.dc_groups[0].landmark);

    engine.process_cancelled_order(id);

    assert_eq!(engine.queued.len(), 3);
    let mut covered: Vec<u32> = engine
        .queued
        .iter()
        .map(|q| {
            let pos = engine.position(*q).unwrap();
            assert!(!pos.is_landmark);
            assert_eq!(pos.side, Side::Buy);
            assert_eq!(pos.market_indices.len(), 1);
            pos.market_indices[0]
        })
        .collect();
    covered.sort_unstable();
    assert_eq!(covered, vec![0, 1, 2]);

    assert!(engine
        .diverging_converging
        .get(MARKET)
        .map(|v| v.is_empty())
        .unwrap_or(true));
    assert_registry_invariants(&engine);
}

// === S5: stray adoption ===

#[test]
fn s5_stray_matching_queued_position_is_adopted() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);

    let id = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    assert!(engine.is_queued(id));

    clock.advance_ms(12_000);
    let row = OrderInfo {
        market: MARKET.to_string(),
        side: Side::Buy,
        price: amt("1.00"),
        btc_amount: amt("10"),
        order_id: "ext1".to_string(),
    };
    engine.on_open_orders(&["ext1".to_string()], &[row], START_MS + 12_000);

    assert!(engine.is_active(id), "queued position adopted, not cancelled");
    assert_eq!(engine.position_for_order_id("ext1"), Some(id));
    assert!(engine.adapter.cancels.is_empty());
    assert!(engine.order_grace_times.is_empty());
    assert_registry_invariants(&engine);
}

#[test]
fn stray_without_match_is_cancelled_after_grace() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);

    // a queued position at the same price but a different size: price
    // matches the grid, amount does not, so no adoption
    engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "5", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    clock.advance_ms(12_000);

    let row = OrderInfo {
        market: MARKET.to_string(),
        side: Side::Buy,
        price: amt("1.00"),
        btc_amount: amt("10"),
        order_id: "s1".to_string(),
    };
    let ids = vec!["s1".to_string()];

    engine.on_open_orders(&ids, std::slice::from_ref(&row), clock.now_ms());
    assert!(engine.adapter.cancels.is_empty(), "first sighting starts grace");
    assert!(engine.order_grace_times.contains_key("s1"));

    clock.advance_ms(600_001);
    engine.on_open_orders(&ids, std::slice::from_ref(&row), clock.now_ms());
    assert_eq!(engine.adapter.cancels, vec![("s1".to_string(), None)]);

    // backoff: an immediate re-sighting does not re-cancel
    clock.advance_ms(1_000);
    engine.on_open_orders(&ids, std::slice::from_ref(&row), clock.now_ms());
    assert_eq!(engine.adapter.cancels.len(), 1);
}

#[test]
fn grace_entries_are_pruned_after_twice_the_limit() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);
    engine.order_grace_times.insert("old".to_string(), START_MS);

    clock.advance_ms(engine.settings.stray_grace_time_limit_ms * 2 + 1);
    engine.clean_grace_times();
    assert!(engine.order_grace_times.is_empty());
}

// === S6: one-time order max age ===

#[test]
fn s6_onetime_order_cancelled_for_max_age() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);

    let id = engine
        .add_position(
            MARKET, Side::Buy, "2.00", "2.00", "10", "onetime-timeout5", "", &[], false, true,
        )
        .unwrap()
        .unwrap();
    engine.activate(id, "o1");
    assert_eq!(engine.position(id).unwrap().max_age_minutes, 5);

    // just before the deadline: nothing happens
    clock.advance_ms(5 * 60_000 - 1);
    engine.on_check_timeouts();
    assert!(engine.adapter.cancels.is_empty());

    clock.advance_ms(2);
    engine.on_check_timeouts();
    assert_eq!(engine.adapter.cancels.len(), 1);
    assert_eq!(
        engine.position(id).unwrap().cancel_reason,
        Some(CancelReason::ForMaxAge)
    );

    engine.process_cancelled_order(id);
    assert!(engine.position(id).is_none());
    assert!(!engine.has_queued_positions(), "one-time orders never flip");
}

// === lifecycle odds and ends ===

#[test]
fn cancel_while_queued_defers_until_activation() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let id = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    engine.cancel_order(id, false, CancelReason::ByUser);

    let pos = engine.position(id).unwrap();
    assert!(pos.is_cancelling);
    assert_eq!(pos.order_cancel_time, 1);
    assert!(engine.adapter.cancels.is_empty(), "no id yet, nothing on the wire");

    engine.activate(id, "x1");
    assert_eq!(engine.adapter.cancels, vec![("x1".to_string(), Some(id))]);
}

#[test]
fn queued_order_resubmitted_after_request_timeout() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);

    let id = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    assert_eq!(engine.adapter.submits.len(), 1);

    clock.advance_ms(engine.settings.request_timeout_ms + 1);
    engine.on_check_timeouts();

    assert_eq!(engine.adapter.submits.len(), 2);
    assert_eq!(engine.adapter.submits[1].id, id);
}

#[test]
fn stuck_cancel_is_recancelled_with_same_reason() {
    let (mut engine, clock) = test_engine(ExchangeKind::Poloniex);

    let id = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "c1");
    engine.cancel_order(id, true, CancelReason::ForMaxAge);
    assert_eq!(engine.adapter.cancels.len(), 1);

    clock.advance_ms(engine.settings.cancel_timeout_ms + 1);
    engine.on_check_timeouts();

    assert_eq!(engine.adapter.cancels.len(), 2);
    assert_eq!(
        engine.position(id).unwrap().cancel_reason,
        Some(CancelReason::ForMaxAge)
    );
}

#[test]
fn remove_aborts_inflight_requests_and_clears_tables() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let id = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "r1");
    engine.remove(id);

    assert!(engine.position(id).is_none());
    assert_eq!(engine.adapter.aborts, vec![id]);
    assert!(!engine.is_order_id("r1"));
    assert!(engine.market(MARKET).unwrap().order_prices.is_empty());
}

#[test]
fn fatal_submit_error_removes_queued_position() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let id = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();

    engine.on_submit_error(id, crate::exchange::SubmitError::Fatal("not enough balance".into()));
    assert!(engine.position(id).is_none());

    // transient errors leave the position queued for the retry timer
    let id2 = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    engine.on_submit_error(id2, crate::exchange::SubmitError::Transient("429".into()));
    assert!(engine.is_queued(id2));
}

// === validations ===

#[test]
fn add_position_rejects_bad_input() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let bad_type = engine.add_position(
        MARKET, Side::Buy, "1.00", "2.00", "10", "limit", "", &[], false, true,
    );
    assert!(matches!(bad_type, Err(EngineError::InvalidInput(_))));

    let empty = engine.add_position(MARKET, Side::Buy, "", "2.00", "10", "active", "", &[], false, true);
    assert!(matches!(empty, Err(EngineError::InvalidInput(_))));

    let inverted = engine.add_position(
        MARKET, Side::Buy, "2.00", "1.00", "10", "active", "", &[], false, true,
    );
    assert!(matches!(inverted, Err(EngineError::InvalidInput(_))));

    let landmark_onetime = engine.add_position(
        MARKET, Side::Buy, "1.00", "2.00", "10", "onetime", "", &[], true, true,
    );
    assert!(matches!(landmark_onetime, Err(EngineError::InvalidInput(_))));

    // nine decimals do not survive the eight-digit amount
    let precision = engine.add_position(
        MARKET, Side::Buy, "1.123456789", "2.00", "10", "active", "", &[], false, true,
    );
    assert!(matches!(precision, Err(EngineError::PrecisionLoss { .. })));

    // price sanity is judged before precision: an inverted pair with an
    // over-precise literal reports the bad order, not the lost decimals
    let inverted_and_long = engine.add_position(
        MARKET, Side::Buy, "1.123456789", "1.00", "10", "active", "", &[], false, true,
    );
    assert!(matches!(inverted_and_long, Err(EngineError::InvalidInput(_))));

    assert!(!engine.has_queued_positions());
    assert_eq!(engine.market(MARKET).unwrap().index.len(), 0, "no side effects");
}

#[test]
fn ghost_reserves_rung_without_placing() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let result = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10/4", "ghost", "", &[], false, true)
        .unwrap();
    assert!(result.is_none());
    assert_eq!(engine.market(MARKET).unwrap().index.len(), 1);
    assert!(!engine.has_queued_positions());
    assert!(engine.adapter.submits.is_empty());

    let rung = engine.market(MARKET).unwrap().index.get(0).unwrap();
    assert_eq!(rung.order_size, amt("10"));
    assert_eq!(rung.alternate_size, amt("4"));
}

#[test]
fn binance_price_window_rejects_far_orders() {
    let mut settings = grid_settings();
    settings.price_min_mul = amt("0.2");
    settings.price_max_mul = amt("5");
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Binance, settings);
    set_ticker(&mut engine, "2.00", "2.10");

    // buy limit = 2.00 * 0.2 * 1.2 = 0.48
    let too_low = engine.add_position(
        MARKET, Side::Buy, "0.40", "0.60", "10", "active", "", &[], false, true,
    );
    assert!(matches!(too_low, Err(EngineError::ExchangeLimit { .. })));

    let in_window = engine.add_position(
        MARKET, Side::Buy, "0.50", "0.60", "10", "active", "", &[], false, true,
    );
    assert!(in_window.unwrap().is_some());

    // sell limit = 2.10 * 5 * 0.8 = 8.40
    let too_high = engine.add_position(
        MARKET, Side::Sell, "1.00", "9.00", "10", "active", "", &[], false, true,
    );
    assert!(matches!(too_high, Err(EngineError::ExchangeLimit { .. })));
}

// === fill pipeline ===

#[test]
fn fills_process_most_at_market_first() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let a = add_active(&mut engine, Side::Buy, "1.00", "4.00", "10", "a"); // ratio 0.25
    let b = add_active(&mut engine, Side::Buy, "1.00", "1.25", "10", "b"); // ratio 0.80
    let c = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "c"); // ratio 0.50
    let d = engine
        .add_position(MARKET, Side::Buy, "1.00", "1.00", "10", "onetime", "", &[], false, true)
        .unwrap()
        .unwrap();
    engine.activate(d, "d");

    engine.adapter.submits.clear();
    engine.process_filled(vec![d, b, a, c], FillSource::OrderScan);

    // flips go out lowest ratio first; the one-time order is settled last
    // and never flips
    let prices: Vec<Amount> = engine.adapter.submits.iter().map(|s| s.price).collect();
    assert_eq!(prices, vec![amt("4.00"), amt("2.00"), amt("1.25")]);
    assert!(engine.adapter.submits.iter().all(|s| s.side == Side::Sell));
    assert!(engine.position(d).is_none());
}

#[test]
fn duplicate_fill_candidates_settle_once() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let id = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "dup");
    engine.adapter.submits.clear();

    engine.process_filled(vec![id, id], FillSource::Ticker);
    assert_eq!(engine.adapter.submits.len(), 1, "one flip for one fill");
}

#[test]
fn ticker_collision_fills_after_grace() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let id = add_active(&mut engine, Side::Buy, "2.00", "3.00", "10", "t1");

    let mut tickers = HashMap::new();
    tickers.insert(
        MARKET.to_string(),
        TickerQuote {
            bid: amt("1.50"),
            ask: amt("1.90"),
        },
    );

    // collision seen immediately: too fresh, no fill yet
    engine.on_ticker(&tickers, clock.now_ms());
    assert!(engine.position(id).is_some());

    clock.advance_ms(3_000);
    engine.on_ticker(&tickers, clock.now_ms() - 100);

    assert!(engine.position(id).is_none());
    assert_eq!(engine.queued.len(), 1);
    assert_eq!(engine.position(engine.queued[0]).unwrap().side, Side::Sell);
    assert_eq!(engine.market(MARKET).unwrap().index.get(0).unwrap().fill_count, 1);
}

#[test]
fn push_feed_ticker_updates_spread_without_fills() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let id = add_active(&mut engine, Side::Buy, "2.00", "3.00", "10", "p1");
    clock.advance_ms(10_000);

    // sent_ms <= 0 marks a feed without request timestamps
    set_ticker(&mut engine, "1.50", "1.90");
    assert!(engine.position(id).is_some(), "no fills from a push feed");
    assert_eq!(engine.hi_buy(MARKET), amt("1.50"));
    assert_eq!(engine.lo_sell(MARKET), amt("1.90"));
}

#[test]
fn blank_orderbook_flash_is_mitigated() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    for i in 0..51 {
        let buy = format!("{:.2}", 1.0 + i as f64 * 0.01);
        let sell = format!("{:.2}", 2.0 + i as f64 * 0.01);
        add_active(&mut engine, Side::Buy, &buy, &sell, "10", &format!("id{i}"));
    }
    clock.advance_ms(3_000);

    engine.on_open_orders(&[], &[], clock.now_ms() - 100);
    assert_eq!(engine.active.len(), 51, "empty snapshot ignored");

    // with mitigation off the same snapshot fills everything
    engine.settings.should_mitigate_blank_orderbook_flash = false;
    engine.on_open_orders(&[], &[], clock.now_ms() - 100);
    assert!(engine.active.is_empty());
    assert_eq!(engine.queued.len(), 51);
}

#[test]
fn bittrex_probes_missing_orders_instead_of_filling() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Bittrex, settings);

    for i in 0..7 {
        let buy = format!("{:.2}", 1.0 + i as f64 * 0.01);
        let sell = format!("{:.2}", 2.0 + i as f64 * 0.01);
        add_active(&mut engine, Side::Buy, &buy, &sell, "10", &format!("m{i}"));
    }
    clock.advance_ms(3_000);

    engine.on_open_orders(&[], &[], clock.now_ms() - 100);

    // probes are rate-limited to five per cycle and nothing fills outright
    assert_eq!(engine.adapter.probes.len(), 5);
    assert_eq!(engine.active.len(), 7);

    // re-running within the per-order probe interval sends nothing new
    engine.on_open_orders(&[], &[], clock.now_ms() - 100);
    assert_eq!(engine.adapter.probes.len(), 7);
}

#[test]
fn order_status_feed_fills_and_cancels() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Waves, settings);

    let filled = add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "w1");
    engine.on_order_status("w1", OrderStatus::Filled, Amount::ZERO);
    assert!(engine.position(filled).is_none());
    assert_eq!(engine.queued.len(), 1, "status fill flips");

    let cancelled = add_active(&mut engine, Side::Buy, "1.10", "2.10", "10", "w2");
    engine.cancel_order(cancelled, true, CancelReason::ByUser);
    engine.on_order_status("w2", OrderStatus::Cancelled, amt("3"));
    assert!(engine.position(cancelled).is_none());

    // a status for an unknown id cancels the stray remotely
    engine.adapter.cancels.clear();
    engine.on_order_status("zz", OrderStatus::Filled, Amount::ZERO);
    assert_eq!(engine.adapter.cancels, vec![("zz".to_string(), None)]);
}

// === slippage ===

#[test]
fn slippage_timeout_resets_through_cancel_and_replace() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);
    set_ticker(&mut engine, "2.00", "2.10");

    // buy crosses the ask at placement and clamps under it
    let id = engine
        .add_position(MARKET, Side::Buy, "2.20", "2.40", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    {
        let pos = engine.position(id).unwrap();
        assert!(pos.is_slippage);
        assert_eq!(pos.buy_price, amt("2.09999999"));
    }
    engine.activate(id, "s1");

    // the market moves away; after the slippage timeout the order resets
    set_ticker(&mut engine, "1.80", "1.90");
    clock.advance_ms(120_001);
    engine.on_check_timeouts();

    let pos = engine.position(id).unwrap();
    assert_eq!(pos.cancel_reason, Some(CancelReason::ForSlippageReset));
    assert_eq!(pos.buy_price, amt("1.89999999"));

    engine.process_cancelled_order(id);
    assert!(engine.position(id).is_none());

    // replacement goes out on the same side at the rung's prices, clamped
    // to the new spread at placement
    assert_eq!(engine.queued.len(), 1);
    let replacement = engine.position(engine.queued[0]).unwrap();
    assert_eq!(replacement.side, Side::Buy);
    assert_eq!(replacement.buy_price_original, amt("2.20"));
    assert_eq!(replacement.buy_price, amt("1.89999999"));
    assert!(replacement.is_slippage);
}

#[test]
fn find_better_price_backs_off_monotonically() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Binance, settings);
    set_ticker(&mut engine, "2.00", "2.10");

    let id = engine
        .add_position(MARKET, Side::Sell, "1.00", "2.05", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();

    // the first reset re-bases the sell one tick outside the bid
    engine.find_better_price(id);
    {
        let pos = engine.position(id).unwrap();
        assert_eq!(pos.price_reset_count, 1);
        assert_eq!(pos.sell_price, amt("2.00000001"));
    }

    // later resets are additive with a growing offset; each moves further
    // out than the one before
    let mut last = engine.position(id).unwrap().sell_price;
    for expected_resets in 2..=4u32 {
        engine.find_better_price(id);
        let pos = engine.position(id).unwrap();
        assert_eq!(pos.price_reset_count, expected_resets);
        assert!(pos.sell_price > last, "reset must move the price out");
        last = pos.sell_price;
    }

    // every reset resubmits
    assert_eq!(engine.adapter.submits.len(), 5);
    assert_registry_invariants(&engine);
}

// === maintenance ===

#[test]
fn count_reconciliation_fills_up_to_order_min() {
    let settings = MarketSettings {
        order_min: 3,
        order_max: 5,
        order_dc: 1,
        ..MarketSettings::default()
    };
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    // six reserved rungs, one live buy at the top rung
    for i in 0..6 {
        let buy = format!("{:.2}", 1.0 + i as f64 * 0.1);
        let sell = format!("{:.2}", 2.0 + i as f64 * 0.1);
        engine
            .add_position(MARKET, Side::Buy, &buy, &sell, "10", "ghost", "", &[], false, true)
            .unwrap();
    }
    let anchor = engine
        .add_position(MARKET, Side::Buy, "1.50", "2.50", "10", "active", "", &[5], false, true)
        .unwrap()
        .unwrap();
    engine.activate(anchor, "b5");

    engine.check_buy_sell_count();

    assert_eq!(engine.buy_total(MARKET), 3);
    assert!(engine.position_by_index(MARKET, 4).is_some());
    assert!(engine.position_by_index(MARKET, 3).is_some());
    // auto-set orders take their prices from the rung data
    let auto = engine
        .position(engine.position_by_index(MARKET, 4).unwrap())
        .unwrap();
    assert_eq!(auto.buy_price, amt("1.40"));
    assert!(auto.is_new_hilo_order);
    assert_registry_invariants(&engine);
}

#[test]
fn count_reconciliation_cancels_above_order_max() {
    let settings = MarketSettings {
        order_min: 1,
        order_max: 2,
        order_dc: 1,
        ..MarketSettings::default()
    };
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    for (i, (buy, sell)) in [("1.00", "2.00"), ("1.10", "2.10"), ("1.20", "2.20")]
        .iter()
        .enumerate()
    {
        engine
            .add_position(MARKET, Side::Buy, buy, sell, "10", "ghost", "", &[], false, true)
            .unwrap();
        let id = engine
            .add_position(MARKET, Side::Buy, buy, sell, "10", "active", "", &[i as u32], false, true)
            .unwrap()
            .unwrap();
        engine.activate(id, &format!("b{i}"));
    }

    engine.check_buy_sell_count();

    // the lowest rung's order is cancelled to get back inside the band
    let lowest = engine.position_by_index(MARKET, 0).unwrap();
    assert!(engine.position(lowest).unwrap().is_cancelling);
    assert_eq!(
        engine.position(lowest).unwrap().cancel_reason,
        Some(CancelReason::Lowest)
    );
}

#[test]
fn maintenance_epoch_saves_and_cancels_once() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let dir = std::env::temp_dir().join(format!("gridpong-maint-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    engine.settings.snapshot_dir = dir.clone();
    engine.settings.maintenance_time_ms = START_MS + 1_000;

    add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "m1");

    clock.advance_ms(2_000);
    engine.on_check_diverge_converge();

    assert!(engine.maintenance_triggered);
    assert!(dir.join("index-all.txt").exists());
    assert!(engine.market(MARKET).unwrap().index.is_empty(), "index cleared");

    // one-shot: a later tick does not run it again
    engine.settings.maintenance_time_ms = START_MS + 1_000;
    engine.on_check_diverge_converge();
    assert!(engine.maintenance_triggered);

    std::fs::remove_dir_all(&dir).ok();
}

// === cancel passes ===

#[test]
fn cancel_local_releases_queued_and_cancels_active() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    let queued = engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    let active = add_active(&mut engine, Side::Sell, "1.10", "2.10", "10", "a1");

    engine.cancel_local("all");

    assert!(engine.position(queued).is_none(), "queued removed outright");
    assert!(engine.position(active).unwrap().is_cancelling);
    assert!(engine.market(MARKET).unwrap().index.is_empty());
    assert!(engine.market(MARKET).unwrap().order_prices.is_empty());
}

#[test]
fn cancel_all_refuses_with_local_positions_then_cancels_remotely() {
    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);

    engine
        .add_position(MARKET, Side::Buy, "1.00", "2.00", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    assert!(matches!(
        engine.cancel_all("all"),
        Err(EngineError::InvalidInput(_))
    ));

    let (mut engine, _clock) = test_engine(ExchangeKind::Poloniex);
    engine.cancel_all("all").unwrap();

    let rows = vec![
        OrderInfo {
            market: MARKET.to_string(),
            side: Side::Buy,
            price: amt("1.00"),
            btc_amount: amt("10"),
            order_id: "x1".to_string(),
        },
        OrderInfo {
            market: MARKET.to_string(),
            side: Side::Sell,
            price: amt("2.00"),
            btc_amount: amt("10"),
            order_id: "x2".to_string(),
        },
    ];
    engine.on_open_orders(
        &["x1".to_string(), "x2".to_string()],
        &rows,
        START_MS,
    );

    let cancelled: Vec<&str> = engine.adapter.cancels.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(cancelled, vec!["x1", "x2"]);

    // the pass disarms after one snapshot
    engine.on_open_orders(&["x1".to_string(), "x2".to_string()], &rows, START_MS);
    assert_eq!(engine.adapter.cancels.len(), 2);
}

// === directional flips ===

#[test]
fn flip_hi_buy_cancels_for_shortlong_and_flips_on_ack() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "f1");
    let hi = add_active(&mut engine, Side::Buy, "1.50", "2.50", "10", "f2");

    assert_eq!(engine.hi_buy_flip_price(MARKET), amt("2.50"));

    engine.flip_hi_buy_price(MARKET, "shortlong");
    let pos = engine.position(hi).unwrap();
    assert!(pos.is_cancelling);
    assert_eq!(pos.cancel_reason, Some(CancelReason::ForShortLong));
    assert_eq!(pos.strategy_tag, "shortlong");

    engine.process_cancelled_order(hi);
    assert!(engine.position(hi).is_none());

    // the replacement is the same rung flipped to a sell
    let flipped = engine.position(*engine.queued.last().unwrap()).unwrap();
    assert_eq!(flipped.side, Side::Sell);
    assert_eq!(flipped.sell_price, amt("2.50"));
}

// === snapshots ===

#[test]
fn save_market_serializes_rungs_with_window_and_alternates() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, _clock) = test_engine_with(ExchangeKind::Poloniex, settings);

    let dir = std::env::temp_dir().join(format!("gridpong-save-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    engine.settings.snapshot_dir = dir.clone();

    add_active(&mut engine, Side::Buy, "1.00", "2.00", "10", "b0");
    let id = engine
        .add_position(MARKET, Side::Buy, "1.10", "2.10", "10/4", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    engine.activate(id, "b1");
    add_active(&mut engine, Side::Sell, "1.20", "2.20", "10", "s2");
    add_active(&mut engine, Side::Sell, "1.30", "2.30", "10", "s3");

    engine.save_market(MARKET, 15).unwrap();

    let contents = std::fs::read_to_string(dir.join(format!("index-{MARKET}.txt"))).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(
        lines[0],
        "setorder BTC-TEST buy 1.00000000 2.00000000 10.00000000 active"
    );
    assert_eq!(
        lines[1],
        "setorder BTC-TEST buy 1.10000000 2.10000000 10.00000000/4.00000000 active"
    );
    assert_eq!(
        lines[2],
        "setorder BTC-TEST sell 1.20000000 2.20000000 10.00000000 active"
    );
    assert_eq!(
        lines[3],
        "setorder BTC-TEST sell 1.30000000 2.30000000 10.00000000 active"
    );

    std::fs::remove_dir_all(&dir).ok();
}

// === flip property ===

#[test]
fn flip_refreshes_prices_from_rung_not_position() {
    let mut settings = grid_settings();
    settings.order_min = 0;
    settings.order_max = 0;
    let (mut engine, clock) = test_engine_with(ExchangeKind::Poloniex, settings);
    set_ticker(&mut engine, "2.00", "2.10");

    // sell lifts off its rung price at placement
    let id = engine
        .add_position(MARKET, Side::Sell, "1.00", "2.05", "10", "active", "", &[], false, true)
        .unwrap()
        .unwrap();
    engine.activate(id, "fl1");
    assert_eq!(engine.position(id).unwrap().sell_price, amt("2.09999999"));

    clock.advance_ms(3_000);
    engine.on_open_orders(&[], &[], clock.now_ms() - 100);

    // the flipped buy takes the rung's stored prices, not the drifted ones
    let flipped = engine.position(engine.queued[0]).unwrap();
    assert_eq!(flipped.side, Side::Buy);
    assert_eq!(flipped.buy_price_original, amt("1.00"));
    assert_eq!(flipped.sell_price_original, amt("2.05"));
    assert!(!flipped.is_slippage);
}
