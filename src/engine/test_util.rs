//! Shared fixtures for the engine test suites: a recording mock adapter
//! and a manually-clocked engine on one test market.

use std::collections::HashMap;

use crate::amount::Amount;
use crate::config::{EngineSettings, MarketSettings};
use crate::exchange::{ExchangeAdapter, ExchangeKind};
use crate::types::{Clock, Side, TickerQuote};

use super::{Engine, PosId, Position};

pub(crate) const MARKET: &str = "BTC-TEST";
pub(crate) const START_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
pub(crate) struct SubmittedOrder {
    pub(crate) id: PosId,
    pub(crate) market: String,
    pub(crate) side: Side,
    pub(crate) price: Amount,
    pub(crate) btc_amount: Amount,
    pub(crate) landmark: bool,
}

/// Records every outbound call; never yields unless told to.
pub(crate) struct MockAdapter {
    pub(crate) kind: ExchangeKind,
    pub(crate) submits: Vec<SubmittedOrder>,
    pub(crate) cancels: Vec<(String, Option<PosId>)>,
    pub(crate) probes: Vec<(String, PosId)>,
    pub(crate) aborts: Vec<PosId>,
    pub(crate) yielding: bool,
    pub(crate) queue_len: usize,
    pub(crate) suppress_ticker: bool,
}

impl MockAdapter {
    pub(crate) fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            submits: Vec::new(),
            cancels: Vec::new(),
            probes: Vec::new(),
            aborts: Vec::new(),
            yielding: false,
            queue_len: 0,
            suppress_ticker: false,
        }
    }
}

impl ExchangeAdapter for MockAdapter {
    fn kind(&self) -> ExchangeKind {
        self.kind
    }

    fn submit(&mut self, id: PosId, pos: &Position, _quiet: bool) {
        self.submits.push(SubmittedOrder {
            id,
            market: pos.market.clone(),
            side: pos.side,
            price: pos.price,
            btc_amount: pos.btc_amount,
            landmark: pos.is_landmark,
        });
    }

    fn cancel(&mut self, order_id: &str, pos: Option<PosId>) {
        self.cancels.push((order_id.to_string(), pos));
    }

    fn request_order_status(&mut self, order_id: &str, pos: PosId) {
        self.probes.push((order_id.to_string(), pos));
    }

    fn abort_requests_for(&mut self, id: PosId) {
        self.aborts.push(id);
    }

    fn yield_to_flow_control(&self) -> bool {
        self.yielding
    }

    fn queued_commands(&self) -> usize {
        self.queue_len
    }

    fn suppresses_ticker_fills(&self) -> bool {
        self.suppress_ticker
    }
}

pub(crate) fn amt(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

/// Grid settings matching the scenario seeds: min 3, max 5, dc 3, satoshi
/// ticksizes.
pub(crate) fn grid_settings() -> MarketSettings {
    MarketSettings {
        order_min: 3,
        order_max: 5,
        order_dc: 3,
        ..MarketSettings::default()
    }
}

pub(crate) fn test_engine(kind: ExchangeKind) -> (Engine<MockAdapter>, Clock) {
    test_engine_with(kind, grid_settings())
}

pub(crate) fn test_engine_with(
    kind: ExchangeKind,
    settings: MarketSettings,
) -> (Engine<MockAdapter>, Clock) {
    let clock = Clock::manual(START_MS);
    let mut engine = Engine::new(
        MockAdapter::new(kind),
        EngineSettings::default(),
        clock.clone(),
    );
    engine.set_market_settings(MARKET, settings);
    (engine, clock)
}

/// Push a spread into the engine without triggering fill classification.
pub(crate) fn set_ticker(engine: &mut Engine<MockAdapter>, bid: &str, ask: &str) {
    let mut tickers = HashMap::new();
    tickers.insert(
        MARKET.to_string(),
        TickerQuote {
            bid: amt(bid),
            ask: amt(ask),
        },
    );
    engine.on_ticker(&tickers, 0);
}

/// Add an active ping-pong order on a fresh rung and activate it.
pub(crate) fn add_active(
    engine: &mut Engine<MockAdapter>,
    side: Side,
    buy: &str,
    sell: &str,
    size: &str,
    order_id: &str,
) -> PosId {
    let id = engine
        .add_position(MARKET, side, buy, sell, size, "active", "", &[], false, true)
        .expect("valid order")
        .expect("placed");
    engine.activate(id, order_id);
    id
}
