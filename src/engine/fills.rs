//! Fill detection and the inbound reconciliation surface.
//!
//! Three independent sources classify fills: the periodic open-orders
//! snapshot (an active order missing from the book), ticker collisions
//! (the public spread moved through our price), and direct order-status
//! replies. All of them funnel into [`Engine::fill_nq`], which settles the
//! rung accounting and flips the position. Candidates are processed most
//! at-market first and deduplicated by handle, so a fill seen by two
//! sources in the same cycle settles once.
//!
//! The open-orders scan also owns stray-order policy: unknown remote
//! orders are matched against queued positions for adoption, and cancelled
//! after a grace period when nothing claims them.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::amount::Amount;
use crate::exchange::ExchangeAdapter;
use crate::types::{CancelReason, FillSource, OrderInfo, OrderStatus, Side, TickerQuote};

use super::{Engine, PosId};

/// Queued placements younger than this are not adoption candidates; the
/// real reply is probably still in flight.
const ADOPT_MIN_REQUEST_AGE_MS: i64 = 10_000;

/// Per-cycle cap on stray cancels, and the threshold above which the whole
/// batch is assumed to be a bad snapshot and skipped.
const STRAY_CANCEL_LIMIT: usize = 50;

/// Active position count above which an all-empty snapshot is treated as a
/// glitch rather than a mass fill.
const BLANK_BOOK_MIN_ACTIVE: usize = 50;

/// Status probes per cycle, and the per-position re-probe interval.
const PROBE_LIMIT_PER_CYCLE: usize = 5;
const PROBE_INTERVAL_MS: i64 = 30_000;

impl<A: ExchangeAdapter> Engine<A> {
    /// Reconcile against an open-orders snapshot.
    ///
    /// `order_ids` is the set of ids the venue reports open, `orders` the
    /// full rows (used for stray matching), `sent_ms` the local send time
    /// of the request that produced the snapshot - orders set after it
    /// cannot be judged by it.
    pub fn on_open_orders(&mut self, order_ids: &[String], orders: &[OrderInfo], sent_ms: i64) {
        let now = self.now_ms();

        if self.cancel_pass_filter.is_some() {
            self.run_cancel_pass(orders);
            return;
        }

        let mut stray_orders: Vec<String> = Vec::new();
        if self.settings.should_clear_stray_orders {
            for order in orders {
                self.observe_possible_stray(order, now, &mut stray_orders);
            }
        }

        if stray_orders.len() > STRAY_CANCEL_LIMIT {
            warn!(
                count = stray_orders.len(),
                "mitigating: refusing to cancel more than {STRAY_CANCEL_LIMIT} stray orders in one cycle"
            );
        } else {
            for order_id in stray_orders {
                info!(%order_id, "cancelling stray order");
                self.adapter.cancel(&order_id, None);
                // back off so the next snapshot doesn't re-cancel it
                self.order_grace_times
                    .insert(order_id, now + self.settings.stray_grace_time_limit_ms);
            }
        }

        // a venue glitch can return an empty book while orders still rest;
        // one skipped cycle is cheaper than mass false fills
        if self.settings.should_mitigate_blank_orderbook_flash
            && order_ids.is_empty()
            && self.active.len() > BLANK_BOOK_MIN_ACTIVE
        {
            warn!("blank orderbook flash mitigated, skipping snapshot");
            return;
        }

        let probing = self.adapter.kind().probes_missing_orders();
        let mut filled: Vec<PosId> = Vec::new();
        let mut probes = 0usize;

        for id in self.active.clone() {
            let Some(pos) = self.arena.get(id) else {
                continue;
            };
            // unset, cancelling, or too-new orders can't be judged yet
            if pos.order_set_time == 0 {
                continue;
            }
            if pos.order_cancel_time > 0 || pos.is_cancelling {
                continue;
            }
            if pos.order_set_time > now - self.settings.safety_delay_time_ms {
                continue;
            }
            let Some(order_id) = pos.order_id.clone() else {
                continue;
            };
            if order_ids.iter().any(|o| *o == order_id) {
                continue;
            }
            // the snapshot must postdate the placement to prove absence
            if pos.order_set_time >= sent_ms {
                continue;
            }

            if probing {
                // this venue's snapshot misses orders routinely; check on
                // the order instead of declaring a fill
                if pos.order_getorder_time > now - PROBE_INTERVAL_MS {
                    continue;
                }
                if let Some(pos) = self.arena.get_mut(id) {
                    pos.order_getorder_time = now;
                }
                self.adapter.request_order_status(&order_id, id);
                probes += 1;
                if probes >= PROBE_LIMIT_PER_CYCLE {
                    break;
                }
            } else {
                filled.push(id);
            }
        }

        if !probing {
            self.process_filled(filled, FillSource::OrderScan);
        }
    }

    /// Cancel everything in the snapshot matching the armed filter, owned
    /// or stray, then disarm.
    fn run_cancel_pass(&mut self, orders: &[OrderInfo]) {
        let filter = self.cancel_pass_filter.take().unwrap_or_default();
        let mut cancelled = 0usize;

        for order in orders {
            if filter != "all" && filter != order.market {
                continue;
            }
            cancelled += 1;

            match self.position_for_order_id(&order.order_id) {
                Some(id) => self.cancel_order(id, false, CancelReason::ByUser),
                None => {
                    info!(
                        market = %order.market,
                        side = %order.side,
                        amount = %order.btc_amount,
                        price = %order.price,
                        order_id = %order.order_id,
                        "cancelling remote order"
                    );
                    self.adapter.cancel(&order.order_id, None);
                }
            }
        }

        info!(cancelled, total = orders.len(), "remote cancel pass finished");
    }

    /// Track one remote order we don't own: adopt it if a queued position
    /// matches, otherwise start (or check) its grace timer.
    fn observe_possible_stray(&mut self, order: &OrderInfo, now: i64, stray_out: &mut Vec<String>) {
        if self.is_order_id(&order.order_id) {
            return;
        }

        // unless clearing everything, only touch orders at one of our
        // grid prices
        if !self.settings.should_clear_stray_orders_all {
            let known_price = self
                .markets
                .get(&order.market)
                .map(|m| m.has_order_price(order.price))
                .unwrap_or(false);
            if !known_price {
                return;
            }
        }

        match self.order_grace_times.get(&order.order_id).copied() {
            None => {
                // a queued position matching this row is our own order seen
                // before its reply; adopt it. Insertion-order scan keeps
                // the adopt-vs-cancel race deterministic.
                let matching = self.queued.iter().copied().find(|id| {
                    self.arena.get(*id).is_some_and(|pos| {
                        pos.market == order.market
                            && pos.side == order.side
                            && pos.price == order.price
                            && order.btc_amount >= pos.btc_amount.ratio(0.999)
                            && order.btc_amount <= pos.btc_amount.ratio(1.001)
                            && pos.order_request_time < now - ADOPT_MIN_REQUEST_AGE_MS
                    })
                });

                match matching {
                    Some(id) => {
                        info!(order_id = %order.order_id, "adopting stray order as queued position");
                        self.activate(id, &order.order_id);
                    }
                    None => {
                        self.order_grace_times.insert(order.order_id.clone(), now);
                    }
                }
            }
            Some(first_seen) => {
                if now - first_seen > self.settings.stray_grace_time_limit_ms {
                    stray_out.push(order.order_id.clone());
                }
            }
        }
    }

    /// Ingest a ticker snapshot: update each market's stored spread, then
    /// classify collisions as fills.
    ///
    /// A nonpositive `sent_ms` marks a push feed with no request timestamp;
    /// those update the spread only, because a fresh order cannot be told
    /// apart from a collision without one.
    pub fn on_ticker(&mut self, tickers: &HashMap<String, TickerQuote>, sent_ms: i64) {
        let now = self.now_ms();

        for (market, quote) in tickers {
            if quote.ask.is_zero_or_less() || quote.bid.is_zero_or_less() {
                continue;
            }
            let info = self.market_mut(market);
            info.highest_buy = quote.bid;
            info.lowest_sell = quote.ask;
        }

        if sent_ms <= 0 {
            return;
        }
        // a private fill feed outruns ticker inference
        if self.adapter.suppresses_ticker_fills() {
            return;
        }

        let probing = self.adapter.kind().probes_missing_orders();
        let mut filled: Vec<PosId> = Vec::new();
        let mut found_equal_bid_ask = false;
        let mut probes = 0usize;

        for id in self.active.clone() {
            let Some(pos) = self.arena.get(id) else {
                continue;
            };
            let Some(quote) = tickers.get(&pos.market) else {
                continue;
            };
            if quote.ask <= quote.bid {
                found_equal_bid_ask = true;
                continue;
            }
            if quote.ask.is_zero_or_less() || quote.bid.is_zero_or_less() {
                continue;
            }

            let collided = match pos.side {
                Side::Sell => pos.sell_price <= quote.bid || pos.sell_price < quote.ask,
                Side::Buy => pos.buy_price >= quote.ask || pos.buy_price > quote.bid,
            };
            if !collided {
                continue;
            }

            // grace window for fresh orders: the collision may predate the
            // order reaching the book
            let too_new = pos.order_set_time > sent_ms - self.settings.ticker_safety_delay_time_ms
                || pos.order_set_time > now - self.settings.ticker_safety_delay_time_ms;
            if too_new {
                if probing && pos.order_getorder_time <= now - PROBE_INTERVAL_MS {
                    if probes < PROBE_LIMIT_PER_CYCLE {
                        let order_id = pos.order_id.clone();
                        if let Some(order_id) = order_id {
                            if let Some(pos) = self.arena.get_mut(id) {
                                pos.order_getorder_time = now;
                            }
                            self.adapter.request_order_status(&order_id, id);
                            probes += 1;
                        }
                    }
                }
                continue;
            }

            if pos.order_cancel_time > 0 || pos.is_cancelling {
                continue;
            }

            filled.push(id);
        }

        self.process_filled(filled, FillSource::Ticker);

        if found_equal_bid_ask {
            warn!("found ask <= bid for at least one market");
        }
    }

    /// Direct order-status reply (venues with exact per-order status).
    ///
    /// `Filled` settles immediately; `Cancelled` runs the cancel
    /// continuation, logging the partial fill when one rode along. A status
    /// for an unknown order id cancels the stray remotely.
    pub fn on_order_status(&mut self, order_id: &str, status: OrderStatus, filled_qty: Amount) {
        let Some(id) = self.position_for_order_id(order_id) else {
            warn!(order_id, ?status, "status for unknown order, cancelling remotely");
            self.adapter.cancel(order_id, None);
            return;
        };

        match status {
            OrderStatus::Filled => self.process_filled(vec![id], FillSource::Feed),
            OrderStatus::Cancelled => {
                if filled_qty.is_positive() {
                    if let Some(pos) = self.arena.get(id) {
                        info!(
                            filled = %filled_qty,
                            "{:<15} {}",
                            FillSource::Cancel.tag(),
                            pos.order_label()
                        );
                    }
                }
                self.process_cancelled_order(id);
            }
            // partially filled keeps resting; wait for fill or cancel
            OrderStatus::PartiallyFilled | OrderStatus::Open => {}
        }
    }

    /// Settle a batch of fill candidates.
    ///
    /// Candidates are ordered by `buy_price / sell_price` ascending (most
    /// at-market rungs first) with one-time orders explicitly last, and
    /// deduplicated by handle.
    pub(crate) fn process_filled(&mut self, ids: Vec<PosId>, source: FillSource) {
        let mut seen: HashSet<PosId> = HashSet::new();
        let mut keyed: Vec<(Amount, PosId)> = Vec::new();
        let mut onetime: Vec<PosId> = Vec::new();

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            let Some(pos) = self.arena.get(id) else {
                continue;
            };
            if pos.is_onetime {
                onetime.push(id);
            } else {
                keyed.push((pos.buy_price / pos.sell_price, id));
            }
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, id) in keyed {
            if let Some(order_id) = self.arena.get(id).and_then(|p| p.order_id.clone()) {
                self.fill_nq(&order_id, source);
            }
        }
        for id in onetime {
            if let Some(order_id) = self.arena.get(id).and_then(|p| p.order_id.clone()) {
                self.fill_nq(&order_id, source);
            }
        }
    }

    /// Settle one fill: apply rung fill accounting, log, flip, release.
    ///
    /// Also the entry point for adapter-side history scans, which report
    /// fills by order id.
    pub fn fill_nq(&mut self, order_id: &str, source: FillSource) {
        if order_id.is_empty() || !self.is_order_id(order_id) {
            warn!(
                order_id,
                source = source.tag(),
                "order id not found in positions (status probe timeout too low?)"
            );
            return;
        }
        let id = self.by_order_id[order_id];

        let (market, indices, label) = {
            let Some(pos) = self.arena.get(id) else {
                return;
            };
            (pos.market.clone(), pos.market_indices.clone(), pos.order_label())
        };

        // first fill on a rung swaps in the alternate size; every fill
        // bumps the rung's count
        let info = self.market_mut(&market);
        for idx in &indices {
            info.index.resize_by_alternate_size(*idx);
        }

        info!("{:<15} {}", source.tag(), label);

        self.flip_position(id);
        self.remove(id);
    }
}
