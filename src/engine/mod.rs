//! The position engine: authoritative registry and lifecycle manager for
//! every order the bot owns.
//!
//! A position is Queued from creation until the adapter reports an order
//! id, Active while resting, Cancelling once a cancel is in flight, and is
//! released when filled, cancelled, or removed. The engine owns all
//! positions in a generational arena; every other table holds [`PosId`]
//! handles, so a late adapter reply for a released position is a no-op.
//!
//! Submodule map:
//! - `fills`: the three fill-detection sources and stray-order handling
//! - `slippage`: post-only price improvement and recovery
//! - `dc`: diverge/converge of rungs into landmark orders
//! - `maintenance`: order-count reconciliation and timeout scans
//! - `snapshot`: save-market serialization
//! - `runtime`: tokio tick driver

mod arena;
mod dc;
mod fills;
mod maintenance;
mod position;
mod runtime;
mod slippage;
mod snapshot;

#[cfg(test)]
pub(crate) mod test_util;
#[cfg(test)]
mod tests;

pub use arena::{Arena, PosId};
pub use position::{IndexList, Position};
pub use runtime::{run_ticks, TickOptions};

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{error, info, warn};

use crate::amount::Amount;
use crate::config::{EngineSettings, MarketSettings};
use crate::errors::EngineError;
use crate::exchange::{ExchangeAdapter, SubmitError};
use crate::market::{MarketInfo, PositionData};
use crate::types::{CancelReason, Clock, OrderFlavor, OrderKind, Side};

use dc::DcGroup;

/// Position engine over one exchange adapter.
pub struct Engine<A: ExchangeAdapter> {
    pub adapter: A,
    pub settings: EngineSettings,
    pub(crate) clock: Clock,
    pub(crate) arena: Arena<Position>,
    /// Queued handles in insertion order; stray adoption scans this in
    /// order, which keeps the adopt-vs-cancel race deterministic.
    pub(crate) queued: Vec<PosId>,
    pub(crate) active: Vec<PosId>,
    pub(crate) by_order_id: HashMap<String, PosId>,
    pub(crate) markets: HashMap<String, MarketInfo>,
    /// Diverge/converge groups waiting for their cancels to confirm.
    pub(crate) dc_groups: Vec<DcGroup>,
    /// Rung indices currently in DC transit, per market.
    pub(crate) diverging_converging: HashMap<String, Vec<u32>>,
    /// First-seen (and post-cancel backoff) stamps for stray order ids.
    pub(crate) order_grace_times: HashMap<String, i64>,
    /// Armed by `cancel_all`: the next open-orders snapshot cancels every
    /// order matching this market filter, strays included.
    pub(crate) cancel_pass_filter: Option<String>,
    pub(crate) maintenance_triggered: bool,
}

impl<A: ExchangeAdapter> Engine<A> {
    pub fn new(adapter: A, settings: EngineSettings, clock: Clock) -> Self {
        Self {
            adapter,
            settings,
            clock,
            arena: Arena::new(),
            queued: Vec::new(),
            active: Vec::new(),
            by_order_id: HashMap::new(),
            markets: HashMap::new(),
            dc_groups: Vec::new(),
            diverging_converging: HashMap::new(),
            order_grace_times: HashMap::new(),
            cancel_pass_filter: None,
            maintenance_triggered: false,
        }
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    // === market access ===

    pub fn set_market_settings(&mut self, market: &str, settings: MarketSettings) {
        self.market_mut(market).settings = settings;
    }

    pub fn market(&self, market: &str) -> Option<&MarketInfo> {
        self.markets.get(market)
    }

    pub(crate) fn market_mut(&mut self, market: &str) -> &mut MarketInfo {
        self.markets.entry(market.to_string()).or_default()
    }

    /// Best public bid last seen for a market.
    pub fn hi_buy(&self, market: &str) -> Amount {
        self.markets
            .get(market)
            .map(|m| m.highest_buy)
            .unwrap_or(Amount::ZERO)
    }

    /// Best public ask last seen for a market.
    pub fn lo_sell(&self, market: &str) -> Amount {
        self.markets
            .get(market)
            .map(|m| m.lowest_sell)
            .unwrap_or(Amount::ZERO)
    }

    // === registry state ===

    pub fn has_active_positions(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn has_queued_positions(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn is_queued(&self, id: PosId) -> bool {
        self.queued.contains(&id)
    }

    pub fn is_active(&self, id: PosId) -> bool {
        self.active.contains(&id)
    }

    pub fn position(&self, id: PosId) -> Option<&Position> {
        self.arena.get(id)
    }

    pub fn is_order_id(&self, order_id: &str) -> bool {
        self.by_order_id.contains_key(order_id)
    }

    pub fn position_for_order_id(&self, order_id: &str) -> Option<PosId> {
        self.by_order_id.get(order_id).copied()
    }

    // === add ===

    /// Create a position from user-facing string arguments.
    ///
    /// `order_type` is one of `active`, `ghost`, or `onetime` with optional
    /// `-taker` / `-override` / `-timeout<N>` suffixes. `order_size` may
    /// carry an alternate size as `size/alternate`. For ping-pong orders an
    /// empty `indices` allocates a fresh rung at the top of the grid.
    ///
    /// Returns `Ok(None)` for ghost rungs (allocated, nothing placed) and
    /// for positions that fail late viability checks; hard validation
    /// failures return an error with no side effect.
    #[allow(clippy::too_many_arguments)]
    pub fn add_position(
        &mut self,
        market: &str,
        side: Side,
        buy_price: &str,
        sell_price: &str,
        order_size: &str,
        order_type: &str,
        strategy_tag: &str,
        indices: &[u32],
        landmark: bool,
        quiet: bool,
    ) -> Result<Option<PosId>, EngineError> {
        let flavor = OrderFlavor::parse(order_type).ok_or_else(|| {
            EngineError::invalid_input(format!(
                "order type must be 'active', 'ghost', or 'onetime', got {order_type:?}"
            ))
        })?;

        if market.is_empty() || buy_price.is_empty() || sell_price.is_empty() || order_size.is_empty()
        {
            return Err(EngineError::invalid_input(format!(
                "an argument was empty: market {market:?} lo {buy_price:?} hi {sell_price:?} size {order_size:?}"
            )));
        }

        if landmark && flavor.is_onetime() {
            return Err(EngineError::invalid_input(
                "landmark flag is not valid on a one-time order",
            ));
        }

        // split an alternate size off the size argument: "0.001/0.002"
        let (size_str, alternate_str) = match order_size.split_once('/') {
            Some((size, alternate)) => (size, Some(alternate)),
            None => (order_size, None),
        };

        let buy = parse_amount("buy_price", buy_price)?;
        let sell = parse_amount("sell_price", sell_price)?;
        let size = parse_amount("order_size", size_str)?;
        let alternate = match alternate_str {
            Some(s) => parse_amount("alternate_size", s)?,
            None => Amount::ZERO,
        };

        let is_onetime = flavor.is_onetime();
        let bad_pingpong = !is_onetime
            && (sell <= buy || buy.is_zero_or_less() || sell.is_zero_or_less());
        let bad_onetime = is_onetime
            && ((side == Side::Buy && buy.is_zero_or_less())
                || (side == Side::Sell && sell.is_zero_or_less())
                || (alternate_str.is_some() && alternate.is_zero_or_less()));
        if bad_pingpong || bad_onetime {
            return Err(EngineError::invalid_input(format!(
                "bad {} order: hi {sell} lo {buy} size {size}",
                if is_onetime { "one-time" } else { "ping-pong" }
            )));
        }

        // only after the prices are known-sane: reject literals whose
        // decimals did not survive normalization
        check_precision("buy_price", buy_price, buy)?;
        check_precision("sell_price", sell_price, sell)?;
        check_precision("order_size", size_str, size)?;
        if let Some(s) = alternate_str {
            check_precision("alternate_size", s, alternate)?;
        }

        self.add_position_inner(
            market,
            side,
            buy,
            sell,
            size,
            alternate,
            flavor,
            strategy_tag,
            indices,
            landmark,
            quiet,
        )
    }

    /// Shared creation path for parsed arguments. Internal re-adds (flips,
    /// DC re-placement, slippage resets, auto-set) enter here directly with
    /// rung data.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_position_inner(
        &mut self,
        market: &str,
        side: Side,
        buy_price: Amount,
        sell_price: Amount,
        order_size: Amount,
        alternate_size: Amount,
        flavor: OrderFlavor,
        strategy_tag: &str,
        indices: &[u32],
        landmark: bool,
        quiet: bool,
    ) -> Result<Option<PosId>, EngineError> {
        let is_onetime = flavor.is_onetime();

        // taker orders must price near the spread unless overridden
        if flavor.taker && !flavor.override_spread {
            let hi_buy = self.hi_buy(market);
            let lo_sell = self.lo_sell(market);
            let off_spread = match side {
                Side::Sell => hi_buy.ratio(0.9) > sell_price || hi_buy.ratio(1.1) < sell_price,
                Side::Buy => lo_sell.ratio(1.1) < buy_price || lo_sell.ratio(0.9) > buy_price,
            };
            if off_spread {
                return Err(EngineError::SpreadViolation {
                    side: side.as_str(),
                    price: match side {
                        Side::Buy => buy_price.to_string(),
                        Side::Sell => sell_price.to_string(),
                    },
                });
            }
        }

        // allocate a fresh rung at the top of the grid when none was given
        let mut indices: IndexList = SmallVec::from_slice(indices);
        if !is_onetime && indices.is_empty() {
            let rung = PositionData::new(buy_price, sell_price, order_size)
                .with_alternate(alternate_size);
            let idx = self.market_mut(market).index.append(rung);
            indices.push(idx);
        }

        // a ghost only reserves the rung
        if !is_onetime && flavor.kind == OrderKind::Ghost {
            return Ok(None);
        }

        let mut pos = if landmark {
            let info = self.market_mut(market);
            let rungs: Vec<&PositionData> = indices
                .iter()
                .filter_map(|i| info.index.get(*i))
                .collect();
            if rungs.len() != indices.len() {
                warn!(market, ?indices, "landmark references missing rungs, not placing");
                return Ok(None);
            }
            Position::new_landmark(market, side, &rungs, indices, info.settings.price_ticksize)
        } else {
            Position::new(
                market,
                side,
                buy_price,
                sell_price,
                order_size,
                strategy_tag,
                indices,
            )
        };

        pos.is_onetime = is_onetime;
        pos.is_taker = flavor.taker;
        pos.alternate_size = alternate_size;
        pos.max_age_minutes = flavor.max_age_minutes;

        if pos.price.is_zero_or_less() || pos.btc_amount.is_zero_or_less() || pos.quantity.is_zero_or_less()
        {
            warn!(
                market,
                %side,
                price = %pos.price,
                amount = %pos.btc_amount,
                "new position failed to initialize, not placing"
            );
            return Ok(None);
        }

        // exchange-enforced price window (compressed 20% to cover the
        // unknown rolling average the venue checks against)
        if self.adapter.kind().enforces_price_window() {
            let info = self.market_mut(market);
            let buy_limit = (info.highest_buy * info.settings.price_min_mul.ratio(1.2))
                .truncated_by_ticksize(Amount::SATOSHI);
            let sell_limit = (info.lowest_sell * info.settings.price_max_mul.ratio(0.8))
                .truncated_by_ticksize(Amount::SATOSHI);

            let out_of_window = match side {
                Side::Buy => {
                    pos.buy_price.is_positive()
                        && buy_limit.is_positive()
                        && pos.buy_price < buy_limit
                }
                Side::Sell => {
                    pos.sell_price.is_positive()
                        && sell_limit.is_positive()
                        && pos.sell_price > sell_limit
                }
            };
            if out_of_window {
                return Err(EngineError::ExchangeLimit {
                    market: market.to_string(),
                    price: pos.price.to_string(),
                });
            }
        }

        // local post-only: nudge a maker order to a better price inside the
        // spread before it goes out
        {
            let is_chatty = self.settings.is_chatty;
            let info = self.market_mut(market);
            if !flavor.taker {
                slippage::try_move_order(&mut pos, info, is_chatty);
            }
            pos.refresh_posted(
                info.settings.market_offset,
                info.settings.market_sentiment,
                info.settings.quantity_ticksize,
            );
        }

        // position is now queued
        pos.order_request_time = self.now_ms();
        let price = pos.price;
        let id = self.arena.insert(pos);
        self.queued.push(id);
        self.market_mut(market).add_order_price(price);

        let pos = self.arena.get(id).expect("just inserted");
        self.adapter.submit(id, pos, quiet);
        Ok(Some(id))
    }

    /// Re-place a rung as an active order on the given side. Best-effort:
    /// failures are logged, never propagated (used by flips, DC handoffs,
    /// slippage resets, and auto-set).
    pub(crate) fn add_active_from_rung(
        &mut self,
        market: &str,
        side: Side,
        indices: &[u32],
        landmark: bool,
    ) -> Option<PosId> {
        let (buy, sell, size, alternate) = {
            let info = self.markets.get(market)?;
            let first = info.index.get(*indices.first()?)?;
            (
                first.buy_price,
                first.sell_price,
                first.order_size,
                first.alternate_size,
            )
        };

        let flavor = OrderFlavor::parse("active").expect("static order type");
        match self.add_position_inner(
            market, side, buy, sell, size, alternate, flavor, "", indices, landmark, true,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!(market, %side, ?indices, error = %e, "rung re-placement rejected");
                None
            }
        }
    }

    pub(crate) fn add_landmark_position_for(&mut self, market: &str, side: Side, indices: &[u32]) {
        self.add_active_from_rung(market, side, indices, true);
    }

    // === lifecycle ===

    /// Adapter reply: a queued position got its exchange id. Moves it to
    /// Active and performs any cancel that was requested while in flight.
    pub fn activate(&mut self, id: PosId, order_id: &str) {
        if order_id.is_empty() {
            error!("tried to set order with blank order id");
            return;
        }

        let now = self.now_ms();
        let prefixes = self.adapter.kind().prefixes_order_ids();
        let (label, cancel_pending, cancel_reason) = {
            let Some(pos) = self.arena.get_mut(id) else {
                warn!(order_id, "activation for a released position, ignoring");
                return;
            };
            pos.order_set_time = now;
            pos.is_new_hilo_order = false;

            // market-prefixed ids keep the global map collision-free on
            // venues with per-market id namespaces
            let full_id = if prefixes {
                format!("{}{}", pos.market, order_id)
            } else {
                order_id.to_string()
            };
            pos.order_id = Some(full_id.clone());
            self.by_order_id.insert(full_id, id);

            let cancel_pending = pos.is_cancelling
                && pos.order_cancel_time < now - self.settings.cancel_timeout_ms;
            (pos.order_label(), cancel_pending, pos.cancel_reason)
        };

        self.queued.retain(|q| *q != id);
        if !self.active.contains(&id) {
            self.active.push(id);
        }

        info!("{:<15} {}", "set", label);

        if cancel_pending {
            self.cancel_order(id, true, cancel_reason.unwrap_or(CancelReason::ByUser));
        }
    }

    /// Adapter reply: placement failed.
    pub fn on_submit_error(&mut self, id: PosId, error: SubmitError) {
        match error {
            SubmitError::Fatal(reason) => {
                let label = self
                    .arena
                    .get(id)
                    .map(|p| p.order_label())
                    .unwrap_or_default();
                warn!(reason = %reason, "fatal submit error, removing {label}");
                self.remove(id);
            }
            SubmitError::Transient(reason) => {
                // the request timeout will resubmit
                warn!(reason = %reason, "transient submit error, leaving queued");
            }
        }
    }

    /// Adapter reply: a cancel was rejected. The cancel timeout re-issues.
    pub fn on_cancel_rejected(&mut self, id: PosId) {
        if let Some(pos) = self.arena.get(id) {
            warn!("cancel rejected for {}", pos.order_label());
        }
    }

    /// Cancel a position. Queued positions defer until activation; active
    /// positions get a cancel on the wire immediately.
    pub fn cancel_order(&mut self, id: PosId, quiet: bool, reason: CancelReason) {
        let now = self.now_ms();
        if !self.arena.contains(id) {
            error!("aborting dangerous cancel for a position not in the registry");
            return;
        }

        if self.is_queued(id) {
            // no id yet; the cancel is issued when the order activates
            let pos = self.arena.get_mut(id).expect("checked above");
            pos.cancel_reason = Some(reason);
            pos.is_cancelling = true;
            pos.order_cancel_time = 1;
            return;
        }

        let (order_id, label, recancelling, is_onetime, is_slippage) = {
            let pos = self.arena.get_mut(id).expect("checked above");
            let recancelling = pos.order_cancel_time > 0 || pos.is_cancelling;
            pos.cancel_reason = Some(reason);
            pos.is_cancelling = true;
            pos.order_cancel_time = now;
            (
                pos.order_id.clone(),
                pos.order_label(),
                recancelling,
                pos.is_onetime,
                pos.is_slippage,
            )
        };

        let Some(order_id) = order_id else {
            error!("active position without an order id, cannot cancel {label}");
            return;
        };

        if !quiet {
            let verb = if is_onetime {
                "cancelling"
            } else if is_slippage {
                "resetting"
            } else if recancelling {
                "recancelling"
            } else {
                "cancelling"
            };
            info!("{:<15} {}", format!("{verb} {}", reason.tag()), label);
        }

        self.adapter.cancel(&order_id, Some(id));
    }

    /// Cancel the lowest-indexed ping-pong position on a market.
    pub fn cancel_lowest(&mut self, market: &str) {
        if let Some(id) = self.lowest_pingpong(market) {
            self.cancel_order(id, false, CancelReason::Lowest);
        }
    }

    /// Cancel the highest-indexed ping-pong position on a market.
    pub fn cancel_highest(&mut self, market: &str) {
        if let Some(id) = self.highest_pingpong(market) {
            self.cancel_order(id, false, CancelReason::Highest);
        }
    }

    /// Cancel or delete every local position matching the market filter
    /// ("all" for everything), then clear the matching market indexes.
    pub fn cancel_local(&mut self, market_filter: &str) {
        let mut queued_ids = Vec::new();
        let mut normal_ids = Vec::new();
        let mut landmark_ids = Vec::new();

        for (id, pos) in self.arena.iter() {
            if market_filter != "all" && pos.market != market_filter {
                continue;
            }
            if self.queued.contains(&id) {
                queued_ids.push(id);
            } else if pos.is_landmark {
                landmark_ids.push(id);
            } else {
                normal_ids.push(id);
            }
        }

        for id in queued_ids {
            self.remove(id);
        }
        for id in normal_ids {
            self.cancel_order(id, false, CancelReason::ByUser);
        }
        for id in landmark_ids {
            self.cancel_order(id, false, CancelReason::ByUser);
        }

        for (market, info) in self.markets.iter_mut() {
            if market_filter == "all" || market == market_filter {
                info.order_prices.clear();
                info.index.clear();
            }
        }
        info!(filter = market_filter, "cleared market indices");
    }

    /// Arm a remote cancel pass: the next open-orders snapshot cancels
    /// every order matching the filter, including strays we do not own.
    ///
    /// Refused for "all" while local positions exist - that would s-fill
    /// them; use [`Engine::cancel_local`] first.
    pub fn cancel_all(&mut self, market_filter: &str) -> Result<(), EngineError> {
        let filter = if market_filter.is_empty() {
            "all"
        } else {
            market_filter
        };

        if filter == "all" && (self.has_active_positions() || self.has_queued_positions()) {
            return Err(EngineError::invalid_input(
                "you have open positions, did you mean cancel_local?",
            ));
        }

        for (market, info) in self.markets.iter_mut() {
            if filter == "all" || market == filter {
                info.order_prices.clear();
                info.index.clear();
            }
        }

        self.cancel_pass_filter = Some(filter.to_string());
        info!(filter, "armed remote cancel pass for next open-orders snapshot");
        Ok(())
    }

    /// A cancel confirmed. Runs the reason-specific continuation (slippage
    /// reset re-place, DC handoff, short/long flip) and releases the
    /// position.
    pub fn process_cancelled_order(&mut self, id: PosId) {
        let Some(pos) = self.arena.get(id) else {
            return;
        };

        // a reset slippage position goes straight back out on the same
        // side, at the rung's refreshed prices
        if pos.is_slippage && pos.cancel_reason == Some(CancelReason::ForSlippageReset) {
            let market = pos.market.clone();
            let side = pos.side;
            let landmark = pos.is_landmark;
            let indices: IndexList = pos.market_indices.clone();
            self.remove(id);
            self.add_active_from_rung(&market, side, &indices, landmark);
            return;
        }

        info!("{:<15} {}", "cancelled", pos.order_label());
        let reason = pos.cancel_reason;

        match reason {
            Some(CancelReason::ForDC) => self.process_dc_cancel(id),
            Some(CancelReason::ForShortLong) => self.flip_position(id),
            _ => {}
        }

        self.remove(id);
    }

    /// Release a position: detach it from DC bookkeeping, abort in-flight
    /// adapter requests, and drop every registry entry.
    pub fn remove(&mut self, id: PosId) {
        if !self.arena.contains(id) {
            error!("called remove with a position not in the registry");
            return;
        }

        self.remove_from_dc(id);
        self.adapter.abort_requests_for(id);

        self.active.retain(|a| *a != id);
        self.queued.retain(|q| *q != id);

        let pos = self.arena.remove(id).expect("checked above");
        if let Some(order_id) = &pos.order_id {
            self.by_order_id.remove(order_id);
        }
        if let Some(info) = self.markets.get_mut(&pos.market) {
            info.remove_order_price(pos.price);
        }
    }

    /// Flip a filled (or short/long-cancelled) ping-pong position to the
    /// opposite side. The new order takes the rung's current prices, not
    /// the old position's - slippage drift dies with the old order.
    pub fn flip_position(&mut self, id: PosId) {
        let Some(pos) = self.arena.get_mut(id) else {
            return;
        };
        if pos.is_onetime {
            return;
        }

        pos.flip();
        let market = pos.market.clone();
        let side = pos.side;
        let landmark = pos.is_landmark;
        let indices: IndexList = pos.market_indices.clone();

        if landmark {
            self.add_landmark_position_for(&market, side, &indices);
        } else {
            self.add_active_from_rung(&market, side, &indices, false);
        }
    }

    // === directional flip commands ===

    /// Tag and cancel the highest active buy (by price); it flips to a sell
    /// when the cancel confirms.
    pub fn flip_hi_buy_price(&mut self, market: &str, tag: &str) {
        if let Some(id) = self.highest_active_buy_by_price(market) {
            self.queue_shortlong_flip(id, tag, "queued short");
        }
    }

    /// Same as [`Engine::flip_hi_buy_price`] but selects by rung index.
    pub fn flip_hi_buy_index(&mut self, market: &str, tag: &str) {
        if let Some(id) = self.highest_active_buy_by_index(market) {
            self.queue_shortlong_flip(id, tag, "queued short");
        }
    }

    /// Tag and cancel the lowest active sell (by price); it flips to a buy
    /// when the cancel confirms.
    pub fn flip_lo_sell_price(&mut self, market: &str, tag: &str) {
        if let Some(id) = self.lowest_active_sell_by_price(market) {
            self.queue_shortlong_flip(id, tag, "queued long");
        }
    }

    /// Same as [`Engine::flip_lo_sell_price`] but selects by rung index.
    pub fn flip_lo_sell_index(&mut self, market: &str, tag: &str) {
        if let Some(id) = self.lowest_active_sell_by_index(market) {
            self.queue_shortlong_flip(id, tag, "queued long");
        }
    }

    fn queue_shortlong_flip(&mut self, id: PosId, tag: &str, verb: &str) {
        if !self.is_active(id) {
            return;
        }
        if let Some(pos) = self.arena.get_mut(id) {
            pos.strategy_tag = tag.to_string();
            info!("{:<15} {}", verb, pos.order_label());
        }
        self.cancel_order(id, false, CancelReason::ForShortLong);
    }

    /// Price the highest active buy would post at after flipping.
    pub fn hi_buy_flip_price(&self, market: &str) -> Amount {
        match self
            .highest_active_buy_by_price(market)
            .and_then(|id| self.arena.get(id))
        {
            Some(pos) => pos.sell_price,
            None => Amount::ZERO,
        }
    }

    /// Price the lowest active sell would post at after flipping.
    pub fn lo_sell_flip_price(&self, market: &str) -> Amount {
        match self
            .lowest_active_sell_by_price(market)
            .and_then(|id| self.arena.get(id))
        {
            Some(pos) => pos.buy_price,
            None => Amount::ZERO,
        }
    }

    // === lookups ===

    /// Position owning a rung index, if any (queued or active).
    pub fn position_by_index(&self, market: &str, idx: u32) -> Option<PosId> {
        self.arena
            .iter()
            .find(|(_, pos)| pos.market == market && pos.market_indices.contains(&idx))
            .map(|(id, _)| id)
    }

    /// Highest buy price over non-cancelling positions of a market.
    pub fn highest_buy_price(&self, market: &str) -> Amount {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && p.side == Side::Buy && !p.is_cancelling)
            .map(|(_, p)| p.buy_price)
            .max()
            .unwrap_or(Amount::ZERO)
    }

    /// Lowest sell price over non-cancelling positions of a market.
    pub fn lowest_sell_price(&self, market: &str) -> Option<Amount> {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && p.side == Side::Sell && !p.is_cancelling)
            .map(|(_, p)| p.sell_price)
            .min()
    }

    fn active_settled<'a>(&'a self, market: &'a str) -> impl Iterator<Item = (PosId, &'a Position)> {
        self.active.iter().filter_map(move |id| {
            let pos = self.arena.get(*id)?;
            if pos.market == market && !pos.is_cancelling && pos.order_id.is_some() {
                Some((*id, pos))
            } else {
                None
            }
        })
    }

    pub fn highest_active_buy_by_index(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Buy)
            .max_by_key(|(_, p)| p.highest_index())
            .map(|(id, _)| id)
    }

    pub fn highest_active_sell_by_index(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Sell)
            .max_by_key(|(_, p)| p.highest_index())
            .map(|(id, _)| id)
    }

    pub fn lowest_active_sell_by_index(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Sell)
            .min_by_key(|(_, p)| p.lowest_index())
            .map(|(id, _)| id)
    }

    pub fn lowest_active_buy_by_index(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Buy)
            .min_by_key(|(_, p)| p.lowest_index())
            .map(|(id, _)| id)
    }

    pub fn highest_active_buy_by_price(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Buy)
            .max_by_key(|(_, p)| p.buy_price)
            .map(|(id, _)| id)
    }

    pub fn lowest_active_sell_by_price(&self, market: &str) -> Option<PosId> {
        self.active_settled(market)
            .filter(|(_, p)| p.side == Side::Sell)
            .min_by_key(|(_, p)| p.sell_price)
            .map(|(id, _)| id)
    }

    /// Lowest-indexed ping-pong position (queued or active). One-time
    /// orders are excluded so maintenance never disturbs them.
    pub fn lowest_pingpong(&self, market: &str) -> Option<PosId> {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && !p.is_onetime && !p.is_cancelling)
            .min_by_key(|(_, p)| p.lowest_index())
            .map(|(id, _)| id)
    }

    /// Highest-indexed ping-pong position (queued or active).
    pub fn highest_pingpong(&self, market: &str) -> Option<PosId> {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && !p.is_onetime && !p.is_cancelling)
            .max_by_key(|(_, p)| p.highest_index())
            .map(|(id, _)| id)
    }

    /// Order count for a market; `onetime_only` restricts to one-time
    /// orders.
    pub fn market_order_total(&self, market: &str, onetime_only: bool) -> usize {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && (!onetime_only || p.is_onetime))
            .count()
    }

    pub fn buy_total(&self, market: &str) -> usize {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && p.side == Side::Buy)
            .count()
    }

    pub fn sell_total(&self, market: &str) -> usize {
        self.arena
            .iter()
            .filter(|(_, p)| p.market == market && p.side == Side::Sell)
            .count()
    }
}

/// Parse an amount literal.
fn parse_amount(field: &'static str, s: &str) -> Result<Amount, EngineError> {
    Amount::parse(s)
        .ok_or_else(|| EngineError::invalid_input(format!("unparseable {field}: {s:?}")))
}

/// Reject a literal whose decimals did not survive normalization (the
/// caller typed more precision than the amount type keeps, so the rendered
/// value comes back shorter than the input).
fn check_precision(field: &'static str, s: &str, amount: Amount) -> Result<(), EngineError> {
    if s.trim().len() > amount.to_string().len() {
        return Err(EngineError::PrecisionLoss {
            field,
            value: s.to_string(),
        });
    }
    Ok(())
}
