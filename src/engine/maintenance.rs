//! Fast-tick maintenance: order-count reconciliation against the
//! configured min/max band, and the four timeout scans.
//!
//! Every pass yields to adapter flow control between outbound actions, and
//! the timeout scan performs at most one action per tick - the cooperative
//! loop stays responsive even when many positions need attention.

use tracing::{info, warn};

use crate::exchange::ExchangeAdapter;
use crate::types::{CancelReason, Side};

use super::{slippage, Engine};

impl<A: ExchangeAdapter> Engine<A> {
    /// Fast-tick entry: reconcile order counts, then scan for timed-out
    /// requests, stuck cancels, stale slippage orders, and aged one-time
    /// orders.
    pub fn on_check_timeouts(&mut self) {
        self.check_buy_sell_count();

        if self.adapter.yield_to_flow_control() {
            return;
        }
        if self.adapter.queued_commands() > self.adapter.timeout_yield_limit() {
            return;
        }

        let now = self.now_ms();

        // queued placement that never got a reply: resend
        for id in self.queued.clone() {
            let Some(pos) = self.arena.get_mut(id) else {
                continue;
            };
            if pos.order_set_time == 0
                && pos.order_request_time > 0
                && pos.order_request_time < now - self.settings.request_timeout_ms
            {
                warn!("order timeout detected, resending {}", pos.order_label());
                pos.order_request_time = now;
                let pos = self.arena.get(id).expect("present above");
                self.adapter.submit(id, pos, true);
                return;
            }
        }

        for id in self.active.clone() {
            let Some(pos) = self.arena.get(id) else {
                continue;
            };

            // cancel that never confirmed: recancel with the same reason
            if pos.is_cancelling
                && pos.order_set_time > 0
                && pos.order_cancel_time > 0
                && pos.order_cancel_time < now - self.settings.cancel_timeout_ms
            {
                let reason = pos.cancel_reason.unwrap_or(CancelReason::ByUser);
                self.cancel_order(id, false, reason);
                return;
            }

            // slippage order resting too long off its rung price: try to
            // move it back toward the spread
            let slippage_timeout = self
                .markets
                .get(&pos.market)
                .map(|m| m.settings.slippage_timeout_ms)
                .unwrap_or(i64::MAX);
            if pos.is_slippage
                && !pos.is_cancelling
                && pos.order_set_time > 0
                && pos.order_set_time < now - slippage_timeout
            {
                let moved = {
                    let pos = self.arena.get_mut(id).expect("present above");
                    let Some(info) = self.markets.get(&pos.market) else {
                        continue;
                    };
                    slippage::try_move_order(pos, info, self.settings.is_chatty)
                };
                if moved {
                    // better price found: reset through a cancel; the
                    // confirmation re-places at the refreshed rung prices
                    self.cancel_order(id, false, CancelReason::ForSlippageReset);
                    return;
                } else {
                    // nothing better; push the clock out so we don't spin
                    let pos = self.arena.get_mut(id).expect("present above");
                    pos.order_set_time = now - self.settings.safety_delay_time_ms;
                }
            }

            let Some(pos) = self.arena.get(id) else {
                continue;
            };
            // one-time order past its max age
            if pos.is_onetime
                && pos.order_set_time > 0
                && pos.max_age_minutes > 0
                && now > pos.order_set_time + 60_000 * pos.max_age_minutes
            {
                self.cancel_order(id, false, CancelReason::ForMaxAge);
                return;
            }
        }
    }

    /// Keep every market's per-side order count inside its configured
    /// band: cancel the extreme order above max, auto-set the next rung
    /// below min, and fill the band's middle with landmarks when DC is
    /// enabled. Loops until a full pass adds nothing.
    pub fn check_buy_sell_count(&mut self) {
        let markets: Vec<String> = self.markets.keys().cloned().collect();

        let mut buys: std::collections::HashMap<String, i64> = Default::default();
        let mut sells: std::collections::HashMap<String, i64> = Default::default();
        for (_, pos) in self.arena.iter() {
            if pos.market.is_empty() || pos.is_cancelling {
                continue;
            }
            match pos.side {
                Side::Buy => *buys.entry(pos.market.clone()).or_insert(0) += 1,
                Side::Sell => *sells.entry(pos.market.clone()).or_insert(0) += 1,
            }
        }

        loop {
            let mut new_orders = 0u32;

            for market in &markets {
                let Some(info) = self.markets.get(market) else {
                    continue;
                };
                if info.index.is_empty() {
                    continue;
                }
                let order_min = info.settings.order_min as i64;
                let order_max = info.settings.order_max as i64;
                let order_dc = info.settings.order_dc;
                let landmark_thresh = info.settings.landmark_thresh as i64;
                // min/max of zero turns automation off for the market
                if order_min <= 0 || order_max <= 0 {
                    continue;
                }

                let mut buy_count = buys.get(market).copied().unwrap_or(0);
                while buy_count > order_max {
                    self.cancel_lowest(market);
                    *buys.entry(market.clone()).or_insert(0) -= 1;
                    buy_count -= 1;
                    if self.adapter.yield_to_flow_control() {
                        return;
                    }
                }
                if buy_count < order_min {
                    self.set_next_lowest(market, Side::Buy, false);
                    *buys.entry(market.clone()).or_insert(0) += 1;
                    new_orders += 1;
                } else if order_dc > 1 && buy_count < order_max - landmark_thresh {
                    self.set_next_lowest(market, Side::Buy, true);
                    *buys.entry(market.clone()).or_insert(0) += 1;
                    new_orders += 1;
                }
                if self.adapter.yield_to_flow_control() {
                    return;
                }

                let mut sell_count = sells.get(market).copied().unwrap_or(0);
                while sell_count > order_max {
                    self.cancel_highest(market);
                    *sells.entry(market.clone()).or_insert(0) -= 1;
                    sell_count -= 1;
                    if self.adapter.yield_to_flow_control() {
                        return;
                    }
                }
                if sell_count < order_min {
                    self.set_next_highest(market, Side::Sell, false);
                    *sells.entry(market.clone()).or_insert(0) += 1;
                    new_orders += 1;
                } else if order_dc > 1 && sell_count < order_max - landmark_thresh {
                    self.set_next_highest(market, Side::Sell, true);
                    *sells.entry(market.clone()).or_insert(0) += 1;
                    new_orders += 1;
                }
                if self.adapter.yield_to_flow_control() {
                    return;
                }
            }

            if new_orders == 0 {
                break;
            }
        }
    }

    /// Place an order on the next unused rung below the current lowest.
    ///
    /// With `landmark` set, greedily grows a contiguous block of exactly
    /// `order_dc` rungs downward; an incomplete block is abandoned unless
    /// it reaches the bottom of the grid.
    pub(crate) fn set_next_lowest(&mut self, market: &str, side: Side, landmark: bool) {
        let lowest = self
            .arena
            .iter()
            .filter(|(_, p)| p.market == market && !p.is_onetime)
            .map(|(_, p)| p.lowest_index() as i64)
            .min();
        let Some(lowest) = lowest else {
            return;
        };

        let dc = self
            .markets
            .get(market)
            .map(|m| m.settings.order_dc)
            .unwrap_or(0);

        let mut new_index = lowest - 1;
        while new_index >= 0
            && (self.position_by_index(market, new_index as u32).is_some()
                || self.is_index_diverging_converging(market, new_index as u32))
        {
            new_index -= 1;
        }
        if new_index < 0 {
            return;
        }

        let mut indices: Vec<u32> = vec![new_index as u32];
        while landmark && indices.len() < dc as usize {
            let next = *indices.last().expect("non-empty") as i64 - 1;
            if next < 0 {
                // bottom of the grid: keep the partial block
                break;
            }
            let next = next as u32;
            if self.position_by_index(market, next).is_some()
                || self.is_index_diverging_converging(market, next)
            {
                indices.truncate(1);
                break;
            }
            indices.push(next);
        }

        // a short landmark is only allowed at the very bottom of the grid
        if landmark && indices.len() != dc as usize && !indices.contains(&0) {
            return;
        }

        let index_len = self
            .markets
            .get(market)
            .map(|m| m.index.len())
            .unwrap_or(0);
        if indices[0] as usize >= index_len {
            return;
        }

        if let Some(id) = self.add_active_from_rung(market, side, &indices, landmark) {
            if let Some(pos) = self.arena.get_mut(id) {
                // far from the spread; excluded from freshness heuristics
                pos.is_new_hilo_order = true;
                info!("setting next lo  {}", pos.order_label());
            }
        }
    }

    /// Place an order on the next unused rung above the current highest.
    /// Mirror of [`Engine::set_next_lowest`], growing landmark blocks
    /// upward and allowing a short block only at the top of the grid.
    pub(crate) fn set_next_highest(&mut self, market: &str, side: Side, landmark: bool) {
        let highest = self
            .arena
            .iter()
            .filter(|(_, p)| p.market == market && !p.is_onetime)
            .map(|(_, p)| p.highest_index() as i64)
            .max();
        let Some(highest) = highest else {
            return;
        };

        let (dc, index_len) = match self.markets.get(market) {
            Some(m) => (m.settings.order_dc, m.index.len() as i64),
            None => return,
        };

        let mut new_index = highest + 1;
        if new_index < 1 {
            return;
        }
        while self.position_by_index(market, new_index as u32).is_some()
            || self.is_index_diverging_converging(market, new_index as u32)
        {
            new_index += 1;
        }
        if new_index >= index_len {
            return;
        }

        let mut indices: Vec<u32> = vec![new_index as u32];
        while landmark && (indices.len() as i32) < dc {
            let next = *indices.last().expect("non-empty") as i64 + 1;
            if next >= index_len {
                // top of the grid: keep the partial block
                break;
            }
            let next = next as u32;
            if self.position_by_index(market, next).is_some()
                || self.is_index_diverging_converging(market, next)
            {
                indices.truncate(1);
                break;
            }
            indices.push(next);
        }

        let top = (index_len - 1).max(0) as u32;
        if landmark && indices.len() != dc as usize && !indices.contains(&top) {
            return;
        }

        if let Some(id) = self.add_active_from_rung(market, side, &indices, landmark) {
            if let Some(pos) = self.arena.get_mut(id) {
                pos.is_new_hilo_order = true;
                info!("setting next hi  {}", pos.order_label());
            }
        }
    }

    /// Drop grace entries old enough that the stray either got cancelled
    /// or vanished on its own.
    pub(crate) fn clean_grace_times(&mut self) {
        if self.order_grace_times.is_empty() {
            return;
        }
        let cutoff = self.now_ms() - self.settings.stray_grace_time_limit_ms * 2;
        self.order_grace_times.retain(|_, seen| *seen >= cutoff);
    }

    /// One-shot maintenance routine: once the configured epoch passes,
    /// snapshot every market and cancel all local positions.
    pub(crate) fn check_maintenance(&mut self) {
        let at = self.settings.maintenance_time_ms;
        if self.maintenance_triggered || at <= 0 || at > self.now_ms() {
            return;
        }

        info!(epoch = at, "running maintenance routine");

        if let Err(e) = self.save_market("all", 15) {
            warn!(error = %e, "maintenance snapshot failed");
        }
        self.cancel_local("all");
        self.maintenance_triggered = true;

        info!("maintenance routine finished");
    }
}
