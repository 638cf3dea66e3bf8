//! Post-only price improvement and slippage recovery.
//!
//! `try_move_order` runs at placement and at the slippage timeout: it keeps
//! a maker order on the right side of the public spread and walks it back
//! toward its rung price when the spread allows. `find_better_price` is the
//! recovery path when a maker order collides with the book anyway (the
//! venue bounced it for crossing): each reset prices further out, so a
//! moving market cannot pin the order forever.

use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::exchange::{ExchangeAdapter, ExchangeKind};
use crate::market::MarketInfo;
use crate::types::Side;

use super::{Engine, PosId, Position};

/// Nudge a maker order to the best allowed price for its side.
///
/// Buys never pay above their rung price: a buy crossing the ask clamps to
/// one tick under it, and a buy pushed below its rung by resets walks back
/// up, capped at both the rung price and the inside of the spread. Sells
/// never give up rung profit: a sell crossing the bid clamps to one tick
/// above it, a sell resting inside the spread lifts to one tick under the
/// public ask, and a sell pushed above that settles back down to the
/// higher of the rung price and the under-ask quote.
///
/// Returns true when a price changed; the position is then flagged as
/// slippage so the timeout loop keeps watching it. The walks are computed
/// in whole ticksize steps, never past the rung original, never crossing
/// the order's own side.
pub(crate) fn try_move_order(pos: &mut Position, info: &MarketInfo, chatty: bool) -> bool {
    let hi_buy = info.highest_buy;
    let lo_sell = info.lowest_sell;

    // no ticker yet, nothing to compare against
    if hi_buy.is_zero_or_less() || lo_sell.is_zero_or_less() {
        return false;
    }

    let tick = info.settings.price_ticksize;

    if pos.side == Side::Buy {
        // crossing the ask: pull the buy one tick under it
        if pos.buy_price >= lo_sell && lo_sell > tick {
            pos.buy_price = lo_sell - tick;
            pos.is_slippage = true;
            return true;
        }

        // walk back toward the rung price in tick steps, staying inside
        // the spread
        let target = pos.buy_price_original.min(lo_sell - tick);
        let mut new_buy = pos.buy_price;
        if new_buy < target {
            new_buy = new_buy + (target - new_buy).truncated_by_ticksize(tick);
        }

        if new_buy != pos.price
            && new_buy.is_positive()
            && new_buy <= pos.buy_price_original
            && new_buy != pos.buy_price
            && new_buy < lo_sell
        {
            pos.buy_price = new_buy;
            pos.is_slippage = true;
            return true;
        }

        if pos.is_slippage && chatty {
            debug!(
                new_buy = %new_buy,
                original = %pos.buy_price_original,
                hi_buy = %hi_buy,
                lo_sell = %lo_sell,
                "couldn't find better buy price for {}",
                pos.order_label()
            );
        }
    } else {
        // crossing the bid: push the sell one tick above it
        if pos.sell_price <= hi_buy {
            pos.sell_price = hi_buy + tick;
            pos.is_slippage = true;
            return true;
        }

        // best allowed quote: one tick under the public ask, never below
        // the rung original, never below the two-tick floor
        let floor = tick + tick;
        let target = pos.sell_price_original.max(lo_sell - tick).max(floor);
        let mut new_sell = pos.sell_price;
        if new_sell < target {
            new_sell = target;
        } else if new_sell > target {
            new_sell = new_sell - (new_sell - target).truncated_by_ticksize(tick);
        }

        if new_sell != pos.price
            && new_sell > tick
            && new_sell >= pos.sell_price_original
            && new_sell != pos.sell_price
            && new_sell > hi_buy
        {
            pos.sell_price = new_sell;
            pos.is_slippage = true;
            return true;
        }

        if pos.is_slippage && chatty {
            debug!(
                new_sell = %new_sell,
                original = %pos.sell_price_original,
                hi_buy = %hi_buy,
                lo_sell = %lo_sell,
                "couldn't find better sell price for {}",
                pos.order_label()
            );
        }
    }

    false
}

/// Compute the tick offset a reset moves by. Grows with the reset count so
/// repeated collisions back off instead of thrashing.
fn reset_offset(pos: &Position, info: &MarketInfo, kind: ExchangeKind) -> Amount {
    match kind {
        ExchangeKind::Poloniex => {
            let base = match pos.side {
                Side::Buy => pos.buy_price,
                Side::Sell => pos.sell_price,
            };
            base.ratio(info.settings.slippage_multiplier) + Amount::SATOSHI
        }
        _ => {
            let tick = info.settings.price_ticksize;
            if pos.price_reset_count > 0 {
                let growth = (pos.price_reset_count as f64).powf(1.110).floor() as i64;
                tick + tick * Amount::from_int(growth)
            } else {
                tick
            }
        }
    }
}

fn adjust_spread_tracker(pos: &Position, info: &mut MarketInfo, chatty: bool) {
    if pos.side == Side::Buy {
        if info.lowest_sell.is_positive() && info.lowest_sell > pos.buy_price {
            if chatty {
                debug!(
                    market = %pos.market,
                    buy = %pos.buy_price,
                    lo_sell = %info.lowest_sell,
                    "lo-sell-adjust"
                );
            }
            info.lowest_sell = pos.buy_price;
        }
    } else if info.highest_buy.is_positive() && info.highest_buy < pos.sell_price {
        if chatty {
            debug!(
                market = %pos.market,
                sell = %pos.sell_price,
                hi_buy = %info.highest_buy,
                "hi-buy-adjust"
            );
        }
        info.highest_buy = pos.sell_price;
    }
}

impl<A: ExchangeAdapter> Engine<A> {
    /// Reprice a maker order that collided with the public book and
    /// resubmit it.
    ///
    /// Two strategies alternate on the reset count: the first reset prices
    /// exactly one offset outside the far side of the spread
    /// ("calculated"), later resets step the prior price further out
    /// ("additive"). Every reset bumps `price_reset_count` and refreshes
    /// the market's open-price multiset.
    pub fn find_better_price(&mut self, id: PosId) {
        let kind = self.adapter.kind();
        if !kind.supports_price_reset() {
            warn!("find_better_price called on a venue without post-only repricing");
            return;
        }

        let Some(pos) = self.arena.get_mut(id) else {
            return;
        };
        let Some(info) = self.markets.get_mut(&pos.market) else {
            return;
        };

        let offset = reset_offset(pos, info, kind);

        if self.settings.should_adjust_hibuy_losell {
            adjust_spread_tracker(pos, info, self.settings.is_chatty);
        }

        let calculated = pos.price_reset_count < 1 && self.settings.should_slippage_be_calculated;
        let strategy;
        if pos.side == Side::Buy {
            let new_buy = if calculated && info.lowest_sell.is_positive() {
                strategy = "calculated";
                info.lowest_sell - offset
            } else {
                strategy = "additive";
                pos.buy_price - offset
            };
            info!(
                strategy,
                price = %new_buy,
                offset = %offset,
                "(post-only) trying new buy price for {}",
                pos.order_label()
            );
            pos.buy_price = new_buy;
        } else {
            let new_sell = if calculated && info.highest_buy.is_positive() {
                strategy = "calculated";
                info.highest_buy + offset
            } else {
                strategy = "additive";
                pos.sell_price + offset
            };
            info!(
                strategy,
                price = %new_sell,
                offset = %offset,
                "(post-only) trying new sell price for {}",
                pos.order_label()
            );
            pos.sell_price = new_sell;
        }

        pos.is_slippage = true;
        pos.price_reset_count += 1;

        // keep the stray-matching multiset in step with the posted price
        info.remove_order_price(pos.price);
        pos.refresh_posted(
            info.settings.market_offset,
            info.settings.market_sentiment,
            info.settings.quantity_ticksize,
        );
        info.add_order_price(pos.price);

        // the order never reached the book; send it again at the new price
        pos.order_request_time = self.clock.now_ms();
        let pos = self.arena.get(id).expect("repriced above");
        self.adapter.submit(id, pos, true);
    }
}
