//! Per-market state: the rung grid, the spread tracker, and the multiset of
//! open order prices used for stray matching.

use crate::amount::Amount;
use crate::config::MarketSettings;

/// One rung of a market's grid: the buy/sell price pair and the size posted
/// at either of them.
///
/// A nonzero `alternate_size` replaces `order_size` after the first fill on
/// the rung; `fill_count` tracks how many fills the rung has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionData {
    pub buy_price: Amount,
    pub sell_price: Amount,
    pub order_size: Amount,
    pub alternate_size: Amount,
    pub fill_count: u32,
}

impl PositionData {
    pub fn new(buy_price: Amount, sell_price: Amount, order_size: Amount) -> Self {
        Self {
            buy_price,
            sell_price,
            order_size,
            alternate_size: Amount::ZERO,
            fill_count: 0,
        }
    }

    pub fn with_alternate(mut self, alternate_size: Amount) -> Self {
        self.alternate_size = alternate_size;
        self
    }
}

/// Ordered vector of rungs for one market, index 0 lowest.
///
/// Entries are append-only during normal operation; only a snapshot restore
/// or an explicit cancel clears them.
#[derive(Debug, Clone, Default)]
pub struct MarketIndex {
    rungs: Vec<PositionData>,
}

impl MarketIndex {
    /// Append a rung, returning its index.
    pub fn append(&mut self, rung: PositionData) -> u32 {
        self.rungs.push(rung);
        (self.rungs.len() - 1) as u32
    }

    pub fn get(&self, idx: u32) -> Option<&PositionData> {
        self.rungs.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionData> {
        self.rungs.iter()
    }

    pub fn clear(&mut self) {
        self.rungs.clear();
    }

    /// Record a fill on a rung: on the first fill a nonzero `alternate_size`
    /// takes over as the rung's order size, then the fill count increments.
    /// Out-of-range indices are ignored.
    pub fn resize_by_alternate_size(&mut self, idx: u32) {
        if let Some(rung) = self.rungs.get_mut(idx as usize) {
            if rung.fill_count == 0 && rung.alternate_size.is_positive() {
                rung.order_size = rung.alternate_size;
            }
            rung.fill_count += 1;
        }
    }
}

/// Everything the engine tracks for one market: settings, the rung grid,
/// the last observed spread, and the prices of orders we currently own.
#[derive(Debug, Clone, Default)]
pub struct MarketInfo {
    pub settings: MarketSettings,
    pub index: MarketIndex,
    /// Best public bid last seen on the ticker.
    pub highest_buy: Amount,
    /// Best public ask last seen on the ticker.
    pub lowest_sell: Amount,
    /// Multiset of posted prices over our queued and active positions.
    pub order_prices: Vec<Amount>,
}

impl MarketInfo {
    pub fn add_order_price(&mut self, price: Amount) {
        self.order_prices.push(price);
    }

    /// Remove one occurrence of `price` from the multiset.
    pub fn remove_order_price(&mut self, price: Amount) {
        if let Some(at) = self.order_prices.iter().position(|p| *p == price) {
            self.order_prices.swap_remove(at);
        }
    }

    pub fn has_order_price(&self, price: Amount) -> bool {
        self.order_prices.contains(&price)
    }
}
