//! Position: one live or queued order on a market's grid.

use smallvec::SmallVec;

use crate::amount::Amount;
use crate::market::PositionData;
use crate::types::{CancelReason, Side};

/// Inline capacity for rung index lists; landmarks rarely span more rungs.
pub type IndexList = SmallVec<[u32; 4]>;

/// One order the engine owns, queued or resting.
///
/// A normal position references exactly one rung; a landmark references
/// `order_dc` consecutive rungs and aggregates their size. The posted price
/// and quantity are derived from side, prices, and the market offset - see
/// [`Position::refresh_posted`].
#[derive(Debug, Clone)]
pub struct Position {
    pub market: String,
    pub side: Side,
    /// Rung-pair prices currently in effect (may drift from the originals
    /// while the position is in slippage).
    pub buy_price: Amount,
    pub sell_price: Amount,
    /// Rung-pair prices at creation; slippage improvement never goes past
    /// these.
    pub buy_price_original: Amount,
    pub sell_price_original: Amount,
    /// Committed quote-denominated size from the rung (pre-offset).
    pub order_size: Amount,
    /// Size that takes over after the rung's first fill; zero when unset.
    pub alternate_size: Amount,
    /// Price the order posts at, given the side.
    pub price: Amount,
    /// Base-denominated quantity posted.
    pub quantity: Amount,
    /// Quote-denominated amount posted (order_size after offset).
    pub btc_amount: Amount,
    pub strategy_tag: String,
    /// Rung indices covered: one entry normally, `order_dc` for landmarks.
    pub market_indices: IndexList,
    pub is_landmark: bool,
    pub is_onetime: bool,
    pub is_taker: bool,
    pub is_slippage: bool,
    pub is_cancelling: bool,
    /// Set on orders auto-placed at the grid edge, far from the spread.
    pub is_new_hilo_order: bool,
    /// Exchange id once the order is set.
    pub order_id: Option<String>,
    pub order_request_time: i64,
    pub order_set_time: i64,
    pub order_cancel_time: i64,
    pub order_getorder_time: i64,
    pub cancel_reason: Option<CancelReason>,
    /// One-time orders only: cancel after this many minutes resting.
    pub max_age_minutes: i64,
    pub price_reset_count: u32,
}

impl Position {
    /// Create a normal (single-rung) position.
    pub fn new(
        market: &str,
        side: Side,
        buy_price: Amount,
        sell_price: Amount,
        order_size: Amount,
        strategy_tag: &str,
        indices: IndexList,
    ) -> Self {
        let mut pos = Self {
            market: market.to_string(),
            side,
            buy_price,
            sell_price,
            buy_price_original: buy_price,
            sell_price_original: sell_price,
            order_size,
            alternate_size: Amount::ZERO,
            price: Amount::ZERO,
            quantity: Amount::ZERO,
            btc_amount: Amount::ZERO,
            strategy_tag: strategy_tag.to_string(),
            market_indices: indices,
            is_landmark: false,
            is_onetime: false,
            is_taker: false,
            is_slippage: false,
            is_cancelling: false,
            is_new_hilo_order: false,
            order_id: None,
            order_request_time: 0,
            order_set_time: 0,
            order_cancel_time: 0,
            order_getorder_time: 0,
            cancel_reason: None,
            max_age_minutes: 0,
            price_reset_count: 0,
        };
        pos.refresh_posted(0.0, false, Amount::SATOSHI);
        pos
    }

    /// Create a landmark spanning `rungs` (one entry per covered index).
    ///
    /// The landmark posts the summed size at the average of the covered
    /// prices, truncated to the price ticksize.
    pub fn new_landmark(
        market: &str,
        side: Side,
        rungs: &[&PositionData],
        indices: IndexList,
        price_ticksize: Amount,
    ) -> Self {
        let count = Amount::from_int(rungs.len().max(1) as i64);
        let buy_sum: Amount = rungs.iter().map(|r| r.buy_price).sum();
        let sell_sum: Amount = rungs.iter().map(|r| r.sell_price).sum();
        let size_sum: Amount = rungs.iter().map(|r| r.order_size).sum();

        let buy_price = (buy_sum / count).truncated_by_ticksize(price_ticksize);
        let sell_price = (sell_sum / count).truncated_by_ticksize(price_ticksize);

        let mut pos = Self::new(market, side, buy_price, sell_price, size_sum, "", indices);
        pos.is_landmark = true;
        pos
    }

    /// Lowest rung index covered.
    pub fn lowest_index(&self) -> u32 {
        self.market_indices.iter().copied().min().unwrap_or(0)
    }

    /// Highest rung index covered.
    pub fn highest_index(&self) -> u32 {
        self.market_indices.iter().copied().max().unwrap_or(0)
    }

    /// Flip to the opposite side. Prices are not touched here - the caller
    /// re-reads them from the rung so slippage drift does not leak into the
    /// flipped order.
    pub fn flip(&mut self) {
        self.side = self.side.opposite();
    }

    /// Recompute posted price, amount, and quantity from the current side
    /// and prices, applying the market offset to the sentiment-favored side.
    ///
    /// Sentiment `true` favors buys: their committed amount grows by
    /// `offset`; `false` favors sells the same way.
    pub fn refresh_posted(&mut self, offset: f64, sentiment: bool, quantity_ticksize: Amount) {
        self.price = match self.side {
            Side::Buy => self.buy_price,
            Side::Sell => self.sell_price,
        };

        let favored = sentiment == self.side.is_buy();
        self.btc_amount = if favored && offset != 0.0 {
            self.order_size.ratio(1.0 + offset)
        } else {
            self.order_size
        };

        self.quantity = if self.price.is_positive() {
            (self.btc_amount / self.price).truncated_by_ticksize(quantity_ticksize)
        } else {
            Amount::ZERO
        };
    }

    /// Short human line for log output.
    pub fn order_label(&self) -> String {
        format!(
            "{:<4} {} {} @ {}{}",
            self.side,
            self.market,
            self.btc_amount,
            self.price,
            match &self.order_id {
                Some(id) => format!(" ({id})"),
                None => String::new(),
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn amt(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    fn sample_buy() -> Position {
        Position::new(
            "BTC-TEST",
            Side::Buy,
            amt("1.00"),
            amt("2.00"),
            amt("10"),
            "",
            smallvec![0],
        )
    }

    #[test]
    fn posted_price_follows_side() {
        let mut pos = sample_buy();
        assert_eq!(pos.price, amt("1.00"));
        assert_eq!(pos.quantity, amt("10"));

        pos.flip();
        pos.refresh_posted(0.0, false, Amount::SATOSHI);
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.price, amt("2.00"));
        assert_eq!(pos.quantity, amt("5"));
    }

    #[test]
    fn flip_twice_is_identity_on_side() {
        let mut pos = sample_buy();
        let original = pos.side;
        pos.flip();
        pos.flip();
        assert_eq!(pos.side, original);
    }

    #[test]
    fn offset_scales_favored_side_only() {
        let mut pos = sample_buy();
        pos.refresh_posted(0.1, true, Amount::SATOSHI);
        assert_eq!(pos.btc_amount, amt("11"));

        // sentiment favoring sells leaves the buy untouched
        pos.refresh_posted(0.1, false, Amount::SATOSHI);
        assert_eq!(pos.btc_amount, amt("10"));
    }

    #[test]
    fn quantity_truncates_to_ticksize() {
        let mut pos = Position::new(
            "BTC-TEST",
            Side::Buy,
            amt("3.00"),
            amt("4.00"),
            amt("10"),
            "",
            smallvec![0],
        );
        pos.refresh_posted(0.0, false, amt("0.001"));
        // 10 / 3 = 3.33333333 -> 3.333
        assert_eq!(pos.quantity, amt("3.333"));
    }

    #[test]
    fn landmark_aggregates_rungs() {
        let r0 = PositionData::new(amt("1.00"), amt("2.00"), amt("10"));
        let r1 = PositionData::new(amt("2.00"), amt("3.00"), amt("10"));
        let r2 = PositionData::new(amt("3.00"), amt("4.00"), amt("10"));
        let pos = Position::new_landmark(
            "BTC-TEST",
            Side::Buy,
            &[&r0, &r1, &r2],
            smallvec![0, 1, 2],
            Amount::SATOSHI,
        );

        assert!(pos.is_landmark);
        assert_eq!(pos.buy_price, amt("2.00"));
        assert_eq!(pos.sell_price, amt("3.00"));
        assert_eq!(pos.btc_amount, amt("30"));
        assert_eq!(pos.lowest_index(), 0);
        assert_eq!(pos.highest_index(), 2);
    }
}
