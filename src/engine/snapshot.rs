//! Save-market snapshots.
//!
//! Serializes each market's rung grid as `setorder` lines that the host
//! replays on restart. Rungs near the spread and currently held by a
//! position save as `active`; everything else saves as `ghost` so the grid
//! shape survives without immediately re-placing far orders.

use std::fs;

use tracing::{info, warn};

use crate::exchange::ExchangeAdapter;
use crate::errors::EngineError;
use crate::types::Side;

use super::Engine;

/// Smallest allowed active window, in orders per side.
const MIN_SAVED_ORDERS: i32 = 15;

impl<A: ExchangeAdapter> Engine<A> {
    /// Write `index-<filter>.txt` covering every market matching the
    /// filter ("all" for everything).
    ///
    /// A rung saves as `active` when a current position holds it and it
    /// sits within `num_orders` rungs of the lowest sell; rungs above the
    /// highest sell save as ghost sells. Sizes carry their alternate as
    /// `size/alternate`.
    pub fn save_market(&self, market_filter: &str, num_orders: i32) -> Result<(), EngineError> {
        let filter = if market_filter.is_empty() {
            "all"
        } else {
            market_filter
        };
        let num_orders = num_orders.max(MIN_SAVED_ORDERS) as i64;

        let mut out = String::new();
        let mut saved_markets = 0usize;

        for (market, info) in &self.markets {
            if filter != "all" && market != filter {
                continue;
            }
            if info.index.is_empty() {
                continue;
            }

            // index ownership from every position of this market
            let mut buys: Vec<u32> = Vec::new();
            let mut sells: Vec<u32> = Vec::new();
            let mut highest_sell_idx: i64 = 0;
            let mut lowest_sell_idx: i64 = i64::MAX;

            for (_, pos) in self.arena.iter() {
                if pos.market != *market {
                    continue;
                }
                for idx in &pos.market_indices {
                    if pos.side == Side::Sell {
                        sells.push(*idx);
                        highest_sell_idx = highest_sell_idx.max(*idx as i64);
                        lowest_sell_idx = lowest_sell_idx.min(*idx as i64);
                    } else {
                        buys.push(*idx);
                    }
                }
            }

            if buys.is_empty() && sells.is_empty() {
                warn!(%market, "no buy or sell indices for market, not saving");
                continue;
            }

            for (current_index, rung) in info.index.iter().enumerate() {
                let idx = current_index as u32;
                let idx_i = current_index as i64;

                let is_active = (sells.contains(&idx) || buys.contains(&idx))
                    && idx_i > lowest_sell_idx - num_orders
                    && idx_i < lowest_sell_idx + num_orders;

                let is_sell = sells.contains(&idx)
                    || (idx_i > highest_sell_idx && highest_sell_idx > 0);

                let mut order_size = rung.order_size.to_string();
                if rung.alternate_size.is_positive() {
                    order_size = format!("{}/{}", order_size, rung.alternate_size);
                }

                out.push_str(&format!(
                    "setorder {} {} {} {} {} {}\n",
                    market,
                    if is_sell { Side::Sell } else { Side::Buy },
                    rung.buy_price,
                    rung.sell_price,
                    order_size,
                    if is_active { "active" } else { "ghost" },
                ));
            }

            saved_markets += 1;
            info!(%market, indices = info.index.len(), "saved market");
        }

        if saved_markets == 0 {
            info!("no markets saved");
            return Ok(());
        }

        let path = self.settings.snapshot_dir.join(format!("index-{filter}.txt"));
        fs::write(&path, out)?;
        Ok(())
    }
}
