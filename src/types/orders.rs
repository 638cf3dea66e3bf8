//! Order-shaped types crossing the adapter boundary.

use crate::amount::Amount;
use crate::types::common::Side;

/// Parsed order type string.
///
/// Accepted forms: `active`, `ghost`, and `onetime` with optional suffixes
/// in any order - `-taker`, `-override`, `-timeout<N>` (minutes), e.g.
/// `onetime-taker-timeout5-override`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderFlavor {
    pub kind: OrderKind,
    pub taker: bool,
    pub override_spread: bool,
    /// Max age in minutes for one-time orders; 0 means no limit.
    pub max_age_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// Allocate the rung and place the order.
    Active,
    /// Allocate the rung only; no order is placed.
    Ghost,
    /// Place once, never flip.
    OneTime,
}

impl OrderFlavor {
    pub fn parse(s: &str) -> Option<OrderFlavor> {
        let kind = if s == "active" {
            OrderKind::Active
        } else if s == "ghost" {
            OrderKind::Ghost
        } else if s.starts_with("onetime") {
            OrderKind::OneTime
        } else {
            return None;
        };

        let mut flavor = OrderFlavor {
            kind,
            taker: s.contains("-taker"),
            override_spread: s.contains("-override"),
            max_age_minutes: 0,
        };

        if kind == OrderKind::OneTime {
            if let Some(at) = s.find("-timeout") {
                let digits: String = s[at + "-timeout".len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if let Ok(minutes) = digits.parse::<i64>() {
                    if minutes > 0 {
                        flavor.max_age_minutes = minutes;
                    }
                }
            }
        }

        Some(flavor)
    }

    pub fn is_onetime(&self) -> bool {
        self.kind == OrderKind::OneTime
    }
}

/// One open order as reported by an exchange snapshot.
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub market: String,
    pub side: Side,
    pub price: Amount,
    pub btc_amount: Amount,
    pub order_id: String,
}

/// Best bid/ask for one market.
#[derive(Debug, Clone, Copy)]
pub struct TickerQuote {
    pub bid: Amount,
    pub ask: Amount,
}

/// Exchange-reported order status (direct status feeds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Which detection path classified a fill. Used for dedup bookkeeping and
/// log tags only - every source funnels into the same fill handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSource {
    OrderScan,
    History,
    Ticker,
    Cancel,
    Feed,
}

impl FillSource {
    pub fn tag(&self) -> &'static str {
        match self {
            FillSource::OrderScan => "getorder-fill",
            FillSource::History => "history-fill",
            FillSource::Ticker => "ticker-fill",
            FillSource::Cancel => "cancel-fill",
            FillSource::Feed => "wss-fill",
        }
    }
}
