//! Exchange adapter contract.
//!
//! The engine never talks to the network. It hands outbound work to an
//! [`ExchangeAdapter`] - an enqueue-only surface whose replies come back
//! later through the engine's event entry points (`on_new_order`,
//! `on_submit_error`, `on_open_orders`, `on_ticker`, `on_order_status`,
//! `process_cancelled_order`). Requests may silently drop; correctness
//! comes from reconciliation, not acknowledgments.

use crate::engine::{PosId, Position};

/// Which venue an adapter speaks to. The engine only consults this for the
/// documented per-venue quirks; everything else lives behind the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Bittrex,
    Binance,
    Poloniex,
    Waves,
}

impl ExchangeKind {
    /// Venues where an order missing from the open-orders snapshot is
    /// declared filled directly.
    pub fn fills_from_order_scan(&self) -> bool {
        matches!(self, ExchangeKind::Binance | ExchangeKind::Poloniex)
    }

    /// Venues where a missing order triggers a per-order status probe
    /// instead of a direct fill claim.
    pub fn probes_missing_orders(&self) -> bool {
        matches!(self, ExchangeKind::Bittrex)
    }

    /// Venues with a post-only style price-reset path.
    pub fn supports_price_reset(&self) -> bool {
        !matches!(self, ExchangeKind::Bittrex)
    }

    /// Venues whose order ids are only unique per market; the engine
    /// prefixes the market symbol at activation. Adapters for these venues
    /// must apply the same prefix to ids in open-orders snapshots and
    /// status events, or registry lookups will miss.
    pub fn prefixes_order_ids(&self) -> bool {
        matches!(self, ExchangeKind::Binance)
    }

    /// Venues with an exchange-enforced price window around the spread.
    pub fn enforces_price_window(&self) -> bool {
        matches!(self, ExchangeKind::Binance)
    }
}

/// Why a placement failed, as classified by the adapter.
#[derive(Debug, Clone)]
pub enum SubmitError {
    /// The order can never succeed (bad market, not enough balance). The
    /// engine removes the position.
    Fatal(String),
    /// Worth retrying; the request timeout will resubmit.
    Transient(String),
}

/// Outbound surface the engine drives.
///
/// All methods are enqueue-only and must not block; the adapter owns its
/// own transport and delivers results on the engine's event loop. The two
/// queue limits bound how much the maintenance passes are allowed to pile
/// onto the adapter before yielding.
pub trait ExchangeAdapter {
    fn kind(&self) -> ExchangeKind;

    /// Enqueue placement of a queued position.
    fn submit(&mut self, id: PosId, pos: &Position, quiet: bool);

    /// Enqueue a cancel. `pos` is the owning handle when the order is ours;
    /// `None` cancels a stray order.
    fn cancel(&mut self, order_id: &str, pos: Option<PosId>);

    /// Enqueue a single-order status probe (venues without a reliable
    /// open-orders fill signal).
    fn request_order_status(&mut self, order_id: &str, pos: PosId);

    /// Drop any in-flight request referencing the handle; late replies for
    /// it must not be delivered. Called before a position is released.
    fn abort_requests_for(&mut self, id: PosId);

    /// Backpressure: when true, maintenance passes stop issuing work for
    /// this tick.
    fn yield_to_flow_control(&self) -> bool;

    /// Number of outbound commands currently queued.
    fn queued_commands(&self) -> usize;

    /// Queue depth above which the DC scan will not start new work.
    fn dc_queue_limit(&self) -> usize {
        5
    }

    /// Queue depth above which the timeout scan skips a tick.
    fn timeout_yield_limit(&self) -> usize {
        5
    }

    /// True when a private fill feed makes ticker-collision classification
    /// redundant (the feed reports fills faster and exactly).
    fn suppresses_ticker_fills(&self) -> bool {
        false
    }
}
