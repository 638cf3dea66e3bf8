#![deny(unreachable_pub)]

//! Grid ping-pong market-making engine.
//!
//! Each market is a vector of indexed price rungs. The engine keeps a
//! bounded window of orders near the spread, flips every filled order to
//! the opposite side of its rung, defends against slippage by tracking the
//! public bid/ask, and compresses far-from-spread rungs into landmark
//! orders to keep exchange order counts down. Exchange transports plug in
//! behind the [`ExchangeAdapter`] trait.

mod amount;
mod config;
mod errors;
mod logging;
mod market;
mod types;

pub mod engine;
pub mod exchange;

pub use amount::{Amount, AMOUNT_SCALE};
pub use config::{EngineSettings, MarketSettings};
pub use engine::{run_ticks, Engine, PosId, Position, TickOptions};
pub use errors::EngineError;
pub use exchange::{ExchangeAdapter, ExchangeKind, SubmitError};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use market::{MarketIndex, MarketInfo, PositionData};
pub use types::{
    CancelReason, Clock, FillSource, OrderFlavor, OrderInfo, OrderKind, OrderStatus, Side,
    TickerQuote,
};
