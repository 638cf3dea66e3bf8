//! Engine configuration surface.
//!
//! Two layers: [`EngineSettings`] holds the global timeouts and feature
//! toggles, [`MarketSettings`] holds the per-market grid parameters. Both
//! deserialize with per-field defaults so hosts can supply sparse configs.
//! Loading files is the host's concern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Global engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Resubmit a queued order whose placement request is older than this.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: i64,

    /// Re-issue a cancel that has not confirmed within this window.
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_ms: i64,

    /// Orders younger than this are never classified from open-order scans.
    #[serde(default = "default_safety_delay")]
    pub safety_delay_time_ms: i64,

    /// Orders younger than this are never classified from ticker collisions.
    #[serde(default = "default_ticker_safety_delay")]
    pub ticker_safety_delay_time_ms: i64,

    /// How long a stray remote order may linger before it is cancelled.
    #[serde(default = "default_stray_grace")]
    pub stray_grace_time_limit_ms: i64,

    /// Cancel remote orders we do not own.
    #[serde(default = "default_true")]
    pub should_clear_stray_orders: bool,

    /// Clear strays even when their price matches none of our rungs.
    #[serde(default)]
    pub should_clear_stray_orders_all: bool,

    /// Ignore an all-empty open-orders snapshot while many positions are
    /// active (single-cycle glitch protection).
    #[serde(default = "default_true")]
    pub should_mitigate_blank_orderbook_flash: bool,

    /// Tighten the stored best bid/ask when our own order improves on it.
    #[serde(default)]
    pub should_adjust_hibuy_losell: bool,

    /// First slippage reset prices one tick outside the public spread;
    /// disabled, every reset is additive.
    #[serde(default = "default_true")]
    pub should_slippage_be_calculated: bool,

    /// Let the DC scan touch slippage positions.
    #[serde(default)]
    pub should_dc_slippage_orders: bool,

    /// Extra diagnostics on slippage and spread adjustments.
    #[serde(default)]
    pub is_chatty: bool,

    /// Epoch ms at which the one-shot maintenance routine (save + cancel
    /// local) runs; 0 disables it.
    #[serde(default)]
    pub maintenance_time_ms: i64,

    /// Directory snapshot files are written into.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

fn default_request_timeout() -> i64 {
    180_000
}

fn default_cancel_timeout() -> i64 {
    300_000
}

fn default_safety_delay() -> i64 {
    2_000
}

fn default_ticker_safety_delay() -> i64 {
    2_000
}

fn default_stray_grace() -> i64 {
    600_000
}

fn default_true() -> bool {
    true
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            cancel_timeout_ms: default_cancel_timeout(),
            safety_delay_time_ms: default_safety_delay(),
            ticker_safety_delay_time_ms: default_ticker_safety_delay(),
            stray_grace_time_limit_ms: default_stray_grace(),
            should_clear_stray_orders: true,
            should_clear_stray_orders_all: false,
            should_mitigate_blank_orderbook_flash: true,
            should_adjust_hibuy_losell: false,
            should_slippage_be_calculated: true,
            should_dc_slippage_orders: false,
            is_chatty: false,
            maintenance_time_ms: 0,
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

/// Per-market grid parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSettings {
    /// Keep at least this many orders per side; 0 disables maintenance.
    #[serde(default = "default_order_min")]
    pub order_min: i32,

    /// Cancel the extreme order when a side exceeds this; 0 disables.
    #[serde(default = "default_order_max")]
    pub order_max: i32,

    /// Landmark width in rungs; ≥2 enables diverge/converge.
    #[serde(default = "default_order_dc")]
    pub order_dc: i32,

    /// Extra rungs of distance before a normal order converges.
    #[serde(default)]
    pub order_dc_nice: i32,

    /// Rungs between the spread and the first landmark boundary.
    #[serde(default)]
    pub landmark_start: i32,

    /// Shrinks the count band in which landmarks are auto-set.
    #[serde(default)]
    pub landmark_thresh: i32,

    /// Sentiment flag: true favors buys when applying the market offset.
    #[serde(default)]
    pub market_sentiment: bool,

    /// Offset fraction applied to the sentiment-favored side.
    #[serde(default)]
    pub market_offset: f64,

    #[serde(default = "default_ticksize")]
    pub price_ticksize: Amount,

    #[serde(default = "default_ticksize")]
    pub quantity_ticksize: Amount,

    /// Reset a slippage position that has rested longer than this.
    #[serde(default = "default_slippage_timeout")]
    pub slippage_timeout_ms: i64,

    /// Exchange price-window multipliers (Binance PERCENT_PRICE); zero
    /// disables the window check.
    #[serde(default)]
    pub price_min_mul: Amount,

    #[serde(default)]
    pub price_max_mul: Amount,

    /// Per-market slippage offset multiplier (Poloniex recovery pricing).
    #[serde(default)]
    pub slippage_multiplier: f64,
}

fn default_order_min() -> i32 {
    1
}

fn default_order_max() -> i32 {
    5
}

fn default_order_dc() -> i32 {
    1
}

fn default_ticksize() -> Amount {
    Amount::SATOSHI
}

fn default_slippage_timeout() -> i64 {
    120_000
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            order_min: default_order_min(),
            order_max: default_order_max(),
            order_dc: default_order_dc(),
            order_dc_nice: 0,
            landmark_start: 0,
            landmark_thresh: 0,
            market_sentiment: false,
            market_offset: 0.0,
            price_ticksize: default_ticksize(),
            quantity_ticksize: default_ticksize(),
            slippage_timeout_ms: default_slippage_timeout(),
            price_min_mul: Amount::ZERO,
            price_max_mul: Amount::ZERO,
            slippage_multiplier: 0.0,
        }
    }
}
