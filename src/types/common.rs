//! Core shared types: order side, cancel reasons, and the engine clock.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Side of an order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse from a user-facing string ("buy" or "sell").
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "b" => Some(Side::Buy),
            "sell" | "s" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position is being cancelled.
///
/// The reason decides the follow-up when the cancel confirms: DC cancels
/// continue the diverge/converge handoff, short/long cancels flip, slippage
/// resets re-place at refreshed rung prices, everything else just dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    ByUser,
    ForDC,
    ForShortLong,
    ForMaxAge,
    Lowest,
    Highest,
    ForSlippageReset,
}

impl CancelReason {
    /// Short tag appended to the cancel log line.
    pub fn tag(&self) -> &'static str {
        match self {
            CancelReason::Lowest => "lo",
            CancelReason::Highest => "hi",
            CancelReason::ForMaxAge => "age",
            CancelReason::ForShortLong => "s/l",
            CancelReason::ForDC => "dc",
            CancelReason::ForSlippageReset => "reset",
            CancelReason::ByUser => "user",
        }
    }
}

/// Millisecond clock for the engine.
///
/// `System` reads wall time; `Manual` reads a shared atomic so tests and
/// replay drivers control timeout and grace logic deterministically.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn manual(start_ms: i64) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start_ms)))
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        match self {
            Clock::System => chrono::Utc::now().timestamp_millis(),
            Clock::Manual(t) => t.load(Ordering::Relaxed),
        }
    }

    /// Set a manual clock. No-op on the system clock.
    pub fn set_ms(&self, ms: i64) {
        if let Clock::Manual(t) = self {
            t.store(ms, Ordering::Relaxed);
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance_ms(&self, delta: i64) {
        if let Clock::Manual(t) = self {
            t.fetch_add(delta, Ordering::Relaxed);
        }
    }
}
