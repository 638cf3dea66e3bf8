//! Cooperative tick driver.
//!
//! The engine is a synchronous state machine; this module supplies the two
//! cadences that drive it - a fast tick for timeouts and count
//! reconciliation, a slow tick for diverge/converge, grace pruning, and
//! the maintenance epoch. Adapter events arrive on the same task, so no
//! position is ever observed by two executions at once.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::exchange::ExchangeAdapter;

use super::Engine;

/// Tick cadences for [`run_ticks`].
#[derive(Debug, Clone, Copy)]
pub struct TickOptions {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
}

impl Default for TickOptions {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(1),
            slow_interval: Duration::from_secs(10),
        }
    }
}

/// Drive the engine's maintenance cadences until `shutdown` flips true (or
/// its sender drops).
pub async fn run_ticks<A: ExchangeAdapter>(
    engine: &mut Engine<A>,
    options: TickOptions,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut fast = tokio::time::interval(options.fast_interval);
    let mut slow = tokio::time::interval(options.slow_interval);
    fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    slow.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        fast_ms = options.fast_interval.as_millis() as u64,
        slow_ms = options.slow_interval.as_millis() as u64,
        "tick driver started"
    );

    loop {
        tokio::select! {
            _ = fast.tick() => engine.on_check_timeouts(),
            _ = slow.tick() => engine.on_check_diverge_converge(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("tick driver stopped");
}
