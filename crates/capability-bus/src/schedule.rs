//! Periodic ticker used by the background loops.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// An interval whose first tick fires one `period` from now.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Recreate `interval` if the configured period changed.
pub(crate) fn reset_if_changed(
    interval: &mut Interval,
    current: &mut Duration,
    configured: Duration,
) {
    if *current != configured {
        *current = configured;
        *interval = ticker(configured);
    }
}
