//! Domain layer: pure quorum bookkeeping, no I/O.

pub mod aggregation;
pub mod message_cache;

pub use aggregation::{aggregate_mode_raw, Aggregator, ModeAggregator};
pub use message_cache::MessageCache;
