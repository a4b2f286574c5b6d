//! Mode aggregation over byte-identical payloads.

use std::collections::HashMap;

use shared_types::TriggerResponse;

use crate::errors::AggregationError;

/// Turns the quorum of payloads for one trigger event into a single response.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        trigger_event_id: &str,
        payloads: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError>;
}

/// The most frequent payload, if it occurs at least `min_identical` times.
///
/// Ties on frequency go to the lexicographically smallest payload so every
/// node picks the same winner regardless of arrival order.
pub fn aggregate_mode_raw(
    payloads: &[Vec<u8>],
    min_identical: usize,
) -> Result<Vec<u8>, AggregationError> {
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for payload in payloads {
        *counts.entry(payload.as_slice()).or_default() += 1;
    }

    let best = counts
        .into_iter()
        .max_by(|(a_bytes, a_count), (b_bytes, b_count)| {
            a_count.cmp(b_count).then_with(|| b_bytes.cmp(a_bytes))
        });

    match best {
        Some((bytes, count)) if count >= min_identical => Ok(bytes.to_vec()),
        Some((_, count)) => Err(AggregationError::NotEnoughIdentical {
            required: min_identical,
            found: count,
        }),
        None => Err(AggregationError::NotEnoughIdentical {
            required: min_identical,
            found: 0,
        }),
    }
}

/// Picks the mode payload and decodes it as a [`TriggerResponse`].
#[derive(Debug, Clone, Copy)]
pub struct ModeAggregator {
    min_identical: usize,
}

impl ModeAggregator {
    pub fn new(min_identical: usize) -> Self {
        Self { min_identical }
    }
}

impl Aggregator for ModeAggregator {
    fn aggregate(
        &self,
        _trigger_event_id: &str,
        payloads: &[Vec<u8>],
    ) -> Result<TriggerResponse, AggregationError> {
        let winner = aggregate_mode_raw(payloads, self.min_identical)?;
        Ok(TriggerResponse::decode(&winner)?)
    }
}
