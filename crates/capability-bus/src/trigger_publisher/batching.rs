//! Batching of identical trigger events.
//!
//! When several workflows from the same caller DON receive a byte-identical
//! event, the publisher sends it once with all their workflow IDs attached.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use shared_types::DonId;

pub(crate) type BatchKey = [u8; 32];

/// Identity of an event delivery: caller DON, event ID and encoded response.
///
/// The event ID is length-prefixed so no split of ID and response bytes
/// collides with another.
pub(crate) fn batch_key(
    caller_don_id: DonId,
    trigger_event_id: &str,
    raw_response: &[u8],
) -> BatchKey {
    let mut hasher = Sha256::new();
    hasher.update(caller_don_id.to_le_bytes());
    hasher.update((trigger_event_id.len() as u64).to_le_bytes());
    hasher.update(trigger_event_id.as_bytes());
    hasher.update(raw_response);
    hasher.finalize().into()
}

/// One encoded event and the workflows it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchedResponse {
    pub raw_response: Vec<u8>,
    pub trigger_event_id: String,
    pub caller_don_id: DonId,
    pub workflow_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct BatchQueue {
    entries: HashMap<BatchKey, BatchedResponse>,
}

impl BatchQueue {
    /// Add `workflow_id` to the batch for this event, creating it if needed.
    pub fn enqueue(
        &mut self,
        caller_don_id: DonId,
        trigger_event_id: &str,
        workflow_id: String,
        raw_response: Vec<u8>,
    ) {
        let key = batch_key(caller_don_id, trigger_event_id, &raw_response);
        self.entries
            .entry(key)
            .or_insert_with(|| BatchedResponse {
                raw_response,
                trigger_event_id: trigger_event_id.to_string(),
                caller_don_id,
                workflow_ids: Vec::new(),
            })
            .workflow_ids
            .push(workflow_id);
    }

    /// Swap out everything queued so far.
    pub fn take(&mut self) -> Vec<BatchedResponse> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Workflow deliveries waiting across all batches.
    #[cfg(test)]
    pub fn pending_workflows(&self) -> usize {
        self.entries.values().map(|b| b.workflow_ids.len()).sum()
    }
}
