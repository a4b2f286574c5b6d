//! # Message Cache
//!
//! Collects payloads for an event key from distinct senders until a quorum
//! of fresh ones is reached.
//!
//! ## Rules
//!
//! - A sender holds at most one payload per key; a later insert overwrites it.
//! - A key is ready when at least `min_count` senders have a payload with
//!   `timestamp >= min_timestamp`. Only those fresh payloads are returned.
//! - With `once`, a key reports ready a single time; later calls return
//!   `None` until the key is deleted or re-armed with `reset_ready`.
//!
//! The cache is not synchronized. Owners keep it behind their own lock.

use std::collections::HashMap;
use std::hash::Hash;

use crate::ports::outbound::Timestamp;

#[derive(Debug)]
struct PeerMessage {
    timestamp: Timestamp,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct EventEntry<S> {
    peer_msgs: HashMap<S, PeerMessage>,
    created_at: Timestamp,
    was_ready: bool,
}

/// Quorum cache keyed by event `K` with sender identity `S`.
#[derive(Debug)]
pub struct MessageCache<K, S> {
    events: HashMap<K, EventEntry<S>>,
}

impl<K, S> Default for MessageCache<K, S> {
    fn default() -> Self {
        Self {
            events: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, S: Eq + Hash> MessageCache<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` from `sender` under `key`, replacing any earlier
    /// payload from that sender. Returns the key's creation timestamp.
    pub fn insert(
        &mut self,
        key: K,
        sender: S,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Timestamp {
        let entry = self.events.entry(key).or_insert_with(|| EventEntry {
            peer_msgs: HashMap::new(),
            created_at: timestamp,
            was_ready: false,
        });
        entry
            .peer_msgs
            .insert(sender, PeerMessage { timestamp, payload });
        entry.created_at
    }

    /// Fresh payloads for `key` if at least `min_count` senders sent one at
    /// or after `min_timestamp`.
    pub fn ready(
        &mut self,
        key: &K,
        min_count: usize,
        min_timestamp: Timestamp,
        once: bool,
    ) -> Option<Vec<Vec<u8>>> {
        let entry = self.events.get_mut(key)?;
        if once && entry.was_ready {
            return None;
        }
        if entry.peer_msgs.len() < min_count {
            return None;
        }
        let fresh: Vec<Vec<u8>> = entry
            .peer_msgs
            .values()
            .filter(|msg| msg.timestamp >= min_timestamp)
            .map(|msg| msg.payload.clone())
            .collect();
        if fresh.len() < min_count {
            return None;
        }
        entry.was_ready = true;
        Some(fresh)
    }

    /// Let a `once` key report ready again, e.g. after its payloads failed
    /// to aggregate. Returns whether the key exists.
    pub fn reset_ready(&mut self, key: &K) -> bool {
        match self.events.get_mut(key) {
            Some(entry) => {
                entry.was_ready = false;
                true
            }
            None => false,
        }
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&mut self, key: &K) -> bool {
        self.events.remove(key).is_some()
    }

    /// Remove every key created before `cutoff`. Returns how many were removed.
    pub fn delete_older_than(&mut self, cutoff: Timestamp) -> usize {
        let before = self.events.len();
        self.events.retain(|_, entry| entry.created_at >= cutoff);
        before - self.events.len()
    }

    /// Remove every key whose newest payload predates `cutoff`, skipping
    /// keys for which `keep` returns true. Returns how many were removed.
    pub fn delete_stale(&mut self, cutoff: Timestamp, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.events.len();
        self.events.retain(|key, entry| {
            keep(key) || entry.peer_msgs.values().any(|msg| msg.timestamp >= cutoff)
        });
        before - self.events.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.events.contains_key(key)
    }

    /// Number of senders with a payload under `key`.
    pub fn sender_count(&self, key: &K) -> usize {
        self.events.get(key).map_or(0, |e| e.peer_msgs.len())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
