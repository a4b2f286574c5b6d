//! # Rate Limiter
//!
//! GCRA rate limiting for inbound peer traffic, backed by `governor`.
//!
//! ## Security
//!
//! Rate limiting prevents:
//! - A single peer flooding the node's receive loop
//! - Aggregate overload from many peers at once
//!
//! [`RateLimiter`] combines one global limiter with one limiter per sender; a
//! message is admitted only if both have capacity. Idle sender entries are
//! dropped by [`RateLimiter::cleanup`], which the owner drives periodically.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::entities::PeerId;
use crate::errors::InputError;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Limits for [`RateLimiter`].
///
/// Rates may be fractional (`0.5` admits one message every two seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub global_rps: f64,
    pub global_burst: u32,
    pub per_sender_rps: f64,
    pub per_sender_burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_rps: 800.0,
            global_burst: 1000,
            per_sender_rps: 100.0,
            per_sender_burst: 100,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), InputError> {
        self.global_quota()?;
        self.per_sender_quota()?;
        Ok(())
    }

    fn global_quota(&self) -> Result<Quota, InputError> {
        quota("global", self.global_rps, self.global_burst)
    }

    fn per_sender_quota(&self) -> Result<Quota, InputError> {
        quota("per-sender", self.per_sender_rps, self.per_sender_burst)
    }
}

/// Build a quota replenishing one cell every `1 / rps` seconds.
fn quota(scope: &str, rps: f64, burst: u32) -> Result<Quota, InputError> {
    if !(rps.is_finite() && rps > 0.0) {
        return Err(InputError::InvalidRateLimit(format!(
            "{scope} RPS must be positive"
        )));
    }
    let burst = NonZeroU32::new(burst).ok_or_else(|| {
        InputError::InvalidRateLimit(format!("{scope} burst size must be positive"))
    })?;
    let period = Duration::try_from_secs_f64(1.0 / rps)
        .map_err(|_| InputError::InvalidRateLimit(format!("{scope} RPS {rps} is too small")))?;
    let quota = Quota::with_period(period)
        .ok_or_else(|| InputError::InvalidRateLimit(format!("{scope} RPS {rps} is too large")))?;
    Ok(quota.allow_burst(burst))
}

/// Limiter entry for one sender.
struct SenderBucket {
    limiter: DirectLimiter,
    /// Last access time (for cleanup)
    last_access: Instant,
}

/// Global plus per-sender rate limiter.
pub struct RateLimiter<S = PeerId> {
    config: RateLimiterConfig,
    per_sender_quota: Quota,
    global: DirectLimiter,
    senders: Mutex<HashMap<S, SenderBucket>>,
}

impl<S: Eq + Hash + Clone> RateLimiter<S> {
    pub fn new(config: RateLimiterConfig) -> Result<Self, InputError> {
        let global = governor::RateLimiter::direct(config.global_quota()?);
        let per_sender_quota = config.per_sender_quota()?;
        Ok(Self {
            config,
            per_sender_quota,
            global,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Admit one message from `sender`.
    ///
    /// The sender's limiter is charged first; a sender over its own limit
    /// does not consume global capacity.
    pub fn allow(&self, sender: &S) -> bool {
        let sender_allowed = {
            let mut senders = self.senders.lock();
            let bucket = senders
                .entry(sender.clone())
                .or_insert_with(|| SenderBucket {
                    limiter: governor::RateLimiter::direct(self.per_sender_quota),
                    last_access: Instant::now(),
                });
            bucket.last_access = Instant::now();
            bucket.limiter.check().is_ok()
        };
        sender_allowed && self.global.check().is_ok()
    }

    /// Drop sender entries not seen within `max_age`.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|_, bucket| bucket.last_access.elapsed() < max_age);
        before - senders.len()
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Number of senders with a limiter entry.
    pub fn tracked_senders(&self) -> usize {
        self.senders.lock().len()
    }
}
