//! Retry backoff policy.
//!
//! The curve is configurable rather than fixed: exponential doubling from a
//! base interval, capped, with a small random jitter so many pairs failing at
//! once do not retry in lockstep. Eligibility is stored on the ledger row
//! (`next_eligible_at`), so the scan loop alone decides retries and no hidden
//! timers exist.

use serde::{Deserialize, Serialize};

/// Backoff and attempt-ceiling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds.
    pub base_ms: u64,
    /// Upper bound for the exponential curve, in milliseconds.
    pub cap_ms: u64,
    /// Maximum random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
    /// Attempts before the pair is parked for manual intervention.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 5_000,
            cap_ms: 300_000,
            jitter_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Zero-jitter policy for deterministic tests.
    pub fn fixed(base_ms: u64, cap_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            cap_ms,
            jitter_ms: 0,
            max_attempts,
        }
    }

    /// Delay before the next attempt, given how many attempts have failed so
    /// far (`retry_count` >= 1). A vendor retry-after hint overrides the
    /// curve when it is longer.
    pub fn delay_ms(&self, retry_count: u32, retry_after_hint_secs: Option<u64>) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(32);
        let exponential = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms);
        let delay = exponential + jitter(self.jitter_ms);
        match retry_after_hint_secs {
            Some(hint_secs) => delay.max(hint_secs.saturating_mul(1_000)),
            None => delay,
        }
    }

    /// Whether the attempt ceiling has been reached.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

/// Uniform jitter in `[0, max_ms)`. Falls back to zero if the OS entropy
/// source is unavailable.
fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0;
    }
    u64::from_le_bytes(buf) % max_ms
}
