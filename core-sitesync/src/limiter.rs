//! Per-site request pacing.
//!
//! Cloud backends advertise an operations-per-second budget in their
//! capability descriptor; workers acquire a slot here before every transfer
//! so the engine honors it regardless of how many workers target the site.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Simple interval rate limiter.
///
/// Hands out start times spaced `1/per_second` apart; each acquirer sleeps
/// until its slot. Waiting happens outside any ledger lock.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / per_second as f64),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait until the next slot is available.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
