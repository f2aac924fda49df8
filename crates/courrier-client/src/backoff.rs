//! Reconnect backoff schedule.
//!
//! Exponential growth from a base delay up to a cap, with full jitter so a
//! fleet of clients dropped by the same outage does not reconnect in
//! lockstep.

use std::time::Duration;

use rand::Rng;

use courrier_shared::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The un-jittered ceiling for the next delay.
    pub fn current_bound(&self) -> Duration {
        let millis = self
            .base
            .as_millis()
            .saturating_mul(1u128 << self.attempt.min(32))
            .min(self.cap.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Next delay to sleep before a reconnect attempt: a uniform draw from
    /// the current bound, which then doubles (until the cap).
    pub fn next_delay(&mut self) -> Duration {
        let bound = self.current_bound();
        self.attempt = self.attempt.saturating_add(1);

        let millis = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Back to the base schedule, called after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BACKOFF_BASE_MS),
            Duration::from_millis(BACKOFF_CAP_MS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let mut bounds = Vec::new();
        for _ in 0..8 {
            bounds.push(backoff.current_bound().as_secs());
            backoff.next_delay();
        }
        assert_eq!(bounds, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_delay_never_exceeds_bound() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..50 {
            let bound = backoff.current_bound();
            assert!(backoff.next_delay() <= bound);
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current_bound(), Duration::from_secs(1));
    }
}
