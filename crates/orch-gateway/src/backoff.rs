//! Exponential reconnect backoff with jitter.
//!
//! Doubles the delay on every failed attempt up to `max_delay`, resetting to
//! `initial_delay` after a successful reconnect.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// Delay to wait before the next reconnect attempt, with up to 20%
    /// jitter added so many clients reconnecting at once don't synchronize.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self
            .initial_delay
            .as_millis()
            .saturating_mul(1u128 << self.attempt.min(20))
            .min(self.max_delay.as_millis());
        self.attempt += 1;

        let jitter_ms = rand::rng().random_range(0..=(base_ms / 5).max(1));
        Duration::from_millis((base_ms + jitter_ms) as u64)
    }

    /// Reset after a successful authenticate.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d <= Duration::from_millis(30_000 + 30_000 / 5));
            last = d;
        }
        assert!(last >= Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut b = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(30));
        b.next_delay();
        b.next_delay();
        assert!(b.attempt() > 0);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }
}
