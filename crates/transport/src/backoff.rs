//! Reconnect backoff
//!
//! Base sequence 0.5, 1, 2, 4, 8 s (capped), jittered by +/- 25 %. After the
//! configured number of consecutive failures the caller gives up and raises
//! `TransportFailed`.

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 500;
const CAP_MS: u64 = 8_000;
const JITTER: f64 = 0.25;

/// Exponential backoff with jitter and a failure budget.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    /// Consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the failure budget is exhausted.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record a failure and return the next delay, or None when exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }

        let base = (BASE_MS << self.attempt.min(16)).min(CAP_MS);
        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        let ms = (base as f64 * (1.0 + jitter)).max(0.0) as u64;
        Some(Duration::from_millis(ms))
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_doubles_and_caps() {
        let mut backoff = Backoff::new(10);
        let expected_base = [500u64, 1000, 2000, 4000, 8000, 8000];

        for base in expected_base {
            let delay = backoff.next_delay().unwrap().as_millis() as u64;
            let low = (base as f64 * 0.75) as u64;
            let high = (base as f64 * 1.25) as u64;
            assert!(
                (low..=high).contains(&delay),
                "delay {delay} outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut backoff = Backoff::new(5);
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(backoff.exhausted());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(5);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(!backoff.exhausted());
        assert_eq!(backoff.attempt(), 0);
    }
}
