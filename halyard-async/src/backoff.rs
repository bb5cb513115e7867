// Copyright © 2026 The Halyard Contributors
//
// This file is part of halyard, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::time::Duration;

/// Jittered exponential backoff for retrying transiently-failed work.
///
/// Delays double per attempt from `base` up to `max`, each drawn uniformly
/// from `[delay/2, delay]` so simultaneous retries fan out.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        use rand::Rng as _;

        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let millis = exp.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis.max(1)))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from `base`, eg. after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_capped() {
        let mut bo = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        for _ in 0..16 {
            assert!(bo.next_delay() <= Duration::from_secs(2));
        }
        assert_eq!(bo.attempts(), 16);
    }

    #[test]
    fn reset_starts_over() {
        let mut bo = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        bo.next_delay();
        bo.next_delay();
        bo.reset();
        assert_eq!(bo.attempts(), 0);
        assert!(bo.next_delay() <= Duration::from_millis(100));
    }
}
