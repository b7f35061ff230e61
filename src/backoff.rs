//! Bounded exponential backoff for SSH connect retries.
//!
//! Default configuration: 250ms base, 4s cap, giving the sequence
//! 250ms, 500ms, 1s, 2s, 4s, 4s... until the attempt budget runs out.

use std::time::Duration;

/// Retry schedule for connection attempts.
///
/// # Example
///
/// ```
/// use sshharness::backoff::Backoff;
/// use std::time::Duration;
///
/// // Three attempts in total: the first is free, two retries follow.
/// let mut backoff = Backoff::new(3);
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
/// assert_eq!(backoff.next_delay(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retries handed out so far
    retries: u32,
    /// Total attempts allowed, including the first one
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    const DEFAULT_BASE: Duration = Duration::from_millis(250);
    const DEFAULT_MAX: Duration = Duration::from_secs(4);

    /// Backoff allowing `max_attempts` connection attempts in total.
    ///
    /// A budget of zero is treated as one: the first attempt always happens.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_config(max_attempts, Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }

    pub fn with_config(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            retries: 0,
            max_attempts: max_attempts.max(1),
            base,
            max,
        }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_made() >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.retries);
        self.retries = self.retries.saturating_add(1);
        Some(delay)
    }

    /// Attempts made so far, counting the initial one.
    pub fn attempts_made(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        // min(base * 2^retry, max), saturating
        let multiplier = 2u64.saturating_pow(retry);
        let base_ms = self.base.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(multiplier)
            .min(self.max.as_millis() as u64);
        Duration::from_millis(capped)
    }
}
