use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter
///
/// Delays within one failure streak never decrease and never exceed `max`.
/// A retry hint from the homeserver raises the delay but is still capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next retry
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(20));
        let jitter_ms = (exp.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };

        let mut delay = exp.saturating_add(jitter).min(self.max);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(self.max));
        }
        delay = delay.max(self.last);

        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Ends the failure streak
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
