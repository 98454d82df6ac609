//! Exponential backoff with jitter for reconnects and snapshot retries

use std::time::Duration;

use rand::Rng;

/// Backoff bounds
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.3 = ±30%)
    pub jitter: f64,
    /// Retries allowed before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 10,
        }
    }
}

/// Retry counter for one backoff sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failure and return the wait before the next attempt
    ///
    /// Returns `None` once `max_attempts` retries have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        Some(self.apply_jitter(base))
    }

    /// Delay for a given retry index without jitter
    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.policy.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let secs = self.policy.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.policy.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}
