//! Reconnect delay policy for the duplex channel.
//!
//! Exponential growth from a base delay, capped, with symmetric jitter.
//! [`Backoff`] walks one reconnect cycle and keeps the emitted delays
//! non-decreasing even when jitter would pull a capped delay below the
//! previous one.

use std::time::Duration;

use rand::Rng;

use rolecall_core::config::ReconnectConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the nominal delay, applied as ±jitter.
    pub jitter: f64,
    pub max_attempts: u32,
    /// Uptime after which a connection counts as stable and resets the
    /// cycle. A frame from the server counts as well.
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
            stable_after: Duration::from_millis(config.stable_after_ms),
        }
    }

    /// Delay before reconnect `attempt` (1-based) without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exp);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Nominal delay scaled by `1 + sample`, where `sample` is drawn from
    /// `[-jitter, jitter]`. Never exceeds the cap.
    pub fn jittered_delay(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let sample = sample.clamp(-self.jitter, self.jitter);
        nominal.mul_f64(1.0 + sample).min(self.cap)
    }

    fn sample(&self) -> f64 {
        if self.jitter <= 0.0 {
            return 0.0;
        }
        rand::rng().random_range(-self.jitter..=self.jitter)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
            last: Duration::ZERO,
        }
    }
}

/// One reconnect cycle. Reset it once a connection has proven stable.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Attempts scheduled so far in this cycle.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Schedule the next attempt. `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        let sample = self.policy.sample();
        let delay = self
            .policy
            .jittered_delay(self.attempt, sample)
            .max(self.last);
        self.last = delay;
        Some((self.attempt, delay))
    }
}
