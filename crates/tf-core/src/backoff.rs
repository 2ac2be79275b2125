//! Exponential backoff with jitter.
//!
//! Used wherever a loop retries an operation without an attempt cap: the
//! shard worker's fetch loop, the WebSocket reconnect loop, and consumer
//! redelivery. Each delay is `initial * multiplier^attempt`, capped at `max`,
//! then spread by `±jitter` so that many shards failing together do not
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Backoff parameters, deserializable from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffPolicy {
    /// First delay in milliseconds (default: 100).
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Delay cap in milliseconds (default: 30_000).
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Growth factor per attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Relative jitter, e.g. 0.2 = ±20% (default: 0.2).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_ms() -> u64 {
    100
}
fn default_max_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            multiplier,
            jitter,
        }
    }
}

/// Stateful delay calculator for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt. Never exceeds `max_ms`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_ms();
        let jittered = apply_jitter(base, self.policy.jitter);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered.min(self.policy.max_ms))
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_ms(&self) -> u64 {
        let exp = self.attempt.min(i32::MAX as u32) as i32;
        let raw = self.policy.initial_ms as f64 * self.policy.multiplier.powi(exp);
        if !raw.is_finite() || raw >= self.policy.max_ms as f64 {
            self.policy.max_ms
        } else {
            raw as u64
        }
    }
}

fn apply_jitter(base_ms: u64, jitter: f64) -> u64 {
    if jitter <= 0.0 || base_ms == 0 {
        return base_ms;
    }
    let spread = base_ms as f64 * jitter;
    let low = (base_ms as f64 - spread).max(0.0);
    let high = base_ms as f64 + spread;
    rand::rng().random_range(low..=high) as u64
}
