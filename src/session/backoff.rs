//! Reconnect backoff policy.
//!
//! Pure state machine, no I/O: the session task asks for the next delay,
//! reports failures, and reports how long the last connection survived.
//! Delay for failure `n` is `min(base * 2^(n-1), max)` plus a uniform
//! random jitter in `[0, delay * jitter_fraction)`. A connection held past
//! the stability window resets the sequence.

use crate::config::ReconnectSection;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffController {
    base: Duration,
    max: Duration,
    jitter_fraction: f64,
    stability_window: Duration,
    failures: u32,
}

impl BackoffController {
    pub fn new(
        base: Duration,
        max: Duration,
        jitter_fraction: f64,
        stability_window: Duration,
    ) -> Self {
        Self {
            base,
            max,
            jitter_fraction,
            stability_window,
            failures: 0,
        }
    }

    pub fn from_config(config: &ReconnectSection) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_fraction,
            Duration::from_secs(config.stability_window_secs),
        )
    }

    /// Count one failed connection attempt.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Restart the sequence from the base delay.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset if the last connection survived past the stability window.
    pub fn observe_uptime(&mut self, uptime: Duration) {
        if uptime >= self.stability_window {
            self.reset();
        }
    }

    pub fn stability_window(&self) -> Duration {
        self.stability_window
    }

    /// Delay before the next attempt, with jitter applied.
    pub fn next_delay(&self) -> Duration {
        let delay = Self::delay_for(self.base, self.max, self.failures);
        self.apply_jitter(delay)
    }

    /// Pre-jitter delay for a given consecutive failure count.
    fn delay_for(base: Duration, max: Duration, failures: u32) -> Duration {
        if failures <= 1 {
            return base.min(max);
        }
        let exponent = (failures - 1).min(31);
        let millis = (base.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(max)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let span = (delay.as_millis() as f64 * self.jitter_fraction) as u64;
        if span == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..span);
        delay + Duration::from_millis(jitter)
    }
}
