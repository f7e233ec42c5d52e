//! Retry timing for the timeout-and-backoff strategy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::config::duration_ms;

/// Timing of the timeout-and-backoff strategy.
///
/// Each resource is waited for at most `per_resource_timeout`. After a
/// failed attempt the request sleeps for an exponentially growing delay,
/// capped at `max_backoff`, with a random jitter in `[delay / 2, delay]` so
/// that competing requesters fall out of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "duration_ms", rename = "per_resource_timeout_ms")]
    pub per_resource_timeout: Duration,
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            per_resource_timeout: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        rng: &mut R,
    ) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let nanos = base.as_nanos() as u64;
        Duration::from_nanos(rng.random_range(nanos / 2..=nanos))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.per_resource_timeout.is_zero() {
            return Err("per_resource_timeout must be non-zero".to_string());
        }
        if self.initial_backoff.is_zero() {
            return Err("initial_backoff must be non-zero".to_string());
        }
        if self.max_backoff < self.initial_backoff {
            return Err("max_backoff must be at least initial_backoff".to_string());
        }
        Ok(())
    }
}
