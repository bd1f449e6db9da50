//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay policy between retry attempts: `min(unit * base^attempt, cap)` plus
/// a uniformly random jitter in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: f64,
    pub unit: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: 2.0,
            unit: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Backoff without randomness, handy for deterministic callers.
    pub fn fixed(base: f64, unit: Duration, cap: Duration) -> Self {
        Self {
            base,
            unit,
            cap,
            jitter: Duration::ZERO,
        }
    }

    /// The capped exponential part of the delay for `attempt` (0-based).
    pub fn capped(&self, attempt: u32) -> Duration {
        let factor = self.base.max(1.0).powi(attempt.min(63) as i32);
        let raw = self.unit.as_secs_f64() * factor;
        if !raw.is_finite() || raw >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// Full delay for `attempt`, including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.capped(attempt) + jitter
    }

    /// Upper bound on the total delay spent across `attempts` retries.
    pub fn max_total(&self, attempts: u32) -> Duration {
        (0..attempts)
            .map(|i| self.capped(i) + self.jitter)
            .sum()
    }
}

/// `2^attempt` seconds, capped at a minute. Used by the extraction and
/// delivery clients, which count attempts from 1.
pub fn collaborator_backoff() -> Backoff {
    Backoff::fixed(2.0, Duration::from_secs(1), Duration::from_secs(60))
}
