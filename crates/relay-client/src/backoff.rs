//! Reconnect delay schedule.
//!
//! `delay(n) = min(initial * 2^n, max) + jitter`, with jitter drawn uniformly
//! from `[0, max_jitter)`. `n` is the number of reconnects already attempted
//! since the last successful open.

use std::time::Duration;

use rand::Rng;

use crate::config::StreamClientConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            initial,
            max,
            max_jitter,
        }
    }

    /// Exponential delay without jitter. Saturates instead of overflowing.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let initial_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor)).min(self.max)
    }

    /// Delay before the next reconnect, jitter included.
    pub fn delay(&self, attempts: u32) -> Duration {
        self.base_delay(attempts) + random_jitter(self.max_jitter)
    }
}

impl From<&StreamClientConfig> for Backoff {
    fn from(config: &StreamClientConfig) -> Self {
        Self::new(
            config.initial_reconnect_delay,
            config.max_reconnect_delay,
            config.max_jitter,
        )
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
