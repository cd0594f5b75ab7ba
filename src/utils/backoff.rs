//! Exponential backoff with jitter
//!
//! Shared by the RPC retry loop, the receipt poller and the job state
//! machine: `base * 2^attempt`, capped, with +/- jitter so many jobs that
//! failed together do not retry together.

use rand::Rng;
use std::time::Duration;

/// Jitter percentage applied to every delay
pub const RETRY_JITTER_PERCENT: u64 = 20;

/// Floor for any computed delay
const MIN_DELAY_MS: u64 = 10;

/// Backoff schedule
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_percent: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_percent: RETRY_JITTER_PERCENT,
        }
    }

    /// Deterministic schedule (tests, polling loops that must be predictable)
    pub fn without_jitter(mut self) -> Self {
        self.jitter_percent = 0;
        self
    }

    /// Capped delay before retry number `attempt` (0-based), without jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt.min(30)).unwrap_or(u64::MAX);
        let delay = base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max.as_millis() as u64))
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.ceiling(attempt).as_millis() as u64;
        if self.jitter_percent == 0 || capped == 0 {
            return Duration::from_millis(capped);
        }

        let jitter_range = (capped * self.jitter_percent) / 100;
        let jitter: i64 =
            rand::thread_rng().gen_range(-(jitter_range as i64)..=(jitter_range as i64));
        let final_delay = (capped as i64 + jitter).max(MIN_DELAY_MS as i64) as u64;
        Duration::from_millis(final_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(64));
        for _ in 0..50 {
            let d = backoff.delay(2).as_millis() as u64;
            assert!((3200..=4800).contains(&d), "delay {} out of range", d);
        }
    }
}
