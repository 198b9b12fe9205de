//! Wall-clock source in unix seconds
//!
//! Rate windows, backoff ages, and distributed-state timestamps are all
//! expressed in unix seconds so they compare across processes. Components
//! take an `Arc<dyn Clock>` so tests can drive time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Reads `SystemTime::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock
///
/// Stores the f64 bit pattern in an atomic so it can be shared across tasks.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, secs: f64) {
        let now = self.now();
        self.set(now + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800.0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(2.5);
        assert_eq!(clock.now(), 102.5);

        clock.set(0.0);
        assert_eq!(clock.now(), 0.0);
    }
}
