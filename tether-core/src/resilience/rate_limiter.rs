//! Outbound REST throttle driven by 429 responses
//!
//! A separate, simpler policy than `BackoffManager`. The limiter starts with
//! zero delay and only slows down once the server says so:
//!
//! ```text
//! 429 with Retry-After  → delay = Retry-After (verbatim)
//! 429, first hit        → delay = initial_backoff_ms
//! 429, later hits       → delay = min(max_backoff_ms, max(delay, initial_backoff_ms) * backoff_multiplier)
//! success               → delay = 0
//! other error           → counted only
//! ```
//!
//! A hinted 429 still counts as a hit: after `Retry-After: 0` the next
//! unhinted 429 grows past `initial_backoff_ms` instead of restarting there.
//!
//! ## Usage
//!
//! ```
//! use tether_core::resilience::rate_limiter::RateLimiter;
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new_default();
//! limiter.record_rate_limit(Some(Duration::from_secs_f64(3.5)));
//! assert_eq!(limiter.current_delay_ms(), 3500.0);
//!
//! limiter.record_success();
//! assert_eq!(limiter.current_delay_ms(), 0.0);
//! ```

use crate::core::errors::{TetherError, TetherResult};
use crate::monitoring::metrics::MetricsRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rate limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Delay adopted on the first 429 without a server hint
    pub initial_backoff_ms: f64,
    /// Upper bound for the exponential schedule
    pub max_backoff_ms: f64,
    /// Growth factor per subsequent 429
    pub backoff_multiplier: f64,
}

impl RateLimiterConfig {
    /// Slow growth, long ceiling
    pub fn conservative() -> Self {
        Self {
            initial_backoff_ms: 2_000.0,
            max_backoff_ms: 120_000.0,
            backoff_multiplier: 2.0,
        }
    }

    pub fn standard() -> Self {
        Self {
            initial_backoff_ms: 1_000.0,
            max_backoff_ms: 60_000.0,
            backoff_multiplier: 2.0,
        }
    }

    /// For tests
    pub fn aggressive() -> Self {
        Self {
            initial_backoff_ms: 10.0,
            max_backoff_ms: 1_000.0,
            backoff_multiplier: 1.5,
        }
    }

    pub fn validate(&self) -> TetherResult<()> {
        if !(self.initial_backoff_ms > 0.0) {
            return Err(TetherError::validation(
                "rate limiter initial_backoff_ms must be positive",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(TetherError::validation(
                "rate limiter max_backoff_ms cannot be smaller than initial_backoff_ms",
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(TetherError::validation(
                "rate limiter backoff_multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Default)]
struct DelayState {
    current_delay_ms: f64,
    is_backing_off: bool,
}

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub current_delay_ms: f64,
    pub is_backing_off: bool,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub total_errors: u64,
}

/// 429-driven delay policy for outbound calls
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    name: Arc<str>,
    state: Arc<Mutex<DelayState>>,
    total_requests: Arc<AtomicU64>,
    rate_limit_hits: Arc<AtomicU64>,
    total_errors: Arc<AtomicU64>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            name: Arc::from("default"),
            state: Arc::new(Mutex::new(DelayState::default())),
            total_requests: Arc::new(AtomicU64::new(0)),
            rate_limit_hits: Arc::new(AtomicU64::new(0)),
            total_errors: Arc::new(AtomicU64::new(0)),
            metrics: None,
        }
    }

    pub fn new_default() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Label hits in the `rest_rate_limit_hits_total` counter under `name`
    pub fn with_metrics(mut self, name: &str, metrics: Arc<MetricsRegistry>) -> Self {
        self.name = Arc::from(name);
        self.metrics = Some(metrics);
        self
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a 429; returns the delay now in force (ms)
    pub fn record_rate_limit(&self, retry_after: Option<Duration>) -> f64 {
        let hits = self.rate_limit_hits.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(metrics) = &self.metrics {
            metrics
                .connection()
                .rest_rate_limit_hits
                .with_label_values(&[&self.name])
                .inc();
        }

        let mut state = self.state.lock();
        state.current_delay_ms = match retry_after {
            Some(hint) => hint.as_secs_f64() * 1000.0,
            None if !state.is_backing_off => self.config.initial_backoff_ms,
            None => (state.current_delay_ms.max(self.config.initial_backoff_ms)
                * self.config.backoff_multiplier)
                .min(self.config.max_backoff_ms),
        };
        state.is_backing_off = true;

        warn!(
            limiter = %self.name,
            hits,
            server_hint = retry_after.is_some(),
            "Rate limited, delaying next request by {:.0}ms",
            state.current_delay_ms
        );

        state.current_delay_ms
    }

    /// Clear any backoff
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.is_backing_off {
            info!(limiter = %self.name, "Rate limit backoff cleared");
        }
        state.current_delay_ms = 0.0;
        state.is_backing_off = false;
    }

    /// Count a non-429 failure; the delay is left alone
    pub fn record_error(&self) {
        let errors = self.total_errors.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(limiter = %self.name, errors, "Request error recorded");
    }

    pub fn current_delay_ms(&self) -> f64 {
        self.state.lock().current_delay_ms
    }

    pub fn current_delay(&self) -> Duration {
        let secs = self.current_delay_ms() / 1000.0;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn is_backing_off(&self) -> bool {
        self.state.lock().is_backing_off
    }

    /// Await the current delay, if any; returns the delay applied
    pub async fn wait_if_needed(&self) -> Duration {
        let delay = self.current_delay();
        if !delay.is_zero() {
            debug!(limiter = %self.name, "Waiting {:?} before request", delay);
            tokio::time::sleep(delay).await;
        }
        delay
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            current_delay_ms: state.current_delay_ms,
            is_backing_off: state.is_backing_off,
            total_requests: self.total_requests.load(Ordering::Acquire),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Acquire),
            total_errors: self.total_errors.load(Ordering::Acquire),
        }
    }

    /// Reset counters (not the delay)
    pub fn reset_stats(&self) {
        self.total_requests.store(0, Ordering::Release);
        self.rate_limit_hits.store(0, Ordering::Release);
        self.total_errors.store(0, Ordering::Release);
    }
}

/// Parse a `Retry-After` header given in (possibly fractional) seconds
///
/// HTTP-date values and negative numbers are rejected.
pub fn parse_retry_after(header: &str) -> Option<Duration> {
    let secs: f64 = header.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            initial_backoff_ms: 100.0,
            max_backoff_ms: 1_000.0,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_starts_without_delay() {
        let limiter = limiter();
        assert_eq!(limiter.current_delay_ms(), 0.0);
        assert!(!limiter.is_backing_off());
    }

    #[test]
    fn test_exponential_schedule_without_hint() {
        let limiter = limiter();
        assert_eq!(limiter.record_rate_limit(None), 100.0);
        assert_eq!(limiter.record_rate_limit(None), 200.0);
        assert_eq!(limiter.record_rate_limit(None), 400.0);
        assert_eq!(limiter.record_rate_limit(None), 800.0);
        assert_eq!(limiter.record_rate_limit(None), 1_000.0);
        assert_eq!(limiter.record_rate_limit(None), 1_000.0);
        assert!(limiter.is_backing_off());
    }

    #[test]
    fn test_retry_after_overrides_schedule() {
        let limiter = limiter();
        limiter.record_rate_limit(None);
        limiter.record_rate_limit(Some(Duration::from_secs_f64(3.5)));
        assert_eq!(limiter.current_delay_ms(), 3500.0);
    }

    #[test]
    fn test_zero_retry_after_keeps_schedule_growing() {
        let limiter = limiter();
        assert_eq!(limiter.record_rate_limit(Some(Duration::ZERO)), 0.0);
        assert!(limiter.is_backing_off());
        assert_eq!(limiter.current_delay(), Duration::ZERO);

        // Second hit, so past the initial step
        assert_eq!(limiter.record_rate_limit(None), 200.0);
        assert_eq!(limiter.record_rate_limit(None), 400.0);
    }

    #[test]
    fn test_success_zeroes_delay() {
        let limiter = limiter();
        limiter.record_rate_limit(None);
        limiter.record_rate_limit(None);
        limiter.record_success();
        assert_eq!(limiter.current_delay_ms(), 0.0);
        assert!(!limiter.is_backing_off());

        // Schedule restarts from the initial value
        assert_eq!(limiter.record_rate_limit(None), 100.0);
    }

    #[test]
    fn test_errors_do_not_change_delay() {
        let limiter = limiter();
        limiter.record_rate_limit(None);
        limiter.record_error();
        limiter.record_error();

        let stats = limiter.stats();
        assert_eq!(stats.current_delay_ms, 100.0);
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.rate_limit_hits, 1);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3.5"), Some(Duration::from_millis(3500)));
        assert_eq!(parse_retry_after(" 2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_concurrent_access() {
        let limiter = RateLimiter::new_default();
        let limiter_clone1 = limiter.clone();
        let limiter_clone2 = limiter.clone();

        let handle1 = thread::spawn(move || {
            for _ in 0..50 {
                limiter_clone1.record_request();
            }
        });

        let handle2 = thread::spawn(move || {
            for _ in 0..50 {
                limiter_clone2.record_request();
            }
        });

        handle1.join().unwrap();
        handle2.join().unwrap();

        assert_eq!(limiter.stats().total_requests, 100);
    }

    #[test]
    fn test_presets_validate() {
        assert!(RateLimiterConfig::conservative().validate().is_ok());
        assert!(RateLimiterConfig::standard().validate().is_ok());
        assert!(RateLimiterConfig::aggressive().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_if_needed() {
        let limiter = limiter();
        assert_eq!(limiter.wait_if_needed().await, Duration::ZERO);

        limiter.record_rate_limit(None);
        let start = tokio::time::Instant::now();
        let waited = limiter.wait_if_needed().await;
        assert_eq!(waited, Duration::from_millis(100));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
