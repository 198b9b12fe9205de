//! Message-rate measurement and silent-failure detection
//!
//! The read loop calls `add_message()` for every frame. The health loop calls
//! `check_and_record_rate()`, which closes the current measurement window at
//! most once per `measurement_interval`:
//!
//! 1. snapshot the window counter as `current_rate`, reset it to zero
//! 2. advance `last_rate_check_time`, and `last_nonzero_update_time` if the rate is positive
//! 3. detect silence: `now - last_nonzero_update_time > silent_failure_threshold`
//! 4. persist the sample to rate history (best-effort)
//!
//! A silent connection is reported before a persistence failure. Neither
//! forces a state transition; that decision belongs to the health monitor.

use crate::core::errors::{TetherError, TetherResult};
use crate::monitoring::metrics::MetricsRegistry;
use crate::store::history::RateHistory;
use crate::utils::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for rate measurement
#[derive(Debug, Clone)]
pub struct MessageStatsConfig {
    /// Length of one measurement window
    pub measurement_interval: Duration,
    /// Zero-rate duration after which the connection counts as silent
    pub silent_failure_threshold: Duration,
}

impl Default for MessageStatsConfig {
    fn default() -> Self {
        Self {
            measurement_interval: Duration::from_secs(1),
            silent_failure_threshold: Duration::from_secs(30),
        }
    }
}

impl MessageStatsConfig {
    pub fn validate(&self) -> TetherResult<()> {
        if self.measurement_interval.is_zero() {
            return Err(TetherError::validation("measurement_interval must be positive"));
        }
        if self.silent_failure_threshold.is_zero() {
            return Err(TetherError::validation(
                "silent_failure_threshold must be positive",
            ));
        }
        Ok(())
    }
}

/// Snapshot of the collector
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MessageStats {
    /// Messages counted in the open window
    pub message_count: u64,
    /// Count of the last closed window
    pub current_rate: u64,
    pub last_rate_check_time: f64,
    pub last_nonzero_update_time: f64,
    /// Messages since construction
    pub total_messages: u64,
}

#[derive(Debug)]
struct RateWindow {
    current_rate: u64,
    last_rate_check_time: f64,
    last_nonzero_update_time: f64,
}

/// Rolling message-rate collector for one service
pub struct MessageStatsCollector {
    service: String,
    config: MessageStatsConfig,
    clock: Arc<dyn Clock>,
    history: Option<RateHistory>,
    metrics: Option<Arc<MetricsRegistry>>,
    message_count: AtomicU64,
    total_messages: AtomicU64,
    window: Mutex<RateWindow>,
}

impl MessageStatsCollector {
    pub fn new(service: impl Into<String>, config: MessageStatsConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            service: service.into(),
            config,
            clock,
            history: None,
            metrics: None,
            message_count: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                current_rate: 0,
                last_rate_check_time: now,
                last_nonzero_update_time: now,
            }),
        }
    }

    pub fn with_history(mut self, history: RateHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &MessageStatsConfig {
        &self.config
    }

    /// Count one received message
    #[inline]
    pub fn add_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics
                .health()
                .messages_total
                .with_label_values(&[&self.service])
                .inc();
        }
    }

    /// Close the window if one interval has elapsed
    ///
    /// Returns `Ok(None)` when it is too early to evaluate and
    /// `Ok(Some(rate))` after a successful evaluation.
    pub async fn check_and_record_rate(&self) -> TetherResult<Option<u64>> {
        let now = self.clock.now();

        let (rate, silent) = {
            let mut window = self.window.lock();
            if now - window.last_rate_check_time < self.config.measurement_interval.as_secs_f64() {
                return Ok(None);
            }

            let rate = self.message_count.swap(0, Ordering::AcqRel);
            window.current_rate = rate;
            window.last_rate_check_time = now;
            if rate > 0 {
                window.last_nonzero_update_time = now;
            }

            let silent = self.detect_silent_failure(now, window.last_nonzero_update_time);
            (rate, silent)
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .health()
                .message_rate
                .with_label_values(&[&self.service])
                .set(rate.min(i64::MAX as u64) as i64);
        }

        debug!(service = %self.service, rate, "Message rate recorded");

        let persisted = match &self.history {
            Some(history) => history.record(&self.service, now, rate).await.map_err(|e| {
                warn!(service = %self.service, "Failed to persist rate sample: {}", e);
                e
            }),
            None => Ok(()),
        };

        silent?;
        persisted?;
        Ok(Some(rate))
    }

    fn detect_silent_failure(&self, now: f64, last_nonzero: f64) -> TetherResult<()> {
        let silent_for = now - last_nonzero;
        let threshold = self.config.silent_failure_threshold;
        if silent_for > threshold.as_secs_f64() {
            warn!(
                service = %self.service,
                "Silent failure: no messages for {:.1}s",
                silent_for
            );
            return Err(TetherError::SilentFailure {
                service: self.service.clone(),
                silent_for: Duration::from_secs_f64(silent_for.max(0.0)),
                threshold,
            });
        }
        Ok(())
    }

    /// Silence check between window closes
    ///
    /// Messages already counted in the open window mean the feed is alive even
    /// if no window has closed with them yet.
    pub fn check_silence(&self) -> TetherResult<()> {
        if self.message_count.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        let now = self.clock.now();
        let last_nonzero = self.window.lock().last_nonzero_update_time;
        self.detect_silent_failure(now, last_nonzero)
    }

    /// True while the last non-zero window is within the silence threshold
    pub fn is_flowing(&self) -> bool {
        let now = self.clock.now();
        let window = self.window.lock();
        now - window.last_nonzero_update_time <= self.config.silent_failure_threshold.as_secs_f64()
    }

    pub fn current_rate(&self) -> u64 {
        self.window.lock().current_rate
    }

    /// Seconds since a window last saw traffic
    pub fn seconds_since_last_message(&self) -> f64 {
        let now = self.clock.now();
        (now - self.window.lock().last_nonzero_update_time).max(0.0)
    }

    pub fn stats(&self) -> MessageStats {
        let window = self.window.lock();
        MessageStats {
            message_count: self.message_count.load(Ordering::Acquire),
            current_rate: window.current_rate,
            last_rate_check_time: window.last_rate_check_time,
            last_nonzero_update_time: window.last_nonzero_update_time,
            total_messages: self.total_messages.load(Ordering::Acquire),
        }
    }

    /// Restart measurement after a fresh connection
    pub fn reset(&self) {
        let now = self.clock.now();
        self.message_count.store(0, Ordering::Release);
        let mut window = self.window.lock();
        window.current_rate = 0;
        window.last_rate_check_time = now;
        window.last_nonzero_update_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorClass;
    use crate::store::kv::{InMemoryStore, SharedStore};
    use crate::utils::clock::ManualClock;

    fn collector(start: f64) -> (MessageStatsCollector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let config = MessageStatsConfig {
            measurement_interval: Duration::from_secs(1),
            silent_failure_threshold: Duration::from_secs(10),
        };
        (MessageStatsCollector::new("kalshi", config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_noop_before_interval() {
        let (stats, clock) = collector(0.0);
        stats.add_message();
        clock.advance(0.5);
        assert_eq!(stats.check_and_record_rate().await.unwrap(), None);
        assert_eq!(stats.stats().message_count, 1);
    }

    #[tokio::test]
    async fn test_window_snapshot_and_reset() {
        let (stats, clock) = collector(0.0);
        for _ in 0..7 {
            stats.add_message();
        }
        clock.advance(1.0);

        assert_eq!(stats.check_and_record_rate().await.unwrap(), Some(7));
        let snapshot = stats.stats();
        assert_eq!(snapshot.current_rate, 7);
        assert_eq!(snapshot.message_count, 0);
        assert_eq!(snapshot.last_nonzero_update_time, 1.0);
        assert_eq!(snapshot.total_messages, 7);
    }

    #[tokio::test]
    async fn test_silent_failure_after_threshold() {
        let (stats, clock) = collector(0.0);

        clock.set(5.0);
        assert_eq!(stats.check_and_record_rate().await.unwrap(), Some(0));

        clock.set(20.0);
        let err = stats.check_and_record_rate().await.unwrap_err();
        assert!(matches!(err, TetherError::SilentFailure { .. }));
        assert_eq!(err.class(), ErrorClass::Connection);
        assert!(!stats.is_flowing());
    }

    #[tokio::test]
    async fn test_traffic_clears_silence() {
        let (stats, clock) = collector(0.0);
        clock.set(20.0);
        assert!(stats.check_and_record_rate().await.is_err());

        stats.add_message();
        clock.advance(1.0);
        assert_eq!(stats.check_and_record_rate().await.unwrap(), Some(1));
        assert!(stats.is_flowing());
    }

    #[tokio::test]
    async fn test_samples_persisted_to_history() {
        let store = Arc::new(InMemoryStore::new());
        let (stats, clock) = collector(100.0);
        let stats = stats.with_history(RateHistory::new(store.clone()));

        stats.add_message();
        stats.add_message();
        clock.advance(1.0);
        stats.check_and_record_rate().await.unwrap();

        let raw = store.zrange_by_score("history:kalshi", 0.0, 1000.0).await.unwrap();
        assert_eq!(raw, vec![("101:2".to_string(), 101.0)]);
    }

    #[tokio::test]
    async fn test_reset_restarts_silence_clock() {
        let (stats, clock) = collector(0.0);
        clock.set(50.0);
        stats.reset();
        clock.advance(1.0);
        assert_eq!(stats.check_and_record_rate().await.unwrap(), Some(0));
    }
}
