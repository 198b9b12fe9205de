//! Exponential backoff for reconnection
//!
//! Tracks independent backoff state per (service, failure type) and computes
//! the delay before the next attempt:
//!
//! ```text
//! base  = min(max_delay, initial_delay * multiplier ^ consecutive_failures)
//! delay = base * (1 ± jitter_range) * network_factor
//! ```
//!
//! `network_factor` is 1.0 while the injected `NetworkHealthMonitor` reports a
//! healthy network and `network_degraded_multiplier` while it is degraded or
//! offline. Jitter prevents thundering-herd reconnects across services.
//!
//! The manager is split the same way the delay logic is reasoned about:
//! - `DelayCalculator`: pure delay arithmetic
//! - `RetryChecker`: retry budget decisions
//! - `BackoffStateManager`: the keyed state map
//!
//! Different services update their entries concurrently without any
//! cross-service lock (`DashMap` shards the map).

use crate::core::errors::{ErrorClass, TetherError, TetherResult};
use crate::monitoring::metrics::MetricsRegistry;
use crate::resilience::network::NetworkHealthMonitor;
use crate::utils::clock::Clock;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure domain; each (service, type) pair owns independent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffType {
    GeneralFailure,
    WebsocketConnection,
    NetworkFailure,
}

impl BackoffType {
    pub const ALL: [BackoffType; 3] = [
        BackoffType::GeneralFailure,
        BackoffType::WebsocketConnection,
        BackoffType::NetworkFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralFailure => "GENERAL_FAILURE",
            Self::WebsocketConnection => "WEBSOCKET_CONNECTION",
            Self::NetworkFailure => "NETWORK_FAILURE",
        }
    }

    /// Failure domain an error is charged against
    pub fn for_error(error: &TetherError) -> Self {
        match error.class() {
            ErrorClass::Timeout => Self::NetworkFailure,
            ErrorClass::Connection => Self::WebsocketConnection,
            ErrorClass::Fatal => Self::GeneralFailure,
        }
    }
}

impl fmt::Display for BackoffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for exponential backoff
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap applied to the exponential schedule
    pub max_delay: Duration,
    /// Growth factor per consecutive failure (typically 2.0)
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_range: f64,
    /// Attempts allowed before the caller must treat the failure as fatal
    pub max_attempts: u32,
    /// Delay multiplier while the network is degraded or offline
    pub network_degraded_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_range: 0.1, // 10% jitter
            max_attempts: 10,
            network_degraded_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Create a configuration for aggressive retries (for testing)
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 1.5,
            jitter_range: 0.1,
            max_attempts: 5,
            network_degraded_multiplier: 1.5,
        }
    }

    /// Create a configuration for conservative retries (for production)
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter_range: 0.2, // 20% jitter
            max_attempts: 20,
            network_degraded_multiplier: 3.0,
        }
    }

    pub fn validate(&self) -> TetherResult<()> {
        if self.initial_delay.is_zero() {
            return Err(TetherError::validation("backoff initial_delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(TetherError::validation(
                "backoff max_delay cannot be smaller than initial_delay",
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(TetherError::validation("backoff multiplier must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter_range) {
            return Err(TetherError::validation("backoff jitter_range must be in [0, 1)"));
        }
        if self.max_attempts == 0 {
            return Err(TetherError::validation("backoff max_attempts must be positive"));
        }
        if !(self.network_degraded_multiplier >= 1.0) {
            return Err(TetherError::validation(
                "network_degraded_multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

/// Backoff bookkeeping for one (service, type) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffState {
    /// Attempts charged against the retry budget
    pub attempts: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Unix seconds of the most recent failure
    pub last_failure_time: f64,
    /// Last delay handed out
    pub current_delay: Duration,
}

impl BackoffState {
    fn new(now: f64, initial_delay: Duration) -> Self {
        Self {
            attempts: 0,
            consecutive_failures: 0,
            last_failure_time: now,
            current_delay: initial_delay,
        }
    }
}

/// Observability snapshot of one backoff entry
#[derive(Debug, Clone, Serialize)]
pub struct BackoffStatus {
    pub service: String,
    pub backoff_type: BackoffType,
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub last_failure_time: f64,
    pub current_delay_secs: f64,
    pub max_attempts: u32,
    pub can_retry: bool,
}

// ============================================================================
// Delay arithmetic
// ============================================================================

/// Seconds to `Duration`: NaN and negatives are zero, overflow saturates
fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Pure delay arithmetic, no state
///
/// Never panics, even for configs that skipped `validate()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayCalculator;

impl DelayCalculator {
    /// Exponential schedule capped at `max_delay`, no jitter
    pub fn base_delay(&self, config: &BackoffConfig, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(i32::MAX as u32) as i32;
        let raw = config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent);
        let capped = raw.min(config.max_delay.as_secs_f64());
        saturating_secs(capped)
    }

    /// Symmetric jitter of `±jitter_range`
    pub fn apply_jitter<R: Rng>(&self, delay: Duration, jitter_range: f64, rng: &mut R) -> Duration {
        if jitter_range <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rng.gen_range(-jitter_range..=jitter_range);
        saturating_secs(delay.as_secs_f64() * factor)
    }

    pub fn network_factor(&self, config: &BackoffConfig, network: &dyn NetworkHealthMonitor) -> f64 {
        if network.is_network_degraded() || network.is_network_offline() {
            config.network_degraded_multiplier
        } else {
            1.0
        }
    }

    /// Full delay: schedule, then jitter, then network factor
    pub fn calculate(
        &self,
        config: &BackoffConfig,
        consecutive_failures: u32,
        network: &dyn NetworkHealthMonitor,
    ) -> Duration {
        let base = self.base_delay(config, consecutive_failures);
        let jittered = self.apply_jitter(base, config.jitter_range, &mut rand::thread_rng());
        let factor = self.network_factor(config, network);
        saturating_secs(jittered.as_secs_f64() * factor)
    }
}

/// Retry budget decisions
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryChecker;

impl RetryChecker {
    /// True while `attempts < max_attempts`
    pub fn should_retry(&self, config: &BackoffConfig, state: Option<&BackoffState>) -> bool {
        state.map_or(true, |s| s.attempts < config.max_attempts)
    }
}

// ============================================================================
// Keyed state
// ============================================================================

type BackoffKey = (String, BackoffType);

/// Owns the per-(service, type) state map
#[derive(Debug, Default)]
pub struct BackoffStateManager {
    states: DashMap<BackoffKey, BackoffState>,
}

impl BackoffStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge a failure, creating the entry lazily
    pub fn record_failure(
        &self,
        service: &str,
        backoff_type: BackoffType,
        now: f64,
        initial_delay: Duration,
    ) -> BackoffState {
        let mut entry = self
            .states
            .entry((service.to_string(), backoff_type))
            .or_insert_with(|| BackoffState::new(now, initial_delay));
        entry.attempts = entry.attempts.saturating_add(1);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure_time = now;
        entry.clone()
    }

    pub fn get(&self, service: &str, backoff_type: BackoffType) -> Option<BackoffState> {
        self.states
            .get(&(service.to_string(), backoff_type))
            .map(|s| s.clone())
    }

    pub fn set_current_delay(&self, service: &str, backoff_type: BackoffType, delay: Duration) {
        if let Some(mut state) = self.states.get_mut(&(service.to_string(), backoff_type)) {
            state.current_delay = delay;
        }
    }

    /// Drop the entry; returns whether one existed
    pub fn reset(&self, service: &str, backoff_type: BackoffType) -> bool {
        self.states
            .remove(&(service.to_string(), backoff_type))
            .is_some()
    }

    /// Drop every entry for `service`
    pub fn reset_service(&self, service: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|(name, _), _| name != service);
        before.saturating_sub(self.states.len())
    }

    /// Prune entries whose last failure is older than `max_age`
    pub fn cleanup(&self, now: f64, max_age: Duration) -> usize {
        let cutoff = now - max_age.as_secs_f64();
        let before = self.states.len();
        self.states.retain(|_, state| state.last_failure_time >= cutoff);
        before.saturating_sub(self.states.len())
    }

    pub fn snapshot(&self) -> Vec<(BackoffKey, BackoffState)> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Computes and tracks reconnection delay per (service, failure type)
pub struct BackoffManager {
    config: BackoffConfig,
    type_configs: HashMap<BackoffType, BackoffConfig>,
    calculator: DelayCalculator,
    retry_checker: RetryChecker,
    states: BackoffStateManager,
    network: Arc<dyn NetworkHealthMonitor>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl BackoffManager {
    pub fn new(
        config: BackoffConfig,
        network: Arc<dyn NetworkHealthMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            type_configs: HashMap::new(),
            calculator: DelayCalculator,
            retry_checker: RetryChecker,
            states: BackoffStateManager::new(),
            network,
            clock,
            metrics: None,
        }
    }

    /// Override the policy for one failure type
    pub fn with_type_config(mut self, backoff_type: BackoffType, config: BackoffConfig) -> Self {
        self.type_configs.insert(backoff_type, config);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Policy in force for `backoff_type`
    pub fn config_for(&self, backoff_type: BackoffType) -> &BackoffConfig {
        self.type_configs.get(&backoff_type).unwrap_or(&self.config)
    }

    /// Record a failed attempt
    pub fn record_failure(&self, service: &str, backoff_type: BackoffType) -> BackoffState {
        let config = self.config_for(backoff_type);
        let state = self.states.record_failure(
            service,
            backoff_type,
            self.clock.now(),
            config.initial_delay,
        );

        debug!(
            service,
            backoff_type = %backoff_type,
            attempts = state.attempts,
            consecutive_failures = state.consecutive_failures,
            "Backoff failure recorded"
        );

        if !self.retry_checker.should_retry(config, Some(&state)) {
            warn!(
                service,
                backoff_type = %backoff_type,
                "Retry budget exhausted after {} attempts",
                state.attempts
            );
        }

        state
    }

    /// Delay before the next attempt
    ///
    /// Without recorded failures this is the initial delay.
    pub fn calculate_delay(&self, service: &str, backoff_type: BackoffType) -> Duration {
        let config = self.config_for(backoff_type);
        let consecutive = self
            .states
            .get(service, backoff_type)
            .map_or(0, |s| s.consecutive_failures);

        let delay = self
            .calculator
            .calculate(config, consecutive, self.network.as_ref());

        self.states.set_current_delay(service, backoff_type, delay);

        if let Some(metrics) = &self.metrics {
            metrics
                .connection()
                .backoff_delay_seconds
                .with_label_values(&[service, backoff_type.as_str()])
                .set(delay.as_secs_f64());
        }

        delay
    }

    /// False once attempts reach `max_attempts`; the caller must then stop
    pub fn should_retry(&self, service: &str, backoff_type: BackoffType) -> bool {
        let config = self.config_for(backoff_type);
        let state = self.states.get(service, backoff_type);
        self.retry_checker.should_retry(config, state.as_ref())
    }

    /// Clear the counters for one pair (after a success)
    pub fn reset_backoff(&self, service: &str, backoff_type: BackoffType) {
        if self.states.reset(service, backoff_type) {
            debug!(service, backoff_type = %backoff_type, "Backoff reset");
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .connection()
                .backoff_delay_seconds
                .with_label_values(&[service, backoff_type.as_str()])
                .set(0.0);
        }
    }

    /// Clear every failure type for `service`
    pub fn reset_service(&self, service: &str) {
        let cleared = self.states.reset_service(service);
        if cleared > 0 {
            info!(service, cleared, "Backoff state cleared after success");
        }
        if let Some(metrics) = &self.metrics {
            for backoff_type in BackoffType::ALL {
                metrics
                    .connection()
                    .backoff_delay_seconds
                    .with_label_values(&[service, backoff_type.as_str()])
                    .set(0.0);
            }
        }
    }

    /// Prune entries whose last failure is older than `max_age`
    pub fn cleanup_old_state(&self, max_age: Duration) -> usize {
        let removed = self.states.cleanup(self.clock.now(), max_age);
        if removed > 0 {
            info!("Pruned {} stale backoff entries", removed);
        }
        removed
    }

    /// Snapshot keyed by `"<service>:<TYPE>"`
    pub fn get_all_backoff_status(&self) -> HashMap<String, BackoffStatus> {
        self.states
            .snapshot()
            .into_iter()
            .map(|((service, backoff_type), state)| {
                let config = self.config_for(backoff_type);
                let status = BackoffStatus {
                    can_retry: self.retry_checker.should_retry(config, Some(&state)),
                    max_attempts: config.max_attempts,
                    attempts: state.attempts,
                    consecutive_failures: state.consecutive_failures,
                    last_failure_time: state.last_failure_time,
                    current_delay_secs: state.current_delay.as_secs_f64(),
                    backoff_type,
                    service: service.clone(),
                };
                (format!("{}:{}", service, backoff_type), status)
            })
            .collect()
    }

    pub fn state(&self, service: &str, backoff_type: BackoffType) -> Option<BackoffState> {
        self.states.get(service, backoff_type)
    }

    /// Await the computed delay; returns the delay that was applied
    pub async fn apply_backoff(&self, service: &str, backoff_type: BackoffType) -> Duration {
        let delay = self.calculate_delay(service, backoff_type);
        debug!(
            service,
            backoff_type = %backoff_type,
            "Waiting {:?} before next connection attempt",
            delay
        );
        tokio::time::sleep(delay).await;
        delay
    }
}
