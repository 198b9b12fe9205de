//! Periodic health checks for one connection
//!
//! `check_health` runs three stages and stops at the first failure:
//!
//! 1. connection: state is operational (and the transport is alive)
//! 2. subscriptions: expected subscriptions are actually tracked
//! 3. data flow: the message rate has not been zero for too long
//!
//! Calls closer together than half of `health_check_interval` are skipped.
//! A loop ticking at the full interval therefore evaluates every tick even
//! when scheduling jitter lands a tick slightly early.
//!
//! A failing stage is alerted through the injected `AlertSink` before the
//! error is returned, so the caller can drive the state transition.
//! `check_and_handle_failure` is that caller-side step, guarded so that only
//! one reconnection task is ever in flight.

use crate::connection::lifecycle::{ConnectionLifecycle, HealthCheckResult};
use crate::connection::state_machine::ConnectionStateMachine;
use crate::connection::task::{start_if_idle, TaskHandle};
use crate::core::errors::{TetherError, TetherResult};
use crate::core::state::ConnectionState;
use crate::monitoring::alerts::AlertSink;
use crate::monitoring::metrics::MetricsRegistry;
use crate::resilience::message_stats::MessageStatsCollector;
use crate::resilience::sequence::SequenceTracker;
use crate::utils::clock::Clock;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use crate::monitoring::alerts::HealthAlertKind;

/// Configuration for health monitoring
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Period of the health loop; calls within half of it are skipped
    pub health_check_interval: Duration,
    /// Subscriptions the connection should carry once subscribed (0 = none)
    pub expected_subscriptions: usize,
    /// Consecutive failed monitoring cycles before the health loop gives up
    pub max_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            expected_subscriptions: 0,
            max_consecutive_failures: 5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> TetherResult<()> {
        if self.health_check_interval.is_zero() {
            return Err(TetherError::validation("health_check_interval must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(TetherError::validation("max_consecutive_failures must be positive"));
        }
        Ok(())
    }
}

/// Successful outcome of `check_health`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthReport {
    /// Called again within half of `health_check_interval`
    Skipped,
    /// All stages passed; `rate` is the last closed window
    Healthy { rate: u64 },
}

/// Health checks over state, subscriptions, and data flow
pub struct HealthMonitor {
    service: String,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    state_machine: Arc<ConnectionStateMachine>,
    sequences: Arc<Mutex<SequenceTracker>>,
    stats: Arc<MessageStatsCollector>,
    alerts: Arc<dyn AlertSink>,
    lifecycle: Option<Arc<ConnectionLifecycle>>,
    metrics: Option<Arc<MetricsRegistry>>,
    last_check: Mutex<Option<f64>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        clock: Arc<dyn Clock>,
        state_machine: Arc<ConnectionStateMachine>,
        sequences: Arc<Mutex<SequenceTracker>>,
        stats: Arc<MessageStatsCollector>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            service: state_machine.service().to_string(),
            config,
            clock,
            state_machine,
            sequences,
            stats,
            alerts,
            lifecycle: None,
            metrics: None,
            last_check: Mutex::new(None),
        }
    }

    /// Include transport liveness (ping/pong) in the connection stage
    pub fn with_lifecycle(mut self, lifecycle: Arc<ConnectionLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run the three-stage check, skipping calls that repeat too soon
    pub async fn check_health(&self) -> TetherResult<HealthReport> {
        let now = self.clock.now();
        {
            let mut last = self.last_check.lock();
            if let Some(at) = *last {
                if now - at < self.config.health_check_interval.as_secs_f64() * 0.5 {
                    return Ok(HealthReport::Skipped);
                }
            }
            *last = Some(now);
        }

        if let Err(reason) = self.check_connection().await {
            return Err(self.fail(HealthAlertKind::ConnectionDown, reason).await);
        }

        if let Err(reason) = self.check_subscriptions() {
            return Err(self.fail(HealthAlertKind::NoSubscriptions, reason).await);
        }

        let measured = match self.stats.check_and_record_rate().await {
            Ok(Some(rate)) => Ok(rate),
            // No window closed yet; silence still counts
            Ok(None) => self
                .stats
                .check_silence()
                .map(|_| self.stats.current_rate()),
            Err(e) => Err(e),
        };

        let rate = match measured {
            Ok(rate) => rate,
            Err(err @ TetherError::SilentFailure { .. }) => {
                let message = err.to_string();
                self.alert(HealthAlertKind::NoDataFlow, &message).await;
                return Err(err);
            }
            Err(e) => {
                // History persistence is best-effort here
                warn!(service = %self.service, "Rate history unavailable: {}", e);
                self.stats.current_rate()
            }
        };

        info!(service = %self.service, rate, "Health check passed");
        Ok(HealthReport::Healthy { rate })
    }

    async fn check_connection(&self) -> Result<(), String> {
        let state = self.state_machine.state();
        if !state.is_operational() {
            return Err(format!("connection not operational (state {})", state));
        }
        if let Some(lifecycle) = &self.lifecycle {
            if let HealthCheckResult::Unhealthy(issue) = lifecycle.check_connection_health().await {
                return Err(format!("transport unhealthy: {}", issue));
            }
        }
        Ok(())
    }

    fn check_subscriptions(&self) -> Result<(), String> {
        if self.config.expected_subscriptions == 0 {
            return Ok(());
        }
        let active = self.sequences.lock().len();
        if active == 0 {
            return Err(format!(
                "no active subscriptions (expected {})",
                self.config.expected_subscriptions
            ));
        }
        if active < self.config.expected_subscriptions {
            debug!(
                service = %self.service,
                active,
                expected = self.config.expected_subscriptions,
                "Fewer subscriptions than expected"
            );
        }
        Ok(())
    }

    async fn fail(&self, kind: HealthAlertKind, reason: String) -> TetherError {
        let message = format!("{}: {}", self.service, reason);
        self.alert(kind, &message).await;
        TetherError::connection(self.service.clone(), reason)
    }

    async fn alert(&self, kind: HealthAlertKind, message: &str) {
        warn!(service = %self.service, stage = %kind, "Health check failed: {}", message);
        if let Some(metrics) = &self.metrics {
            metrics
                .health()
                .health_check_failures_total
                .with_label_values(&[&self.service, kind.as_str()])
                .inc();
        }
        if let Err(e) = self
            .alerts
            .send_service_health_alert(&self.service, message, kind)
            .await
        {
            error!(service = %self.service, "Failed to deliver health alert: {}", e);
        }
    }

    /// Evaluate every stage without side effects
    pub fn is_healthy(&self) -> bool {
        if !self.state_machine.is_operational() {
            return false;
        }
        if let Some(lifecycle) = &self.lifecycle {
            if !lifecycle.is_open() {
                return false;
            }
        }
        if self.check_subscriptions().is_err() {
            return false;
        }
        self.stats.is_flowing()
    }

    /// Run `check_fn`; on failure drop to DISCONNECTED and make sure one
    /// reconnection task is in flight
    ///
    /// Returns whether the check passed and the task now in flight. A task
    /// that is still running is kept; `connect_fn` is only called when
    /// `current_task` is absent or finished.
    pub async fn check_and_handle_failure<T, C, Fut, S>(
        &self,
        check_fn: C,
        connect_fn: S,
        current_task: Option<T>,
    ) -> (bool, Option<T>)
    where
        T: TaskHandle,
        C: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
        S: FnOnce() -> T,
    {
        if check_fn().await {
            return (true, current_task);
        }

        if let Err(e) = self
            .state_machine
            .transition_state(ConnectionState::Disconnected, Some("Health check failed"))
        {
            error!(service = %self.service, "Could not mark connection down: {}", e);
        }

        let (task, started) = start_if_idle(current_task, connect_fn);
        if started {
            info!(service = %self.service, "Reconnection task started");
        } else {
            debug!(service = %self.service, "Reconnection already in flight");
        }
        (false, task)
    }
}
