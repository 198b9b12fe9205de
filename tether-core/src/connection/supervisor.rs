//! One supervised connection
//!
//! `ConnectionSupervisor` wires the lifecycle, state machine, backoff manager,
//! health monitor, message stats, and sequence tracker of a single service
//! together and drives them:
//!
//! - `connect_with_retry` opens the transport, backing off between attempts
//!   and giving up to FAILED once the retry budget is spent
//! - a periodic health loop checks operational connections, restarts
//!   reconnection from DISCONNECTED, and leaves FAILED to the operator
//! - `record_message` is the read loop's entry point
//!
//! At most one reconnection task is in flight at any time.

use crate::connection::lifecycle::{ConnectionFactory, ConnectionLifecycle, LifecycleConfig};
use crate::connection::state_machine::ConnectionStateMachine;
use crate::connection::task::{
    start_if_idle, IntervalLoop, LoopCallback, LoopFuture, PeriodicLoop, TaskHandle,
};
use crate::core::errors::{TetherError, TetherResult};
use crate::core::state::ConnectionState;
use crate::monitoring::alerts::AlertSink;
use crate::monitoring::metrics::MetricsRegistry;
use crate::resilience::backoff::{BackoffManager, BackoffType};
use crate::resilience::health::{HealthConfig, HealthMonitor};
use crate::resilience::message_stats::{MessageStatsCollector, MessageStatsConfig};
use crate::resilience::sequence::SequenceTracker;
use crate::store::history::RateHistory;
use crate::utils::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-service settings
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub message_stats: MessageStatsConfig,
    /// Move to AUTHENTICATED after connecting
    pub requires_credential: bool,
}

impl SupervisorConfig {
    pub fn validate(&self) -> TetherResult<()> {
        self.lifecycle.validate()?;
        self.health.validate()?;
        self.message_stats.validate()
    }
}

/// Shared collaborators, usually one set per process
#[derive(Clone)]
pub struct SupervisorContext {
    pub clock: Arc<dyn Clock>,
    pub backoff: Arc<BackoffManager>,
    pub alerts: Arc<dyn AlertSink>,
    pub metrics: Option<Arc<MetricsRegistry>>,
    pub history: Option<RateHistory>,
}

/// Point-in-time view of a supervised connection
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub service: String,
    pub state: ConnectionState,
    pub in_reconnection: bool,
    pub error_context: Option<String>,
    pub time_in_state_secs: f64,
    pub transport_open: bool,
    pub message_rate: u64,
    pub total_messages: u64,
    pub seconds_since_last_message: f64,
    pub tracked_sids: Vec<u64>,
    pub total_gaps: u64,
    pub total_connections: u64,
    pub consecutive_failures: u32,
    pub total_reconnection_attempts: u64,
    pub failed_monitor_cycles: u32,
    pub health_loop_running: bool,
    pub reconnect_in_flight: bool,
}

pub struct ConnectionSupervisor {
    service: String,
    config: SupervisorConfig,
    lifecycle: Arc<ConnectionLifecycle>,
    state_machine: Arc<ConnectionStateMachine>,
    backoff: Arc<BackoffManager>,
    health: Arc<HealthMonitor>,
    stats: Arc<MessageStatsCollector>,
    sequences: Arc<Mutex<SequenceTracker>>,
    alerts: Arc<dyn AlertSink>,
    metrics: Option<Arc<MetricsRegistry>>,
    health_loop: IntervalLoop,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    failed_cycles: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        service: impl Into<String>,
        config: SupervisorConfig,
        factory: Arc<dyn ConnectionFactory>,
        ctx: SupervisorContext,
    ) -> Arc<Self> {
        let service = service.into();

        let lifecycle = Arc::new(ConnectionLifecycle::new(
            service.clone(),
            config.lifecycle.clone(),
            factory,
        ));

        let mut state_machine = ConnectionStateMachine::new(service.clone(), ctx.clock.clone())
            .with_backoff(ctx.backoff.clone());
        let mut stats = MessageStatsCollector::new(
            service.clone(),
            config.message_stats.clone(),
            ctx.clock.clone(),
        );
        if let Some(history) = ctx.history.clone() {
            stats = stats.with_history(history);
        }
        if let Some(metrics) = &ctx.metrics {
            state_machine = state_machine.with_metrics(metrics.clone());
            stats = stats.with_metrics(metrics.clone());
        }
        let state_machine = Arc::new(state_machine);
        let stats = Arc::new(stats);
        let sequences = Arc::new(Mutex::new(SequenceTracker::new()));

        let mut health = HealthMonitor::new(
            config.health.clone(),
            ctx.clock.clone(),
            state_machine.clone(),
            sequences.clone(),
            stats.clone(),
            ctx.alerts.clone(),
        )
        .with_lifecycle(lifecycle.clone());
        if let Some(metrics) = &ctx.metrics {
            health = health.with_metrics(metrics.clone());
        }

        let health_loop = IntervalLoop::new(
            format!("{}-health", service),
            config.health.health_check_interval,
        );
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            service,
            config,
            lifecycle,
            state_machine,
            backoff: ctx.backoff,
            health: Arc::new(health),
            stats,
            sequences,
            alerts: ctx.alerts,
            metrics: ctx.metrics,
            health_loop,
            reconnect_task: Mutex::new(None),
            failed_cycles: AtomicU32::new(0),
            shutdown,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.state_machine
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn stats(&self) -> &Arc<MessageStatsCollector> {
        &self.stats
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Validate, connect, and start the health loop
    pub async fn start(self: &Arc<Self>) -> TetherResult<()> {
        self.config.validate()?;
        self.shutdown.send_replace(false);
        self.failed_cycles.store(0, Ordering::Release);

        info!(service = %self.service, "Starting connection supervisor");
        self.connect_with_retry().await?;
        self.start_health_loop()
    }

    /// Request shutdown and release everything
    ///
    /// Cancels the health loop and any reconnection in flight, closes the
    /// transport, and leaves the state machine in DISCONNECTED.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.health_loop.stop();
        if let Some(task) = self.reconnect_task.lock().take() {
            task.cancel();
        }
        self.lifecycle.cleanup_connection().await;

        if let Err(e) = self
            .state_machine
            .transition_state(ConnectionState::Disconnected, Some("shutdown"))
        {
            warn!(service = %self.service, "Could not record shutdown: {}", e);
        }
        info!(service = %self.service, "Connection supervisor stopped");
    }

    /// Connect, backing off between failed attempts
    ///
    /// Returns immediately if already operational. Fatal errors and an
    /// exhausted retry budget move the connection to FAILED and alert the
    /// operator.
    pub async fn connect_with_retry(&self) -> TetherResult<()> {
        loop {
            if self.is_shutdown() {
                return Err(TetherError::Cancelled {
                    service: self.service.clone(),
                });
            }
            if self.state_machine.is_operational() {
                return Ok(());
            }

            self.state_machine
                .transition_state(ConnectionState::Connecting, None)?;

            let error = match self.lifecycle.establish_connection().await {
                Ok(_) => return self.on_connected().await,
                Err(e) => e,
            };

            let backoff_type = BackoffType::for_error(&error);
            if let Some(metrics) = &self.metrics {
                metrics
                    .connection()
                    .connection_failures_total
                    .with_label_values(&[&self.service, error.class().as_str()])
                    .inc();
            }
            let state = self.backoff.record_failure(&self.service, backoff_type);

            if !error.is_retryable() {
                self.fail(&error.to_string()).await;
                return Err(error);
            }
            if !self.backoff.should_retry(&self.service, backoff_type) {
                let exhausted = TetherError::RetriesExhausted {
                    service: self.service.clone(),
                    backoff_type,
                    attempts: state.attempts,
                };
                self.fail(&exhausted.to_string()).await;
                return Err(exhausted);
            }

            let context = error.to_string();
            self.state_machine
                .transition_state(ConnectionState::Reconnecting, Some(&context))?;

            let delay = self.backoff.calculate_delay(&self.service, backoff_type);
            info!(
                service = %self.service,
                attempt = state.attempts,
                "Retrying {} in {:.2}s",
                backoff_type,
                delay.as_secs_f64()
            );
            if !self.sleep_unless_shutdown(delay).await {
                return Err(TetherError::Cancelled {
                    service: self.service.clone(),
                });
            }
        }
    }

    async fn on_connected(&self) -> TetherResult<()> {
        if self.is_shutdown() {
            self.lifecycle.cleanup_connection().await;
            return Err(TetherError::Cancelled {
                service: self.service.clone(),
            });
        }

        self.stats.reset();
        self.sequences.lock().reset_all();
        self.state_machine
            .transition_state(ConnectionState::Connected, None)?;
        if self.config.requires_credential {
            self.state_machine
                .transition_state(ConnectionState::Authenticated, None)?;
        }
        Ok(())
    }

    async fn fail(&self, reason: &str) {
        error!(service = %self.service, "Connection failed: {}", reason);
        if let Err(e) = self
            .state_machine
            .transition_state(ConnectionState::Failed, Some(reason))
        {
            warn!(service = %self.service, "Could not mark connection failed: {}", e);
        }
        if let Err(e) = self.alerts.send_operator_alert(&self.service, reason).await {
            error!(service = %self.service, "Failed to deliver operator alert: {}", e);
        }
    }

    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let mut rx = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = async {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            } => false,
        }
    }

    /// Operator retry of a FAILED connection
    ///
    /// Clears the service's backoff state, starts one reconnection task, and
    /// restarts the health loop if it had stopped.
    pub fn manual_retry(self: &Arc<Self>) -> TetherResult<()> {
        let state = self.state_machine.state();
        if !state.is_failed() {
            return Err(TetherError::validation(format!(
                "{}: manual retry requires FAILED, connection is {}",
                self.service, state
            )));
        }

        info!(service = %self.service, "Manual retry requested");
        self.shutdown.send_replace(false);
        self.backoff.reset_service(&self.service);
        self.failed_cycles.store(0, Ordering::Release);
        self.state_machine
            .transition_state(ConnectionState::Reconnecting, Some("manual retry"))?;

        self.ensure_reconnecting();
        if !self.health_loop.is_running() {
            self.start_health_loop()?;
        }
        Ok(())
    }

    /// Read-loop entry point: count the message and track its sequence
    ///
    /// Returns the gap detected for `sid`. The first message on a new sid
    /// moves a freshly connected session to SUBSCRIBED.
    pub fn record_message(&self, sid: u64, seq: u64) -> u64 {
        self.stats.add_message();

        let (gap, new_sid) = {
            let mut sequences = self.sequences.lock();
            let new_sid = !sequences.has_sid(sid);
            (sequences.observe(sid, seq), new_sid)
        };

        if gap > 0 {
            warn!(service = %self.service, sid, seq, gap, "Sequence gap detected");
            if let Some(metrics) = &self.metrics {
                metrics
                    .health()
                    .sequence_gaps_total
                    .with_label_values(&[&self.service])
                    .inc_by(gap);
            }
        }

        if new_sid {
            let state = self.state_machine.state();
            if matches!(state, ConnectionState::Connected | ConnectionState::Authenticated) {
                if let Err(e) = self
                    .state_machine
                    .transition_state(ConnectionState::Subscribed, None)
                {
                    debug!(service = %self.service, "Subscription not recorded: {}", e);
                }
            }
        }
        gap
    }

    pub fn is_reconnect_in_flight(&self) -> bool {
        self.reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|task| !TaskHandle::is_finished(task))
    }

    pub fn get_status(&self) -> SupervisorStatus {
        let info = self.state_machine.snapshot();
        let tracker = self.state_machine.metrics_tracker();
        let stats = self.stats.stats();
        let (tracked_sids, total_gaps) = {
            let sequences = self.sequences.lock();
            (sequences.tracked_sids(), sequences.total_gap_count())
        };

        SupervisorStatus {
            service: self.service.clone(),
            state: info.state,
            in_reconnection: info.in_reconnection,
            error_context: info.error_context,
            time_in_state_secs: self.state_machine.time_in_state(),
            transport_open: self.lifecycle.is_open(),
            message_rate: stats.current_rate,
            total_messages: stats.total_messages,
            seconds_since_last_message: self.stats.seconds_since_last_message(),
            tracked_sids,
            total_gaps,
            total_connections: tracker.total_connections,
            consecutive_failures: tracker.consecutive_failures,
            total_reconnection_attempts: tracker.total_reconnection_attempts,
            failed_monitor_cycles: self.failed_cycles.load(Ordering::Acquire),
            health_loop_running: self.health_loop.is_running(),
            reconnect_in_flight: self.is_reconnect_in_flight(),
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.state_machine.state() == ConnectionState::Disconnected {
                if let Err(e) = this
                    .state_machine
                    .transition_state(ConnectionState::Reconnecting, Some("connection lost"))
                {
                    debug!(service = %this.service, "Reconnection not started: {}", e);
                    return;
                }
            }
            match this.connect_with_retry().await {
                Ok(()) => info!(service = %this.service, "Reconnected"),
                Err(TetherError::Cancelled { .. }) => {
                    debug!(service = %this.service, "Reconnection cancelled")
                }
                Err(e) => warn!(service = %this.service, "Reconnection gave up: {}", e),
            }
        })
    }

    fn ensure_reconnecting(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        let (task, started) = start_if_idle(slot.take(), || self.spawn_reconnect());
        *slot = task;
        if started {
            debug!(service = %self.service, "Reconnection task started");
        }
    }

    fn start_health_loop(self: &Arc<Self>) -> TetherResult<()> {
        let weak = Arc::downgrade(self);
        let callback: LoopCallback = Arc::new(move || -> LoopFuture {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(supervisor) => supervisor.run_monitor_cycle().await,
                    None => ControlFlow::Break(()),
                }
            })
        });
        self.health_loop.start(callback)
    }

    async fn run_monitor_cycle(self: &Arc<Self>) -> ControlFlow<()> {
        if self.is_shutdown() {
            return ControlFlow::Break(());
        }

        let state = self.state_machine.state();
        let cycle_ok = match state {
            s if s.is_operational() => {
                let healthy = self.health.check_health().await.is_ok();
                let current = self.reconnect_task.lock().take();
                let (ok, task) = self
                    .health
                    .check_and_handle_failure(|| async move { healthy }, || self.spawn_reconnect(), current)
                    .await;
                *self.reconnect_task.lock() = task;
                ok
            }
            ConnectionState::Disconnected => {
                self.ensure_reconnecting();
                true
            }
            ConnectionState::Failed => {
                debug!(service = %self.service, "Connection FAILED, awaiting manual retry");
                true
            }
            _ => true,
        };

        if cycle_ok {
            self.failed_cycles.store(0, Ordering::Release);
            return ControlFlow::Continue(());
        }

        let failed = self.failed_cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = self.config.health.max_consecutive_failures;
        if failed < limit {
            return ControlFlow::Continue(());
        }

        if let Some(task) = self.reconnect_task.lock().take() {
            task.cancel();
        }
        self.lifecycle.cleanup_connection().await;
        self.fail(&format!("{} consecutive health monitoring cycles failed", failed))
            .await;
        ControlFlow::Break(())
    }
}
