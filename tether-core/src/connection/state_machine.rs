//! Authoritative connection state for one service
//!
//! `transition_state` validates the move against `ConnectionState`'s table,
//! stores it, and hands it to `StateTransitionHandler` for side effects:
//!
//! | Entering      | Side effect                                              |
//! |---------------|----------------------------------------------------------|
//! | CONNECTED     | success signal: metrics tracker, backoff reset for service |
//! | FAILED        | failure signal: metrics tracker, GENERAL_FAILURE backoff |
//! | RECONNECTING  | reconnection attempt counted                             |
//! | anything else | none                                                     |
//!
//! Every accepted transition is broadcast as a `ConnectionStateInfo` snapshot
//! on a `watch` channel; subscribers (the state publisher, dashboards) see the
//! latest value and may skip intermediate ones.

use crate::core::errors::{TetherError, TetherResult};
use crate::core::state::ConnectionState;
use crate::monitoring::metrics::{ConnectionMetricsTracker, MetricsRegistry};
use crate::resilience::backoff::{BackoffManager, BackoffType};
use crate::store::distributed::ConnectionStateInfo;
use crate::utils::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_HISTORY: usize = 100;

/// One accepted transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: f64,
    pub error_context: Option<String>,
}

#[derive(Debug)]
struct StateStore {
    info: ConnectionStateInfo,
    history: VecDeque<StateTransition>,
    tracker: ConnectionMetricsTracker,
}

/// Applies the retry-bookkeeping side effects of a transition
pub struct StateTransitionHandler {
    service: String,
    backoff: Option<Arc<BackoffManager>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl StateTransitionHandler {
    fn apply(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        now: f64,
        tracker: &mut ConnectionMetricsTracker,
    ) {
        if let Some(metrics) = &self.metrics {
            let conn = metrics.connection();
            conn.state
                .with_label_values(&[&self.service])
                .set(state_index(to));
            if from != to {
                conn.state_transitions_total
                    .with_label_values(&[&self.service, from.as_str(), to.as_str()])
                    .inc();
            }
        }

        match to {
            ConnectionState::Connected => {
                tracker.record_success(now);
                if let Some(backoff) = &self.backoff {
                    backoff.reset_service(&self.service);
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .connection()
                        .connection_successes_total
                        .with_label_values(&[&self.service])
                        .inc();
                }
            }
            ConnectionState::Failed => {
                tracker.record_failure(now);
                if let Some(backoff) = &self.backoff {
                    backoff.record_failure(&self.service, BackoffType::GeneralFailure);
                }
            }
            ConnectionState::Reconnecting if from != to => {
                tracker.record_reconnection_attempt();
                if let Some(metrics) = &self.metrics {
                    metrics
                        .connection()
                        .reconnection_attempts_total
                        .with_label_values(&[&self.service])
                        .inc();
                }
            }
            _ => {}
        }
    }
}

fn state_index(state: ConnectionState) -> i64 {
    ConnectionState::ALL
        .iter()
        .position(|s| *s == state)
        .map_or(-1, |i| i as i64)
}

/// State machine for one logical connection
pub struct ConnectionStateMachine {
    service: String,
    clock: Arc<dyn Clock>,
    store: Mutex<StateStore>,
    handler: StateTransitionHandler,
    tx: watch::Sender<ConnectionStateInfo>,
}

impl ConnectionStateMachine {
    pub fn new(service: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let service = service.into();
        let info = ConnectionStateInfo::new(service.clone(), ConnectionState::Disconnected, clock.now());
        let (tx, _) = watch::channel(info.clone());
        Self {
            handler: StateTransitionHandler {
                service: service.clone(),
                backoff: None,
                metrics: None,
            },
            service,
            clock,
            store: Mutex::new(StateStore {
                info,
                history: VecDeque::with_capacity(MAX_HISTORY),
                tracker: ConnectionMetricsTracker::new(),
            }),
            tx,
        }
    }

    /// Route success/failure signals into `backoff`
    pub fn with_backoff(mut self, backoff: Arc<BackoffManager>) -> Self {
        self.handler.backoff = Some(backoff);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        metrics
            .connection()
            .state
            .with_label_values(&[&self.service])
            .set(state_index(ConnectionState::Disconnected));
        self.handler.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Move to `new_state`
    ///
    /// Rejected moves leave the state untouched and return
    /// `TetherError::InvalidTransition`.
    pub fn transition_state(
        &self,
        new_state: ConnectionState,
        error_context: Option<&str>,
    ) -> TetherResult<()> {
        let now = self.clock.now();

        let snapshot = {
            let mut store = self.store.lock();
            let from = store.info.state;

            if !from.can_transition_to(new_state) {
                warn!(
                    service = %self.service,
                    "Rejected state transition {} -> {}",
                    from, new_state
                );
                return Err(TetherError::InvalidTransition {
                    service: self.service.clone(),
                    from,
                    to: new_state,
                });
            }

            let info = &mut store.info;
            info.state = new_state;
            info.timestamp = now;
            info.error_context = error_context.map(str::to_string);
            match new_state {
                ConnectionState::Reconnecting | ConnectionState::Connecting => {
                    if new_state == ConnectionState::Reconnecting {
                        info.in_reconnection = true;
                    }
                    if info.in_reconnection && info.reconnection_start_time.is_none() {
                        info.reconnection_start_time = Some(now);
                    }
                }
                ConnectionState::Connected => {
                    info.in_reconnection = false;
                    info.reconnection_start_time = None;
                    info.last_successful_connection = Some(now);
                }
                ConnectionState::Authenticated | ConnectionState::Subscribed => {
                    info.in_reconnection = false;
                    info.reconnection_start_time = None;
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    info.in_reconnection = false;
                    info.reconnection_start_time = None;
                }
            }

            if store.history.len() == MAX_HISTORY {
                store.history.pop_front();
            }
            store.history.push_back(StateTransition {
                from,
                to: new_state,
                timestamp: now,
                error_context: error_context.map(str::to_string),
            });

            let StateStore { info, tracker, .. } = &mut *store;
            self.handler.apply(from, new_state, now, tracker);

            if from == new_state {
                debug!(service = %self.service, state = %new_state, "State refreshed");
            } else if let Some(context) = error_context {
                info!(
                    service = %self.service,
                    "State transition {} -> {} ({})",
                    from, new_state, context
                );
            } else {
                info!(service = %self.service, "State transition {} -> {}", from, new_state);
            }

            info.clone()
        };

        self.tx.send_replace(snapshot);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.store.lock().info.state
    }

    pub fn snapshot(&self) -> ConnectionStateInfo {
        self.store.lock().info.clone()
    }

    pub fn is_operational(&self) -> bool {
        self.state().is_operational()
    }

    /// Seconds spent in the current state
    pub fn time_in_state(&self) -> f64 {
        (self.clock.now() - self.store.lock().info.timestamp).max(0.0)
    }

    /// Oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.store.lock().history.iter().cloned().collect()
    }

    pub fn metrics_tracker(&self) -> ConnectionMetricsTracker {
        self.store.lock().tracker.clone()
    }

    /// Receiver that always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStateInfo> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::backoff::BackoffConfig;
    use crate::resilience::network::SharedNetworkStatus;
    use crate::utils::clock::ManualClock;

    fn machine() -> (ConnectionStateMachine, Arc<BackoffManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100.0));
        let backoff = Arc::new(BackoffManager::new(
            BackoffConfig::default(),
            Arc::new(SharedNetworkStatus::healthy()),
            clock.clone(),
        ));
        let machine = ConnectionStateMachine::new("kalshi", clock.clone()).with_backoff(backoff.clone());
        (machine, backoff, clock)
    }

    #[test]
    fn test_starts_disconnected() {
        let (machine, _, _) = machine();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let (machine, _, _) = machine();
        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        machine.transition_state(ConnectionState::Connected, None).unwrap();
        machine.transition_state(ConnectionState::Authenticated, None).unwrap();
        machine.transition_state(ConnectionState::Subscribed, None).unwrap();

        assert!(machine.is_operational());
        assert_eq!(machine.history().len(), 4);
        assert_eq!(machine.metrics_tracker().total_connections, 1);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (machine, _, _) = machine();
        let err = machine
            .transition_state(ConnectionState::Subscribed, None)
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidTransition { .. }));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connected_resets_backoff() {
        let (machine, backoff, _) = machine();
        backoff.record_failure("kalshi", BackoffType::WebsocketConnection);
        backoff.record_failure("kalshi", BackoffType::NetworkFailure);

        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        machine.transition_state(ConnectionState::Connected, None).unwrap();

        assert!(backoff.get_all_backoff_status().is_empty());
    }

    #[test]
    fn test_failed_records_failure_signal() {
        let (machine, backoff, _) = machine();
        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        machine
            .transition_state(ConnectionState::Failed, Some("retries exhausted"))
            .unwrap();

        assert_eq!(machine.metrics_tracker().consecutive_failures, 1);
        assert!(backoff.state("kalshi", BackoffType::GeneralFailure).is_some());
        assert_eq!(
            machine.snapshot().error_context.as_deref(),
            Some("retries exhausted")
        );
    }

    #[test]
    fn test_reconnection_flag_lifecycle() {
        let (machine, _, clock) = machine();
        machine.transition_state(ConnectionState::Reconnecting, None).unwrap();
        let info = machine.snapshot();
        assert!(info.in_reconnection);
        assert_eq!(info.reconnection_start_time, Some(100.0));

        clock.advance(5.0);
        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        assert!(machine.snapshot().in_reconnection);
        assert_eq!(machine.snapshot().reconnection_start_time, Some(100.0));

        machine.transition_state(ConnectionState::Connected, None).unwrap();
        let info = machine.snapshot();
        assert!(!info.in_reconnection);
        assert_eq!(info.last_successful_connection, Some(105.0));
        assert_eq!(machine.metrics_tracker().total_reconnection_attempts, 1);
    }

    #[tokio::test]
    async fn test_watch_channel_sees_latest() {
        let (machine, _, _) = machine();
        let mut rx = machine.subscribe();

        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, ConnectionState::Connecting);
    }

    #[test]
    fn test_metrics_state_gauge() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let clock = Arc::new(ManualClock::new(0.0));
        let machine = ConnectionStateMachine::new("kalshi", clock).with_metrics(registry.clone());

        machine.transition_state(ConnectionState::Connecting, None).unwrap();
        machine.transition_state(ConnectionState::Connected, None).unwrap();

        let gauge = registry.connection().state.with_label_values(&["kalshi"]).get();
        assert_eq!(gauge, 2);
        let successes = registry
            .connection()
            .connection_successes_total
            .with_label_values(&["kalshi"])
            .get();
        assert_eq!(successes, 1);
    }
}
