//! Prometheus metrics for connection monitoring
//!
//! Provides metrics for:
//! - Connection lifecycle (state, transitions, successes, failures, backoff)
//! - Data flow health (message rate, sequence gaps, failed checks)
//!
//! Also holds `ConnectionMetricsTracker`, the in-process counters the state
//! machine updates on success and failure signals.

use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    connection: Arc<ConnectionMetrics>,
    health: Arc<HealthMetrics>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metric families
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let connection = Arc::new(ConnectionMetrics::new(&registry)?);
        let health = Arc::new(HealthMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            connection,
            health,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionMetrics {
        &self.connection
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Render every family in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Connection lifecycle metrics
pub struct ConnectionMetrics {
    /// Current state as its index in `ConnectionState::ALL`
    pub state: IntGaugeVec,
    /// Accepted state transitions
    pub state_transitions_total: IntCounterVec,
    /// Transitions into CONNECTED
    pub connection_successes_total: IntCounterVec,
    /// Failed connection attempts
    pub connection_failures_total: IntCounterVec,
    /// Reconnection attempts started
    pub reconnection_attempts_total: IntCounterVec,
    /// Last computed backoff delay
    pub backoff_delay_seconds: GaugeVec,
    /// 429 responses seen by outbound rate limiters
    pub rest_rate_limit_hits: IntCounterVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let state = IntGaugeVec::new(
            Opts::new("connection_state", "Current connection state index")
                .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(state.clone()))?;

        let state_transitions_total = IntCounterVec::new(
            Opts::new(
                "connection_state_transitions_total",
                "Total number of accepted state transitions",
            )
            .namespace("tether"),
            &["service", "from", "to"],
        )?;
        registry.register(Box::new(state_transitions_total.clone()))?;

        let connection_successes_total = IntCounterVec::new(
            Opts::new(
                "connection_successes_total",
                "Total number of successful connections",
            )
            .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(connection_successes_total.clone()))?;

        let connection_failures_total = IntCounterVec::new(
            Opts::new(
                "connection_failures_total",
                "Total number of failed connection attempts",
            )
            .namespace("tether"),
            &["service", "class"],
        )?;
        registry.register(Box::new(connection_failures_total.clone()))?;

        let reconnection_attempts_total = IntCounterVec::new(
            Opts::new(
                "reconnection_attempts_total",
                "Total number of reconnection attempts",
            )
            .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(reconnection_attempts_total.clone()))?;

        let backoff_delay_seconds = GaugeVec::new(
            Opts::new("backoff_delay_seconds", "Last computed reconnection delay")
                .namespace("tether"),
            &["service", "backoff_type"],
        )?;
        registry.register(Box::new(backoff_delay_seconds.clone()))?;

        let rest_rate_limit_hits = IntCounterVec::new(
            Opts::new(
                "rest_rate_limit_hits_total",
                "Total number of rate-limited outbound requests",
            )
            .namespace("tether"),
            &["limiter"],
        )?;
        registry.register(Box::new(rest_rate_limit_hits.clone()))?;

        Ok(Self {
            state,
            state_transitions_total,
            connection_successes_total,
            connection_failures_total,
            reconnection_attempts_total,
            backoff_delay_seconds,
            rest_rate_limit_hits,
        })
    }
}

/// Data flow health metrics
pub struct HealthMetrics {
    /// Messages in the last measurement window
    pub message_rate: IntGaugeVec,
    /// Messages received
    pub messages_total: IntCounterVec,
    /// Missing sequence numbers detected
    pub sequence_gaps_total: IntCounterVec,
    /// Failed health checks by stage
    pub health_check_failures_total: IntCounterVec,
    /// Alerts sent through the alert sink
    pub alerts_total: IntCounterVec,
}

impl HealthMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let message_rate = IntGaugeVec::new(
            Opts::new("message_rate", "Messages received in the last measurement window")
                .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(message_rate.clone()))?;

        let messages_total = IntCounterVec::new(
            Opts::new("messages_total", "Total number of messages received")
                .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let sequence_gaps_total = IntCounterVec::new(
            Opts::new("sequence_gaps_total", "Total missing sequence numbers")
                .namespace("tether"),
            &["service"],
        )?;
        registry.register(Box::new(sequence_gaps_total.clone()))?;

        let health_check_failures_total = IntCounterVec::new(
            Opts::new(
                "health_check_failures_total",
                "Total number of failed health checks",
            )
            .namespace("tether"),
            &["service", "stage"],
        )?;
        registry.register(Box::new(health_check_failures_total.clone()))?;

        let alerts_total = IntCounterVec::new(
            Opts::new("alerts_total", "Total number of health alerts sent")
                .namespace("tether"),
            &["kind"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        Ok(Self {
            message_rate,
            messages_total,
            sequence_gaps_total,
            health_check_failures_total,
            alerts_total,
        })
    }
}

/// In-process connection counters for one service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetricsTracker {
    pub total_connections: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub total_reconnection_attempts: u64,
    pub last_success_time: Option<f64>,
    pub last_failure_time: Option<f64>,
}

impl ConnectionMetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, now: f64) {
        self.total_connections += 1;
        self.consecutive_failures = 0;
        self.last_success_time = Some(now);
    }

    pub fn record_failure(&mut self, now: f64) {
        self.total_failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(now);
    }

    pub fn record_reconnection_attempt(&mut self) {
        self.total_reconnection_attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().unwrap();
        registry.connection().state.with_label_values(&["kalshi"]).set(2);
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn test_connection_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry
            .connection()
            .state_transitions_total
            .with_label_values(&["kalshi", "CONNECTING", "CONNECTED"])
            .inc();
        registry
            .connection()
            .backoff_delay_seconds
            .with_label_values(&["kalshi", "NETWORK_FAILURE"])
            .set(4.0);

        let text = registry.render().unwrap();
        assert!(text.contains("tether_connection_state_transitions_total"));
        assert!(text.contains("tether_backoff_delay_seconds"));
    }

    #[test]
    fn test_health_metrics() {
        let registry = MetricsRegistry::new().unwrap();

        registry.health().message_rate.with_label_values(&["kalshi"]).set(42);
        registry
            .health()
            .health_check_failures_total
            .with_label_values(&["kalshi", "no_data_flow"])
            .inc();

        let text = registry.render().unwrap();
        assert!(text.contains("tether_message_rate{service=\"kalshi\"} 42"));
    }

    #[test]
    fn test_tracker_counts() {
        let mut tracker = ConnectionMetricsTracker::new();
        tracker.record_failure(1.0);
        tracker.record_failure(2.0);
        assert_eq!(tracker.consecutive_failures, 2);

        tracker.record_success(3.0);
        assert_eq!(tracker.consecutive_failures, 0);
        assert_eq!(tracker.total_connections, 1);
        assert_eq!(tracker.total_failures, 2);
        assert_eq!(tracker.last_success_time, Some(3.0));
    }
}
