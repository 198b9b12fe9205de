//! Observability: Prometheus metrics, alerting, and the HTTP endpoint
//! that exposes both metrics and connection status.

pub mod alerts;
pub mod metrics;
pub mod server;

pub use alerts::{
    Alert, AlertCategory, AlertId, AlertManager, AlertManagerConfig, AlertOutput, AlertSeverity,
    AlertSink, HealthAlertKind,
};
pub use metrics::{ConnectionMetrics, ConnectionMetricsTracker, HealthMetrics, MetricsRegistry};
pub use server::{MetricsServer, MetricsServerConfig, StatusReport, StatusSource};
