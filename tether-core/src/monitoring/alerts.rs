//! Alerting for connection health
//!
//! `AlertSink` is the contract the health monitor talks to. Delivery
//! transports (chat bots, pagers) implement it outside this crate;
//! `AlertManager` is the built-in implementation:
//! - Severity levels (Critical, Error, Warning, Info)
//! - Alert categories (Connection, DataFlow, Store, System)
//! - Console and JSON-lines file outputs
//! - Per-alert rate limiting, critical alerts always go through
//! - Active alert tracking with auto-resolve

use crate::core::errors::{TetherError, TetherResult};
use crate::monitoring::metrics::MetricsRegistry;
use crate::utils::clock::Clock;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stage of the health check that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAlertKind {
    ConnectionDown,
    NoSubscriptions,
    NoDataFlow,
}

impl HealthAlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionDown => "connection_down",
            Self::NoSubscriptions => "no_subscriptions",
            Self::NoDataFlow => "no_data_flow",
        }
    }
}

impl fmt::Display for HealthAlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for health alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_health_alert(&self, message: &str, kind: HealthAlertKind) -> TetherResult<()>;

    /// Health alert attributed to one service
    ///
    /// Sinks that deduplicate should key on (service, kind) here so one
    /// service's outage never hides another's.
    async fn send_service_health_alert(
        &self,
        _service: &str,
        message: &str,
        kind: HealthAlertKind,
    ) -> TetherResult<()> {
        self.send_health_alert(message, kind).await
    }

    /// A connection needs operator intervention (retry budget exhausted)
    async fn send_operator_alert(&self, service: &str, message: &str) -> TetherResult<()> {
        warn!(service, "Operator intervention required: {}", message);
        Ok(())
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Informational alerts (no action required)
    Info = 0,
    /// Warning alerts (should investigate)
    Warning = 1,
    /// Error alerts (requires attention)
    Error = 2,
    /// Critical alerts (immediate action required)
    Critical = 3,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Alert category for organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCategory {
    /// Transport up/down, retry exhaustion
    Connection,
    /// Subscriptions and message flow
    DataFlow,
    /// Shared store failures
    Store,
    System,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION",
            Self::DataFlow => "DATA_FLOW",
            Self::Store => "STORE",
            Self::System => "SYSTEM",
        }
    }
}

/// Alert identifier for deduplication and tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId {
    pub category: AlertCategory,
    pub name: String,
}

impl AlertId {
    pub fn new(category: AlertCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category.as_str(), self.name)
    }
}

/// Alert with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: HashMap<String, String>,
    /// Unix seconds, stamped by the manager when sent
    pub timestamp: f64,
}

impl Alert {
    pub fn new(
        category: AlertCategory,
        name: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: AlertId::new(category, name),
            severity,
            message: message.into(),
            details: HashMap::new(),
            timestamp: 0.0,
        }
    }

    /// Alert for a failed health check stage
    pub fn health(kind: HealthAlertKind, message: impl Into<String>) -> Self {
        let (category, severity) = match kind {
            HealthAlertKind::ConnectionDown => (AlertCategory::Connection, AlertSeverity::Error),
            HealthAlertKind::NoSubscriptions => (AlertCategory::DataFlow, AlertSeverity::Warning),
            HealthAlertKind::NoDataFlow => (AlertCategory::DataFlow, AlertSeverity::Error),
        };
        Self::new(category, kind.as_str(), severity, message)
    }

    /// Health alert tracked per service (`CONNECTION.kalshi.connection_down`)
    pub fn service_health(service: &str, kind: HealthAlertKind, message: impl Into<String>) -> Self {
        let mut alert = Self::health(kind, message).with_detail("service", service);
        alert.id.name = format!("{}.{}", service, kind.as_str());
        alert
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Format alert for display
    pub fn format(&self) -> String {
        let mut output = format!(
            "[{}] {} - {}",
            self.severity.as_str(),
            self.id,
            self.message
        );

        if !self.details.is_empty() {
            let mut keys: Vec<&String> = self.details.keys().collect();
            keys.sort();
            output.push_str("\n  Details:");
            for key in keys {
                output.push_str(&format!("\n    {}: {}", key, self.details[key]));
            }
        }

        output
    }

    pub fn to_json(&self) -> TetherResult<String> {
        serde_json::to_string(self)
            .map_err(|e| TetherError::store("serialize alert", e.to_string()))
    }
}

/// Alert output channel configuration
#[derive(Debug, Clone)]
pub enum AlertOutput {
    /// Emit through tracing at a level matching the severity
    Console {
        /// Minimum severity to output
        min_severity: AlertSeverity,
    },
    /// Append one JSON object per line
    File {
        path: PathBuf,
        /// Minimum severity to output
        min_severity: AlertSeverity,
    },
}

#[derive(Debug, Clone)]
struct AlertState {
    last_seen: f64,
    count: u64,
    last_sent: Option<f64>,
}

/// Alert manager configuration
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    pub outputs: Vec<AlertOutput>,
    /// Minimum time between sending the same alert
    pub rate_limit: Duration,
    /// Resolve alerts that have not recurred for this long
    pub auto_resolve: Duration,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            outputs: vec![AlertOutput::Console {
                min_severity: AlertSeverity::Warning,
            }],
            rate_limit: Duration::from_secs(60),
            auto_resolve: Duration::from_secs(300),
        }
    }
}

/// Central alert manager
pub struct AlertManager {
    config: AlertManagerConfig,
    clock: Arc<dyn Clock>,
    active_alerts: RwLock<HashMap<AlertId, AlertState>>,
    alert_counts: RwLock<HashMap<AlertSeverity, u64>>,
    suppressed: RwLock<u64>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "AlertManager initialized with {} outputs",
            config.outputs.len()
        );
        Self {
            config,
            clock,
            active_alerts: RwLock::new(HashMap::new()),
            alert_counts: RwLock::new(HashMap::new()),
            suppressed: RwLock::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send an alert through all configured outputs
    ///
    /// Returns whether the alert was delivered (false when rate limited).
    /// Output failures are logged, never propagated.
    pub fn send(&self, mut alert: Alert) -> bool {
        let now = self.clock.now();
        alert.timestamp = now;

        if !self.should_send(&alert, now) {
            self.touch(&alert.id, now);
            *self.suppressed.write() += 1;
            debug!("Alert {} rate limited", alert.id);
            return false;
        }

        self.record_sent(&alert.id, now);
        *self.alert_counts.write().entry(alert.severity).or_insert(0) += 1;

        for output in &self.config.outputs {
            if let Err(e) = self.send_to_output(&alert, output) {
                error!("Failed to send alert to output: {}", e);
            }
        }

        true
    }

    fn should_send(&self, alert: &Alert, now: f64) -> bool {
        if alert.severity == AlertSeverity::Critical {
            return true;
        }

        let active = self.active_alerts.read();
        match active.get(&alert.id).and_then(|state| state.last_sent) {
            Some(last_sent) => now - last_sent >= self.config.rate_limit.as_secs_f64(),
            None => true,
        }
    }

    fn touch(&self, id: &AlertId, now: f64) {
        if let Some(state) = self.active_alerts.write().get_mut(id) {
            state.last_seen = now;
            state.count += 1;
        }
    }

    fn record_sent(&self, id: &AlertId, now: f64) {
        self.active_alerts
            .write()
            .entry(id.clone())
            .and_modify(|state| {
                state.last_seen = now;
                state.count += 1;
                state.last_sent = Some(now);
            })
            .or_insert(AlertState {
                last_seen: now,
                count: 1,
                last_sent: Some(now),
            });
    }

    fn send_to_output(&self, alert: &Alert, output: &AlertOutput) -> TetherResult<()> {
        match output {
            AlertOutput::Console { min_severity } if alert.severity >= *min_severity => {
                self.send_to_console(alert);
                Ok(())
            }
            AlertOutput::File { path, min_severity } if alert.severity >= *min_severity => {
                self.send_to_file(alert, path)
            }
            _ => Ok(()),
        }
    }

    fn send_to_console(&self, alert: &Alert) {
        let formatted = alert.format();
        match alert.severity {
            AlertSeverity::Info => info!("{}", formatted),
            AlertSeverity::Warning => warn!("{}", formatted),
            AlertSeverity::Error | AlertSeverity::Critical => error!("{}", formatted),
        }
    }

    fn send_to_file(&self, alert: &Alert, path: &Path) -> TetherResult<()> {
        let io_err = |e: std::io::Error| TetherError::store("alert log write", e.to_string());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        let json = alert.to_json()?;
        writeln!(file, "{}", json).map_err(io_err)?;
        file.flush().map_err(io_err)
    }

    /// Resolve an alert (mark as no longer active)
    pub fn resolve(&self, alert_id: &AlertId) {
        if self.active_alerts.write().remove(alert_id).is_some() {
            info!("Alert {} resolved", alert_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_alerts.read().len()
    }

    /// How many times an active alert fired, including suppressed repeats
    pub fn occurrences(&self, alert_id: &AlertId) -> u64 {
        self.active_alerts
            .read()
            .get(alert_id)
            .map_or(0, |state| state.count)
    }

    pub fn suppressed_count(&self) -> u64 {
        *self.suppressed.read()
    }

    pub fn counts_by_severity(&self) -> HashMap<AlertSeverity, u64> {
        self.alert_counts.read().clone()
    }

    /// Auto-resolve alerts that have not recurred within `auto_resolve`
    pub fn cleanup_old_alerts(&self) -> usize {
        let cutoff = self.clock.now() - self.config.auto_resolve.as_secs_f64();
        let mut active = self.active_alerts.write();
        let before = active.len();
        active.retain(|id, state| {
            if state.last_seen < cutoff {
                info!("Auto-resolving inactive alert {}", id);
                return false;
            }
            true
        });
        before - active.len()
    }
}

impl AlertManager {
    fn count_health_alert(&self, kind: HealthAlertKind) {
        if let Some(metrics) = &self.metrics {
            metrics
                .health()
                .alerts_total
                .with_label_values(&[kind.as_str()])
                .inc();
        }
    }
}

#[async_trait]
impl AlertSink for AlertManager {
    async fn send_health_alert(&self, message: &str, kind: HealthAlertKind) -> TetherResult<()> {
        self.count_health_alert(kind);
        self.send(Alert::health(kind, message));
        Ok(())
    }

    async fn send_service_health_alert(
        &self,
        service: &str,
        message: &str,
        kind: HealthAlertKind,
    ) -> TetherResult<()> {
        self.count_health_alert(kind);
        self.send(Alert::service_health(service, kind, message));
        Ok(())
    }

    async fn send_operator_alert(&self, service: &str, message: &str) -> TetherResult<()> {
        let alert = Alert::new(
            AlertCategory::Connection,
            format!("{}_failed", service),
            AlertSeverity::Critical,
            message,
        )
        .with_detail("service", service);
        self.send(alert);
        Ok(())
    }
}
