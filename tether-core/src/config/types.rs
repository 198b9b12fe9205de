use crate::connection::lifecycle::LifecycleConfig;
use crate::connection::supervisor::SupervisorConfig;
use crate::monitoring::alerts::{AlertManagerConfig, AlertOutput, AlertSeverity};
use crate::resilience::backoff::{BackoffConfig, BackoffType};
use crate::resilience::health::HealthConfig;
use crate::resilience::message_stats::MessageStatsConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub backoff: BackoffSection,
    pub rate_limiter: RateLimiterSection,
    pub lifecycle: LifecycleSection,
    pub health: HealthSection,
    pub message_stats: MessageStatsSection,
    pub store: StoreSection,
    pub monitoring: MonitoringSection,
    pub alerts: AlertsSection,
    pub services: Vec<ServiceConfig>,
}

/// One market-data connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique name, used as the key everywhere (metrics, store, backoff)
    pub name: String,

    /// Websocket endpoint
    #[serde(default)]
    pub endpoint: String,

    /// API credential (usually injected through the environment)
    #[serde(default)]
    pub credential: Option<String>,

    #[serde(default)]
    pub requires_credential: bool,

    /// Subscriptions the connection must carry to count as healthy
    #[serde(default)]
    pub expected_subscriptions: usize,

    /// Subscription ids to request
    #[serde(default = "default_sids")]
    pub sids: Vec<u64>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: String::new(),
            credential: None,
            requires_credential: false,
            expected_subscriptions: 0,
            sids: default_sids(),
        }
    }
}

fn default_sids() -> Vec<u64> {
    vec![1]
}

/// Exponential backoff parameters; unset fields take the built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffParams {
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    /// Fraction of the delay used as +/- jitter, in [0, 1)
    pub jitter_range: f64,
    pub max_attempts: u32,
    pub network_degraded_multiplier: f64,
}

impl Default for BackoffParams {
    fn default() -> Self {
        let config = BackoffConfig::default();
        Self {
            initial_delay_secs: config.initial_delay.as_secs_f64(),
            max_delay_secs: config.max_delay.as_secs_f64(),
            multiplier: config.multiplier,
            jitter_range: config.jitter_range,
            max_attempts: config.max_attempts,
            network_degraded_multiplier: config.network_degraded_multiplier,
        }
    }
}

impl BackoffParams {
    pub fn to_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: secs(self.initial_delay_secs),
            max_delay: secs(self.max_delay_secs),
            multiplier: self.multiplier,
            jitter_range: self.jitter_range,
            max_attempts: self.max_attempts,
            network_degraded_multiplier: self.network_degraded_multiplier,
        }
    }
}

/// ```toml
/// [backoff.defaults]
/// max_attempts = 10
///
/// [backoff.per_type.network_failure]
/// max_attempts = 30
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub defaults: BackoffParams,
    /// Keyed by lowercase backoff type (`general_failure`, `websocket_connection`,
    /// `network_failure`)
    pub per_type: HashMap<String, BackoffParams>,
}

impl BackoffSection {
    /// Per-type overrides; unknown keys are reported by `TetherConfig::validate`
    pub fn overrides(&self) -> Vec<(BackoffType, BackoffConfig)> {
        let mut out: Vec<_> = self
            .per_type
            .iter()
            .filter_map(|(key, params)| backoff_type_for_key(key).map(|t| (t, params.to_config())))
            .collect();
        out.sort_by_key(|(t, _)| *t);
        out
    }
}

pub(crate) fn backoff_type_for_key(key: &str) -> Option<BackoffType> {
    BackoffType::ALL
        .iter()
        .copied()
        .find(|t| t.as_str().eq_ignore_ascii_case(key))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSection {
    pub initial_backoff_ms: f64,
    pub max_backoff_ms: f64,
    pub backoff_multiplier: f64,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        let config = RateLimiterConfig::standard();
        Self {
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl From<&RateLimiterSection> for RateLimiterConfig {
    fn from(section: &RateLimiterSection) -> Self {
        Self {
            initial_backoff_ms: section.initial_backoff_ms,
            max_backoff_ms: section.max_backoff_ms,
            backoff_multiplier: section.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub connection_timeout_secs: f64,
    pub ping_interval_secs: f64,
    pub pong_timeout_secs: f64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        let config = LifecycleConfig::default();
        Self {
            connection_timeout_secs: config.connection_timeout.as_secs_f64(),
            ping_interval_secs: config.ping_interval.as_secs_f64(),
            pong_timeout_secs: config.pong_timeout.as_secs_f64(),
        }
    }
}

impl From<&LifecycleSection> for LifecycleConfig {
    fn from(section: &LifecycleSection) -> Self {
        Self {
            connection_timeout: secs(section.connection_timeout_secs),
            ping_interval: secs(section.ping_interval_secs),
            pong_timeout: secs(section.pong_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub health_check_interval_secs: f64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        let config = HealthConfig::default();
        Self {
            health_check_interval_secs: config.health_check_interval.as_secs_f64(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageStatsSection {
    pub measurement_interval_secs: f64,
    pub silent_failure_threshold_secs: f64,
}

impl Default for MessageStatsSection {
    fn default() -> Self {
        let config = MessageStatsConfig::default();
        Self {
            measurement_interval_secs: config.measurement_interval.as_secs_f64(),
            silent_failure_threshold_secs: config.silent_failure_threshold.as_secs_f64(),
        }
    }
}

impl From<&MessageStatsSection> for MessageStatsConfig {
    fn from(section: &MessageStatsSection) -> Self {
        Self {
            measurement_interval: secs(section.measurement_interval_secs),
            silent_failure_threshold: secs(section.silent_failure_threshold_secs),
        }
    }
}

/// Shared store settings (in-process store only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Mirror connection state into the shared store
    pub publish_state: bool,
    /// Persist per-window message rates
    pub record_rate_history: bool,
    pub history_retention_secs: u64,
    /// Records older than this are removed by the cleanup task
    pub state_max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            publish_state: true,
            record_rate_history: true,
            history_retention_secs: 24 * 60 * 60,
            state_max_age_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub enable_http: bool,
    pub listen_addr: String,
    pub metrics_path: String,
    /// "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            enable_http: true,
            listen_addr: "127.0.0.1:9090".to_string(),
            metrics_path: "/metrics".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsSection {
    pub console_output: bool,
    pub console_min_severity: AlertSeverity,
    /// JSON-lines alert log
    pub file_path: Option<PathBuf>,
    pub file_min_severity: AlertSeverity,
    pub rate_limit_secs: u64,
    pub auto_resolve_secs: u64,
}

impl Default for AlertsSection {
    fn default() -> Self {
        Self {
            console_output: true,
            console_min_severity: AlertSeverity::Warning,
            file_path: None,
            file_min_severity: AlertSeverity::Info,
            rate_limit_secs: 60,
            auto_resolve_secs: 300,
        }
    }
}

impl From<&AlertsSection> for AlertManagerConfig {
    fn from(section: &AlertsSection) -> Self {
        let mut outputs = Vec::new();
        if section.console_output {
            outputs.push(AlertOutput::Console {
                min_severity: section.console_min_severity,
            });
        }
        if let Some(path) = &section.file_path {
            outputs.push(AlertOutput::File {
                path: path.clone(),
                min_severity: section.file_min_severity,
            });
        }
        Self {
            outputs,
            rate_limit: Duration::from_secs(section.rate_limit_secs),
            auto_resolve: Duration::from_secs(section.auto_resolve_secs),
        }
    }
}

impl TetherConfig {
    pub fn health_config(&self, service: &ServiceConfig) -> HealthConfig {
        HealthConfig {
            health_check_interval: secs(self.health.health_check_interval_secs),
            expected_subscriptions: service.expected_subscriptions,
            max_consecutive_failures: self.health.max_consecutive_failures,
        }
    }

    pub fn supervisor_config(&self, service: &ServiceConfig) -> SupervisorConfig {
        SupervisorConfig {
            lifecycle: LifecycleConfig::from(&self.lifecycle),
            health: self.health_config(service),
            message_stats: MessageStatsConfig::from(&self.message_stats),
            requires_credential: service.requires_credential,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Negative and non-finite values clamp to zero; `validate` rejects them first
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
