//! Runtime configuration
//!
//! Layers, lowest precedence first: built-in defaults, a TOML file, then
//! environment variables prefixed `TETHER` with `__` as the separator
//! (`TETHER__MONITORING__LOG_LEVEL=debug`).

pub mod types;

pub use types::*;

use crate::core::errors::{TetherError, TetherResult};
use crate::monitoring::alerts::AlertManagerConfig;
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::message_stats::MessageStatsConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::connection::lifecycle::LifecycleConfig;
use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl TetherConfig {
    /// Load from a TOML file with environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_layers(Some(path.as_ref()))
    }

    /// Defaults plus environment overrides only
    pub fn from_env() -> Result<Self> {
        Self::load_layers(None)
    }

    fn load_layers(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix("TETHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let cfg: TetherConfig = loaded
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate().context("Invalid configuration")?;
        Ok(cfg)
    }

    /// Reject malformed configuration; never retried
    pub fn validate(&self) -> TetherResult<()> {
        self.backoff.defaults.to_config().validate()?;
        for (key, params) in &self.backoff.per_type {
            if backoff_type_for_key(key).is_none() {
                return Err(TetherError::validation(format!(
                    "unknown backoff type '{}' in backoff.per_type",
                    key
                )));
            }
            params.to_config().validate()?;
        }

        RateLimiterConfig::from(&self.rate_limiter).validate()?;
        LifecycleConfig::from(&self.lifecycle).validate()?;
        MessageStatsConfig::from(&self.message_stats).validate()?;

        if self.store.cleanup_interval_secs == 0 || self.store.state_max_age_secs == 0 {
            return Err(TetherError::validation(
                "store cleanup interval and max age must be positive",
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            return Err(TetherError::validation(format!(
                "invalid log level '{}', must be one of {:?}",
                self.monitoring.log_level, VALID_LOG_LEVELS
            )));
        }
        if self.monitoring.enable_http {
            self.monitoring
                .listen_addr
                .parse::<SocketAddr>()
                .map_err(|e| {
                    TetherError::validation(format!(
                        "invalid monitoring.listen_addr '{}': {}",
                        self.monitoring.listen_addr, e
                    ))
                })?;
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(TetherError::validation("service name must not be empty"));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(TetherError::validation(format!(
                    "duplicate service '{}'",
                    service.name
                )));
            }
            let has_credential = service
                .credential
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty());
            if service.requires_credential && !has_credential {
                return Err(TetherError::validation(format!(
                    "service '{}' requires a credential but none is configured",
                    service.name
                )));
            }
            self.health_config(service).validate()?;
        }

        Ok(())
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        self.backoff.defaults.to_config()
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::from(&self.rate_limiter)
    }

    pub fn alert_manager_config(&self) -> AlertManagerConfig {
        AlertManagerConfig::from(&self.alerts)
    }
}
