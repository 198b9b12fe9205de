//! Physical transport lifecycle
//!
//! Opens the transport through an injected `ConnectionFactory` under a hard
//! timeout, validates the handle, and guarantees release on every exit path.
//!
//! ```text
//! establish_connection()
//!   ├─ cleanup previous handle
//!   ├─ factory.connect() under connection_timeout
//!   │    ├─ elapsed        → TetherError::Timeout
//!   │    └─ transport err  → TetherError::Connection
//!   ├─ store handle
//!   └─ close_code present  → TetherError::Connection (dead on arrival)
//! ```
//!
//! Every failure branch closes and clears the stored handle before the error
//! propagates. If the caller's future is dropped mid-connect, a drop guard
//! clears the handle and schedules the close on the runtime.
//!
//! Transport errors are boxed and never escape this module unmapped.

use crate::core::errors::{TetherError, TetherResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error type surfaced by transport implementations
pub type TransportError = Box<dyn StdError + Send + Sync>;

/// A duplex, message-oriented connection handle
#[async_trait]
pub trait Transport: Send + Sync {
    /// Terminal close code, if the remote or local side closed the connection
    fn close_code(&self) -> Option<u16>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Resolves once the matching pong arrives
    async fn ping(&self) -> Result<(), TransportError>;
}

/// Opens transports for a service
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, service: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Lifecycle timing
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Deadline for `factory.connect()`
    pub connection_timeout: Duration,
    /// Minimum spacing between liveness pings
    pub ping_interval: Duration,
    /// Deadline for a pong
    pub pong_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> TetherResult<()> {
        if self.connection_timeout.is_zero() {
            return Err(TetherError::validation("connection_timeout must be positive"));
        }
        if self.pong_timeout.is_zero() {
            return Err(TetherError::validation("pong_timeout must be positive"));
        }
        Ok(())
    }
}

/// Why a liveness check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionIssue {
    ConnectionMissing,
    ConnectionClosed,
    PongTimeout,
}

impl fmt::Display for ConnectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionMissing => "connection_missing",
            Self::ConnectionClosed => "connection_closed",
            Self::PongTimeout => "pong_timeout",
        };
        f.write_str(name)
    }
}

/// Outcome of `check_connection_health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthCheckResult {
    Healthy,
    Unhealthy(ConnectionIssue),
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

type Slot = Arc<Mutex<Option<Arc<dyn Transport>>>>;

/// Clears the slot if dropped while armed
struct CleanupGuard {
    slot: Slot,
    service: Arc<str>,
    armed: bool,
}

impl CleanupGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(transport) = self.slot.lock().take() else {
            return;
        };
        warn!(service = %self.service, "Connect attempt abandoned, releasing transport");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let service = self.service.clone();
            runtime.spawn(async move {
                if let Err(e) = transport.close().await {
                    debug!(service = %service, "Close after abandoned connect failed: {}", e);
                }
            });
        }
    }
}

/// Owns the transport handle of one service
pub struct ConnectionLifecycle {
    service: Arc<str>,
    config: LifecycleConfig,
    factory: Arc<dyn ConnectionFactory>,
    connection: Slot,
    last_ping: Mutex<Option<Instant>>,
}

impl ConnectionLifecycle {
    pub fn new(
        service: impl Into<String>,
        config: LifecycleConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            service: Arc::from(service.into()),
            config,
            factory,
            connection: Arc::new(Mutex::new(None)),
            last_ping: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Open a fresh transport, replacing any previous one
    pub async fn establish_connection(&self) -> TetherResult<Arc<dyn Transport>> {
        self.cleanup_connection().await;

        let guard = CleanupGuard {
            slot: self.connection.clone(),
            service: self.service.clone(),
            armed: true,
        };

        debug!(service = %self.service, "Opening transport");
        let opened =
            tokio::time::timeout(self.config.connection_timeout, self.factory.connect(&self.service))
                .await;

        let transport = match opened {
            Err(_) => {
                self.cleanup_connection().await;
                guard.disarm();
                warn!(
                    service = %self.service,
                    "Connection attempt timed out after {:?}",
                    self.config.connection_timeout
                );
                return Err(TetherError::Timeout {
                    service: self.service.to_string(),
                    timeout: self.config.connection_timeout,
                });
            }
            Ok(Err(e)) => {
                self.cleanup_connection().await;
                guard.disarm();
                warn!(service = %self.service, "Transport failed to open: {}", e);
                return Err(TetherError::connection(self.service.as_ref(), e.to_string()));
            }
            Ok(Ok(transport)) => transport,
        };

        *self.connection.lock() = Some(transport.clone());

        if let Some(code) = transport.close_code() {
            self.cleanup_connection().await;
            guard.disarm();
            warn!(service = %self.service, code, "Transport closed before first use");
            return Err(TetherError::connection(
                self.service.as_ref(),
                format!("connection closed immediately with code {}", code),
            ));
        }

        guard.disarm();
        *self.last_ping.lock() = Some(Instant::now());
        info!(service = %self.service, "Transport established");
        Ok(transport)
    }

    /// Close and clear the stored handle; safe to call repeatedly
    pub async fn cleanup_connection(&self) {
        let transport = self.connection.lock().take();
        *self.last_ping.lock() = None;

        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(service = %self.service, "Error closing transport: {}", e);
            }
            debug!(service = %self.service, "Transport released");
        }
    }

    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.connection.lock().clone()
    }

    /// Handle present and not closed
    pub fn is_open(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|t| t.close_code().is_none())
    }

    /// Liveness probe: handle present, not closed, and answering pings
    ///
    /// A ping is sent at most once per `ping_interval`.
    pub async fn check_connection_health(&self) -> HealthCheckResult {
        let Some(transport) = self.current() else {
            return HealthCheckResult::Unhealthy(ConnectionIssue::ConnectionMissing);
        };

        if let Some(code) = transport.close_code() {
            debug!(service = %self.service, code, "Transport reports closed");
            return HealthCheckResult::Unhealthy(ConnectionIssue::ConnectionClosed);
        }

        let last_ping = *self.last_ping.lock();
        let due = last_ping.map_or(true, |at| at.elapsed() >= self.config.ping_interval);
        if !due {
            return HealthCheckResult::Healthy;
        }

        *self.last_ping.lock() = Some(Instant::now());
        match tokio::time::timeout(self.config.pong_timeout, transport.ping()).await {
            Ok(Ok(())) => HealthCheckResult::Healthy,
            Ok(Err(e)) => {
                warn!(service = %self.service, "Ping failed: {}", e);
                HealthCheckResult::Unhealthy(ConnectionIssue::PongTimeout)
            }
            Err(_) => {
                warn!(
                    service = %self.service,
                    "No pong within {:?}",
                    self.config.pong_timeout
                );
                HealthCheckResult::Unhealthy(ConnectionIssue::PongTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::simulated::{SimulatedFeedFactory, SimulatedFeedOptions};
    use crate::core::errors::ErrorClass;

    fn lifecycle(options: SimulatedFeedOptions) -> (ConnectionLifecycle, Arc<SimulatedFeedFactory>) {
        let factory = Arc::new(SimulatedFeedFactory::new(options));
        let config = LifecycleConfig {
            connection_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(1),
        };
        (ConnectionLifecycle::new("kalshi", config, factory.clone()), factory)
    }

    #[tokio::test]
    async fn test_establish_and_cleanup() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions::default());

        lifecycle.establish_connection().await.unwrap();
        assert!(lifecycle.is_open());
        assert_eq!(factory.connect_calls(), 1);

        lifecycle.cleanup_connection().await;
        lifecycle.cleanup_connection().await;
        assert!(lifecycle.current().is_none());
        assert_eq!(factory.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_handle() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions::default());

        lifecycle.establish_connection().await.unwrap();
        lifecycle.establish_connection().await.unwrap();
        assert_eq!(factory.connect_calls(), 2);
        assert_eq!(factory.open_transports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_timeout_class() {
        let (lifecycle, _) = lifecycle(SimulatedFeedOptions {
            connect_latency: Duration::from_secs(5),
            ..Default::default()
        });

        let err = lifecycle.establish_connection().await.err().unwrap();
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(lifecycle.current().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_is_remapped() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions::default());
        factory.fail_next_connects(1);

        let err = lifecycle.establish_connection().await.err().unwrap();
        assert_eq!(err.class(), ErrorClass::Connection);
        assert!(err.to_string().contains("simulated connect failure"));
    }

    #[tokio::test]
    async fn test_dead_on_arrival_is_failure() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions::default());
        factory.dead_on_arrival_next(1);

        let err = lifecycle.establish_connection().await.err().unwrap();
        assert!(err.to_string().contains("closed immediately"));
        assert!(lifecycle.current().is_none());
        assert_eq!(factory.open_transports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_health_checks() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions::default());
        assert_eq!(
            lifecycle.check_connection_health().await,
            HealthCheckResult::Unhealthy(ConnectionIssue::ConnectionMissing)
        );

        lifecycle.establish_connection().await.unwrap();
        assert!(lifecycle.check_connection_health().await.is_healthy());

        // Ping due, pong never arrives
        factory.set_pong_latency(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            lifecycle.check_connection_health().await,
            HealthCheckResult::Unhealthy(ConnectionIssue::PongTimeout)
        );

        factory.close_all_remote(1006);
        assert_eq!(
            lifecycle.check_connection_health().await,
            HealthCheckResult::Unhealthy(ConnectionIssue::ConnectionClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_leaves_no_handle() {
        let (lifecycle, factory) = lifecycle(SimulatedFeedOptions {
            connect_latency: Duration::from_millis(500),
            ..Default::default()
        });
        let lifecycle = Arc::new(lifecycle);

        let task = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.establish_connection().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        let _ = task.await;

        assert!(lifecycle.current().is_none());
        assert_eq!(factory.open_transports(), 0);
    }
}
