//! HTTP server for metrics and connection status
//!
//! Endpoints:
//! - `/metrics`: Prometheus text format
//! - `/health`: 200 when every supervised connection is operational, 503 otherwise
//! - `/status`: JSON with backoff state, distributed connection states, the
//!   reconnecting-service list, and per-supervisor status

use super::MetricsRegistry;
use crate::connection::supervisor::{ConnectionSupervisor, SupervisorStatus};
use crate::resilience::backoff::{BackoffManager, BackoffStatus};
use crate::store::distributed::{
    filter_reconnecting_services, ConnectionStateInfo, DistributedConnectionStateStore,
};
use crate::utils::clock::Clock;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

/// Body of `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: f64,
    pub backoff: HashMap<String, BackoffStatus>,
    pub connections: HashMap<String, ConnectionStateInfo>,
    pub reconnecting: Vec<String>,
    pub supervisors: Vec<SupervisorStatus>,
}

/// Everything `/status` and `/health` read from
#[derive(Clone)]
pub struct StatusSource {
    clock: Arc<dyn Clock>,
    backoff: Arc<BackoffManager>,
    store: Option<DistributedConnectionStateStore>,
    supervisors: Vec<Arc<ConnectionSupervisor>>,
}

impl StatusSource {
    pub fn new(clock: Arc<dyn Clock>, backoff: Arc<BackoffManager>) -> Self {
        Self {
            clock,
            backoff,
            store: None,
            supervisors: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: DistributedConnectionStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<ConnectionSupervisor>) -> Self {
        self.supervisors.push(supervisor);
        self
    }

    /// Snapshot for `/status`; an unreachable store leaves its sections empty
    pub async fn report(&self) -> StatusReport {
        let connections = match &self.store {
            Some(store) => store.get_all_connection_states().await.unwrap_or_else(|e| {
                warn!("Distributed state unavailable: {}", e);
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        StatusReport {
            generated_at: self.clock.now(),
            backoff: self.backoff.get_all_backoff_status(),
            reconnecting: filter_reconnecting_services(&connections),
            connections,
            supervisors: self.supervisors.iter().map(|s| s.get_status()).collect(),
        }
    }

    /// Services whose local state is not operational
    pub fn unhealthy_services(&self) -> Vec<String> {
        self.supervisors
            .iter()
            .filter(|s| !s.state_machine().is_operational())
            .map(|s| s.service().to_string())
            .collect()
    }
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<MetricsRegistry>,
    status: Option<StatusSource>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            registry,
            status: None,
        }
    }

    pub fn with_status(mut self, status: StatusSource) -> Self {
        self.status = Some(status);
        self
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .context("Failed to bind metrics server")?;

        info!(
            "Metrics server listening on http://{}{}",
            self.config.listen_addr, self.config.metrics_path
        );

        let routes = Arc::new(Routes {
            registry: self.registry,
            metrics_path: self.config.metrics_path,
            status: self.status,
        });

        tokio::pin!(shutdown);
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Metrics server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let routes = routes.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let routes = routes.clone();
                    async move { Ok::<_, hyper::Error>(routes.handle(req.uri().path()).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

struct Routes {
    registry: Arc<MetricsRegistry>,
    metrics_path: String,
    status: Option<StatusSource>,
}

impl Routes {
    async fn handle(&self, path: &str) -> Response<Full<Bytes>> {
        debug!("Monitoring request: {}", path);

        if path == self.metrics_path {
            return match self.registry.render() {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        format!("Error: {}", e),
                    )
                }
            };
        }

        match path {
            "/health" | "/healthz" => {
                let unhealthy = self
                    .status
                    .as_ref()
                    .map(StatusSource::unhealthy_services)
                    .unwrap_or_default();
                if unhealthy.is_empty() {
                    respond(StatusCode::OK, "text/plain", "OK".to_string())
                } else {
                    respond(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "text/plain",
                        format!("UNHEALTHY: {}", unhealthy.join(", ")),
                    )
                }
            }
            "/status" => {
                let Some(source) = &self.status else {
                    return respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string());
                };
                match serde_json::to_string(&source.report().await) {
                    Ok(json) => respond(StatusCode::OK, "application/json", json),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        format!("Error: {}", e),
                    ),
                }
            }
            "/" => respond(
                StatusCode::OK,
                "text/plain",
                format!(
                    "Tether connection monitor\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Health check\n  /status - Connection status (JSON)\n",
                    self.metrics_path
                ),
            ),
            _ => {
                warn!("Unknown monitoring endpoint requested: {}", path);
                respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())
            }
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
