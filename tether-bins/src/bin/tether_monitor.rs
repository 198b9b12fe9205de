//! Supervised market-data connections against the simulated feed
//!
//! This binary combines:
//! - one `ConnectionSupervisor` per configured service
//! - state publishing into the shared store, with periodic stale-record cleanup
//! - Prometheus metrics and JSON status over HTTP
//! - optional chaos: periodic remote closes to exercise reconnection
//!
//! Run with `--chaos-interval-secs 30` and watch `/status` to see services
//! drop, back off, and recover.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tether_bins::common::{
    init_logging, load_config, print_stats, shutdown_signal, wait_for_shutdown, CommonArgs,
};
use tether_core::config::{ServiceConfig, TetherConfig};
use tether_core::connection::{
    ConnectionSupervisor, IntervalLoop, LoopCallback, LoopFuture, PeriodicLoop, SimulatedFeedFactory,
    SimulatedFeedOptions, SupervisorContext, Transport, ABNORMAL_CLOSURE,
};
use tether_core::monitoring::{
    AlertManager, MetricsRegistry, MetricsServer, MetricsServerConfig, StatusSource,
};
use tether_core::resilience::{BackoffManager, SharedNetworkStatus};
use tether_core::store::{
    DistributedConnectionStateStore, InMemoryStore, RateHistory, SharedStore, StatePublisher,
};
use tether_core::utils::{Clock, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise simulated market-data feeds")]
struct MonitorArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Spacing between simulated feed messages
    #[arg(long, default_value = "100")]
    message_interval_ms: u64,

    /// Skip one sequence number every N messages per sid
    #[arg(long)]
    gap_every: Option<u64>,

    /// Remotely close every feed on this period
    #[arg(long)]
    chaos_interval_secs: Option<u64>,
}

struct Supervised {
    supervisor: Arc<ConnectionSupervisor>,
    factory: Arc<SimulatedFeedFactory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MonitorArgs::parse();
    let config = load_config(&args.common)?;
    init_logging(&config)?;

    info!("=== Tether: connection monitor (simulated feeds) ===");
    let shutdown = shutdown_signal()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    let alerts = Arc::new(
        AlertManager::new(config.alert_manager_config(), clock.clone()).with_metrics(metrics.clone()),
    );

    let mut backoff = BackoffManager::new(
        config.backoff_config(),
        Arc::new(SharedNetworkStatus::healthy()),
        clock.clone(),
    )
    .with_metrics(metrics.clone());
    for (backoff_type, type_config) in config.backoff.overrides() {
        info!("Backoff override for {}: max_attempts={}", backoff_type, type_config.max_attempts);
        backoff = backoff.with_type_config(backoff_type, type_config);
    }
    let backoff = Arc::new(backoff);

    let shared: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let state_store = DistributedConnectionStateStore::new(shared.clone(), clock.clone());
    let history = config.store.record_rate_history.then(|| {
        RateHistory::with_retention(
            shared.clone(),
            Duration::from_secs(config.store.history_retention_secs),
        )
    });

    let ctx = SupervisorContext {
        clock: clock.clone(),
        backoff: backoff.clone(),
        alerts,
        metrics: Some(metrics.clone()),
        history,
    };

    let services = configured_services(&config);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut supervised = Vec::with_capacity(services.len());

    for service in &services {
        let factory = Arc::new(SimulatedFeedFactory::new(SimulatedFeedOptions {
            message_interval: Duration::from_millis(args.message_interval_ms.max(1)),
            sids: service.sids.clone(),
            gap_every: args.gap_every,
            ..Default::default()
        }));
        let supervisor = ConnectionSupervisor::new(
            service.name.clone(),
            config.supervisor_config(service),
            factory.clone(),
            ctx.clone(),
        );

        if config.store.publish_state {
            // Refresh well inside the cleanup age so quiet services keep their record
            let refresh = Duration::from_secs(config.store.state_max_age_secs) / 3;
            tasks.push(
                StatePublisher::new(state_store.clone())
                    .with_refresh_interval(refresh)
                    .spawn(supervisor.state_machine().subscribe()),
            );
        }

        if let Err(e) = supervisor.start().await {
            error!(service = %service.name, "Initial connection failed: {}", e);
        }
        tasks.push(tokio::spawn(read_loop(
            supervisor.clone(),
            factory.clone(),
            shutdown.clone(),
        )));

        supervised.push(Supervised { supervisor, factory });
    }

    let cleanup = start_cleanup_loop(&config, state_store.clone(), backoff.clone())?;

    if let Some(secs) = args.chaos_interval_secs.filter(|s| *s > 0) {
        let factories: Vec<_> = supervised.iter().map(|s| s.factory.clone()).collect();
        tasks.push(tokio::spawn(chaos_loop(
            factories,
            Duration::from_secs(secs),
            shutdown.clone(),
        )));
    }

    if config.monitoring.enable_http {
        let listen_addr: SocketAddr = config
            .monitoring
            .listen_addr
            .parse()
            .context("Invalid monitoring.listen_addr")?;
        let mut status = StatusSource::new(clock.clone(), backoff.clone()).with_store(state_store.clone());
        for s in &supervised {
            status = status.with_supervisor(s.supervisor.clone());
        }

        let server = MetricsServer::new(
            MetricsServerConfig {
                listen_addr,
                metrics_path: config.monitoring.metrics_path.clone(),
            },
            metrics.clone(),
        )
        .with_status(status);

        let server_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(wait_for_shutdown(server_shutdown)).await {
                error!("Metrics server stopped: {:#}", e);
            }
        }));
    }

    info!("Supervising {} service(s); press Ctrl+C to stop", supervised.len());
    wait_for_shutdown(shutdown).await;

    cleanup.stop();
    for s in &supervised {
        s.supervisor.stop().await;
        print_stats(&s.supervisor.get_status());
    }
    // Let publishers write the final DISCONNECTED snapshots
    tokio::time::sleep(Duration::from_millis(100)).await;
    for task in tasks {
        task.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

fn configured_services(config: &TetherConfig) -> Vec<ServiceConfig> {
    if config.services.is_empty() {
        warn!("No services configured, supervising a single 'simulated' feed");
        return vec![ServiceConfig::new("simulated")];
    }
    config.services.clone()
}

/// Feed every message of the current transport into the supervisor
///
/// Follows reconnections: once a transport closes, waits for the next one.
async fn read_loop(
    supervisor: Arc<ConnectionSupervisor>,
    factory: Arc<SimulatedFeedFactory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = supervisor.service().to_string();
    loop {
        if *shutdown.borrow() {
            return;
        }

        let Some(transport) = factory.latest().filter(|t| t.close_code().is_none()) else {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
            continue;
        };

        debug!(service = %service, transport = transport.id(), "Reading feed");
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                message = transport.recv() => match message {
                    Some(message) => {
                        supervisor.record_message(message.sid, message.seq);
                    }
                    None => {
                        debug!(service = %service, "Feed closed, waiting for reconnection");
                        break;
                    }
                },
            }
        }
    }
}

async fn chaos_loop(
    factories: Vec<Arc<SimulatedFeedFactory>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(period) => {}
        }
        if *shutdown.borrow() {
            return;
        }
        warn!("Chaos: closing every feed remotely");
        for factory in &factories {
            factory.close_all_remote(ABNORMAL_CLOSURE);
        }
    }
}

/// Periodically drop stale connection records and idle backoff state
fn start_cleanup_loop(
    config: &TetherConfig,
    state_store: DistributedConnectionStateStore,
    backoff: Arc<BackoffManager>,
) -> Result<IntervalLoop> {
    let max_age = Duration::from_secs(config.store.state_max_age_secs);
    let cleanup = IntervalLoop::new(
        "store-cleanup",
        Duration::from_secs(config.store.cleanup_interval_secs),
    );

    let callback: LoopCallback = Arc::new(move || -> LoopFuture {
        let state_store = state_store.clone();
        let backoff = backoff.clone();
        Box::pin(async move {
            match state_store.cleanup_stale_states(max_age).await {
                Ok(removed) if removed > 0 => debug!("Removed {} stale state records", removed),
                Ok(_) => {}
                Err(e) => warn!("State cleanup failed: {}", e),
            }
            let expired = backoff.cleanup_old_state(max_age);
            if expired > 0 {
                debug!("Dropped {} idle backoff entries", expired);
            }
            ControlFlow::Continue(())
        })
    });
    cleanup.start(callback)?;
    Ok(cleanup)
}
