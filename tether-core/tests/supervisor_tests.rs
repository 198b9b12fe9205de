//! Supervised connections end to end
//!
//! Uses the simulated feed, a manual clock for the resilience components,
//! and paused tokio time for sleeps and the health loop.

use parking_lot::Mutex;
use std::future::pending;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::connection::simulated::{SimulatedFeedFactory, SimulatedFeedOptions, ABNORMAL_CLOSURE};
use tether_core::connection::state_machine::ConnectionStateMachine;
use tether_core::connection::supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorContext};
use tether_core::core::state::ConnectionState;
use tether_core::monitoring::metrics::MetricsRegistry;
use tether_core::resilience::health::{HealthConfig, HealthMonitor};
use tether_core::resilience::message_stats::{MessageStatsCollector, MessageStatsConfig};
use tether_core::resilience::sequence::SequenceTracker;
use tether_core::store::distributed::DistributedConnectionStateStore;
use tether_core::store::kv::InMemoryStore;
use tether_core::store::publisher::StatePublisher;
use tether_core::testing::{
    backoff_manager, deterministic_backoff, drive_to, manual_clock, RecordingAlertSink,
};
use tether_core::utils::clock::ManualClock;
use tokio::task::JoinHandle;

struct Setup {
    supervisor: Arc<ConnectionSupervisor>,
    factory: Arc<SimulatedFeedFactory>,
    alerts: Arc<RecordingAlertSink>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<ManualClock>,
}

fn setup(options: SimulatedFeedOptions, requires_credential: bool) -> Setup {
    let clock = manual_clock(1_000.0);
    let alerts = Arc::new(RecordingAlertSink::new());
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let factory = Arc::new(SimulatedFeedFactory::new(options));

    let config = SupervisorConfig {
        health: HealthConfig {
            health_check_interval: Duration::from_secs(5),
            expected_subscriptions: 0,
            max_consecutive_failures: 3,
        },
        message_stats: MessageStatsConfig {
            measurement_interval: Duration::from_secs(1),
            silent_failure_threshold: Duration::from_secs(3_600),
        },
        requires_credential,
        ..Default::default()
    };

    let supervisor = ConnectionSupervisor::new(
        "kalshi",
        config,
        factory.clone(),
        SupervisorContext {
            clock: clock.clone(),
            backoff: backoff_manager(deterministic_backoff(5), clock.clone()),
            alerts: alerts.clone(),
            metrics: Some(metrics.clone()),
            history: None,
        },
    );

    Setup {
        supervisor,
        factory,
        alerts,
        metrics,
        clock,
    }
}

// ============================================================================
// READ LOOP
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_loop_counts_messages_and_gaps() {
    let s = setup(
        SimulatedFeedOptions {
            sids: vec![1, 2],
            gap_every: Some(5),
            ..Default::default()
        },
        false,
    );
    s.supervisor.connect_with_retry().await.unwrap();
    let transport = s.factory.latest().unwrap();

    let mut gaps = 0;
    for _ in 0..20 {
        let msg = transport.recv().await.unwrap();
        gaps += s.supervisor.record_message(msg.sid, msg.seq);
    }

    // Each sid skips 5 and 11 in its first ten messages
    assert_eq!(gaps, 4);
    let status = s.supervisor.get_status();
    assert_eq!(status.state, ConnectionState::Subscribed);
    assert_eq!(status.tracked_sids, vec![1, 2]);
    assert_eq!(status.total_gaps, 4);
    assert_eq!(status.total_messages, 20);

    let gap_metric = s
        .metrics
        .health()
        .sequence_gaps_total
        .with_label_values(&["kalshi"])
        .get();
    assert_eq!(gap_metric, 4);
}

#[tokio::test(start_paused = true)]
async fn test_credentialed_service_authenticates_before_subscribing() {
    let s = setup(SimulatedFeedOptions::default(), true);
    s.supervisor.connect_with_retry().await.unwrap();
    assert_eq!(s.supervisor.state_machine().state(), ConnectionState::Authenticated);

    s.supervisor.record_message(1, 1);
    let path: Vec<_> = s
        .supervisor
        .state_machine()
        .history()
        .iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        path,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticated,
            ConnectionState::Subscribed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_sequences_and_window() {
    let s = setup(SimulatedFeedOptions::default(), false);
    s.supervisor.connect_with_retry().await.unwrap();
    s.supervisor.record_message(1, 100);
    s.supervisor.record_message(1, 101);

    s.supervisor
        .state_machine()
        .transition_state(ConnectionState::Reconnecting, Some("test"))
        .unwrap();
    s.supervisor.connect_with_retry().await.unwrap();

    // A restarted stream does not count as a gap
    assert_eq!(s.supervisor.record_message(1, 1), 0);
    assert_eq!(s.supervisor.get_status().total_gaps, 0);
    assert_eq!(s.factory.open_transports(), 1);
}

// ============================================================================
// HEALTH-DRIVEN RECONNECTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_remote_close_recovers_and_is_published() {
    let s = setup(SimulatedFeedOptions::default(), false);
    let store = DistributedConnectionStateStore::new(Arc::new(InMemoryStore::new()), s.clock.clone());
    let publisher = StatePublisher::new(store.clone()).spawn(s.supervisor.state_machine().subscribe());

    s.supervisor.start().await.unwrap();
    let first = s.factory.latest().unwrap().id();

    s.factory.close_all_remote(ABNORMAL_CLOSURE);
    for _ in 0..6 {
        s.clock.advance(5.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        if s.factory.connect_calls() >= 2 && s.supervisor.state_machine().is_operational() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(s.supervisor.state_machine().is_operational());
    assert_ne!(s.factory.latest().unwrap().id(), first);
    assert_eq!(s.factory.open_transports(), 1);

    let failures = s
        .metrics
        .health()
        .health_check_failures_total
        .with_label_values(&["kalshi", "connection_down"])
        .get();
    assert!(failures >= 1);
    assert!(!s.alerts.health_alerts().is_empty());

    let stored = store.get_connection_state("kalshi").await.unwrap().unwrap();
    assert!(stored.state.is_operational());
    assert!(!stored.in_reconnection);

    s.supervisor.stop().await;
    publisher.abort();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_backoff_cancels_reconnection() {
    let s = setup(SimulatedFeedOptions::default(), false);
    s.factory.fail_next_connects(100);

    let supervisor = s.supervisor.clone();
    let task = tokio::spawn(async move { supervisor.connect_with_retry().await });
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    s.supervisor.stop().await;
    let result = task.await.unwrap();
    assert!(result.is_err());
    assert!(s.factory.connect_calls() < 5);
    assert_eq!(s.supervisor.state_machine().state(), ConnectionState::Disconnected);
    assert!(s.alerts.operator_alerts().is_empty());
}

// ============================================================================
// RECONNECTION GUARD
// ============================================================================

fn monitor(clock: Arc<ManualClock>) -> (HealthMonitor, Arc<ConnectionStateMachine>) {
    let machine = Arc::new(ConnectionStateMachine::new("kalshi", clock.clone()));
    let stats = Arc::new(MessageStatsCollector::new(
        "kalshi",
        MessageStatsConfig::default(),
        clock.clone(),
    ));
    let monitor = HealthMonitor::new(
        HealthConfig::default(),
        clock,
        machine.clone(),
        Arc::new(Mutex::new(SequenceTracker::new())),
        stats,
        Arc::new(RecordingAlertSink::new()),
    );
    (monitor, machine)
}

#[tokio::test]
async fn test_repeated_failures_never_double_reconnect() {
    let (monitor, machine) = monitor(manual_clock(0.0));
    drive_to(&machine, ConnectionState::Subscribed);

    let started = Arc::new(AtomicU32::new(0));
    let spawn_reconnect = || {
        let started = started.clone();
        move || -> JoinHandle<()> {
            started.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(pending::<()>())
        }
    };

    let mut task = None;
    for _ in 0..5 {
        let (passed, next) = monitor
            .check_and_handle_failure(|| async { false }, spawn_reconnect(), task)
            .await;
        assert!(!passed);
        task = next;
    }
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(machine.state(), ConnectionState::Disconnected);

    // Once the running task ends, the next failure starts a new one
    let finished = task.take().unwrap();
    finished.abort();
    while !finished.is_finished() {
        tokio::task::yield_now().await;
    }
    let (_, next) = monitor
        .check_and_handle_failure(|| async { false }, spawn_reconnect(), Some(finished))
        .await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    if let Some(handle) = next {
        handle.abort();
    }
}

#[tokio::test]
async fn test_passing_check_keeps_state_and_task() {
    let (monitor, machine) = monitor(manual_clock(0.0));
    drive_to(&machine, ConnectionState::Connected);

    let (passed, task) = monitor
        .check_and_handle_failure(
            || async { true },
            || -> JoinHandle<()> { panic!("no reconnect expected") },
            None,
        )
        .await;
    assert!(passed);
    assert!(task.is_none());
    assert_eq!(machine.state(), ConnectionState::Connected);
}
