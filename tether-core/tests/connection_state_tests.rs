//! Connection state transitions and their distributed snapshot
//!
//! The state machine is driven through realistic reconnect cycles while a
//! `StatePublisher` mirrors it into an in-memory shared store. A second
//! reader (as another process would) then inspects the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_core::connection::state_machine::ConnectionStateMachine;
use tether_core::core::errors::TetherError;
use tether_core::core::state::ConnectionState;
use tether_core::resilience::backoff::BackoffType;
use tether_core::store::distributed::{
    filter_reconnecting_services, is_reconnecting, parse_all_states, serialize_state_info,
    state_key, ConnectionStateInfo, DistributedConnectionStateStore, ReconnectionEventKind,
};
use tether_core::store::kv::{InMemoryStore, SharedStore};
use tether_core::store::publisher::StatePublisher;
use tether_core::testing::{backoff_manager, deterministic_backoff, drive_to, manual_clock};

use ConnectionState::*;

// ============================================================================
// TRANSITION TABLE
// ============================================================================

#[test]
fn test_transition_table() {
    let allowed: &[(ConnectionState, &[ConnectionState])] = &[
        (Disconnected, &[Connecting, Reconnecting, Failed]),
        (Connecting, &[Connected, Reconnecting, Disconnected, Failed]),
        (
            Connected,
            &[Authenticated, Subscribed, Reconnecting, Disconnected, Failed],
        ),
        (Authenticated, &[Subscribed, Reconnecting, Disconnected, Failed]),
        (Subscribed, &[Reconnecting, Disconnected, Failed]),
        (Reconnecting, &[Connecting, Connected, Disconnected, Failed]),
        (Failed, &[Reconnecting, Connecting, Disconnected]),
    ];

    for (from, targets) in allowed {
        for to in ConnectionState::ALL {
            let expected = from == &to || targets.contains(&to);
            assert_eq!(
                from.can_transition_to(to),
                expected,
                "{} -> {} should be {}",
                from,
                to,
                if expected { "allowed" } else { "rejected" }
            );
        }
    }
}

#[test]
fn test_rejected_transition_leaves_state_untouched() {
    let clock = manual_clock(10.0);
    let machine = ConnectionStateMachine::new("kalshi", clock.clone());
    drive_to(&machine, Subscribed);

    let err = machine.transition_state(Authenticated, None).unwrap_err();
    assert!(matches!(
        err,
        TetherError::InvalidTransition {
            from: Subscribed,
            to: Authenticated,
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(machine.state(), Subscribed);
    assert_eq!(machine.history().len(), 3);
}

#[test]
fn test_reconnect_cycle_bookkeeping() {
    let clock = manual_clock(100.0);
    let backoff = backoff_manager(deterministic_backoff(5), clock.clone());
    let machine = ConnectionStateMachine::new("kalshi", clock.clone()).with_backoff(backoff.clone());
    drive_to(&machine, Subscribed);

    clock.set(110.0);
    machine
        .transition_state(Reconnecting, Some("socket reset"))
        .unwrap();
    let info = machine.snapshot();
    assert!(info.in_reconnection);
    assert_eq!(info.reconnection_start_time, Some(110.0));
    assert_eq!(info.error_context.as_deref(), Some("socket reset"));

    // The reconnection clock keeps its first start across retries
    clock.set(112.0);
    machine.transition_state(Connecting, None).unwrap();
    machine.transition_state(Reconnecting, Some("refused")).unwrap();
    assert_eq!(machine.snapshot().reconnection_start_time, Some(110.0));

    backoff.record_failure("kalshi", BackoffType::WebsocketConnection);
    clock.set(115.0);
    machine.transition_state(Connecting, None).unwrap();
    machine.transition_state(Connected, None).unwrap();

    let info = machine.snapshot();
    assert!(!info.in_reconnection);
    assert_eq!(info.reconnection_start_time, None);
    assert_eq!(info.last_successful_connection, Some(115.0));
    assert_eq!(info.error_context, None);
    // A successful connect clears every backoff type of the service
    assert!(backoff.get_all_backoff_status().is_empty());
}

// ============================================================================
// DISTRIBUTED SNAPSHOT
// ============================================================================

fn info(service: &str, state: ConnectionState, in_reconnection: bool, ts: f64) -> ConnectionStateInfo {
    let mut info = ConnectionStateInfo::new(service, state, ts);
    info.in_reconnection = in_reconnection;
    info
}

#[test]
fn test_is_reconnecting_truth_table() {
    for state in ConnectionState::ALL {
        for flag in [false, true] {
            let expected = flag || matches!(state, Reconnecting | Connecting);
            assert_eq!(is_reconnecting(&info("svc", state, flag, 0.0)), expected);
        }
    }
}

#[test]
fn test_parse_all_states_keeps_valid_entries() {
    let mut raw = HashMap::new();
    raw.insert(
        state_key("kalshi"),
        serialize_state_info(&info("kalshi", Reconnecting, true, 1.0)).unwrap(),
    );
    raw.insert(
        "polymarket".to_string(),
        serialize_state_info(&info("polymarket", Subscribed, false, 2.0)).unwrap(),
    );
    raw.insert("broken".to_string(), "{not json".to_string());
    raw.insert(
        "future".to_string(),
        r#"{"service_name":"future","state":"HIBERNATING","timestamp":1.0,"in_reconnection":false}"#
            .to_string(),
    );
    raw.insert(
        "partial".to_string(),
        r#"{"service_name":"partial","state":"CONNECTED"}"#.to_string(),
    );

    let parsed = parse_all_states(&raw);
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed["kalshi"].state, Reconnecting);
    assert_eq!(parsed["polymarket"].state, Subscribed);
    assert_eq!(filter_reconnecting_services(&parsed), vec!["kalshi".to_string()]);
}

#[tokio::test]
async fn test_reader_sees_other_writers_and_skips_garbage() {
    let clock = manual_clock(1_000.0);
    let shared: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let writer = DistributedConnectionStateStore::new(shared.clone(), clock.clone());
    let reader = DistributedConnectionStateStore::new(shared.clone(), clock.clone());

    writer
        .store_connection_state(&info("kalshi", Connecting, false, 1_000.0))
        .await
        .unwrap();
    writer
        .store_connection_state(&info("polymarket", Failed, true, 1_000.0))
        .await
        .unwrap();
    writer
        .store_connection_state(&info("betfair", Subscribed, false, 1_000.0))
        .await
        .unwrap();
    shared
        .set(&state_key("corrupt"), "\u{0}\u{1}".to_string())
        .await
        .unwrap();

    let all = reader.get_all_connection_states().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(
        reader.get_services_in_reconnection().await.unwrap(),
        vec!["kalshi".to_string(), "polymarket".to_string()]
    );
    assert_eq!(reader.get_connection_state("corrupt").await.unwrap(), None);
    assert_eq!(reader.get_connection_state("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_cleanup_removes_old_and_undecodable_records() {
    let clock = manual_clock(1_000.0);
    let shared = Arc::new(InMemoryStore::new());
    let store = DistributedConnectionStateStore::new(shared.clone(), clock.clone());

    store
        .store_connection_state(&info("old", Connected, false, 100.0))
        .await
        .unwrap();
    store
        .store_connection_state(&info("fresh", Connected, false, 900.0))
        .await
        .unwrap();
    shared.set(&state_key("corrupt"), "nope".to_string()).await.unwrap();
    shared.set("unrelated", "kept".to_string()).await.unwrap();

    let removed = store
        .cleanup_stale_states(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let remaining = store.get_all_connection_states().await.unwrap();
    assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["fresh"]);
    assert_eq!(shared.get("unrelated").await.unwrap().as_deref(), Some("kept"));

    assert_eq!(store.cleanup_stale_states(Duration::from_secs(300)).await.unwrap(), 0);
}

// ============================================================================
// PUBLISHER
// ============================================================================

#[tokio::test]
async fn test_publisher_mirrors_reconnect_cycle() {
    let clock = manual_clock(500.0);
    let store = DistributedConnectionStateStore::new(Arc::new(InMemoryStore::new()), clock.clone());
    let machine = ConnectionStateMachine::new("kalshi", clock.clone());
    drive_to(&machine, Subscribed);

    let publisher = StatePublisher::new(store.clone());
    let mut rx = machine.subscribe();
    let mut previous = rx.borrow_and_update().clone();
    publisher.publish(None, &previous).await;

    let steps: [(ConnectionState, Option<&str>, f64); 3] = [
        (Reconnecting, Some("remote closed"), 510.0),
        (Connecting, None, 511.0),
        (Connected, None, 514.0),
    ];
    for (state, context, at) in steps {
        clock.set(at);
        machine.transition_state(state, context).unwrap();
        let current = rx.borrow_and_update().clone();
        publisher.publish(Some(&previous), &current).await;

        let stored = store.get_connection_state("kalshi").await.unwrap().unwrap();
        assert_eq!(stored.updated_at, Some(at));
        assert_eq!(
            ConnectionStateInfo {
                updated_at: None,
                ..stored
            },
            current
        );
        previous = current;
    }

    let events = store
        .get_recent_reconnection_events("kalshi", Duration::from_secs(60))
        .await
        .unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            ReconnectionEventKind::ReconnectionStarted,
            ReconnectionEventKind::ReconnectionCompleted,
        ]
    );
    assert_eq!(events[0].details.as_deref(), Some("remote closed"));
    assert_eq!(events[1].details.as_deref(), Some("reconnected after 4.0s"));
    assert!(store.get_services_in_reconnection().await.unwrap().is_empty());
}
