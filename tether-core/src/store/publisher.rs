//! Mirrors a state machine's snapshots into the distributed store
//!
//! The publisher follows the state machine's `watch` channel. Every snapshot
//! it sees is written with `store_connection_state`, and reconnection
//! boundaries are recorded as events. Writes are best-effort: failures are
//! logged and the publisher keeps going. Snapshots may be skipped if several
//! transitions happen between two polls; only the latest is written.
//!
//! Between transitions the latest snapshot is rewritten every
//! `refresh_interval`, keeping the record's `updated_at` ahead of
//! `cleanup_stale_states`. Keep the interval well under the cleanup age.

use crate::core::state::ConnectionState;
use crate::store::distributed::{
    ConnectionStateInfo, DistributedConnectionStateStore, ReconnectionEventKind,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Rewrite period for an unchanged state
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnection event implied by moving from `previous` to `current`
pub fn reconnection_event_for(
    previous: Option<&ConnectionStateInfo>,
    current: &ConnectionStateInfo,
) -> Option<(ReconnectionEventKind, Option<String>)> {
    let was_reconnecting = previous.is_some_and(|p| p.in_reconnection);

    if current.in_reconnection && !was_reconnecting {
        return Some((
            ReconnectionEventKind::ReconnectionStarted,
            current.error_context.clone(),
        ));
    }

    if !was_reconnecting {
        return None;
    }

    match current.state {
        ConnectionState::Connected
        | ConnectionState::Authenticated
        | ConnectionState::Subscribed => {
            let details = previous
                .and_then(|p| p.reconnection_start_time)
                .map(|start| format!("reconnected after {:.1}s", current.timestamp - start));
            Some((ReconnectionEventKind::ReconnectionCompleted, details))
        }
        ConnectionState::Failed => Some((
            ReconnectionEventKind::ReconnectionFailed,
            current.error_context.clone(),
        )),
        _ => None,
    }
}

pub struct StatePublisher {
    store: DistributedConnectionStateStore,
    refresh_interval: Duration,
}

impl StatePublisher {
    pub fn new(store: DistributedConnectionStateStore) -> Self {
        Self {
            store,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Zero is replaced by the default
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        if !refresh_interval.is_zero() {
            self.refresh_interval = refresh_interval;
        }
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Write `current` and any reconnection event it implies
    pub async fn publish(
        &self,
        previous: Option<&ConnectionStateInfo>,
        current: &ConnectionStateInfo,
    ) {
        if let Err(e) = self.store.store_connection_state(current).await {
            warn!(
                service = %current.service_name,
                "Failed to publish connection state: {}",
                e
            );
        }

        if let Some((kind, details)) = reconnection_event_for(previous, current) {
            debug!(service = %current.service_name, event = %kind, "Reconnection event");
            if let Err(e) = self
                .store
                .record_reconnection_event(&current.service_name, kind, details)
                .await
            {
                warn!(
                    service = %current.service_name,
                    "Failed to record reconnection event: {}",
                    e
                );
            }
        }
    }

    /// Publish until the state machine is dropped
    pub async fn run(self, mut rx: watch::Receiver<ConnectionStateInfo>) {
        let mut previous = rx.borrow_and_update().clone();
        self.publish(None, &previous).await;

        let mut refresh = interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = rx.borrow_and_update().clone();
                    self.publish(Some(&previous), &current).await;
                    previous = current;
                    refresh.reset();
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.store.store_connection_state(&previous).await {
                        warn!(
                            service = %previous.service_name,
                            "Failed to refresh connection state: {}",
                            e
                        );
                    }
                }
            }
        }
        debug!(service = %previous.service_name, "State publisher finished");
    }

    pub fn spawn(self, rx: watch::Receiver<ConnectionStateInfo>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::state_machine::ConnectionStateMachine;
    use crate::store::kv::InMemoryStore;
    use crate::testing::FailingStore;
    use crate::utils::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn snapshot(state: ConnectionState, in_reconnection: bool, ts: f64) -> ConnectionStateInfo {
        let mut info = ConnectionStateInfo::new("kalshi", state, ts);
        info.in_reconnection = in_reconnection;
        info
    }

    #[test]
    fn test_event_for_reconnection_start_and_completion() {
        let connected = snapshot(ConnectionState::Connected, false, 1.0);
        let mut reconnecting = snapshot(ConnectionState::Reconnecting, true, 2.0);
        reconnecting.reconnection_start_time = Some(2.0);
        reconnecting.error_context = Some("Health check failed".into());

        let (kind, details) = reconnection_event_for(Some(&connected), &reconnecting).unwrap();
        assert_eq!(kind, ReconnectionEventKind::ReconnectionStarted);
        assert_eq!(details.as_deref(), Some("Health check failed"));

        let back = snapshot(ConnectionState::Connected, false, 5.5);
        let (kind, details) = reconnection_event_for(Some(&reconnecting), &back).unwrap();
        assert_eq!(kind, ReconnectionEventKind::ReconnectionCompleted);
        assert_eq!(details.as_deref(), Some("reconnected after 3.5s"));
    }

    #[test]
    fn test_event_for_failure_and_noise() {
        let reconnecting = snapshot(ConnectionState::Connecting, true, 2.0);
        let failed = snapshot(ConnectionState::Failed, false, 3.0);
        let (kind, _) = reconnection_event_for(Some(&reconnecting), &failed).unwrap();
        assert_eq!(kind, ReconnectionEventKind::ReconnectionFailed);

        // Staying inside a reconnection, or ordinary moves, emit nothing
        assert!(reconnection_event_for(Some(&reconnecting), &reconnecting).is_none());
        let connected = snapshot(ConnectionState::Connected, false, 1.0);
        let subscribed = snapshot(ConnectionState::Subscribed, false, 1.5);
        assert!(reconnection_event_for(Some(&connected), &subscribed).is_none());
        assert!(reconnection_event_for(None, &connected).is_none());
    }

    #[tokio::test]
    async fn test_publisher_follows_state_machine() {
        let clock = Arc::new(ManualClock::new(100.0));
        let kv = Arc::new(InMemoryStore::new());
        let store = DistributedConnectionStateStore::new(kv, clock.clone());
        let machine = ConnectionStateMachine::new("kalshi", clock.clone());

        let handle = StatePublisher::new(store.clone()).spawn(machine.subscribe());

        machine
            .transition_state(ConnectionState::Reconnecting, Some("connection lost"))
            .unwrap();
        tokio::task::yield_now().await;
        clock.advance(2.0);
        machine
            .transition_state(ConnectionState::Connecting, None)
            .unwrap();
        tokio::task::yield_now().await;
        machine
            .transition_state(ConnectionState::Connected, None)
            .unwrap();
        drop(machine);
        handle.await.unwrap();

        let stored = store.get_connection_state("kalshi").await.unwrap().unwrap();
        assert_eq!(stored.state, ConnectionState::Connected);
        assert!(!stored.in_reconnection);

        let kinds: Vec<_> = store
            .get_recent_reconnection_events("kalshi", Duration::from_secs(60))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ReconnectionEventKind::ReconnectionStarted,
                ReconnectionEventKind::ReconnectionCompleted,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_survives_cleanup() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let store = DistributedConnectionStateStore::new(Arc::new(InMemoryStore::new()), clock.clone());
        let machine = ConnectionStateMachine::new("kalshi", clock.clone());
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Subscribed,
        ] {
            machine.transition_state(state, None).unwrap();
        }

        let handle = StatePublisher::new(store.clone())
            .with_refresh_interval(Duration::from_secs(100))
            .spawn(machine.subscribe());

        // Six quiet minutes in SUBSCRIBED
        for _ in 0..3 {
            clock.advance(120.0);
            tokio::time::sleep(Duration::from_secs(120)).await;
        }

        assert_eq!(store.cleanup_stale_states(Duration::from_secs(300)).await.unwrap(), 0);
        let stored = store.get_connection_state("kalshi").await.unwrap().unwrap();
        assert_eq!(stored.state, ConnectionState::Subscribed);
        assert_eq!(stored.timestamp, 1000.0);
        assert_eq!(stored.updated_at, Some(1360.0));

        // Without the publisher the record ages out
        handle.abort();
        clock.advance(360.0);
        assert_eq!(store.cleanup_stale_states(Duration::from_secs(300)).await.unwrap(), 1);
        assert!(store.get_connection_state("kalshi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_survives_store_failure() {
        let clock = Arc::new(ManualClock::new(0.0));
        let store = DistributedConnectionStateStore::new(Arc::new(FailingStore), clock);
        let publisher = StatePublisher::new(store);

        let reconnecting = snapshot(ConnectionState::Reconnecting, true, 1.0);
        publisher.publish(None, &reconnecting).await;
    }
}
