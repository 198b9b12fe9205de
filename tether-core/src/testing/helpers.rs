//! Builders with deterministic settings (no jitter, manual time)

use crate::connection::state_machine::ConnectionStateMachine;
use crate::core::state::ConnectionState;
use crate::resilience::backoff::{BackoffConfig, BackoffManager};
use crate::resilience::network::{NetworkHealthMonitor, SharedNetworkStatus};
use crate::utils::clock::ManualClock;
use std::sync::Arc;
use std::time::Duration;

pub fn manual_clock(start: f64) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start))
}

/// 1s initial delay, doubling, 60s cap, no jitter
pub fn deterministic_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
        jitter_range: 0.0,
        max_attempts,
        network_degraded_multiplier: 2.0,
    }
}

/// Backoff manager on a healthy network
pub fn backoff_manager(config: BackoffConfig, clock: Arc<ManualClock>) -> Arc<BackoffManager> {
    backoff_manager_with_network(config, clock, Arc::new(SharedNetworkStatus::healthy()))
}

pub fn backoff_manager_with_network(
    config: BackoffConfig,
    clock: Arc<ManualClock>,
    network: Arc<dyn NetworkHealthMonitor>,
) -> Arc<BackoffManager> {
    Arc::new(BackoffManager::new(config, network, clock))
}

/// Walk a fresh state machine up to `target` through valid transitions
pub fn drive_to(machine: &ConnectionStateMachine, target: ConnectionState) {
    use ConnectionState::*;

    let path: &[ConnectionState] = match target {
        Disconnected => &[],
        Connecting => &[Connecting],
        Connected => &[Connecting, Connected],
        Authenticated => &[Connecting, Connected, Authenticated],
        Subscribed => &[Connecting, Connected, Subscribed],
        Reconnecting => &[Reconnecting],
        Failed => &[Failed],
    };
    for state in path {
        if let Err(e) = machine.transition_state(*state, None) {
            panic!("cannot drive state machine to {}: {}", target, e);
        }
    }
}
