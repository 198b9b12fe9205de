//! Network health signal consumed by the backoff engine
//!
//! The backoff delay is stretched by `network_degraded_multiplier` whenever
//! the injected monitor reports the host network as degraded or offline.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Host network health, as seen by an external probe
pub trait NetworkHealthMonitor: Send + Sync {
    fn is_network_healthy(&self) -> bool;
    fn is_network_degraded(&self) -> bool;
    fn is_network_offline(&self) -> bool;
}

/// Discrete network status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Healthy = 0,
    Degraded = 1,
    Offline = 2,
}

impl NetworkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Degraded,
            2 => Self::Offline,
            _ => Self::Healthy,
        }
    }
}

/// Settable network status shared between a probe task and consumers
#[derive(Debug)]
pub struct SharedNetworkStatus {
    status: AtomicU8,
}

impl SharedNetworkStatus {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
        }
    }

    pub fn healthy() -> Self {
        Self::new(NetworkStatus::Healthy)
    }

    pub fn set(&self, status: NetworkStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

impl Default for SharedNetworkStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

impl NetworkHealthMonitor for SharedNetworkStatus {
    fn is_network_healthy(&self) -> bool {
        self.status() == NetworkStatus::Healthy
    }

    fn is_network_degraded(&self) -> bool {
        self.status() == NetworkStatus::Degraded
    }

    fn is_network_offline(&self) -> bool {
        self.status() == NetworkStatus::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_status_transitions() {
        let status = SharedNetworkStatus::healthy();
        assert!(status.is_network_healthy());

        status.set(NetworkStatus::Degraded);
        assert!(status.is_network_degraded());
        assert!(!status.is_network_healthy());

        status.set(NetworkStatus::Offline);
        assert!(status.is_network_offline());
        assert!(!status.is_network_degraded());
    }
}
