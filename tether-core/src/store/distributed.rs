//! Cross-process connection-state snapshot
//!
//! Each process persists its own connection state under
//! `connection_state:<service>` so dashboards and ops tooling can see every
//! service at once. The store is a best-effort cache; the in-memory state
//! machine of the owning process stays authoritative.
//!
//! Record schema (optional fields are omitted when absent):
//!
//! ```json
//! {"service_name":"kalshi","state":"RECONNECTING","timestamp":1700000000.0,
//!  "in_reconnection":true,"error_context":"Health check failed"}
//! ```
//!
//! Readers are tolerant: malformed payloads and unknown state strings decode
//! to `None` and are dropped from bulk reads.
//!
//! `timestamp` is the time of the last transition. Every write also stamps
//! `updated_at`, and staleness is judged on that, so a long-lived state kept
//! fresh by its publisher is never swept.

use crate::core::errors::{TetherError, TetherResult};
use crate::core::state::ConnectionState;
use crate::store::kv::SharedStore;
use crate::utils::clock::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const STATE_KEY_PREFIX: &str = "connection_state:";
pub const EVENT_KEY_PREFIX: &str = "reconnection_events:";

/// Reconnection events older than this are pruned on write
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// The unit persisted to the shared store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStateInfo {
    pub service_name: String,
    pub state: ConnectionState,
    pub timestamp: f64,
    pub in_reconnection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnection_start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<f64>,
    /// Time of the last write, set by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<f64>,
}

impl ConnectionStateInfo {
    pub fn new(service_name: impl Into<String>, state: ConnectionState, timestamp: f64) -> Self {
        Self {
            service_name: service_name.into(),
            state,
            timestamp,
            in_reconnection: false,
            error_context: None,
            reconnection_start_time: None,
            last_successful_connection: None,
            updated_at: None,
        }
    }

    /// Last write time, or the transition time for records written without one
    pub fn last_seen(&self) -> f64 {
        self.updated_at.unwrap_or(self.timestamp)
    }
}

pub fn state_key(service: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, service)
}

fn event_key(service: &str) -> String {
    format!("{}{}", EVENT_KEY_PREFIX, service)
}

pub fn serialize_state_info(info: &ConnectionStateInfo) -> TetherResult<String> {
    serde_json::to_string(info).map_err(|e| TetherError::store("serialize state", e.to_string()))
}

/// `None` for malformed JSON, missing fields, or unknown states
pub fn deserialize_state_info(raw: &str) -> Option<ConnectionStateInfo> {
    match serde_json::from_str(raw) {
        Ok(info) => Some(info),
        Err(e) => {
            debug!("Discarding unreadable connection state record: {}", e);
            None
        }
    }
}

/// Decode a full snapshot, keyed by service name
///
/// Keys may be bare service names or full `connection_state:` keys.
/// Invalid entries are dropped; valid ones are kept.
pub fn parse_all_states(raw: &HashMap<String, String>) -> HashMap<String, ConnectionStateInfo> {
    raw.iter()
        .filter_map(|(key, value)| {
            let service = key.strip_prefix(STATE_KEY_PREFIX).unwrap_or(key);
            deserialize_state_info(value).map(|info| (service.to_string(), info))
        })
        .collect()
}

/// True iff `in_reconnection` is set or the state is RECONNECTING/CONNECTING
pub fn is_reconnecting(info: &ConnectionStateInfo) -> bool {
    info.in_reconnection || info.state.is_reconnecting()
}

/// Services currently reconnecting, sorted by name
pub fn filter_reconnecting_services(all_states: &HashMap<String, ConnectionStateInfo>) -> Vec<String> {
    let mut services: Vec<String> = all_states
        .iter()
        .filter(|(_, info)| is_reconnecting(info))
        .map(|(service, _)| service.clone())
        .collect();
    services.sort();
    services
}

/// Reconnection event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionEventKind {
    ReconnectionStarted,
    ReconnectionCompleted,
    ReconnectionFailed,
}

impl fmt::Display for ReconnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReconnectionStarted => "reconnection_started",
            Self::ReconnectionCompleted => "reconnection_completed",
            Self::ReconnectionFailed => "reconnection_failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionEvent {
    pub service_name: String,
    pub event_type: ReconnectionEventKind,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Reads and writes connection state in the shared store
#[derive(Clone)]
pub struct DistributedConnectionStateStore {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl DistributedConnectionStateStore {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn store_connection_state(&self, info: &ConnectionStateInfo) -> TetherResult<()> {
        let stamped = ConnectionStateInfo {
            updated_at: Some(self.clock.now()),
            ..info.clone()
        };
        let payload = serialize_state_info(&stamped)?;
        self.store
            .set(&state_key(&info.service_name), payload)
            .await
            .map_err(|e| TetherError::store("store state", e.to_string()))?;
        debug!(
            service = %info.service_name,
            state = %info.state,
            in_reconnection = info.in_reconnection,
            "Connection state published"
        );
        Ok(())
    }

    pub async fn get_connection_state(&self, service: &str) -> TetherResult<Option<ConnectionStateInfo>> {
        let raw = self.store.get(&state_key(service)).await?;
        Ok(raw.as_deref().and_then(deserialize_state_info))
    }

    pub async fn get_all_connection_states(&self) -> TetherResult<HashMap<String, ConnectionStateInfo>> {
        let raw: HashMap<String, String> = self
            .store
            .scan_prefix(STATE_KEY_PREFIX)
            .await?
            .into_iter()
            .collect();
        Ok(parse_all_states(&raw))
    }

    pub async fn get_services_in_reconnection(&self) -> TetherResult<Vec<String>> {
        let all = self.get_all_connection_states().await?;
        Ok(filter_reconnecting_services(&all))
    }

    /// Delete records not written within `max_age`, and records that no longer decode
    pub async fn cleanup_stale_states(&self, max_age: Duration) -> TetherResult<usize> {
        let cutoff = self.clock.now() - max_age.as_secs_f64();
        let mut removed = 0;

        for (key, value) in self.store.scan_prefix(STATE_KEY_PREFIX).await? {
            let stale = match deserialize_state_info(&value) {
                Some(info) => info.last_seen() < cutoff,
                None => true,
            };
            if stale && self.store.delete(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} stale connection state records", removed);
        }
        Ok(removed)
    }

    pub async fn record_reconnection_event(
        &self,
        service: &str,
        kind: ReconnectionEventKind,
        details: Option<String>,
    ) -> TetherResult<()> {
        let now = self.clock.now();
        let event = ReconnectionEvent {
            service_name: service.to_string(),
            event_type: kind,
            timestamp: now,
            details,
        };
        let member = serde_json::to_string(&event)
            .map_err(|e| TetherError::store("serialize event", e.to_string()))?;

        let key = event_key(service);
        self.store.zadd(&key, now, member).await?;
        self.store
            .zrem_range_by_score(&key, f64::NEG_INFINITY, now - EVENT_RETENTION.as_secs_f64())
            .await?;
        Ok(())
    }

    /// Events within the last `window`, oldest first
    pub async fn get_recent_reconnection_events(
        &self,
        service: &str,
        window: Duration,
    ) -> TetherResult<Vec<ReconnectionEvent>> {
        let now = self.clock.now();
        let members = self
            .store
            .zrange_by_score(&event_key(service), now - window.as_secs_f64(), f64::INFINITY)
            .await?;

        Ok(members
            .iter()
            .filter_map(|(member, _)| match serde_json::from_str(member) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(service, "Skipping unreadable reconnection event: {}", e);
                    None
                }
            })
            .collect())
    }
}
