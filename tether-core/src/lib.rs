//! Tether Core - connection resilience for market-data websocket feeds
//!
//! Keeps long-lived feed connections alive and observable: explicit connection
//! states, per-failure-type exponential backoff, three-stage health checks
//! (connection, subscriptions, data flow), sequence gap tracking, silent-failure
//! detection, and a cross-process snapshot of every connection's state.
//!
//! ## Core Modules
//! - `core`: connection state enum and error taxonomy
//! - `config`: layered configuration (defaults, TOML, environment)
//! - `resilience`: backoff, REST rate limiting, sequence tracking, message
//!   stats, health monitoring
//! - `connection`: transport lifecycle, state machine, supervisor
//! - `store`: shared key-value store, distributed state, rate history
//! - `monitoring`: Prometheus metrics, alerts, HTTP status server
//! - `utils`: clock and logger
//! - `testing`: test doubles

pub mod config;
pub mod connection;
pub mod core;
pub mod monitoring;
pub mod resilience;
pub mod store;
pub mod testing;
pub mod utils;

pub use crate::config::TetherConfig;
pub use crate::connection::{ConnectionLifecycle, ConnectionStateMachine, ConnectionSupervisor};
pub use crate::core::{ConnectionState, ErrorClass, TetherError, TetherResult};
pub use crate::resilience::{
    BackoffManager, BackoffType, HealthMonitor, MessageStatsCollector, RateLimiter,
    SequenceTracker,
};
pub use crate::store::DistributedConnectionStateStore;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{ServiceConfig, TetherConfig};
    pub use crate::connection::{
        ConnectionFactory, ConnectionLifecycle, ConnectionStateMachine, ConnectionSupervisor,
        SupervisorConfig, SupervisorContext, Transport,
    };
    pub use crate::core::{ConnectionState, ErrorClass, TetherError, TetherResult};
    pub use crate::monitoring::{AlertSink, HealthAlertKind, MetricsRegistry};
    pub use crate::resilience::{
        BackoffConfig, BackoffManager, BackoffType, HealthConfig, HealthMonitor,
        MessageStatsCollector, MessageStatsConfig, RateLimiter, SequenceTracker,
    };
    pub use crate::store::{
        ConnectionStateInfo, DistributedConnectionStateStore, InMemoryStore, SharedStore,
    };
    pub use crate::utils::{Clock, SystemClock};
}
