//! Shared key-value storage and what is kept in it
//!
//! - `kv`: the `SharedStore` abstraction and an in-process implementation
//! - `distributed`: cross-process connection-state records and reconnection events
//! - `history`: per-service message-rate history
//! - `publisher`: follows a state machine and writes its snapshots

pub mod distributed;
pub mod history;
pub mod kv;
pub mod publisher;

pub use distributed::{
    filter_reconnecting_services, is_reconnecting, parse_all_states, ConnectionStateInfo,
    DistributedConnectionStateStore, ReconnectionEvent, ReconnectionEventKind,
};
pub use history::{RateHistory, RateSample};
pub use kv::{InMemoryStore, SharedStore};
pub use publisher::StatePublisher;
