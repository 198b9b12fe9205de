//! Connection ownership and supervision
//!
//! - `lifecycle`: opens and releases the transport, ping/pong liveness
//! - `state_machine`: authoritative state plus transition side effects
//! - `supervisor`: drives one connection end to end
//! - `task`: task handles and periodic loops
//! - `simulated`: in-process feed for tests and the monitor binary

pub mod lifecycle;
pub mod simulated;
pub mod state_machine;
pub mod supervisor;
pub mod task;

pub use lifecycle::{
    ConnectionFactory, ConnectionIssue, ConnectionLifecycle, HealthCheckResult, LifecycleConfig,
    Transport, TransportError,
};
pub use simulated::{
    FeedMessage, SimulatedFeedFactory, SimulatedFeedOptions, SimulatedTransport, ABNORMAL_CLOSURE,
};
pub use state_machine::{ConnectionStateMachine, StateTransition};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorContext, SupervisorStatus};
pub use task::{start_if_idle, IntervalLoop, LoopCallback, LoopFuture, PeriodicLoop, TaskHandle};
