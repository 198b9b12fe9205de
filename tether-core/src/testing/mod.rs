//! Test doubles and helpers shared by unit and integration tests
//!
//! - `RecordingAlertSink`: captures health and operator alerts
//! - `FailingStore`: a `SharedStore` whose every operation errors
//! - builders for clocks and backoff managers with deterministic settings

pub mod helpers;
pub mod mocks;

pub use helpers::*;
pub use mocks::{FailingStore, RecordingAlertSink};
