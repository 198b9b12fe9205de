//! Retry, throttling, and health policies
//!
//! - `backoff`: per-(service, failure type) exponential backoff with jitter
//! - `rate_limiter`: 429-driven throttle for outbound REST calls
//! - `network`: host network health consulted by backoff
//! - `sequence`: per-sid sequence gap tracking
//! - `message_stats`: message rate and silent-failure detection
//! - `health`: three-stage connection health checks

pub mod backoff;
pub mod health;
pub mod message_stats;
pub mod network;
pub mod rate_limiter;
pub mod sequence;

pub use backoff::{BackoffConfig, BackoffManager, BackoffState, BackoffStatus, BackoffType};
pub use health::{HealthAlertKind, HealthConfig, HealthMonitor, HealthReport};
pub use message_stats::{MessageStats, MessageStatsCollector, MessageStatsConfig};
pub use network::{NetworkHealthMonitor, NetworkStatus, SharedNetworkStatus};
pub use rate_limiter::{parse_retry_after, RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use sequence::{SequenceTracker, TrackingState};
