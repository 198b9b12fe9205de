//! Time-ordered message-rate history
//!
//! One sorted set per service at `history:<service>`. Each sample is stored
//! with the unix timestamp as its score and `"<timestamp>:<count>"` as its
//! member, so two samples never collide even when their counts match.

use crate::core::errors::{TetherError, TetherResult};
use crate::store::kv::SharedStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const HISTORY_KEY_PREFIX: &str = "history:";

/// Default retention for rate samples
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One persisted rate sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSample {
    pub timestamp: f64,
    pub count: u64,
}

pub fn history_key(service: &str) -> String {
    format!("{}{}", HISTORY_KEY_PREFIX, service)
}

fn encode_member(timestamp: f64, count: u64) -> String {
    format!("{}:{}", timestamp, count)
}

fn decode_member(member: &str) -> Option<RateSample> {
    let (ts, count) = member.rsplit_once(':')?;
    Some(RateSample {
        timestamp: ts.parse().ok()?,
        count: count.parse().ok()?,
    })
}

/// Writes and reads rate samples for every service
#[derive(Clone)]
pub struct RateHistory {
    store: Arc<dyn SharedStore>,
    retention: Duration,
}

impl RateHistory {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_retention(store, DEFAULT_HISTORY_RETENTION)
    }

    pub fn with_retention(store: Arc<dyn SharedStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Append a sample and prune samples older than the retention window
    pub async fn record(&self, service: &str, timestamp: f64, count: u64) -> TetherResult<()> {
        let key = history_key(service);
        self.store
            .zadd(&key, timestamp, encode_member(timestamp, count))
            .await
            .map_err(|e| TetherError::store("history write", e.to_string()))?;

        let cutoff = timestamp - self.retention.as_secs_f64();
        let pruned = self
            .store
            .zrem_range_by_score(&key, f64::NEG_INFINITY, cutoff)
            .await
            .map_err(|e| TetherError::store("history prune", e.to_string()))?;
        if pruned > 0 {
            debug!(service, pruned, "Pruned expired rate samples");
        }
        Ok(())
    }

    /// Samples with `start <= timestamp <= end`, oldest first
    ///
    /// Members that do not decode are skipped.
    pub async fn window(&self, service: &str, start: f64, end: f64) -> TetherResult<Vec<RateSample>> {
        let members = self
            .store
            .zrange_by_score(&history_key(service), start, end)
            .await?;
        Ok(members
            .iter()
            .filter_map(|(member, _)| decode_member(member))
            .collect())
    }
}
