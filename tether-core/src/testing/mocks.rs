use crate::core::errors::{TetherError, TetherResult};
use crate::monitoring::alerts::{AlertSink, HealthAlertKind};
use crate::store::kv::SharedStore;
use async_trait::async_trait;
use parking_lot::Mutex;

/// `AlertSink` that remembers every alert
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    health: Mutex<Vec<(String, HealthAlertKind)>>,
    operator: Mutex<Vec<(String, String)>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Health alerts as (message, kind), oldest first
    pub fn health_alerts(&self) -> Vec<(String, HealthAlertKind)> {
        self.health.lock().clone()
    }

    pub fn kinds(&self) -> Vec<HealthAlertKind> {
        self.health.lock().iter().map(|(_, kind)| *kind).collect()
    }

    /// Operator alerts as (service, message)
    pub fn operator_alerts(&self) -> Vec<(String, String)> {
        self.operator.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send_health_alert(&self, message: &str, kind: HealthAlertKind) -> TetherResult<()> {
        self.health.lock().push((message.to_string(), kind));
        Ok(())
    }

    async fn send_operator_alert(&self, service: &str, message: &str) -> TetherResult<()> {
        self.operator
            .lock()
            .push((service.to_string(), message.to_string()));
        Ok(())
    }
}

/// Store that is always unreachable
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

fn unreachable_store(operation: &str) -> TetherError {
    TetherError::store(operation, "store unreachable")
}

#[async_trait]
impl SharedStore for FailingStore {
    async fn set(&self, _key: &str, _value: String) -> TetherResult<()> {
        Err(unreachable_store("set"))
    }

    async fn get(&self, _key: &str) -> TetherResult<Option<String>> {
        Err(unreachable_store("get"))
    }

    async fn delete(&self, _key: &str) -> TetherResult<bool> {
        Err(unreachable_store("delete"))
    }

    async fn scan_prefix(&self, _prefix: &str) -> TetherResult<Vec<(String, String)>> {
        Err(unreachable_store("scan"))
    }

    async fn zadd(&self, _key: &str, _score: f64, _member: String) -> TetherResult<()> {
        Err(unreachable_store("zadd"))
    }

    async fn zrange_by_score(
        &self,
        _key: &str,
        _min: f64,
        _max: f64,
    ) -> TetherResult<Vec<(String, f64)>> {
        Err(unreachable_store("zrange"))
    }

    async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> TetherResult<usize> {
        Err(unreachable_store("zrem"))
    }
}
