//! Simulated market-data transport
//!
//! Stands in for a real websocket feed in tests and in the `tether-monitor`
//! binary. Failure modes are programmable:
//! - connect latency (to exercise timeouts)
//! - a number of upcoming connects that fail outright
//! - a number of upcoming connects that return an already-closed handle
//! - pong latency (to exercise liveness checks)
//! - remote close of every open handle
//! - periodic sequence gaps in the generated message stream

use crate::connection::lifecycle::{ConnectionFactory, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Close code used for abnormal remote closure
pub const ABNORMAL_CLOSURE: u16 = 1006;
const NORMAL_CLOSURE: u16 = 1000;

/// Knobs for the simulated feed
#[derive(Debug, Clone)]
pub struct SimulatedFeedOptions {
    pub connect_latency: Duration,
    pub pong_latency: Duration,
    /// Spacing between generated messages
    pub message_interval: Duration,
    /// Subscription ids the feed publishes on
    pub sids: Vec<u64>,
    /// Skip one sequence number every N messages per sid
    pub gap_every: Option<u64>,
}

impl Default for SimulatedFeedOptions {
    fn default() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            pong_latency: Duration::ZERO,
            message_interval: Duration::from_millis(100),
            sids: vec![1],
            gap_every: None,
        }
    }
}

/// One generated feed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedMessage {
    pub sid: u64,
    pub seq: u64,
}

/// Handle produced by `SimulatedFeedFactory`
pub struct SimulatedTransport {
    id: u32,
    remote_close: Mutex<Option<u16>>,
    local_closed: AtomicBool,
    pong_latency: Arc<Mutex<Duration>>,
    message_interval: Duration,
    sids: Vec<u64>,
    gap_every: Option<u64>,
    emitted: AtomicU64,
}

impl SimulatedTransport {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn close_remote(&self, code: u16) {
        *self.remote_close.lock() = Some(code);
    }

    pub fn is_locally_closed(&self) -> bool {
        self.local_closed.load(Ordering::Acquire)
    }

    /// Next feed message, or `None` once the handle is closed
    ///
    /// Sids are served round-robin; each sid numbers its messages from 1.
    pub async fn recv(&self) -> Option<FeedMessage> {
        if self.close_code().is_some() || self.sids.is_empty() {
            return None;
        }
        tokio::time::sleep(self.message_interval).await;
        if self.close_code().is_some() {
            return None;
        }

        let n = self.emitted.fetch_add(1, Ordering::AcqRel);
        let sid_count = self.sids.len() as u64;
        let sid = self.sids[(n % sid_count) as usize];
        let per_sid = n / sid_count + 1;
        let skipped = self.gap_every.map_or(0, |every| per_sid / every.max(1));
        Some(FeedMessage {
            sid,
            seq: per_sid + skipped,
        })
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn close_code(&self) -> Option<u16> {
        if let Some(code) = *self.remote_close.lock() {
            return Some(code);
        }
        if self.local_closed.load(Ordering::Acquire) {
            return Some(NORMAL_CLOSURE);
        }
        None
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.local_closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.close_code().is_some() {
            return Err("ping on closed transport".into());
        }
        let latency = *self.pong_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    fail_remaining: u32,
    dead_on_arrival_remaining: u32,
    transports: Vec<Arc<SimulatedTransport>>,
}

/// `ConnectionFactory` producing `SimulatedTransport`s
pub struct SimulatedFeedFactory {
    options: SimulatedFeedOptions,
    pong_latency: Arc<Mutex<Duration>>,
    connect_calls: AtomicU32,
    state: Mutex<FactoryState>,
}

impl SimulatedFeedFactory {
    pub fn new(options: SimulatedFeedOptions) -> Self {
        Self {
            pong_latency: Arc::new(Mutex::new(options.pong_latency)),
            options,
            connect_calls: AtomicU32::new(0),
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// The next `n` connects fail with a transport error
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    /// The next `n` connects return a handle that is already closed
    pub fn dead_on_arrival_next(&self, n: u32) {
        self.state.lock().dead_on_arrival_remaining = n;
    }

    pub fn set_pong_latency(&self, latency: Duration) {
        *self.pong_latency.lock() = latency;
    }

    /// Remote side drops every handle that is still open
    pub fn close_all_remote(&self, code: u16) {
        for transport in &self.state.lock().transports {
            if transport.close_code().is_none() {
                transport.close_remote(code);
            }
        }
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::Acquire)
    }

    /// Handles not yet closed locally
    pub fn open_transports(&self) -> usize {
        self.state
            .lock()
            .transports
            .iter()
            .filter(|t| !t.is_locally_closed())
            .count()
    }

    /// Most recently opened handle
    pub fn latest(&self) -> Option<Arc<SimulatedTransport>> {
        self.state.lock().transports.last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedFeedFactory {
    async fn connect(&self, service: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let attempt = self.connect_calls.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(service, attempt, "Simulated connect");

        if !self.options.connect_latency.is_zero() {
            tokio::time::sleep(self.options.connect_latency).await;
        }

        let mut state = self.state.lock();
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(format!("{}: simulated connect failure", service).into());
        }

        let transport = Arc::new(SimulatedTransport {
            id: attempt,
            remote_close: Mutex::new(None),
            local_closed: AtomicBool::new(false),
            pong_latency: self.pong_latency.clone(),
            message_interval: self.options.message_interval,
            sids: self.options.sids.clone(),
            gap_every: self.options.gap_every,
            emitted: AtomicU64::new(0),
        });

        if state.dead_on_arrival_remaining > 0 {
            state.dead_on_arrival_remaining -= 1;
            transport.close_remote(ABNORMAL_CLOSURE);
        }

        state.transports.push(transport.clone());
        Ok(transport)
    }
}
