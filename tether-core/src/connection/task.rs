//! Task handles and periodic loops
//!
//! `TaskHandle` is what the reconnection guard inspects: it only needs to know
//! whether a task is still running and how to cancel it. `PeriodicLoop` is the
//! single interface for anything that runs a callback on a timer.

use crate::core::errors::{TetherError, TetherResult};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a spawned unit of work
pub trait TaskHandle: Send {
    fn is_finished(&self) -> bool;
    fn cancel(&self);
}

impl<T: Send + 'static> TaskHandle for JoinHandle<T> {
    fn is_finished(&self) -> bool {
        JoinHandle::is_finished(self)
    }

    fn cancel(&self) {
        self.abort();
    }
}

/// Start a task only if `current` is absent or finished
///
/// Returns the task now in flight and whether a new one was started. A
/// running task is never replaced, so at most one is outstanding.
pub fn start_if_idle<T, F>(current: Option<T>, start: F) -> (Option<T>, bool)
where
    T: TaskHandle,
    F: FnOnce() -> T,
{
    match current {
        Some(task) if !task.is_finished() => (Some(task), false),
        _ => (Some(start()), true),
    }
}

pub type LoopFuture = Pin<Box<dyn Future<Output = ControlFlow<()>> + Send>>;

/// Callback run on every tick; `Break` stops the loop
pub type LoopCallback = Arc<dyn Fn() -> LoopFuture + Send + Sync>;

/// Something that runs a callback periodically
pub trait PeriodicLoop: Send + Sync {
    /// Fails if the loop is already running
    fn start(&self, callback: LoopCallback) -> TetherResult<()>;

    /// Idempotent
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// `PeriodicLoop` on tokio's interval timer
///
/// The first tick fires immediately. Slow callbacks delay later ticks rather
/// than bursting to catch up.
pub struct IntervalLoop {
    name: String,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalLoop {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            handle: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl PeriodicLoop for IntervalLoop {
    fn start(&self, callback: LoopCallback) -> TetherResult<()> {
        if self.period.is_zero() {
            return Err(TetherError::validation(format!(
                "{}: loop period must be positive",
                self.name
            )));
        }

        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(TetherError::validation(format!(
                "{}: loop already running",
                self.name
            )));
        }

        let period = self.period;
        let name = self.name.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if callback().await.is_break() {
                    debug!(loop_name = %name, "Periodic loop finished");
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for IntervalLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_callback(counter: Arc<AtomicU32>, stop_after: u32) -> LoopCallback {
        Arc::new(move || -> LoopFuture {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= stop_after {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_loop_ticks_until_break() {
        let counter = Arc::new(AtomicU32::new(0));
        let looper = IntervalLoop::new("test", Duration::from_secs(1));
        looper.start(counting_callback(counter.clone(), 3)).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!looper.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_rejected_and_stop() {
        let counter = Arc::new(AtomicU32::new(0));
        let looper = IntervalLoop::new("test", Duration::from_secs(1));
        looper.start(counting_callback(counter.clone(), u32::MAX)).unwrap();
        assert!(looper.start(counting_callback(counter.clone(), u32::MAX)).is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        looper.stop();
        looper.stop();
        let seen = counter.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        assert!(!looper.is_running());
    }

    #[tokio::test]
    async fn test_start_if_idle_keeps_running_task() {
        let running: JoinHandle<()> = tokio::spawn(std::future::pending());
        let (task, started) = start_if_idle(Some(running), || tokio::spawn(async {}));
        assert!(!started);
        task.unwrap().cancel();

        let (task, started) = start_if_idle(None::<JoinHandle<()>>, || tokio::spawn(async {}));
        assert!(started);
        task.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_handle_as_task_handle() {
        let handle: JoinHandle<()> = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!TaskHandle::is_finished(&handle));
        handle.cancel();
        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
