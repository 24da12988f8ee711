//! Background Task Lifecycle
//!
//! Every periodic job (retention cleanup, reputation decay, load sampling,
//! replication sync) runs as a [`BackgroundTask`]: a single tokio task
//! driven by an interval and stopped through a one-shot signal. The
//! `active` flag makes `stop` safe to call any number of times.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Handle to a periodic job owned by a component
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    active: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`, starting one period from now
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Background task '{}' started ({:?})", task_name, period);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => tick().await,
                }
            }

            debug!("Background task '{}' exited", task_name);
        });

        Self {
            name,
            active: AtomicBool::new(true),
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Task name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has not been stopped yet
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal the task to exit
    ///
    /// Returns `true` only for the call that actually stopped the task.
    pub fn stop(&self) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let sender = self
            .stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            // The receiver is gone only if the task already finished
            let _ = sender.send(());
        }
        info!("Stopped background task '{}'", self.name);
        true
    }

    /// Stop the task and wait for the current tick to finish
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = BackgroundTask::spawn("counter", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.shutdown().await;
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_double_stop_is_noop() {
        let task = BackgroundTask::spawn("noop", Duration::from_secs(60), || async {});
        assert!(task.is_active());
        assert!(task.stop());
        assert!(!task.stop());
        assert!(!task.is_active());
        task.shutdown().await;
        task.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_tick_is_delayed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = BackgroundTask::spawn("delayed", Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        task.shutdown().await;
    }
}
