// ============================
// crates/backend-lib/src/sweeper.rs
// ============================
//! Cancellable periodic background task.
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a task that runs `tick` every `interval` until stopped.
///
/// The task stops when [`PeriodicSweep::shutdown`] is called, when the handle
/// is dropped, or when `tick` returns `false` (its owner is gone).
#[derive(Debug)]
pub struct PeriodicSweep {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSweep {
    /// Spawn the task on the current tokio runtime
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of `interval` completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !tick().await {
                            tracing::debug!(task = name, "owner dropped, stopping sweep");
                            break;
                        }
                    }
                    // Either an explicit stop or the sender was dropped
                    _ = stopped.changed() => {
                        tracing::debug!(task = name, "sweep cancelled");
                        break;
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether the background task has already exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for PeriodicSweep {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let sweep = PeriodicSweep::spawn("test", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        sweep.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_tick_reports_owner_gone() {
        let sweep = PeriodicSweep::spawn("test", Duration::from_secs(1), || async { false });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sweep.is_finished());
    }
}
