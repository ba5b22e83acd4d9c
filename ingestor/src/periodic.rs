use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle to a spawned periodic task. Dropping it does not stop the task;
/// call [`PeriodicTask::stop`].
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Runs `tick` every `period` until cancelled. The first tick fires
    /// immediately. A tick that overruns the period delays the next one
    /// instead of queueing a burst, so ticks never overlap.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(task = name, "tick");
                        tick().await;
                    }
                }
            }

            info!(task = name, "periodic task stopped");
        });

        PeriodicTask {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancels the task and waits for an in-progress tick to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Prevents two overlapping executions of the same job.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    running: AtomicBool,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a permit if nobody else holds one. The guard is released when
    /// the permit drops, including on early return or panic.
    pub fn try_enter(&self) -> Option<GuardPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct GuardPermit<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}
