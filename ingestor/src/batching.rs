use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{
    BUFFER_SIZE, FLUSH_LATENCY_SECONDS, READINGS_PERSISTED_TOTAL, READING_FAILURES_TOTAL,
};
use crate::model::{AlertStatus, TelemetryReading};
use crate::repository::Repository;

pub const MODERATE_THRESHOLD: i32 = 1700;
pub const SEVERE_THRESHOLD: i32 = 2500;

/// Maps a raw alcohol level onto its alert band.
pub fn alert_status_for(alcohol_level: i32) -> AlertStatus {
    if alcohol_level >= SEVERE_THRESHOLD {
        AlertStatus::CompletelyDrunk
    } else if alcohol_level >= MODERATE_THRESHOLD {
        AlertStatus::ModerateDrunk
    } else {
        AlertStatus::Normal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherSettings {
    /// Buffer length that triggers a flush without waiting for the timer.
    pub max_batch: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        BatcherSettings {
            max_batch: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Buffers readings in memory and writes them to the repository in batches.
pub struct TelemetryBatcher {
    repo: Arc<dyn Repository>,
    settings: BatcherSettings,
    buffer: Mutex<Vec<TelemetryReading>>,
    flush_requested: Notify,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TelemetryBatcher {
    pub fn new(repo: Arc<dyn Repository>, settings: BatcherSettings) -> Self {
        TelemetryBatcher {
            repo,
            settings,
            buffer: Mutex::new(Vec::with_capacity(settings.max_batch)),
            flush_requested: Notify::new(),
            worker: Mutex::new(None),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<TelemetryReading>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> BatcherSettings {
        self.settings
    }

    pub fn enqueue(&self, reading: TelemetryReading) {
        let len = {
            let mut buffer = self.buffer();
            buffer.push(reading);
            buffer.len()
        };
        BUFFER_SIZE.set(len as f64);

        if len >= self.settings.max_batch {
            debug!("Buffer reached {} readings, requesting flush", len);
            self.flush_requested.notify_one();
        }
    }

    /// Readings waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    /// Swaps the buffer out and persists each reading on its own, so one bad
    /// record cannot block the rest. Failed readings are put back at the front
    /// of the buffer when `retry_on_error` is set, otherwise dropped.
    /// Returns how many readings were persisted.
    pub async fn flush(&self, retry_on_error: bool) -> usize {
        let batch = std::mem::take(&mut *self.buffer());
        BUFFER_SIZE.set(self.pending() as f64);
        if batch.is_empty() {
            return 0;
        }

        let batch_len = batch.len();
        debug!("Flushing batch of {} readings", batch_len);
        let start = Instant::now();

        let mut persisted = 0;
        let mut failed = Vec::new();
        for reading in batch {
            match self.repo.create_device_data(&reading).await {
                Ok(()) => persisted += 1,
                Err(e) => {
                    READING_FAILURES_TOTAL.inc();
                    warn!(
                        device_id = %reading.device_id,
                        error = %e,
                        "Failed to persist reading"
                    );
                    failed.push(reading);
                }
            }
        }

        READINGS_PERSISTED_TOTAL.inc_by(persisted as f64);
        FLUSH_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        if !failed.is_empty() {
            if retry_on_error {
                let requeued = failed.len();
                let mut buffer = self.buffer();
                failed.append(&mut buffer);
                *buffer = failed;
                BUFFER_SIZE.set(buffer.len() as f64);
                warn!("Requeued {} readings for the next flush", requeued);
            } else {
                error!(
                    "{} of {} readings dropped after failed insert",
                    failed.len(),
                    batch_len
                );
            }
        }

        debug!(
            "Flushed {}/{} readings in {:.3}s",
            persisted,
            batch_len,
            start.elapsed().as_secs_f64()
        );
        persisted
    }

    /// Spawns the flush loop: every `flush_interval`, and whenever the buffer
    /// fills up. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(cancel.clone()));
        *worker = Some((cancel, handle));
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Starting batcher with max_batch={}, flush_interval_ms={}",
            self.settings.max_batch,
            self.settings.flush_interval.as_millis()
        );

        let mut ticker = interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                // Buffer is full
                _ = self.flush_requested.notified() => {
                    self.flush(false).await;
                }

                // Periodic flush timer
                _ = ticker.tick() => {
                    self.flush(false).await;
                }
            }
        }

        info!("Batcher stopped");
    }

    /// Stops the flush loop, then flushes once with requeueing so transient
    /// failures get one more chance before exit.
    pub async fn shutdown(&self) -> usize {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = worker {
            cancel.cancel();
            let _ = handle.await;
        }

        let persisted = self.flush(true).await;
        let remaining = self.pending();
        if remaining > 0 {
            error!(
                "Shutdown flush persisted {} readings, {} could not be written",
                persisted, remaining
            );
        } else {
            info!("Shutdown flush persisted {} readings", persisted);
        }
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use chrono::Utc;
    use rand::Rng;

    fn batcher(repo: &Arc<MemoryRepository>) -> Arc<TelemetryBatcher> {
        Arc::new(TelemetryBatcher::new(repo.clone(), BatcherSettings::default()))
    }

    fn reading(device_id: &str, level: i32) -> TelemetryReading {
        TelemetryReading::new(device_id, level, Utc::now())
    }

    #[test]
    fn test_alert_bands() {
        assert_eq!(alert_status_for(0), AlertStatus::Normal);
        assert_eq!(alert_status_for(1699), AlertStatus::Normal);
        assert_eq!(alert_status_for(1700), AlertStatus::ModerateDrunk);
        assert_eq!(alert_status_for(2499), AlertStatus::ModerateDrunk);
        assert_eq!(alert_status_for(2500), AlertStatus::CompletelyDrunk);
        assert_eq!(alert_status_for(-5), AlertStatus::Normal);
    }

    #[test]
    fn test_alert_bands_are_monotonic() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let a: i32 = rng.gen_range(0..5000);
            let b: i32 = rng.gen_range(a..=5000);
            assert!(alert_status_for(a) as u8 <= alert_status_for(b) as u8);
        }
    }

    #[tokio::test]
    async fn test_flush_persists_in_order() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        for level in [10, 20, 30] {
            batcher.enqueue(reading("D1", level));
        }

        assert_eq!(batcher.flush(false).await, 3);
        assert_eq!(batcher.pending(), 0);
        let levels: Vec<_> = repo.readings().iter().map(|r| r.alcohol_level).collect();
        assert_eq!(levels, vec![10, 20, 30]);
        assert_eq!(batcher.flush(false).await, 0);
    }

    #[tokio::test]
    async fn test_failed_readings_dropped_without_retry() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        repo.fail_inserts_for("BAD");
        batcher.enqueue(reading("D1", 1));
        batcher.enqueue(reading("BAD", 2));
        batcher.enqueue(reading("D1", 3));

        assert_eq!(batcher.flush(false).await, 2);
        assert_eq!(batcher.pending(), 0);
        assert_eq!(repo.reading_count(), 2);

        repo.clear_insert_failures();
        batcher.enqueue(reading("BAD", 4));
        assert_eq!(batcher.flush(false).await, 1);
        assert_eq!(repo.reading_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_readings_requeued_ahead_of_new_ones() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        repo.fail_next_inserts(1);
        batcher.enqueue(reading("D1", 1));
        batcher.enqueue(reading("D1", 2));

        assert_eq!(batcher.flush(true).await, 1);
        assert_eq!(batcher.pending(), 1);

        batcher.enqueue(reading("D1", 3));
        assert_eq!(batcher.flush(true).await, 2);
        let levels: Vec<_> = repo.readings().iter().map(|r| r.alcohol_level).collect();
        assert_eq!(levels, vec![2, 1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_small_batches() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        batcher.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for level in 0..7 {
            batcher.enqueue(reading("D1", level));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(repo.reading_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(repo.reading_count(), 7);
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_flushes_immediately() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        batcher.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for level in 0..100 {
            batcher.enqueue(reading("D1", level));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(repo.reading_count(), 100);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining() {
        let repo = Arc::new(MemoryRepository::new());
        let batcher = batcher(&repo);
        batcher.start();
        batcher.enqueue(reading("D1", 1800));
        batcher.enqueue(reading("D2", 2600));

        batcher.shutdown().await;
        assert_eq!(batcher.pending(), 0);
        let stored = repo.readings();
        assert_eq!(stored[0].alert_status, AlertStatus::ModerateDrunk);
        assert_eq!(stored[1].alert_status, AlertStatus::CompletelyDrunk);
    }
}
