use chrono::Duration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broadcast::{BroadcastEvent, Broadcaster};
use crate::clock::Clock;
use crate::errors::Result;
use crate::metrics::DEVICES_OFFLINE_TOTAL;
use crate::model::{Device, DeviceStatus, DeviceUpdate};
use crate::repository::Repository;

/// Why a device went offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineCause {
    ConnectionError,
    ProtocolExhausted,
    LivenessTimeout,
}

impl OfflineCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineCause::ConnectionError => "connection_error",
            OfflineCause::ProtocolExhausted => "protocol_exhausted",
            OfflineCause::LivenessTimeout => "liveness_timeout",
        }
    }
}

/// Writes device status changes, records offline events and announces the
/// result. Shared by every component allowed to change `status`/`last_seen`.
pub struct StatusTracker {
    repo: Arc<dyn Repository>,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    // Serialises status writes so an offline transition never overwrites a
    // fresher online write, and concurrent offline writers log one event.
    transition_lock: Mutex<()>,
}

impl StatusTracker {
    pub fn new(repo: Arc<dyn Repository>, broadcaster: Broadcaster, clock: Arc<dyn Clock>) -> Self {
        StatusTracker {
            repo,
            broadcaster,
            clock,
            transition_lock: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Sets `online` and refreshes `last_seen`.
    pub async fn mark_online(&self, device_id: &str) -> Result<Option<Device>> {
        self.set_status(device_id, DeviceStatus::Online).await
    }

    /// The broker closed the connection without an error.
    pub async fn mark_waiting(&self, device_id: &str) -> Result<Option<Device>> {
        self.set_status(device_id, DeviceStatus::Waiting).await
    }

    async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<Option<Device>> {
        let _guard = self.transition_lock.lock().await;
        let now = self.clock.now();
        let updated = self
            .repo
            .update_device(device_id, DeviceUpdate::status(status, now))
            .await?;
        if let Some(device) = &updated {
            self.broadcaster
                .publish(BroadcastEvent::device_status(device.clone(), now));
        }
        Ok(updated)
    }

    /// Moves a device to `offline`, appending one offline event. Returns
    /// `None` without writing if the device is unknown or already offline.
    pub async fn mark_offline(&self, device_id: &str, cause: OfflineCause) -> Result<Option<Device>> {
        self.go_offline(device_id, cause, |_| true).await
    }

    /// Moves an `online` device to `offline` if nothing was heard from it for
    /// longer than `threshold`. The staleness check is repeated under the
    /// transition lock, so a message that arrived mid-sweep wins.
    pub async fn expire_if_stale(&self, device_id: &str, threshold: Duration) -> Result<Option<Device>> {
        let now = self.clock.now();
        self.go_offline(device_id, OfflineCause::LivenessTimeout, |device| {
            is_stale(device, now, threshold)
        })
        .await
    }

    async fn go_offline<P>(&self, device_id: &str, cause: OfflineCause, should: P) -> Result<Option<Device>>
    where
        P: Fn(&Device) -> bool + Send,
    {
        let _guard = self.transition_lock.lock().await;

        let Some(current) = self.repo.get_device_by_device_id(device_id).await? else {
            debug!(device_id = %device_id, "offline transition skipped: unknown device");
            return Ok(None);
        };
        if current.status == DeviceStatus::Offline || !should(&current) {
            return Ok(None);
        }

        let now = self.clock.now();
        let updated = self
            .repo
            .update_device(device_id, DeviceUpdate::status(DeviceStatus::Offline, now))
            .await?;
        self.repo.log_device_offline_event(device_id, now).await?;
        DEVICES_OFFLINE_TOTAL
            .with_label_values(&[cause.as_str()])
            .inc();

        info!(
            device_id = %device_id,
            cause = cause.as_str(),
            previous = %current.status,
            "Device marked offline"
        );
        if let Some(device) = &updated {
            self.broadcaster
                .publish(BroadcastEvent::device_status(device.clone(), now));
        }
        Ok(updated)
    }
}

/// `true` for an online device whose last message is older than `threshold`.
pub fn is_stale(device: &Device, now: chrono::DateTime<chrono::Utc>, threshold: Duration) -> bool {
    device.status == DeviceStatus::Online
        && device
            .last_seen
            .map_or(true, |last_seen| now - last_seen > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ProtocolVariant;
    use crate::repository::MemoryRepository;
    use crate::model::{CleanupSchedule, CleanupScheduleUpdate, OfflineEvent, TelemetryReading};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Holds the next device read until released.
    #[derive(Default)]
    struct StalledRepository {
        inner: MemoryRepository,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Repository for StalledRepository {
        async fn get_devices(&self) -> Result<Vec<Device>> {
            self.inner.get_devices().await
        }

        async fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.get_device_by_device_id(device_id).await
        }

        async fn update_device(&self, device_id: &str, update: DeviceUpdate) -> Result<Option<Device>> {
            self.inner.update_device(device_id, update).await
        }

        async fn create_device_data(&self, reading: &TelemetryReading) -> Result<()> {
            self.inner.create_device_data(reading).await
        }

        async fn log_device_offline_event(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.log_device_offline_event(device_id, at).await
        }

        async fn get_offline_events(&self, device_id: &str) -> Result<Vec<OfflineEvent>> {
            self.inner.get_offline_events(device_id).await
        }

        async fn get_cleanup_schedule(&self, task_name: &str) -> Result<Option<CleanupSchedule>> {
            self.inner.get_cleanup_schedule(task_name).await
        }

        async fn create_cleanup_schedule(&self, schedule: &CleanupSchedule) -> Result<CleanupSchedule> {
            self.inner.create_cleanup_schedule(schedule).await
        }

        async fn update_cleanup_schedule(
            &self,
            task_name: &str,
            update: CleanupScheduleUpdate,
        ) -> Result<Option<CleanupSchedule>> {
            self.inner.update_cleanup_schedule(task_name, update).await
        }

        async fn clear_all_device_data(&self) -> Result<u64> {
            self.inner.clear_all_device_data().await
        }
    }

    struct Fixture {
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
        events: Arc<StdMutex<Vec<BroadcastEvent>>>,
        tracker: StatusTracker,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::with_devices(vec![Device::new(
            "D1",
            "localhost",
            "sensors/D1",
            ProtocolVariant::Mqtt,
        )]));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let captured = events.clone();
        let broadcaster = Broadcaster::new();
        broadcaster.set_sink(Arc::new(move |e| captured.lock().unwrap().push(e)));
        let tracker = StatusTracker::new(repo.clone(), broadcaster, clock.clone());
        Fixture {
            repo,
            clock,
            events,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_offline_is_idempotent() {
        let f = fixture();
        f.tracker.mark_online("D1").await.unwrap();

        let first = f
            .tracker
            .mark_offline("D1", OfflineCause::ConnectionError)
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, DeviceStatus::Offline);

        let second = f
            .tracker
            .mark_offline("D1", OfflineCause::ConnectionError)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(f.repo.offline_events().len(), 1);
        // online + offline, nothing for the no-op
        assert_eq!(f.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expire_only_stale_online_devices() {
        let f = fixture();
        f.tracker.mark_online("D1").await.unwrap();

        f.clock.advance(Duration::seconds(5));
        let fresh = f
            .tracker
            .expire_if_stale("D1", Duration::seconds(10))
            .await
            .unwrap();
        assert!(fresh.is_none());

        f.clock.advance(Duration::seconds(6));
        let expired = f
            .tracker
            .expire_if_stale("D1", Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, DeviceStatus::Offline);
        assert_eq!(expired.last_seen, Some(f.clock.now()));
        assert_eq!(f.repo.offline_events()[0].offline_at, f.clock.now());
    }

    #[tokio::test]
    async fn test_waiting_device_is_not_expired() {
        let f = fixture();
        f.tracker.mark_waiting("D1").await.unwrap();
        f.clock.advance(Duration::seconds(60));
        let result = f
            .tracker
            .expire_if_stale("D1", Duration::seconds(10))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(f.repo.offline_events().is_empty());
    }

    #[tokio::test]
    async fn test_message_during_sweep_keeps_device_online() {
        let repo = Arc::new(StalledRepository::default());
        repo.inner.upsert_device(Device::new(
            "D1",
            "localhost",
            "sensors/D1",
            ProtocolVariant::Mqtt,
        ));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let captured = events.clone();
        let broadcaster = Broadcaster::new();
        broadcaster.set_sink(Arc::new(move |e| captured.lock().unwrap().push(e)));
        let tracker = Arc::new(StatusTracker::new(repo.clone(), broadcaster, clock.clone()));

        tracker.mark_online("D1").await.unwrap();
        clock.advance(Duration::seconds(11));
        repo.armed.store(true, Ordering::SeqCst);

        let sweeper = tracker.clone();
        let sweep =
            tokio::spawn(async move { sweeper.expire_if_stale("D1", Duration::seconds(10)).await });
        repo.reached.notified().await;

        let receiver = tracker.clone();
        let message = tokio::spawn(async move { receiver.mark_online("D1").await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!message.is_finished());

        repo.release.notify_one();
        sweep.await.unwrap().unwrap();
        message.await.unwrap().unwrap();

        let device = repo.inner.get_device_by_device_id("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(repo.inner.offline_events().len(), 1);
        match events.lock().unwrap().last() {
            Some(BroadcastEvent::DeviceStatusUpdate { device, .. }) => {
                assert_eq!(device.status, DeviceStatus::Online)
            }
            other => panic!("unexpected event {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_unknown_device_is_ignored() {
        let f = fixture();
        let result = f
            .tracker
            .mark_offline("ghost", OfflineCause::LivenessTimeout)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
