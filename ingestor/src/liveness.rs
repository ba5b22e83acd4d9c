use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::model::DeviceStatus;
use crate::periodic::{PeriodicTask, ReentrancyGuard};
use crate::repository::Repository;
use crate::status::{is_stale, StatusTracker};

#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    pub check_interval: Duration,
    /// Longest allowed silence before an online device is demoted.
    pub threshold: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        LivenessSettings {
            check_interval: Duration::from_secs(10),
            threshold: Duration::from_secs(10),
        }
    }
}

/// Periodically demotes online devices that stopped publishing.
pub struct LivenessMonitor {
    repo: Arc<dyn Repository>,
    tracker: Arc<StatusTracker>,
    settings: LivenessSettings,
    guard: ReentrancyGuard,
    task: Mutex<Option<PeriodicTask>>,
}

impl LivenessMonitor {
    pub fn new(repo: Arc<dyn Repository>, tracker: Arc<StatusTracker>, settings: LivenessSettings) -> Self {
        LivenessMonitor {
            repo,
            tracker,
            settings,
            guard: ReentrancyGuard::new(),
            task: Mutex::new(None),
        }
    }

    /// One sweep over active devices. Returns how many went offline; a sweep
    /// already in progress makes this a no-op returning 0.
    pub async fn sweep(&self) -> Result<usize> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Liveness sweep already running, skipping");
            return Ok(0);
        };

        let now = self.tracker.clock().now();
        let threshold = chrono::Duration::from_std(self.settings.threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));

        let devices = self.repo.get_devices().await?;
        let mut demoted = 0;
        for device in devices
            .iter()
            .filter(|d| d.is_active && d.status == DeviceStatus::Online)
        {
            if !is_stale(device, now, threshold) {
                continue;
            }
            match self.tracker.expire_if_stale(&device.device_id, threshold).await {
                Ok(Some(_)) => {
                    demoted += 1;
                    warn!(
                        device_id = %device.device_id,
                        last_seen = ?device.last_seen,
                        "No data within liveness threshold"
                    );
                }
                Ok(None) => {}
                Err(e) => error!(
                    device_id = %device.device_id,
                    error = %e,
                    "Failed to mark device offline"
                ),
            }
        }

        if demoted > 0 {
            info!("Liveness sweep marked {} device(s) offline", demoted);
        }
        Ok(demoted)
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let monitor = self.clone();
        *task = Some(PeriodicTask::spawn(
            "liveness-monitor",
            self.settings.check_interval,
            move || {
                let monitor = monitor.clone();
                async move {
                    if let Err(e) = monitor.sweep().await {
                        error!(error = %e, "Liveness sweep failed");
                    }
                }
            },
        ));
    }

    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastEvent, Broadcaster};
    use crate::clock::{Clock, ManualClock};
    use crate::model::{Device, DeviceUpdate, ProtocolVariant};
    use crate::repository::MemoryRepository;
    use chrono::Utc;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
        events: Arc<std::sync::Mutex<Vec<BroadcastEvent>>>,
        monitor: Arc<LivenessMonitor>,
    }

    fn device(id: &str, active: bool) -> Device {
        let mut d = Device::new(id, "localhost", format!("sensors/{}", id), ProtocolVariant::Mqtt);
        d.is_active = active;
        d
    }

    fn fixture(devices: Vec<Device>) -> Fixture {
        let repo = Arc::new(MemoryRepository::with_devices(devices));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = events.clone();
        let broadcaster = Broadcaster::new();
        broadcaster.set_sink(Arc::new(move |e| captured.lock().unwrap().push(e)));
        let tracker = Arc::new(StatusTracker::new(repo.clone(), broadcaster, clock.clone()));
        let monitor = Arc::new(LivenessMonitor::new(
            repo.clone(),
            tracker,
            LivenessSettings::default(),
        ));
        Fixture {
            repo,
            clock,
            events,
            monitor,
        }
    }

    async fn set(f: &Fixture, id: &str, status: DeviceStatus, secs_ago: i64) {
        let at = f.clock.now() - chrono::Duration::seconds(secs_ago);
        f.repo
            .update_device(id, DeviceUpdate::status(status, at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_demotes_silent_online_devices_once() {
        let f = fixture(vec![device("D1", true), device("D2", true)]);
        set(&f, "D1", DeviceStatus::Online, 30).await;
        set(&f, "D2", DeviceStatus::Online, 3).await;

        assert_eq!(f.monitor.sweep().await.unwrap(), 1);
        let d1 = f.repo.get_device_by_device_id("D1").await.unwrap().unwrap();
        assert_eq!(d1.status, DeviceStatus::Offline);
        let d2 = f.repo.get_device_by_device_id("D2").await.unwrap().unwrap();
        assert_eq!(d2.status, DeviceStatus::Online);

        assert_eq!(f.monitor.sweep().await.unwrap(), 0);
        assert_eq!(f.repo.offline_events().len(), 1);
        assert_eq!(f.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_ignores_inactive_waiting_and_offline() {
        let f = fixture(vec![
            device("inactive", false),
            device("waiting", true),
            device("offline", true),
        ]);
        set(&f, "inactive", DeviceStatus::Online, 60).await;
        set(&f, "waiting", DeviceStatus::Waiting, 60).await;
        set(&f, "offline", DeviceStatus::Offline, 60).await;

        assert_eq!(f.monitor.sweep().await.unwrap(), 0);
        assert!(f.repo.offline_events().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let f = fixture(vec![device("D1", true)]);
        set(&f, "D1", DeviceStatus::Online, 10).await;
        assert_eq!(f.monitor.sweep().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(f.monitor.sweep().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweeps() {
        let f = fixture(vec![device("D1", true)]);
        set(&f, "D1", DeviceStatus::Online, 0).await;
        f.monitor.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.repo.offline_events().is_empty());

        f.clock.advance(chrono::Duration::seconds(15));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.repo.offline_events().len(), 1);

        f.monitor.stop().await;
    }
}
